//! Tree-store backend on the etcd v2 keys API.
//!
//! Each instance is a directory holding `host` and `port` leaves, with the
//! lease expressed as a TTL on the directory:
//!
//! ```text
//! /{prefix}/{service}/{service}-{host}-{port}/host
//! /{prefix}/{service}/{service}-{host}-{port}/port
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use beacon_core::{DiscoveryError, Lease, ServiceInstance, WatchCursor};
use reqwest::{Method, Response};
use serde::Deserialize;
use url::Url;

use crate::backend::{Backend, Connect, Snapshot};
use crate::http::{build_client, header_index, join_segments, map_request_error, parse_base_url};

const INDEX_HEADER: &str = "X-Etcd-Index";

/// etcd error code for a missing key.
const KEY_NOT_FOUND: u64 = 100;
/// etcd error code for a watch index older than the retained event history.
const EVENT_INDEX_CLEARED: u64 = 401;

/// Configuration for the etcd backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Cluster member URLs, tried in order on connection failures.
    pub endpoints: Vec<String>,

    /// Root directory of the service tree.
    pub prefix: String,

    /// Timeout for ordinary reads and writes.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Upper bound on a long-poll watch before it is reported as timed out.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,

    /// Timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "naming".to_string(),
            request_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl EtcdConfig {
    /// Create a config from a comma-separated endpoint list,
    /// e.g. `http://127.0.0.1:2379,http://127.0.0.1:12379`.
    #[must_use]
    pub fn new(target: &str) -> Self {
        Self {
            endpoints: target
                .split(',')
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())
                .map(String::from)
                .collect(),
            ..Default::default()
        }
    }

    /// Set the root directory of the service tree.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the long-poll timeout.
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// A node of the keys API response tree.
#[derive(Debug, Default, Deserialize)]
struct Node {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default, rename = "modifiedIndex")]
    modified_index: u64,
}

impl Node {
    /// Last path segment of the key.
    fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }

    /// Value of the named leaf child, if set and non-empty.
    fn leaf(&self, name: &str) -> Option<&str> {
        self.nodes
            .iter()
            .filter(|child| !child.dir && child.name() == name)
            .find_map(|child| child.value.as_deref())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    #[serde(default)]
    node: Option<Node>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: Option<u64>,
}

/// Interpreted answer of one keys API call.
enum KeysOutcome {
    Found { node: Option<Node>, index: Option<u64> },
    Missing { index: Option<u64> },
    Cleared,
}

/// Addresses found under a service directory.
#[derive(Debug, Default, PartialEq, Eq)]
struct Extracted {
    addrs: Vec<String>,
    /// Instance directories holding neither `host` nor `port`.
    orphans: Vec<String>,
}

fn extract(service_dir: Option<&Node>) -> Extracted {
    let mut extracted = Extracted::default();
    let Some(service_dir) = service_dir else {
        return extracted;
    };

    for node in service_dir.nodes.iter().filter(|node| node.dir) {
        match (node.leaf("host"), node.leaf("port")) {
            (Some(host), Some(port)) => extracted.addrs.push(format!("{host}:{port}")),
            (None, None) => extracted.orphans.push(node.key.clone()),
            // Half-written record, not an address yet.
            _ => tracing::trace!(key = %node.key, "skipping partial instance record"),
        }
    }

    extracted
}

/// etcd v2 backend.
///
/// ## Example
///
/// ```rust,ignore
/// use beacon_discovery::{EtcdBackend, EtcdConfig};
///
/// let backend = EtcdBackend::with_config(
///     EtcdConfig::new("http://127.0.0.1:2379,http://127.0.0.1:12379").prefix("naming"),
/// )?;
/// ```
pub struct EtcdBackend {
    config: EtcdConfig,
    prefix: String,
    endpoints: Vec<Url>,
    /// Endpoint that answered last; requests start there.
    current: AtomicUsize,
    client: reqwest::Client,
}

impl EtcdBackend {
    /// Create a backend for a comma-separated endpoint list.
    pub fn new(target: &str) -> Result<Self, DiscoveryError> {
        Self::with_config(EtcdConfig::new(target))
    }

    /// Create a backend with full configuration.
    pub fn with_config(config: EtcdConfig) -> Result<Self, DiscoveryError> {
        if config.endpoints.is_empty() {
            return Err(DiscoveryError::connection_setup("no etcd endpoints provided"));
        }

        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| parse_base_url(endpoint, "http"))
            .collect::<Result<Vec<_>, _>>()?;

        let prefix = config.prefix.trim_matches('/').to_string();
        if prefix.is_empty() {
            return Err(DiscoveryError::connection_setup("etcd key prefix is empty"));
        }

        Ok(Self {
            client: build_client(config.connect_timeout)?,
            prefix,
            endpoints,
            current: AtomicUsize::new(0),
            config,
        })
    }

    /// Directory holding every instance of a service.
    #[must_use]
    pub fn service_key(&self, service: &str) -> String {
        format!("/{}/{}", self.prefix, service)
    }

    /// Directory of one instance.
    #[must_use]
    pub fn instance_key(&self, instance: &ServiceInstance) -> String {
        format!("/{}/{}/{}", self.prefix, instance.name(), instance.id())
    }

    /// Send a keys API request, failing over between endpoints on connection errors.
    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
        timeout: Duration,
    ) -> Result<Response, DiscoveryError> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = None;

        for attempt in 0..self.endpoints.len() {
            let idx = (start + attempt) % self.endpoints.len();
            let segments = ["v2", "keys"]
                .into_iter()
                .chain(key.split('/').filter(|segment| !segment.is_empty()));
            let url = join_segments(&self.endpoints[idx], segments)?;

            let mut request = self
                .client
                .request(method.clone(), url)
                .query(query)
                .timeout(timeout);
            if let Some(form) = form {
                request = request.form(form);
            }

            match request.send().await {
                Ok(resp) => {
                    self.current.store(idx, Ordering::Relaxed);
                    return Ok(resp);
                }
                Err(e) if e.is_connect() => {
                    tracing::warn!(
                        endpoint = %self.endpoints[idx],
                        error = %e,
                        "etcd endpoint unreachable, trying next"
                    );
                    last_error = Some(map_request_error(e));
                }
                Err(e) => return Err(map_request_error(e)),
            }
        }

        Err(last_error.unwrap_or_else(|| DiscoveryError::Transport("no etcd endpoints".into())))
    }

    async fn keys(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
        timeout: Duration,
    ) -> Result<KeysOutcome, DiscoveryError> {
        let resp = self.send(method, key, query, form, timeout).await?;
        let index = header_index(&resp, INDEX_HEADER);

        if resp.status().is_success() {
            let body: KeysResponse = resp.json().await.map_err(map_request_error)?;
            return Ok(KeysOutcome::Found {
                node: body.node,
                index,
            });
        }

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(map_request_error)?;
        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(err) if err.error_code == KEY_NOT_FOUND => Ok(KeysOutcome::Missing {
                index: index.or(err.index),
            }),
            Ok(err) if err.error_code == EVENT_INDEX_CLEARED => Ok(KeysOutcome::Cleared),
            Ok(err) => Err(DiscoveryError::Status {
                status,
                message: match err.cause {
                    Some(cause) => format!("{} ({cause}) [code {}]", err.message, err.error_code),
                    None => format!("{} [code {}]", err.message, err.error_code),
                },
            }),
            Err(_) => Err(DiscoveryError::Status {
                status,
                message: text.trim().to_string(),
            }),
        }
    }

    /// Issue a write and require the key to have been accepted.
    async fn write(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<(), DiscoveryError> {
        match self
            .keys(method, key, query, form, self.config.request_timeout)
            .await?
        {
            KeysOutcome::Found { .. } => Ok(()),
            KeysOutcome::Missing { .. } => Err(DiscoveryError::NotFound(key.to_string())),
            KeysOutcome::Cleared => Err(DiscoveryError::Decode(format!(
                "unexpected event-index-cleared reply writing {key}"
            ))),
        }
    }

    async fn set_value(&self, key: &str, value: String) -> Result<(), DiscoveryError> {
        let form = [("value", value)];
        self.write(Method::PUT, key, &[], Some(&form[..])).await
    }

    /// Attach the TTL to an instance directory that already exists.
    async fn set_dir_ttl(&self, key: &str, lease: &Lease, refresh: bool) -> Result<(), DiscoveryError> {
        let mut form = vec![
            ("dir", "true".to_string()),
            ("ttl", lease.ttl_secs().to_string()),
            ("prevExist", "true".to_string()),
        ];
        if refresh {
            form.push(("refresh", "true".to_string()));
        }
        self.write(Method::PUT, key, &[], Some(form.as_slice())).await
    }

    async fn delete_dir(&self, key: &str) -> Result<(), DiscoveryError> {
        self.write(Method::DELETE, key, &[("recursive", "true".to_string())], None)
            .await
    }

    /// Best-effort removal of empty instance directories.
    async fn drop_orphans(&self, orphans: &[String]) {
        for key in orphans {
            match self.delete_dir(key).await {
                Ok(()) => tracing::debug!(key = %key, "dropped empty service directory"),
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to drop empty service directory"),
            }
        }
    }
}

impl Backend for EtcdBackend {
    async fn publish(&self, instance: &ServiceInstance, lease: &Lease) -> Result<(), DiscoveryError> {
        let dir = self.instance_key(instance);

        self.set_value(&format!("{dir}/host"), instance.host().to_string())
            .await?;
        self.set_value(&format!("{dir}/port"), instance.port().to_string())
            .await?;
        // The leaf writes created the directory, so prevExist always holds here.
        self.set_dir_ttl(&dir, lease, false).await
    }

    async fn refresh(&self, instance: &ServiceInstance, lease: &Lease) -> Result<(), DiscoveryError> {
        let dir = self.instance_key(instance);
        let probe = self
            .keys(
                Method::GET,
                &dir,
                &[("recursive", "true".to_string())],
                None,
                self.config.request_timeout,
            )
            .await;

        match probe {
            Ok(KeysOutcome::Found { node: Some(node), .. })
                if node.leaf("host").is_some() && node.leaf("port").is_some() =>
            {
                // Refresh mode extends the TTL without notifying watchers.
                self.set_dir_ttl(&dir, lease, true).await
            }
            Ok(KeysOutcome::Found { .. }) => {
                tracing::debug!(key = %dir, "instance record incomplete, re-publishing");
                self.publish(instance, lease).await
            }
            Ok(KeysOutcome::Missing { .. }) => {
                tracing::info!(key = %dir, "instance record expired, re-publishing");
                self.publish(instance, lease).await
            }
            Ok(KeysOutcome::Cleared) => self.publish(instance, lease).await,
            Err(e) => {
                tracing::warn!(key = %dir, error = %e, "probe failed, re-publishing");
                self.publish(instance, lease).await
            }
        }
    }

    async fn remove(&self, instance: &ServiceInstance) -> Result<(), DiscoveryError> {
        self.delete_dir(&self.instance_key(instance)).await
    }

    async fn list(&self, service: &str) -> Result<Snapshot, DiscoveryError> {
        let key = self.service_key(service);
        let outcome = self
            .keys(
                Method::GET,
                &key,
                &[("recursive", "true".to_string())],
                None,
                self.config.request_timeout,
            )
            .await?;

        match outcome {
            KeysOutcome::Found { node, index } => {
                let extracted = extract(node.as_ref());
                self.drop_orphans(&extracted.orphans).await;

                let index = index
                    .or_else(|| node.as_ref().map(|node| node.modified_index))
                    .unwrap_or_default();
                Ok(Snapshot::new(extracted.addrs, WatchCursor::new(index)))
            }
            KeysOutcome::Missing { index } => Ok(Snapshot::new(
                Vec::new(),
                WatchCursor::new(index.unwrap_or_default()),
            )),
            KeysOutcome::Cleared => Err(DiscoveryError::Decode(format!(
                "unexpected event-index-cleared reply reading {key}"
            ))),
        }
    }

    async fn block_until_changed(
        &self,
        service: &str,
        cursor: WatchCursor,
    ) -> Result<Snapshot, DiscoveryError> {
        let key = self.service_key(service);
        let query = [
            ("wait", "true".to_string()),
            ("recursive", "true".to_string()),
            ("waitIndex", (cursor.index() + 1).to_string()),
        ];

        match self
            .keys(Method::GET, &key, &query, None, self.config.wait_timeout)
            .await?
        {
            KeysOutcome::Found { .. } | KeysOutcome::Missing { .. } => {}
            KeysOutcome::Cleared => {
                tracing::debug!(key = %key, cursor = %cursor, "watch index cleared, re-listing");
            }
        }

        self.list(service).await
    }
}

impl Connect for EtcdBackend {
    fn connect(target: &str) -> Result<Self, DiscoveryError> {
        Self::new(target)
    }
}
