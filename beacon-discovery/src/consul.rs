//! Catalog-store backend on the Consul agent and health APIs.
//!
//! Instances register as Consul services with a companion TTL check keyed by
//! the same id. Resolution only returns instances whose checks pass, using
//! blocking queries on `X-Consul-Index` to wait for changes.

use std::time::Duration;

use beacon_core::{DiscoveryError, Lease, ServiceInstance, WatchCursor};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::{Backend, Connect, Snapshot};
use crate::http::{
    build_client, header_index, join_segments, map_request_error, parse_base_url, status_error,
};

const INDEX_HEADER: &str = "X-Consul-Index";

const PASSING: &str = "passing";

/// Configuration for the Consul backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Agent address, `host:port` or a full URL.
    pub address: String,

    /// Scheme used when `address` has none.
    pub scheme: String,

    /// Timeout for non-blocking requests.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Server-side wait of a blocking query.
    #[serde(with = "humantime_serde")]
    pub wait: Duration,

    /// Timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            scheme: "http".to_string(),
            request_timeout: Duration::from_secs(5),
            wait: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl ConsulConfig {
    /// Create a config for the given agent address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the scheme used for addresses without one.
    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the blocking query wait.
    #[must_use]
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
}

#[derive(Serialize)]
struct CheckRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "ServiceID")]
    service_id: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Status")]
    status: &'a str,
}

#[derive(Serialize)]
struct CheckUpdate<'a> {
    #[serde(rename = "Status")]
    status: &'a str,
    #[serde(rename = "Output")]
    output: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: HealthNode,
    service: HealthService,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
}

impl HealthEntry {
    /// Service address, falling back to the node address as Consul does.
    fn addr(&self) -> String {
        let host = if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        };
        format!("{}:{}", host, self.service.port)
    }
}

/// Consul backend.
///
/// ## Example
///
/// ```rust,ignore
/// use beacon_discovery::{ConsulBackend, ConsulConfig};
///
/// let backend = ConsulBackend::with_config(
///     ConsulConfig::new("127.0.0.1:8500").wait(Duration::from_secs(60)),
/// )?;
/// ```
pub struct ConsulBackend {
    config: ConsulConfig,
    base: Url,
    client: reqwest::Client,
}

impl ConsulBackend {
    /// Create a backend for an agent address such as `127.0.0.1:8500`.
    pub fn new(address: &str) -> Result<Self, DiscoveryError> {
        Self::with_config(ConsulConfig::new(address))
    }

    /// Create a backend with full configuration.
    pub fn with_config(config: ConsulConfig) -> Result<Self, DiscoveryError> {
        let base = parse_base_url(&config.address, &config.scheme)?;
        Ok(Self {
            client: build_client(config.connect_timeout)?,
            base,
            config,
        })
    }

    /// Agent base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn put<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<(), DiscoveryError> {
        let url = join_segments(&self.base, segments.iter().copied())?;
        let mut request = self
            .client
            .put(url)
            .timeout(self.config.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await.map_err(map_request_error)?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            let message = resp.text().await.unwrap_or_default();
            return Err(DiscoveryError::NotFound(message.trim().to_string()));
        }
        Err(status_error(resp).await)
    }

    /// Query passing instances, blocking on `cursor` when given.
    async fn health(
        &self,
        service: &str,
        cursor: Option<WatchCursor>,
    ) -> Result<Snapshot, DiscoveryError> {
        let url = join_segments(&self.base, ["v1", "health", "service", service])?;
        let mut query = vec![("passing", "true".to_string())];
        let mut timeout = self.config.request_timeout;

        if let Some(cursor) = cursor {
            query.push(("index", cursor.index().to_string()));
            query.push(("wait", format!("{}s", self.config.wait.as_secs().max(1))));
            // Consul adds up to wait/16 of jitter to a blocking query.
            timeout += self.config.wait + self.config.wait / 16;
        }

        let resp = self
            .client
            .get(url)
            .query(&query)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_request_error)?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let index = header_index(&resp, INDEX_HEADER).ok_or_else(|| {
            DiscoveryError::Decode(format!("health response for '{service}' lacks {INDEX_HEADER}"))
        })?;
        let entries: Vec<HealthEntry> = resp.json().await.map_err(map_request_error)?;
        let addrs = entries.iter().map(HealthEntry::addr).collect();

        let mut next = WatchCursor::new(index);
        if let Some(cursor) = cursor {
            if next < cursor {
                // Index went backwards (e.g. snapshot restore); restart from scratch.
                tracing::warn!(
                    service,
                    cursor = %cursor,
                    index,
                    "consul index went backwards, resetting cursor"
                );
                next = WatchCursor::ZERO;
            }
        }

        Ok(Snapshot::new(addrs, next))
    }
}

impl Backend for ConsulBackend {
    async fn publish(&self, instance: &ServiceInstance, lease: &Lease) -> Result<(), DiscoveryError> {
        let id = instance.id();

        let service = ServiceRegistration {
            id: &id,
            name: instance.name(),
            address: instance.host(),
            port: instance.port(),
        };
        self.put(&["v1", "agent", "service", "register"], Some(&service))
            .await?;

        let check = CheckRegistration {
            id: &id,
            name: instance.name(),
            service_id: &id,
            ttl: format!("{}s", lease.ttl_secs()),
            status: PASSING,
        };
        self.put(&["v1", "agent", "check", "register"], Some(&check))
            .await
    }

    async fn refresh(&self, instance: &ServiceInstance, _lease: &Lease) -> Result<(), DiscoveryError> {
        let update = CheckUpdate {
            status: PASSING,
            output: "",
        };
        let id = instance.id();
        self.put(&["v1", "agent", "check", "update", id.as_str()], Some(&update))
            .await
    }

    async fn remove(&self, instance: &ServiceInstance) -> Result<(), DiscoveryError> {
        let id = instance.id();
        let service = self
            .put::<()>(&["v1", "agent", "service", "deregister", id.as_str()], None)
            .await;

        // Consul drops a service's checks with it, so this usually finds nothing.
        match self
            .put::<()>(&["v1", "agent", "check", "deregister", id.as_str()], None)
            .await
        {
            Ok(()) | Err(DiscoveryError::NotFound(_)) => {}
            Err(e) => tracing::warn!(instance = %instance, error = %e, "failed to deregister check"),
        }

        service
    }

    async fn list(&self, service: &str) -> Result<Snapshot, DiscoveryError> {
        self.health(service, None).await
    }

    async fn block_until_changed(
        &self,
        service: &str,
        cursor: WatchCursor,
    ) -> Result<Snapshot, DiscoveryError> {
        self.health(service, Some(cursor)).await
    }
}

impl Connect for ConsulBackend {
    fn connect(target: &str) -> Result<Self, DiscoveryError> {
        Self::new(target)
    }
}
