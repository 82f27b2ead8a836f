//! Plumbing shared by the HTTP-based store adapters.

use std::time::Duration;

use beacon_core::DiscoveryError;
use reqwest::Response;
use url::Url;

/// Build the HTTP client used for every request to one store.
pub(crate) fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, DiscoveryError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| DiscoveryError::connection_setup(format!("create http client: {e}")))
}

/// Parse a store address, prefixing `default_scheme` when it has none.
pub(crate) fn parse_base_url(raw: &str, default_scheme: &str) -> Result<Url, DiscoveryError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DiscoveryError::connection_setup("empty store address"));
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{default_scheme}://{raw}")
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| DiscoveryError::connection_setup(format!("invalid address '{raw}': {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DiscoveryError::connection_setup(format!(
            "unsupported scheme '{}' in '{raw}'",
            url.scheme()
        )));
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(DiscoveryError::connection_setup(format!(
            "address '{raw}' has no host"
        )));
    }

    Ok(url)
}

/// Append path segments to a base URL, percent-encoding each one.
pub(crate) fn join_segments<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, DiscoveryError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| DiscoveryError::connection_setup(format!("'{base}' cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Map a client error into the discovery taxonomy.
pub(crate) fn map_request_error(err: reqwest::Error) -> DiscoveryError {
    if err.is_timeout() {
        DiscoveryError::Timeout
    } else if err.is_decode() {
        DiscoveryError::Decode(err.to_string())
    } else {
        DiscoveryError::Transport(err.to_string())
    }
}

/// Read a numeric index header such as `X-Etcd-Index`.
pub(crate) fn header_index(resp: &Response, name: &str) -> Option<u64> {
    resp.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Turn a non-success response into a status error carrying its body.
#[cfg_attr(not(feature = "consul"), allow(dead_code))]
pub(crate) async fn status_error(resp: Response) -> DiscoveryError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    DiscoveryError::Status {
        status,
        message: message.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base_url() {
        let url = parse_base_url("127.0.0.1:8500", "http").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8500/");

        let url = parse_base_url(" https://etcd.internal:2379 ", "http").unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn test_parse_base_url_rejects_garbage() {
        for raw in ["", "ftp://127.0.0.1:21", "http://", "http://[::1"] {
            let err = parse_base_url(raw, "http").unwrap_err();
            assert!(err.is_setup(), "{raw}: {err}");
        }
    }

    #[test]
    fn test_join_segments_encodes() {
        let base = parse_base_url("http://127.0.0.1:8500", "http").unwrap();
        let url = join_segments(&base, ["v1", "health", "service", "hello world"]).unwrap();
        assert_eq!(url.path(), "/v1/health/service/hello%20world");
    }
}
