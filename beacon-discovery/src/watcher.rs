//! Client-side reconciliation loop for one service.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::{diff, Update, WatchCursor};
use futures_core::Stream;
use serde::Deserialize;

use crate::backend::Backend;

/// Configuration for a [`Watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Pause after a failed query before retrying.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
        }
    }
}

impl WatcherConfig {
    /// Set the retry backoff.
    #[must_use]
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Uninitialized,
    Steady(WatchCursor),
}

/// Streams address changes of one service as batches of [`Update`]s.
///
/// The watcher keeps the last observed address list; every batch it returns
/// turns the previous list into the current one. Store errors never reach the
/// caller: they are logged and retried after a fixed backoff.
pub struct Watcher<B> {
    backend: Arc<B>,
    service: String,
    state: WatchState,
    addrs: Vec<String>,
    config: WatcherConfig,
}

impl<B: Backend> Watcher<B> {
    /// Create a watcher; no request is made until [`next`](Self::next).
    #[must_use]
    pub fn new(backend: Arc<B>, service: impl Into<String>) -> Self {
        Self::with_config(backend, service, WatcherConfig::default())
    }

    /// Create a watcher with custom configuration.
    #[must_use]
    pub fn with_config(backend: Arc<B>, service: impl Into<String>, config: WatcherConfig) -> Self {
        Self {
            backend,
            service: service.into(),
            state: WatchState::Uninitialized,
            addrs: Vec::new(),
            config,
        }
    }

    /// Watched service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Addresses as of the last returned batch.
    #[must_use]
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Store position of the last observation, if any.
    #[must_use]
    pub fn cursor(&self) -> Option<WatchCursor> {
        match self.state {
            WatchState::Uninitialized => None,
            WatchState::Steady(cursor) => Some(cursor),
        }
    }

    /// Wait for the next non-empty batch of updates.
    ///
    /// The first call lists the service; if it has instances the batch holds
    /// one `Add` per address. Afterwards each call blocks on the store until
    /// the address list differs from the last one returned.
    pub async fn next(&mut self) -> Vec<Update> {
        let mut cursor = match self.state {
            WatchState::Steady(cursor) => cursor,
            WatchState::Uninitialized => match self.backend.list(&self.service).await {
                Ok(snapshot) if !snapshot.is_empty() => {
                    let updates = diff::<String>(&[], &snapshot.addrs);
                    tracing::debug!(
                        service = %self.service,
                        cursor = %snapshot.cursor,
                        count = updates.len(),
                        "initial addresses"
                    );
                    self.addrs = snapshot.addrs;
                    self.state = WatchState::Steady(snapshot.cursor);
                    return updates;
                }
                Ok(_) => WatchCursor::ZERO,
                Err(e) => {
                    tracing::warn!(service = %self.service, error = %e, "initial list failed");
                    WatchCursor::ZERO
                }
            },
        };

        loop {
            let snapshot = match self
                .backend
                .block_until_changed(&self.service, cursor)
                .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(
                        service = %self.service,
                        cursor = %cursor,
                        error = %e,
                        backoff = ?self.config.backoff,
                        "watch failed, retrying"
                    );
                    tokio::time::sleep(self.config.backoff).await;
                    continue;
                }
            };

            let updates = diff(&self.addrs, &snapshot.addrs);
            cursor = snapshot.cursor;
            self.addrs = snapshot.addrs;
            self.state = WatchState::Steady(cursor);

            if updates.is_empty() {
                tracing::trace!(service = %self.service, cursor = %cursor, "no address change");
                continue;
            }

            tracing::debug!(
                service = %self.service,
                cursor = %cursor,
                count = updates.len(),
                "addresses changed"
            );
            return updates;
        }
    }

    /// Release the watcher. Nothing is held open between calls to `next`.
    pub fn close(self) {
        tracing::debug!(service = %self.service, "watcher closed");
    }

    /// Turn the watcher into an endless stream of batches.
    pub fn into_stream(self) -> impl Stream<Item = Vec<Update>> + Send {
        futures::stream::unfold(self, |mut watcher| async move {
            let updates = watcher.next().await;
            Some((updates, watcher))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use beacon_core::{DiscoveryError, Lease, ServiceInstance};
    use futures::StreamExt;
    use parking_lot::Mutex;

    use super::*;
    use crate::backend::Snapshot;
    use crate::memory::MemoryBackend;

    /// Backend replaying scripted read results.
    #[derive(Default)]
    struct ScriptedBackend {
        list: Mutex<VecDeque<Result<Snapshot, DiscoveryError>>>,
        watch: Mutex<VecDeque<Result<Snapshot, DiscoveryError>>>,
        cursors: Mutex<Vec<WatchCursor>>,
    }

    impl ScriptedBackend {
        fn with_list(self, result: Result<Snapshot, DiscoveryError>) -> Self {
            self.list.lock().push_back(result);
            self
        }

        fn with_watch(self, result: Result<Snapshot, DiscoveryError>) -> Self {
            self.watch.lock().push_back(result);
            self
        }
    }

    fn snapshot(addrs: &[&str], index: u64) -> Result<Snapshot, DiscoveryError> {
        Ok(Snapshot::new(
            addrs.iter().map(|addr| (*addr).to_string()).collect(),
            WatchCursor::new(index),
        ))
    }

    impl Backend for ScriptedBackend {
        async fn publish(&self, _: &ServiceInstance, _: &Lease) -> Result<(), DiscoveryError> {
            Ok(())
        }

        async fn refresh(&self, _: &ServiceInstance, _: &Lease) -> Result<(), DiscoveryError> {
            Ok(())
        }

        async fn remove(&self, _: &ServiceInstance) -> Result<(), DiscoveryError> {
            Ok(())
        }

        async fn list(&self, _: &str) -> Result<Snapshot, DiscoveryError> {
            self.list
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Snapshot::default()))
        }

        async fn block_until_changed(
            &self,
            _: &str,
            cursor: WatchCursor,
        ) -> Result<Snapshot, DiscoveryError> {
            self.cursors.lock().push(cursor);
            let next = self.watch.lock().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_initial_list_emits_adds() {
        let backend = Arc::new(ScriptedBackend::default().with_list(snapshot(&["a:1", "b:2"], 7)));
        let mut watcher = Watcher::new(backend.clone(), "svc");
        assert_eq!(watcher.cursor(), None);

        let updates = watcher.next().await;
        assert_eq!(updates, vec![Update::add("a:1"), Update::add("b:2")]);
        assert_eq!(watcher.cursor(), Some(WatchCursor::new(7)));
        assert!(backend.cursors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_list_falls_through_to_watch() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .with_list(snapshot(&[], 3))
                .with_watch(snapshot(&["a:1"], 4)),
        );
        let mut watcher = Watcher::new(backend.clone(), "svc");

        assert_eq!(watcher.next().await, vec![Update::add("a:1")]);
        assert_eq!(*backend.cursors.lock(), vec![WatchCursor::ZERO]);
    }

    #[tokio::test]
    async fn test_unchanged_snapshots_are_skipped() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .with_list(snapshot(&["a:1"], 5))
                .with_watch(snapshot(&["a:1"], 6))
                .with_watch(snapshot(&["a:1"], 9))
                .with_watch(snapshot(&["b:2"], 10)),
        );
        let mut watcher = Watcher::new(backend.clone(), "svc");
        watcher.next().await;

        let updates = watcher.next().await;
        assert_eq!(updates, vec![Update::delete("a:1"), Update::add("b:2")]);
        assert_eq!(
            *backend.cursors.lock(),
            vec![WatchCursor::new(5), WatchCursor::new(6), WatchCursor::new(9)]
        );
        assert_eq!(watcher.addrs(), ["b:2".to_string()]);
    }

    #[tokio::test]
    async fn test_store_index_reset_restarts_cursor() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .with_list(snapshot(&["a:1"], 50))
                .with_watch(snapshot(&["a:1", "b:2"], 0))
                .with_watch(snapshot(&["b:2"], 4)),
        );
        let mut watcher = Watcher::new(backend.clone(), "svc");
        watcher.next().await;

        assert_eq!(watcher.next().await, vec![Update::add("b:2")]);
        assert_eq!(watcher.cursor(), Some(WatchCursor::ZERO));

        assert_eq!(watcher.next().await, vec![Update::delete("a:1")]);
        assert_eq!(
            *backend.cursors.lock(),
            vec![WatchCursor::new(50), WatchCursor::ZERO]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_back_off_and_retry_same_cursor() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .with_list(Err(DiscoveryError::Transport("connection refused".to_string())))
                .with_watch(Err(DiscoveryError::Timeout))
                .with_watch(Err(DiscoveryError::Status {
                    status: 503,
                    message: String::new(),
                }))
                .with_watch(snapshot(&["a:1"], 2)),
        );
        let mut watcher = Watcher::with_config(
            backend.clone(),
            "svc",
            WatcherConfig::default().backoff(Duration::from_secs(2)),
        );

        let started = tokio::time::Instant::now();
        assert_eq!(watcher.next().await, vec![Update::add("a:1")]);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(*backend.cursors.lock(), vec![WatchCursor::ZERO; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_over_memory_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = Lease::default();
        let a = ServiceInstance::new("svc", "10.0.0.1", 9000).unwrap();
        backend.publish(&a, &lease).await.unwrap();

        let mut stream = Box::pin(Watcher::new(backend.clone(), "svc").into_stream());
        assert_eq!(stream.next().await, Some(vec![Update::add("10.0.0.1:9000")]));

        backend.remove(&a).await.unwrap();
        assert_eq!(stream.next().await, Some(vec![Update::delete("10.0.0.1:9000")]));
    }
}
