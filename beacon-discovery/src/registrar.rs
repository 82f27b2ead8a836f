//! Publishing a local instance and keeping its lease alive.

use std::future::Future;
use std::sync::Arc;

use beacon_core::{DiscoveryError, Lease, ServiceInstance};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, Connect};

/// Lifecycle of a published instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistrationState {
    /// Nothing published yet.
    #[default]
    Unregistered,
    /// Initial publish in flight.
    Registering,
    /// Published and waiting for the next heartbeat.
    Active,
    /// Heartbeat in flight.
    Refreshing,
    /// Record removed; no further heartbeats.
    Deregistered,
}

/// Publishes instances to a backend under a lease.
///
/// ## Example
///
/// ```rust,ignore
/// use beacon_discovery::{EtcdBackend, Lease, Registrar, ServiceInstance, shutdown_signal};
///
/// let registrar = Registrar::<EtcdBackend>::connect("http://127.0.0.1:2379", Lease::default())?;
/// let registration = registrar
///     .start(ServiceInstance::new("greeter", "10.0.0.1", 9000)?)
///     .await?;
///
/// // Remove the record when the process is asked to stop.
/// let done = registration.deregister_on(shutdown_signal());
/// done.await??;
/// ```
pub struct Registrar<B> {
    backend: Arc<B>,
    lease: Lease,
}

impl<B: Backend> Registrar<B> {
    /// Create a registrar over a shared backend.
    #[must_use]
    pub fn new(backend: Arc<B>, lease: Lease) -> Self {
        Self { backend, lease }
    }

    /// The backend records are written to.
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Lease attached to every instance.
    #[must_use]
    pub fn lease(&self) -> Lease {
        self.lease
    }

    /// Publish `instance` and start heartbeating it.
    ///
    /// A failed initial publish is returned to the caller; once published,
    /// heartbeat failures are logged and retried on the next tick.
    pub async fn start(&self, instance: ServiceInstance) -> Result<Registration<B>, DiscoveryError> {
        let shared = Arc::new(Shared {
            backend: self.backend.clone(),
            instance,
            lease: self.lease,
            state: Mutex::new(RegistrationState::Unregistered),
            op_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });

        shared.set_state(RegistrationState::Registering);
        shared
            .backend
            .publish(&shared.instance, &shared.lease)
            .await?;
        shared.set_state(RegistrationState::Active);

        tracing::info!(
            instance = %shared.instance,
            ttl = ?shared.lease.ttl(),
            "registered service instance"
        );

        let refresher = tokio::spawn(refresh_loop(shared.clone()));

        Ok(Registration {
            shared,
            refresher: Some(refresher),
        })
    }
}

impl<B: Connect> Registrar<B> {
    /// Build the backend for `target` and wrap it in a registrar.
    pub fn connect(target: &str, lease: Lease) -> Result<Self, DiscoveryError> {
        Ok(Self::new(Arc::new(B::connect(target)?), lease))
    }
}

struct Shared<B> {
    backend: Arc<B>,
    instance: ServiceInstance,
    lease: Lease,
    state: Mutex<RegistrationState>,
    /// Serializes heartbeats with removal.
    op_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl<B> Shared<B> {
    fn set_state(&self, state: RegistrationState) {
        *self.state.lock() = state;
    }
}

async fn refresh_loop<B: Backend>(shared: Arc<Shared<B>>) {
    let mut interval = tokio::time::interval(shared.lease.refresh_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let _guard = tokio::select! {
            () = shared.cancel.cancelled() => break,
            guard = shared.op_lock.lock() => guard,
        };
        if shared.cancel.is_cancelled() {
            break;
        }

        shared.set_state(RegistrationState::Refreshing);
        match shared.backend.refresh(&shared.instance, &shared.lease).await {
            Ok(()) => tracing::trace!(instance = %shared.instance, "lease refreshed"),
            Err(e) => tracing::warn!(
                instance = %shared.instance,
                error = %e,
                "lease refresh failed, retrying next tick"
            ),
        }
        shared.set_state(RegistrationState::Active);
    }

    tracing::debug!(instance = %shared.instance, "refresher stopped");
}

/// Handle to a published instance.
///
/// Dropping the handle stops heartbeating without removing the record, which
/// then disappears once its lease expires. Call [`deregister`](Self::deregister)
/// to remove it right away.
pub struct Registration<B: Backend> {
    shared: Arc<Shared<B>>,
    refresher: Option<JoinHandle<()>>,
}

impl<B: Backend> Registration<B> {
    /// The published instance.
    #[must_use]
    pub fn instance(&self) -> &ServiceInstance {
        &self.shared.instance
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RegistrationState {
        *self.shared.state.lock()
    }

    /// Stop heartbeating and remove the record.
    ///
    /// Waits for an in-flight heartbeat first, so a refresh can never
    /// re-create the record after it was removed.
    pub async fn deregister(mut self) -> Result<(), DiscoveryError> {
        self.shared.cancel.cancel();

        let result = {
            let _guard = self.shared.op_lock.lock().await;
            self.shared.backend.remove(&self.shared.instance).await
        };
        self.shared.set_state(RegistrationState::Deregistered);

        match &result {
            Ok(()) => tracing::info!(instance = %self.shared.instance, "deregistered service instance"),
            Err(e) => tracing::warn!(
                instance = %self.shared.instance,
                error = %e,
                "failed to deregister service instance"
            ),
        }

        if let Some(refresher) = self.refresher.take() {
            if let Err(e) = refresher.await {
                tracing::error!(instance = %self.shared.instance, error = %e, "refresher task failed");
            }
        }

        result
    }

    /// Deregister once `signal` completes.
    ///
    /// The returned handle resolves with the deregistration outcome, so a
    /// server can await it before exiting.
    pub fn deregister_on<F>(self, signal: F) -> JoinHandle<Result<(), DiscoveryError>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            signal.await;
            tracing::info!(instance = %self.shared.instance, "shutdown requested");
            self.deregister().await
        })
    }
}

impl<B: Backend> Drop for Registration<B> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
