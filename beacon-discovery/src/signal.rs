//! Process shutdown signal for [`Registration::deregister_on`](crate::Registration::deregister_on).

/// Complete when the process receives SIGINT, SIGTERM, SIGHUP or SIGQUIT.
///
/// Off Unix only Ctrl-C is observed. A handler that fails to install is
/// logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received interrupt signal"),
            Err(e) => {
                tracing::error!(error = %e, "failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;

        tokio::select! {
            () = ctrl_c => {}
            () = unix_signal(SignalKind::terminate(), "SIGTERM") => {}
            () = unix_signal(SignalKind::hangup(), "SIGHUP") => {}
            () = unix_signal(SignalKind::quit(), "SIGQUIT") => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind, name: &'static str) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut signal) => {
            signal.recv().await;
            tracing::info!(signal = name, "received shutdown signal");
        }
        Err(e) => {
            tracing::error!(signal = name, error = %e, "failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}
