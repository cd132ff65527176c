use tokio_util::sync::CancellationToken;

/// Returns a token that is cancelled by the first SIGINT or SIGTERM.
/// Every wait and retry suspension point checks it.
pub fn cancel_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signalled = cancel.clone();
    tokio::spawn(async move {
        let signal_name = termination_signal().await;
        tracing::warn!(signal = signal_name, "termination requested; cancelling the active phase");
        signalled.cancel();
    });
    cancel
}

#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("install Ctrl+C handler");
    "interrupt"
}
