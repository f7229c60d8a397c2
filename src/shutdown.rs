use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Cooperative shutdown handle shared by the server and the task monitor.
///
/// Cloning is cheap; all clones observe the same signal. The resulting
/// futures are safe to cancel by dropping.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Creates a handle that also listens for SIGINT/SIGTERM.
    pub fn spawn() -> Self {
        let shutdown = Self::new();
        shutdown.watch_signals();
        shutdown
    }

    /// Begin shutting down the program.
    pub fn shutdown(&self) {
        // Does not fail because we hold a sender.
        let _ = self.sender.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait for shutdown to begin. Resolves immediately if it already has.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.sender.subscribe();
        if *watch.borrow_and_update() {
            return;
        }
        // Does not fail because we hold a sender.
        let _ = watch.changed().await;
    }

    fn watch_signals(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if let Err(err) = signal_shutdown().await {
                tracing::error!("Error listening for shutdown signals: {err}");
            }
            shutdown.shutdown();
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> std::io::Result<()> {
    use tokio::signal::ctrl_c;

    ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, Duration};

    use super::*;

    #[tokio::test]
    async fn shutdown_signal() {
        let shutdown = Shutdown::new();
        let start = tokio::time::Instant::now();

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                sleep(Duration::from_millis(100)).await;
                shutdown.shutdown();
            }
        });

        shutdown.await_shutdown_begin().await;

        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500));
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn await_resolves_immediately_when_already_down() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();
        shutdown.await_shutdown_begin().await;
    }
}
