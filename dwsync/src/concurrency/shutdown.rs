use tokio::sync::watch;

/// Result of an operation that stops early when shutdown is requested.
#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

/// Sending side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Notifies every subscriber. Fails only when no receiver is left.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    pub fn subscribe(&self) -> ShutdownRx {
        let mut rx = self.0.subscribe();
        rx.mark_unchanged();

        ShutdownRx(rx)
    }
}

/// Receiving side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<()>);

impl ShutdownRx {
    /// Whether shutdown was requested. A dropped sender counts as a request.
    pub fn is_shutdown(&self) -> bool {
        self.0.has_changed().unwrap_or(true)
    }

    /// Waits until shutdown is requested.
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// Creates a shutdown channel with one receiver.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, mut rx) = watch::channel(());
    rx.mark_unchanged();

    (ShutdownTx(tx), ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn subscribers_observe_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        let mut other = tx.subscribe();
        assert!(!rx.is_shutdown());
        assert!(!other.is_shutdown());

        tx.shutdown().unwrap();

        assert!(rx.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), other.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn dropped_sender_counts_as_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        drop(tx);
        assert!(rx.is_shutdown());
    }
}
