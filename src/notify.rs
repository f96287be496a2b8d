//! One-shot close signal shared between a handle and the task it stops.

use std::sync::Arc;

/// Trigger side of the signal. Sending consumes the last receiver it holds,
/// which wakes every [`Receiver`] waiting on it.
#[derive(Debug)]
pub(crate) struct Sender(Option<tokio::sync::watch::Receiver<()>>);

impl Sender {
    pub(crate) fn send(&mut self) {
        if self.0.take().is_some() {
            tracing::trace!("sending close signal");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_sent(&self) -> bool {
        self.0.is_none()
    }
}

/// Waiting side of the signal.
#[derive(Debug, Clone)]
pub(crate) struct Receiver(Arc<tokio::sync::watch::Sender<()>>);

impl Receiver {
    /// Resolves once the matching [`Sender`] has fired or been dropped.
    pub(crate) async fn recv(&self) {
        self.0.closed().await;
    }
}

pub(crate) fn channel() -> (Sender, Receiver) {
    let (tx, rx) = tokio::sync::watch::channel(());
    (Sender(Some(rx)), Receiver(Arc::new(tx)))
}
