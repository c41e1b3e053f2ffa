//! # Summary
//!
//! This module abstracts over intra-node connections between the
//! dispatcher and the per-key actors.
//!
//! Currently backed by `tokio::sync::mpsc` unbounded channels, so
//! senders never block the state machine. A send can only fail if the
//! receiving actor has exited; `send` treats that as an internal error
//! while `try_send` quietly drops the message for paths (retry timers,
//! cleanup tickets) that may legitimately outlive their actor.

use tokio::sync::mpsc;

/// Intra-node receiving channel.
#[derive(Debug)]
pub(crate) struct Rx<T>(mpsc::UnboundedReceiver<T>);

/// Intra-node transmission channel. All clones send to the same
/// receiving end.
#[derive(Debug)]
pub(crate) struct Tx<T>(mpsc::UnboundedSender<T>);

impl<T> Clone for Tx<T> {
    fn clone(&self) -> Self {
        Tx(self.0.clone())
    }
}

/// Create a new pair of linked receiving and transmitting channels.
pub(crate) fn new<T>() -> (Rx<T>, Tx<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Rx(rx), Tx(tx))
}

impl<T> Tx<T> {
    /// Force a message through the channel.
    /// Panics if the receiving end has been dropped.
    pub fn send(&self, message: T) {
        self.0.send(message).ok().expect("[INTERNAL ERROR]: receiver dropped");
    }

    /// Attempt to send a message through the channel.
    /// Does nothing if the receiving end has been dropped.
    pub fn try_send(&self, message: T) {
        self.0.send(message).ok();
    }
}

impl<T> Rx<T> {
    /// Receive the next message, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }
}

#[cfg(test)]
impl<T> Rx<T> {
    /// Non-blocking receive for unit tests.
    pub fn try_recv(&mut self) -> Option<T> {
        self.0.try_recv().ok()
    }
}
