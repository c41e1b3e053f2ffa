//! # Summary
//!
//! This module defines a single node of the cluster: the inbound
//! decode/demux loop, the registry of per-key actors, and the client
//! `read`/`write` entry points.
//!
//! The registry is the only structure shared across keys, and its lock
//! covers nothing but lookup-or-create; all per-key traffic flows
//! through the owning actor's mailbox. Self-sent broadcasts join the
//! decoded inbound stream before demux, so a node's own acceptor sees
//! its own proposer's messages in the normal event order.

use std::collections::HashMap as Map;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Error;
use crate::internal;
use crate::message::Message;
use crate::shared::Shared;
use crate::storage::Storage;
use crate::thread::actor;

/// A single node of the write-once store.
///
/// The host owns the transport: it feeds received bytes into the
/// channel given to [`Node::new`] and registers one outbound byte sink
/// per peer with [`Node::connect_peer`]. The transport may lose,
/// reorder, or duplicate messages without violating safety.
pub struct Node<S> {
    config: Config,

    /// Outbound hub shared with every per-key actor.
    shared: Shared,

    /// Durable backing store, one logical slot per key.
    storage: Arc<S>,

    /// Per-key actor mailboxes, created on first demand.
    registry: Mutex<Map<u64, internal::Tx<actor::In>>>,
}

impl<S: Storage> Node<S> {
    /// Creates a node that consumes peer bytes from `inbound`.
    pub fn new(config: Config, storage: S, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) -> Arc<Self> {
        let (demux_rx, demux_tx) = internal::new();
        let shared = Shared::new(config.id(), demux_tx.clone());
        let node = Arc::new(Node {
            config,
            shared,
            storage: Arc::new(storage),
            registry: Mutex::new(Map::default()),
        });

        // Decode inbound bytes onto the same queue self-sends use, so
        // one demux loop sees all traffic in arrival order.
        tokio::spawn(async move {
            while let Some(bytes) = inbound.recv().await {
                match Message::decode(&bytes) {
                | Ok(message) => demux_tx.try_send(message),
                | Err(error) => warn!("dropping inbound message: {}", error),
                }
            }
        });

        tokio::spawn(Arc::clone(&node).dispatch(demux_rx));
        node
    }

    /// Routes each decoded message to its key's actor.
    async fn dispatch(self: Arc<Self>, mut rx: internal::Rx<Message>) {
        while let Some(message) = rx.recv().await {
            self.actor(message.key()).send(actor::In::Peer(message));
        }
    }

    /// Registers the outbound byte sink for a remote peer.
    pub fn connect_peer(&self, id: usize, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.shared.connect_peer(id, tx);
    }

    /// Drops the outbound byte sink for a remote peer. Traffic to it
    /// is discarded until it reconnects.
    pub fn disconnect_peer(&self, id: usize) {
        self.shared.disconnect_peer(id);
    }

    /// This node's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Looks up or creates the actor owning `key`. The lock covers
    /// only this lookup; actors never block each other.
    fn actor(&self, key: u64) -> internal::Tx<actor::In> {
        let mut registry = self.registry.lock();
        registry
            .entry(key)
            .or_insert_with(|| {
                let (rx, tx) = internal::new();
                let actor = actor::Actor::new(
                    key,
                    self.config,
                    rx,
                    tx.clone(),
                    self.shared.clone(),
                    Arc::clone(&self.storage),
                );
                tokio::spawn(actor.run());
                tx
            })
            .clone()
    }

    /// Reads the chosen value for `key`, or `None` if the cluster can
    /// prove no value has been chosen yet.
    pub async fn read(&self, ctx: &CancellationToken, key: u64) -> Result<Option<Vec<u8>>, Error> {
        let (operation, rx) = operation(Vec::new());
        let op_id = operation.op_id;
        self.actor(key).send(actor::In::Read(operation));
        let value = self.wait(ctx, key, op_id, rx).await?;
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    /// Writes `value` to `key`, returning the value actually chosen —
    /// which is another proposer's if that proposal won the key.
    /// Callers that care must compare.
    pub async fn write(&self, ctx: &CancellationToken, key: u64, value: Vec<u8>) -> Result<Vec<u8>, Error> {
        if value.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let (operation, rx) = operation(value);
        let op_id = operation.op_id;
        self.actor(key).send(actor::In::Write(operation));
        self.wait(ctx, key, op_id, rx).await
    }

    /// Awaits the actor's reply, the caller's cancellation, or the
    /// configured deadline, whichever fires first. Per-operation state
    /// in the actor is discarded on every exit path.
    async fn wait(
        &self,
        ctx: &CancellationToken,
        key: u64,
        op_id: u128,
        rx: oneshot::Receiver<Result<Vec<u8>, Error>>,
    ) -> Result<Vec<u8>, Error> {
        let _cleanup = Cleanup { tx: self.actor(key), op_id };
        tokio::select! {
            reply = rx => reply.unwrap_or(Err(Error::Cancelled)),
            _ = ctx.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(self.config.timeout()) => Err(Error::DeadlineExceeded),
        }
    }
}

/// Creates a fresh operation and the client half of its reply channel.
fn operation(value: Vec<u8>) -> (actor::Operation, oneshot::Receiver<Result<Vec<u8>, Error>>) {
    let (reply, rx) = oneshot::channel();
    let operation = actor::Operation {
        op_id: rand::random::<u128>(),
        value,
        reply,
    };
    (operation, rx)
}

/// Posts a cleanup ticket once the client stops waiting, whether by
/// reply, cancellation, deadline, or a dropped future.
struct Cleanup {
    tx: internal::Tx<actor::In>,
    op_id: u128,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.tx.try_send(actor::In::Cleanup(self.op_id));
    }
}
