//! # Summary
//!
//! This module implements the outbound half of the transport seam: a
//! hub of per-peer byte sinks shared between the per-key actors. The
//! host registers one sink per remote peer; sends to this node's own
//! ordinal skip encoding and loop straight back into the dispatcher's
//! inbound stream, so a node's acceptor sees its own proposer's
//! messages like any other traffic.
//!
//! Sinks are unbounded, so a send never blocks an actor; draining a
//! sink at whatever rate the network allows is the host's business. A
//! send to an unregistered or disconnected peer is dropped — the
//! protocol treats the response that never comes as ordinary loss.

use std::collections::HashMap as Map;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::internal;
use crate::message::Message;

/// Thread-safe handle to the outbound hub.
pub(crate) struct Shared(Arc<RwLock<State>>);

impl Clone for Shared {
    fn clone(&self) -> Self {
        Shared(Arc::clone(&self.0))
    }
}

struct State {
    /// This node's ordinal.
    id: usize,

    /// Outbound byte sinks, one per connected remote peer.
    peer_txs: Map<usize, mpsc::UnboundedSender<Vec<u8>>>,

    /// Loopback into the local dispatcher for self-delivery.
    loopback: internal::Tx<Message>,
}

impl Shared {
    pub(crate) fn new(id: usize, loopback: internal::Tx<Message>) -> Self {
        Shared(Arc::new(RwLock::new(State {
            id,
            peer_txs: Map::default(),
            loopback,
        })))
    }

    /// Registers the outbound byte sink for a remote peer.
    pub(crate) fn connect_peer(&self, id: usize, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.0.write().peer_txs.insert(id, tx);
    }

    /// Drops the outbound byte sink for a remote peer.
    pub(crate) fn disconnect_peer(&self, id: usize) {
        self.0.write().peer_txs.remove(&id);
    }

    /// Sends a message to one node. Self-sends bypass the wire.
    pub(crate) fn send(&self, to: usize, message: &Message) {
        let state = self.0.read();
        if to == state.id {
            state.loopback.try_send(message.clone());
        } else if let Some(tx) = state.peer_txs.get(&to) {
            tx.send(message.encode()).ok();
        } else {
            trace!("no connection to {}, dropping {:?}", to, message);
        }
    }

    /// Sends a message to every node in the cluster, including self.
    pub(crate) fn broadcast(&self, message: &Message) {
        let state = self.0.read();
        let bytes = message.encode();
        for tx in state.peer_txs.values() {
            tx.send(bytes.clone()).ok();
        }
        state.loopback.try_send(message.clone());
    }
}
