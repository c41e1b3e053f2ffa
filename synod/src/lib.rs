//! # Summary
//!
//! This crate implements a strongly-consistent, write-once distributed
//! key/value store built from the Single-Decree Paxos algorithm. Every
//! key is an independent Paxos instance: once a value has been chosen
//! for a key, it is fixed forever and every subsequent read or write
//! observes that same value.
//!
//! A [`Node`] fuses the proposer, acceptor, and learner roles for its
//! share of the cluster. The host supplies durable [`Storage`] and the
//! transport: one outbound byte sink per peer and a single inbound byte
//! source, wired up with [`Node::connect_peer`]. Clients call
//! [`Node::read`] and [`Node::write`] from any node; the cluster
//! serializes concurrent proposals into a single agreed value per key
//! even under message loss, reordering, and minority failures.

#[macro_use] extern crate log;

mod config;
mod error;
mod internal;
mod message;
mod node;
mod shared;
mod state;
mod storage;
mod thread;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::message::{Ballot, Message};
pub use crate::node::Node;
pub use crate::state::AcceptorState;
pub use crate::storage::{DiskStorage, MemoryStorage, Storage};

pub use tokio_util::sync::CancellationToken;
