//! # Summary
//!
//! This module defines the per-key acceptor state that must survive
//! restarts. The layout on disk is a JSON object with short, stable
//! field names; other components treat the stored bytes as opaque.
//!
//! Invariants: `accepted_n <= promised_n` at every persisted snapshot;
//! `accepted_value` is non-empty whenever `accepted_n` is non-zero;
//! once `chosen` is set no field ever changes again.

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::Ballot;

/// Durable Paxos state for a single key.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcceptorState {
    /// Round counter for ballots this node composes for this key.
    /// Never decreases.
    #[serde(rename = "r", default)]
    pub round_seq: u64,

    /// Highest ballot this node has promised not to undercut.
    #[serde(rename = "pn", default)]
    pub promised_n: Ballot,

    /// Ballot of the last accepted proposal; zero means none.
    #[serde(rename = "an", default)]
    pub accepted_n: Ballot,

    /// Value of the last accepted proposal; empty means none.
    #[serde(rename = "v", default, skip_serializing_if = "Vec::is_empty")]
    pub accepted_value: Vec<u8>,

    /// Once set, `accepted_value` is the chosen value for this key and
    /// this state is frozen forever.
    #[serde(rename = "f", default)]
    pub chosen: bool,
}

impl AcceptorState {
    /// Loads the state for `key`, or the default state if the key has
    /// never been persisted.
    pub fn load<S: crate::storage::Storage + ?Sized>(storage: &S, key: u64) -> Result<Self, Error> {
        let bytes = storage.get(key)?;
        if bytes.is_empty() {
            return Ok(AcceptorState::default());
        }
        serde_json::from_slice(&bytes)
            .map_err(|error| Error::Storage(format!("corrupt state for key {}: {}", key, error)))
    }

    /// Persists this state for `key`. Durable before return.
    pub fn store<S: crate::storage::Storage + ?Sized>(&self, storage: &S, key: u64) -> Result<(), Error> {
        let bytes = serde_json::to_vec(self)
            .expect("[INTERNAL ERROR]: failed to encode acceptor state");
        storage.put(key, &bytes)
    }
}
