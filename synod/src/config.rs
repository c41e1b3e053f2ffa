//! # Summary
//!
//! This module defines the static cluster configuration for a single
//! node. Peers are identified by the ordinals `0..count`; the ordinal
//! doubles as the low bits of every ballot the node composes, which is
//! what keeps concurrent proposers' ballots distinct.

use std::time;

/// Maximum cluster size, bounded by the ordinal bits in a ballot.
const MAX_COUNT: usize = 256;

/// Defines a single node out of a cluster of `count` peers.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// This node's ordinal.
    id: usize,

    /// Total number of nodes, including this one.
    count: usize,

    /// Deadline applied to every client read and write.
    timeout: time::Duration,

    /// Base delay before retrying a nacked proposal.
    backoff: time::Duration,
}

impl Config {
    /// Creates a configuration for node `id` of `count`.
    pub fn new(id: usize, count: usize) -> Self {
        assert!(count > 0 && count <= MAX_COUNT, "cluster size out of range");
        assert!(id < count, "node ordinal out of range");
        Config {
            id,
            count,
            timeout: time::Duration::from_secs(10),
            backoff: time::Duration::from_millis(20),
        }
    }

    /// Configure the per-operation deadline.
    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configure the base retry backoff.
    pub fn with_backoff(mut self, backoff: time::Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn timeout(&self) -> time::Duration {
        self.timeout
    }

    pub(crate) fn backoff(&self) -> time::Duration {
        self.backoff
    }

    /// Number of nodes constituting a minority; a waiting set no larger
    /// than this means a strict majority has replied.
    pub(crate) fn minority(&self) -> usize {
        (self.count - 1) / 2
    }

    /// All node ordinals in the cluster, including this node's.
    pub(crate) fn peers(&self) -> impl Iterator<Item = usize> {
        0..self.count
    }
}
