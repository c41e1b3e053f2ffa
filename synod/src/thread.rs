//! # Summary
//!
//! This module contains the per-key worker task for the consensus
//! protocol. Unlike a replicated log, a write-once store needs no
//! separate scout, commander, or replica roles: a single key is a
//! single decree, so the proposer, acceptor, and learner collapse into
//! one event loop per key.

/// The fused proposer/acceptor/learner for one key.
pub(crate) mod actor;
