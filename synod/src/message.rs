//! # Summary
//!
//! This module defines ballot numbers and the peer wire messages.
//! Messages are encoded as JSON objects keyed by the message type, with
//! short field names inside; the transport only ever sees the encoded
//! bytes. Unknown fields are ignored on decode, and unknown message
//! types fail decode so the dispatcher can log and drop them.

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;

/// Low bits of a ballot reserved for the proposing node's ordinal.
/// Bounds the cluster at 256 nodes.
const ORDINAL_BITS: u32 = 8;

/// A ballot number: `(round << 8) | ordinal`.
///
/// Ballots are totally ordered by their packed value. Uniqueness per
/// (node, key) follows from the per-key round counter and the node
/// ordinal in the low bits: two nodes can never compose the same
/// ballot, and one node never reuses a round for a key.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot(u64);

impl Ballot {
    /// The null ballot: "nothing promised, nothing accepted".
    pub const ZERO: Ballot = Ballot(0);

    /// Composes a ballot from a round counter and a node ordinal.
    pub fn new(round: u64, ordinal: usize) -> Self {
        Ballot((round << ORDINAL_BITS) | ordinal as u64)
    }

    /// The round counter this ballot was composed from.
    pub fn round(self) -> u64 {
        self.0 >> ORDINAL_BITS
    }

    /// The ordinal of the node that composed this ballot.
    pub fn ordinal(self) -> usize {
        (self.0 & ((1 << ORDINAL_BITS) - 1)) as usize
    }
}

/// A peer wire message. One Paxos exchange step per variant.
///
/// `sender` is the sending node's ordinal, `op_id` identifies the
/// client operation being driven, and `key` routes the message to the
/// per-key actor. Responses and nacks echo the ballot they answer so
/// the proposer can discard traffic from superseded rounds; nacks carry
/// the acceptor's promised ballot so the proposer can jump past it.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    ReadRequest {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
    },
    ReadResponse {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
        /// The responder's accepted value; empty means none.
        #[serde(rename = "v", default, skip_serializing_if = "Vec::is_empty")]
        value: Vec<u8>,
    },
    Phase1Request {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
        #[serde(rename = "n")]
        n: Ballot,
    },
    Phase1Response {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
        /// The ballot this response answers.
        #[serde(rename = "n")]
        n: Ballot,
        /// The responder's accepted ballot, not the request's.
        #[serde(rename = "an", default)]
        accepted_n: Ballot,
        #[serde(rename = "v", default, skip_serializing_if = "Vec::is_empty")]
        value: Vec<u8>,
    },
    Phase1Nack {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
        /// The responder's promised ballot.
        #[serde(rename = "n")]
        n: Ballot,
    },
    Phase2Request {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
        #[serde(rename = "n")]
        n: Ballot,
        #[serde(rename = "v", default, skip_serializing_if = "Vec::is_empty")]
        value: Vec<u8>,
    },
    Phase2Response {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
        #[serde(rename = "n")]
        n: Ballot,
    },
    Phase2Nack {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
        /// The responder's promised ballot.
        #[serde(rename = "n")]
        n: Ballot,
    },
    Final {
        #[serde(rename = "s")]
        sender: usize,
        #[serde(rename = "o")]
        op_id: u128,
        #[serde(rename = "k")]
        key: u64,
        /// The chosen value.
        #[serde(rename = "v", default, skip_serializing_if = "Vec::is_empty")]
        value: Vec<u8>,
    },
}

impl Message {
    /// Encodes this message for the wire.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("[INTERNAL ERROR]: failed to encode message")
    }

    /// Decodes a wire message. Malformed bytes and unknown types fail.
    pub fn decode(bytes: &[u8]) -> Result<Message, Error> {
        serde_json::from_slice(bytes).map_err(Error::Decode)
    }

    /// The key this message belongs to.
    pub fn key(&self) -> u64 {
        match self {
        | Message::ReadRequest { key, .. }
        | Message::ReadResponse { key, .. }
        | Message::Phase1Request { key, .. }
        | Message::Phase1Response { key, .. }
        | Message::Phase1Nack { key, .. }
        | Message::Phase2Request { key, .. }
        | Message::Phase2Response { key, .. }
        | Message::Phase2Nack { key, .. }
        | Message::Final { key, .. } => *key,
        }
    }

    /// The ordinal of the node that sent this message.
    pub fn sender(&self) -> usize {
        match self {
        | Message::ReadRequest { sender, .. }
        | Message::ReadResponse { sender, .. }
        | Message::Phase1Request { sender, .. }
        | Message::Phase1Response { sender, .. }
        | Message::Phase1Nack { sender, .. }
        | Message::Phase2Request { sender, .. }
        | Message::Phase2Response { sender, .. }
        | Message::Phase2Nack { sender, .. }
        | Message::Final { sender, .. } => *sender,
        }
    }

    /// The client operation this message is driving.
    pub fn op_id(&self) -> u128 {
        match self {
        | Message::ReadRequest { op_id, .. }
        | Message::ReadResponse { op_id, .. }
        | Message::Phase1Request { op_id, .. }
        | Message::Phase1Response { op_id, .. }
        | Message::Phase1Nack { op_id, .. }
        | Message::Phase2Request { op_id, .. }
        | Message::Phase2Response { op_id, .. }
        | Message::Phase2Nack { op_id, .. }
        | Message::Final { op_id, .. } => *op_id,
        }
    }
}
