//! # Summary
//!
//! This module implements the per-key actor: a single-consumer event
//! loop owning all Paxos state for one key, with the proposer,
//! acceptor, and learner roles fused into one node. Every mutation of
//! durable and per-operation state happens on this loop, so the
//! protocol invariants hold by sequential reasoning alone.
//!
//! Durable transitions persist before the response leaves the node;
//! a response that was never preceded by its persisted state change is
//! a promise that never happened.

use std::cmp;
use std::collections::HashMap as Map;
use std::collections::HashSet as Set;
use std::sync::Arc;
use std::time;

use tokio::sync::oneshot;

use crate::config::Config;
use crate::error::Error;
use crate::internal;
use crate::message::{Ballot, Message};
use crate::shared::Shared;
use crate::state::AcceptorState;
use crate::storage::Storage;

/// Events consumed by a per-key actor, in mailbox arrival order.
/// Self-sent broadcasts arrive here like any peer's message.
#[derive(Debug)]
pub(crate) enum In {
    /// A decoded peer message for this key.
    Peer(Message),

    /// A client read entering the quorum-read path.
    Read(Operation),

    /// A client write entering the proposer path.
    Write(Operation),

    /// Discard all per-operation state for an operation.
    Cleanup(u128),

    /// A nacked proposal's backoff elapsed; re-enter phase 1.
    Retry(u128),
}

/// One client call in flight on this node.
#[derive(Debug)]
pub(crate) struct Operation {
    pub op_id: u128,

    /// Proposed bytes; unused for reads.
    pub value: Vec<u8>,

    /// One-shot delivery back to the waiting client.
    pub reply: oneshot::Sender<Result<Vec<u8>, Error>>,
}

/// Operations this node is currently driving for its key.
enum Pending {
    Write(WriteOp),
    Read(ReadOp),
}

impl Pending {
    /// Consume the operation, delivering its result. Exactly-once
    /// delivery holds because the operation is removed from the
    /// pending map before this is called.
    fn reply(self, result: Result<Vec<u8>, Error>) {
        let reply = match self {
        | Pending::Write(op) => op.reply,
        | Pending::Read(op) => op.reply,
        };
        reply.send(result).ok();
    }
}

/// A client write being driven through the two Paxos phases.
struct WriteOp {
    /// The client's proposed bytes.
    value: Vec<u8>,

    reply: oneshot::Sender<Result<Vec<u8>, Error>>,

    /// Current ballot; zero until the first phase 1 begins.
    ballot: Ballot,

    /// Value actually proposed in phase 2: the client's, or a prior
    /// accepted value that phase 1 obliges this proposer to carry.
    proposal: Vec<u8>,

    /// Highest accepted pair reported by phase-1 responders so far.
    max_accepted_n: Ballot,
    max_accepted_value: Vec<u8>,

    /// Rounds at or below this are known taken; the next ballot must
    /// jump past them.
    round_floor: u64,

    /// Current retry delay in milliseconds, grown on every nack.
    backoff: f32,

    phase: WritePhase,
}

enum WritePhase {
    /// Waiting on phase-1 responses from these nodes.
    One { waiting: Set<usize> },

    /// Waiting on phase-2 responses from these nodes.
    Two { waiting: Set<usize> },

    /// Preempted; a retry timer is running.
    Backoff,

    /// Phase-2 majority reached; the decision broadcast is in flight.
    Done,
}

/// A client read being driven through the quorum-read path.
struct ReadOp {
    reply: oneshot::Sender<Result<Vec<u8>, Error>>,

    /// Nodes that have not yet answered.
    waiting: Set<usize>,

    /// Reply tally, keyed by the returned value bytes.
    responses: Map<Vec<u8>, usize>,
}

/// The per-key consensus state machine.
pub(crate) struct Actor<S> {
    /// The key this actor owns.
    key: u64,

    config: Config,

    /// Mailbox carrying peer messages, client requests, and tickets.
    rx: internal::Rx<In>,

    /// Handle to this actor's own mailbox, cloned into retry timers.
    tx: internal::Tx<In>,

    /// Outbound hub shared with the rest of the node.
    shared: Shared,

    /// Backing store for durable state.
    storage: Arc<S>,

    /// Durable state, loaded lazily and written through on transitions.
    cache: Option<AcceptorState>,

    /// Operations this node is currently driving, by operation id.
    pending: Map<u128, Pending>,
}

impl<S: Storage> Actor<S> {
    pub(crate) fn new(
        key: u64,
        config: Config,
        rx: internal::Rx<In>,
        tx: internal::Tx<In>,
        shared: Shared,
        storage: Arc<S>,
    ) -> Self {
        Actor {
            key,
            config,
            rx,
            tx,
            shared,
            storage,
            cache: None,
            pending: Map::default(),
        }
    }

    /// Drives the actor until every mailbox sender is gone.
    pub(crate) async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
            | In::Peer(message) => self.respond_peer(message),
            | In::Read(op) => self.respond_read(op),
            | In::Write(op) => self.respond_write(op),
            | In::Cleanup(op_id) => self.respond_cleanup(op_id),
            | In::Retry(op_id) => self.respond_retry(op_id),
            }
        }
    }

    /// Current durable state for this key, loading it on first touch.
    fn state(&mut self) -> Result<AcceptorState, Error> {
        match &self.cache {
        | Some(state) => Ok(state.clone()),
        | None => {
            let state = AcceptorState::load(self.storage.as_ref(), self.key)?;
            self.cache = Some(state.clone());
            Ok(state)
        }
        }
    }

    /// Persist `state`, updating the cache only once storage succeeds.
    fn persist(&mut self, state: &AcceptorState) -> Result<(), Error> {
        state.store(self.storage.as_ref(), self.key)?;
        self.cache = Some(state.clone());
        Ok(())
    }

    /// Fail an operation that cannot proceed, e.g. on a storage error
    /// in the proposer path.
    fn abort(&mut self, op_id: u128, error: Error) {
        if let Some(pending) = self.pending.remove(&op_id) {
            pending.reply(Err(error));
        }
    }

    fn respond_peer(&mut self, message: Message) {
        trace!("key {}: received {:?}", self.key, message);
        let state = match self.state() {
        | Ok(state) => state,
        | Err(error) => return warn!("key {}: dropping message: {}", self.key, error),
        };

        // A decided key answers everything except Final with the
        // choice itself, so stragglers converge in one round trip.
        if state.chosen && !matches!(message, Message::Final { .. }) {
            let reply = Message::Final {
                sender: self.config.id(),
                op_id: message.op_id(),
                key: self.key,
                value: state.accepted_value,
            };
            self.shared.send(message.sender(), &reply);
            return;
        }

        match message {
        | Message::ReadRequest { sender, op_id, .. } => {
            self.respond_read_request(sender, op_id)
        }
        | Message::ReadResponse { sender, op_id, value, .. } => {
            self.respond_read_response(sender, op_id, value)
        }
        | Message::Phase1Request { sender, op_id, n, .. } => {
            self.respond_phase1_request(sender, op_id, n)
        }
        | Message::Phase1Response { sender, op_id, n, accepted_n, value, .. } => {
            self.respond_phase1_response(sender, op_id, n, accepted_n, value)
        }
        | Message::Phase2Request { sender, op_id, n, value, .. } => {
            self.respond_phase2_request(sender, op_id, n, value)
        }
        | Message::Phase2Response { sender, op_id, n, .. } => {
            self.respond_phase2_response(sender, op_id, n)
        }
        | Message::Phase1Nack { op_id, n, .. }
        | Message::Phase2Nack { op_id, n, .. } => {
            self.respond_nack(op_id, n)
        }
        | Message::Final { value, .. } => self.respond_final(value),
        }
    }

    /// Acceptor answering a quorum read with its accepted value.
    fn respond_read_request(&mut self, sender: usize, op_id: u128) {
        let state = match self.state() {
        | Ok(state) => state,
        | Err(error) => return warn!("key {}: dropping read request: {}", self.key, error),
        };
        let response = Message::ReadResponse {
            sender: self.config.id(),
            op_id,
            key: self.key,
            value: state.accepted_value,
        };
        self.shared.send(sender, &response);
    }

    /// Acceptor promise path: promise the ballot if it beats the
    /// current promise. The persisted promise precedes the response.
    fn respond_phase1_request(&mut self, sender: usize, op_id: u128, n: Ballot) {
        let mut state = match self.state() {
        | Ok(state) => state,
        | Err(error) => return warn!("key {}: dropping phase 1 request: {}", self.key, error),
        };
        let response = if n > state.promised_n {
            state.promised_n = n;
            if let Err(error) = self.persist(&state) {
                // The promise did not happen; stay silent and let the
                // proposer retry elsewhere.
                return error!("key {}: failed to persist promise: {}", self.key, error);
            }
            debug!("key {}: promised {:?}", self.key, n);
            Message::Phase1Response {
                sender: self.config.id(),
                op_id,
                key: self.key,
                n,
                accepted_n: state.accepted_n,
                value: state.accepted_value.clone(),
            }
        } else {
            Message::Phase1Nack {
                sender: self.config.id(),
                op_id,
                key: self.key,
                n: state.promised_n,
            }
        };
        self.shared.send(sender, &response);
    }

    /// Acceptor accept path: accept any proposal at or above the
    /// promise. The persisted accept precedes the response.
    fn respond_phase2_request(&mut self, sender: usize, op_id: u128, n: Ballot, value: Vec<u8>) {
        let mut state = match self.state() {
        | Ok(state) => state,
        | Err(error) => return warn!("key {}: dropping phase 2 request: {}", self.key, error),
        };
        let response = if n >= state.promised_n {
            state.promised_n = n;
            state.accepted_n = n;
            state.accepted_value = value;
            if let Err(error) = self.persist(&state) {
                return error!("key {}: failed to persist accept: {}", self.key, error);
            }
            debug!("key {}: accepted {:?}", self.key, n);
            Message::Phase2Response {
                sender: self.config.id(),
                op_id,
                key: self.key,
                n,
            }
        } else {
            Message::Phase2Nack {
                sender: self.config.id(),
                op_id,
                key: self.key,
                n: state.promised_n,
            }
        };
        self.shared.send(sender, &response);
    }

    /// Proposer entry: a client write for this key.
    fn respond_write(&mut self, op: Operation) {
        let state = match self.state() {
        | Ok(state) => state,
        | Err(error) => {
            op.reply.send(Err(error)).ok();
            return;
        }
        };
        if state.chosen {
            op.reply.send(Ok(state.accepted_value)).ok();
            return;
        }
        let op_id = op.op_id;
        self.pending.insert(op_id, Pending::Write(WriteOp {
            value: op.value,
            reply: op.reply,
            ballot: Ballot::ZERO,
            proposal: Vec::new(),
            max_accepted_n: Ballot::ZERO,
            max_accepted_value: Vec::new(),
            round_floor: 0,
            backoff: self.config.backoff().as_millis() as f32 * rand::random::<f32>(),
            phase: WritePhase::Backoff,
        }));
        self.start_phase1(op_id);
    }

    /// Begin a fresh ballot for a pending write: bump and persist the
    /// round counter, then solicit promises from every node.
    fn start_phase1(&mut self, op_id: u128) {
        let round_floor = match self.pending.get(&op_id) {
        | Some(Pending::Write(op)) => op.round_floor,
        | _ => return,
        };
        let mut state = match self.state() {
        | Ok(state) => state,
        | Err(error) => return self.abort(op_id, error),
        };
        state.round_seq = cmp::max(state.round_seq, round_floor) + 1;
        if let Err(error) = self.persist(&state) {
            return self.abort(op_id, error);
        }
        let n = Ballot::new(state.round_seq, self.config.id());
        if let Some(Pending::Write(op)) = self.pending.get_mut(&op_id) {
            op.ballot = n;
            op.max_accepted_n = Ballot::ZERO;
            op.max_accepted_value.clear();
            op.phase = WritePhase::One { waiting: self.config.peers().collect() };
        }
        debug!("key {}: proposing with {:?}", self.key, n);
        self.shared.broadcast(&Message::Phase1Request {
            sender: self.config.id(),
            op_id,
            key: self.key,
            n,
        });
    }

    /// Proposer collecting promises for the current ballot.
    fn respond_phase1_response(
        &mut self,
        sender: usize,
        op_id: u128,
        n: Ballot,
        accepted_n: Ballot,
        value: Vec<u8>,
    ) {
        let ready = match self.pending.get_mut(&op_id) {
        | Some(Pending::Write(op)) if op.ballot == n => {
            let waiting = match &mut op.phase {
            | WritePhase::One { waiting } => waiting,
            | _ => return,
            };
            if !waiting.remove(&sender) {
                return;
            }
            if accepted_n > op.max_accepted_n {
                op.max_accepted_n = accepted_n;
                op.max_accepted_value = value;
            }
            waiting.len() <= self.config.minority()
        }
        | _ => return,
        };
        if ready {
            self.start_phase2(op_id);
        }
    }

    /// A majority promised the ballot: propose a value. If any
    /// responder reported an accepted proposal, this proposer is bound
    /// to carry the highest-balloted one instead of the client's.
    fn start_phase2(&mut self, op_id: u128) {
        let (n, value) = match self.pending.get_mut(&op_id) {
        | Some(Pending::Write(op)) => {
            op.proposal = if op.max_accepted_n > Ballot::ZERO {
                op.max_accepted_value.clone()
            } else {
                op.value.clone()
            };
            op.phase = WritePhase::Two { waiting: self.config.peers().collect() };
            (op.ballot, op.proposal.clone())
        }
        | _ => return,
        };
        self.shared.broadcast(&Message::Phase2Request {
            sender: self.config.id(),
            op_id,
            key: self.key,
            n,
            value,
        });
    }

    /// Proposer collecting accepts for the current ballot.
    fn respond_phase2_response(&mut self, sender: usize, op_id: u128, n: Ballot) {
        let decided = match self.pending.get_mut(&op_id) {
        | Some(Pending::Write(op)) if op.ballot == n => {
            match &mut op.phase {
            | WritePhase::Two { waiting } => {
                if !waiting.remove(&sender) {
                    return;
                }
                waiting.len() <= self.config.minority()
            }
            | _ => return,
            }
        }
        | _ => return,
        };
        if !decided {
            return;
        }
        let value = match self.pending.get_mut(&op_id) {
        | Some(Pending::Write(op)) => {
            op.phase = WritePhase::Done;
            op.proposal.clone()
        }
        | _ => return,
        };
        info!("key {}: decided", self.key);
        // The self-delivered Final freezes the durable state and
        // resolves every pending operation, this one included.
        self.shared.broadcast(&Message::Final {
            sender: self.config.id(),
            op_id,
            key: self.key,
            value,
        });
    }

    /// A nack preempts the current ballot: discard its phase state,
    /// remember the promised round to jump past, and retry after a
    /// jittered delay.
    fn respond_nack(&mut self, op_id: u128, promised: Ballot) {
        let delay = match self.pending.get_mut(&op_id) {
        | Some(Pending::Write(op)) => {
            if promised < op.ballot {
                return; // Answers a superseded ballot.
            }
            match op.phase {
            | WritePhase::One { .. } | WritePhase::Two { .. } => (),
            | WritePhase::Backoff | WritePhase::Done => return,
            }
            op.phase = WritePhase::Backoff;
            op.round_floor = cmp::max(op.round_floor, promised.round());
            op.backoff = (op.backoff * (1.0 + rand::random::<f32>() / 2.0)).max(1.0);
            time::Duration::from_millis(op.backoff.round() as u64)
        }
        | _ => return,
        };
        debug!("key {}: preempted by {:?}, retrying in {:?}", self.key, promised, delay);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tx.try_send(In::Retry(op_id));
        });
    }

    /// A backoff elapsed; if the operation is still waiting to retry,
    /// re-enter phase 1 with a fresh ballot.
    fn respond_retry(&mut self, op_id: u128) {
        let retry = matches!(
            self.pending.get(&op_id),
            Some(Pending::Write(op)) if matches!(op.phase, WritePhase::Backoff)
        );
        if retry {
            self.start_phase1(op_id);
        }
    }

    /// Learner entry: a client read for this key.
    fn respond_read(&mut self, op: Operation) {
        let state = match self.state() {
        | Ok(state) => state,
        | Err(error) => {
            op.reply.send(Err(error)).ok();
            return;
        }
        };
        if state.chosen {
            op.reply.send(Ok(state.accepted_value)).ok();
            return;
        }
        let op_id = op.op_id;
        self.pending.insert(op_id, Pending::Read(ReadOp {
            reply: op.reply,
            waiting: self.config.peers().collect(),
            responses: Map::default(),
        }));
        self.shared.broadcast(&Message::ReadRequest {
            sender: self.config.id(),
            op_id,
            key: self.key,
        });
    }

    /// Tally one quorum-read reply. A value holding a strict majority
    /// is the chosen value, because a chosen value must already sit on
    /// a majority of acceptors. Once no value can reach a majority the
    /// key is proven undecided and the read returns empty.
    fn respond_read_response(&mut self, sender: usize, op_id: u128, value: Vec<u8>) {
        let count = self.config.count();
        let outcome = match self.pending.get_mut(&op_id) {
        | Some(Pending::Read(op)) => {
            if !op.waiting.remove(&sender) {
                return;
            }
            let tally = op.responses.entry(value.clone()).or_insert(0);
            *tally += 1;
            if *tally > count / 2 {
                Some(value)
            } else {
                let best = op.responses.values().copied().max().unwrap_or(0);
                if best + op.waiting.len() <= count / 2 {
                    Some(Vec::new())
                } else {
                    None // Still undetermined; keep waiting.
                }
            }
        }
        | _ => return,
        };
        let value = match outcome {
        | Some(value) => value,
        | None => return,
        };
        if let Some(pending) = self.pending.remove(&op_id) {
            if !value.is_empty() {
                // A majority holds this value, so it is the choice;
                // spread the word before replying.
                self.shared.broadcast(&Message::Final {
                    sender: self.config.id(),
                    op_id,
                    key: self.key,
                    value: value.clone(),
                });
            }
            pending.reply(Ok(value));
        }
    }

    /// Learner path: freeze the durable state and deliver the chosen
    /// value to every operation pending on this key.
    fn respond_final(&mut self, value: Vec<u8>) {
        let mut state = match self.state() {
        | Ok(state) => state,
        | Err(error) => return warn!("key {}: dropping final: {}", self.key, error),
        };
        if !state.chosen {
            state.chosen = true;
            state.accepted_value = value;
            if let Err(error) = self.persist(&state) {
                return error!("key {}: failed to persist final value: {}", self.key, error);
            }
            info!("key {}: learned final value", self.key);
        }
        for (_, pending) in self.pending.drain() {
            pending.reply(Ok(state.accepted_value.clone()));
        }
    }

    /// The client stopped waiting: discard all per-operation state.
    /// Responses still in flight for this operation no longer match
    /// anything and fall through silently.
    fn respond_cleanup(&mut self, op_id: u128) {
        self.pending.remove(&op_id);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::storage::MemoryStorage;

    const KEY: u64 = 7;

    /// Drives an actor for node 0 directly, capturing self-sends on
    /// `loopback` and remote sends on `peers[id - 1]`.
    struct Harness {
        actor: Actor<MemoryStorage>,
        storage: MemoryStorage,
        loopback: internal::Rx<Message>,
        peers: Vec<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    fn harness(count: usize) -> Harness {
        let (loopback, loopback_tx) = internal::new();
        let shared = Shared::new(0, loopback_tx);
        let mut peers = Vec::new();
        for id in 1..count {
            let (tx, rx) = mpsc::unbounded_channel();
            shared.connect_peer(id, tx);
            peers.push(rx);
        }
        let storage = MemoryStorage::new();
        let config = Config::new(0, count)
            .with_backoff(time::Duration::from_millis(1));
        let (rx, tx) = internal::new();
        let actor = Actor::new(KEY, config, rx, tx.clone(), shared, Arc::new(storage.clone()));
        Harness { actor, storage, loopback, peers }
    }

    impl Harness {
        fn self_sent(&mut self) -> Message {
            self.loopback.try_recv().expect("expected a self-send")
        }

        fn peer_sent(&mut self, id: usize) -> Message {
            let bytes = self.peers[id - 1].try_recv().expect("expected a peer send");
            Message::decode(&bytes).unwrap()
        }

        fn persisted(&self) -> AcceptorState {
            AcceptorState::load(&self.storage, KEY).unwrap()
        }
    }

    fn operation(op_id: u128, value: &[u8]) -> (Operation, oneshot::Receiver<Result<Vec<u8>, Error>>) {
        let (reply, rx) = oneshot::channel();
        (Operation { op_id, value: value.to_vec(), reply }, rx)
    }

    #[tokio::test]
    async fn promise_is_persisted_before_response() {
        let mut h = harness(3);
        let n = Ballot::new(1, 1);
        h.actor.respond_peer(Message::Phase1Request { sender: 1, op_id: 5, key: KEY, n });
        assert_eq!(h.persisted().promised_n, n);
        match h.peer_sent(1) {
        | Message::Phase1Response { n: echoed, accepted_n, value, .. } => {
            assert_eq!(echoed, n);
            assert_eq!(accepted_n, Ballot::ZERO);
            assert!(value.is_empty());
        }
        | other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stale_ballot_is_nacked() {
        let mut h = harness(3);
        let high = Ballot::new(2, 1);
        h.actor.respond_peer(Message::Phase1Request { sender: 1, op_id: 5, key: KEY, n: high });
        h.peer_sent(1);

        let low = Ballot::new(1, 2);
        h.actor.respond_peer(Message::Phase1Request { sender: 2, op_id: 6, key: KEY, n: low });
        match h.peer_sent(2) {
        | Message::Phase1Nack { n, .. } => assert_eq!(n, high),
        | other => panic!("unexpected response: {:?}", other),
        }
        // The losing ballot left no trace.
        assert_eq!(h.persisted().promised_n, high);
    }

    #[tokio::test]
    async fn accept_is_persisted_before_response() {
        let mut h = harness(3);
        let n = Ballot::new(3, 2);
        h.actor.respond_peer(Message::Phase2Request {
            sender: 2,
            op_id: 5,
            key: KEY,
            n,
            value: b"agreed".to_vec(),
        });
        let state = h.persisted();
        assert_eq!(state.accepted_n, n);
        assert_eq!(state.promised_n, n);
        assert_eq!(state.accepted_value, b"agreed");
        assert!(matches!(h.peer_sent(2), Message::Phase2Response { .. }));
    }

    #[tokio::test]
    async fn accept_below_promise_is_nacked() {
        let mut h = harness(3);
        let promised = Ballot::new(5, 1);
        h.actor.respond_peer(Message::Phase1Request { sender: 1, op_id: 1, key: KEY, n: promised });
        h.peer_sent(1);

        h.actor.respond_peer(Message::Phase2Request {
            sender: 2,
            op_id: 2,
            key: KEY,
            n: Ballot::new(4, 2),
            value: b"late".to_vec(),
        });
        match h.peer_sent(2) {
        | Message::Phase2Nack { n, .. } => assert_eq!(n, promised),
        | other => panic!("unexpected response: {:?}", other),
        }
        let state = h.persisted();
        assert_eq!(state.accepted_n, Ballot::ZERO);
        assert!(state.accepted_value.is_empty());
    }

    #[tokio::test]
    async fn acceptor_state_is_monotonic() {
        let mut h = harness(5);
        let mut last = Ballot::ZERO;
        for (round, ordinal) in [(1, 1), (3, 2), (2, 4), (3, 1), (4, 0)] {
            let n = Ballot::new(round, ordinal);
            h.actor.respond_peer(Message::Phase1Request { sender: 1, op_id: 1, key: KEY, n });
            let state = h.persisted();
            assert!(state.promised_n >= last, "promise went backwards");
            assert!(state.accepted_n <= state.promised_n);
            last = state.promised_n;
        }
        assert_eq!(last, Ballot::new(4, 0));
    }

    #[tokio::test]
    async fn write_proposes_client_value_when_unconstrained() {
        let mut h = harness(3);
        let (op, _rx) = operation(9, b"mine");
        h.actor.respond_write(op);

        let n = match h.self_sent() {
        | Message::Phase1Request { n, .. } => n,
        | other => panic!("unexpected broadcast: {:?}", other),
        };
        assert_eq!(n, Ballot::new(1, 0));
        assert_eq!(h.persisted().round_seq, 1);

        for sender in [1, 2] {
            h.actor.respond_peer(Message::Phase1Response {
                sender,
                op_id: 9,
                key: KEY,
                n,
                accepted_n: Ballot::ZERO,
                value: Vec::new(),
            });
        }
        match h.self_sent() {
        | Message::Phase2Request { n: phase2_n, value, .. } => {
            assert_eq!(phase2_n, n);
            assert_eq!(value, b"mine");
        }
        | other => panic!("unexpected broadcast: {:?}", other),
        }
    }

    #[tokio::test]
    async fn write_carries_highest_accepted_value() {
        let mut h = harness(5);
        let (op, _rx) = operation(9, b"mine");
        h.actor.respond_write(op);
        let n = match h.self_sent() {
        | Message::Phase1Request { n, .. } => n,
        | other => panic!("unexpected broadcast: {:?}", other),
        };

        h.actor.respond_peer(Message::Phase1Response {
            sender: 1,
            op_id: 9,
            key: KEY,
            n,
            accepted_n: Ballot::new(1, 1),
            value: b"older".to_vec(),
        });
        h.actor.respond_peer(Message::Phase1Response {
            sender: 2,
            op_id: 9,
            key: KEY,
            n,
            accepted_n: Ballot::new(2, 2),
            value: b"newest".to_vec(),
        });
        h.actor.respond_peer(Message::Phase1Response {
            sender: 3,
            op_id: 9,
            key: KEY,
            n,
            accepted_n: Ballot::ZERO,
            value: Vec::new(),
        });
        match h.self_sent() {
        | Message::Phase2Request { value, .. } => assert_eq!(value, b"newest"),
        | other => panic!("unexpected broadcast: {:?}", other),
        }
    }

    #[tokio::test]
    async fn write_decides_through_the_full_protocol() {
        let mut h = harness(3);
        let (op, mut rx) = operation(9, b"agreed");
        h.actor.respond_write(op);

        // Self-delivery: the node's own acceptor handles its own
        // proposer's messages through the ordinary path.
        let phase1 = h.self_sent();
        h.actor.respond_peer(phase1);
        let response = h.self_sent();
        assert!(matches!(response, Message::Phase1Response { .. }));
        h.actor.respond_peer(response);
        h.actor.respond_peer(Message::Phase1Response {
            sender: 1,
            op_id: 9,
            key: KEY,
            n: Ballot::new(1, 0),
            accepted_n: Ballot::ZERO,
            value: Vec::new(),
        });

        let phase2 = h.self_sent();
        assert!(matches!(phase2, Message::Phase2Request { .. }));
        h.actor.respond_peer(phase2);
        let response = h.self_sent();
        assert!(matches!(response, Message::Phase2Response { .. }));
        h.actor.respond_peer(response);
        h.actor.respond_peer(Message::Phase2Response {
            sender: 1,
            op_id: 9,
            key: KEY,
            n: Ballot::new(1, 0),
        });

        let decision = h.self_sent();
        match &decision {
        | Message::Final { value, .. } => assert_eq!(value, b"agreed"),
        | other => panic!("unexpected broadcast: {:?}", other),
        }
        h.actor.respond_peer(decision);

        assert_eq!(rx.try_recv().unwrap().unwrap(), b"agreed");
        assert!(h.actor.pending.is_empty());
        let state = h.persisted();
        assert!(state.chosen);
        assert_eq!(state.accepted_value, b"agreed");
    }

    #[tokio::test]
    async fn nacked_write_retries_past_the_promised_round() {
        let mut h = harness(3);
        let (op, _rx) = operation(9, b"mine");
        h.actor.respond_write(op);
        h.self_sent();

        h.actor.respond_peer(Message::Phase1Nack {
            sender: 1,
            op_id: 9,
            key: KEY,
            n: Ballot::new(8, 1),
        });
        // The backoff timer posts Retry to the mailbox; drive it by hand.
        h.actor.respond_retry(9);

        match h.self_sent() {
        | Message::Phase1Request { n, .. } => {
            assert!(n > Ballot::new(8, 1));
            assert_eq!(n.round(), 9);
        }
        | other => panic!("unexpected broadcast: {:?}", other),
        }
        assert_eq!(h.persisted().round_seq, 9);
    }

    #[tokio::test]
    async fn decided_key_short_circuits_everything() {
        let mut h = harness(3);
        let decided = AcceptorState {
            round_seq: 2,
            promised_n: Ballot::new(2, 1),
            accepted_n: Ballot::new(2, 1),
            accepted_value: b"settled".to_vec(),
            chosen: true,
        };
        decided.store(&h.storage, KEY).unwrap();

        // Any peer message but Final is answered with the choice.
        h.actor.respond_peer(Message::Phase1Request {
            sender: 2,
            op_id: 4,
            key: KEY,
            n: Ballot::new(9, 2),
        });
        match h.peer_sent(2) {
        | Message::Final { value, .. } => assert_eq!(value, b"settled"),
        | other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(h.persisted().promised_n, Ballot::new(2, 1));

        // Client traffic is answered locally without a single send.
        let (op, mut rx) = operation(5, b"too-late");
        h.actor.respond_write(op);
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"settled");
        let (op, mut rx) = operation(6, b"");
        h.actor.respond_read(op);
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"settled");
        assert!(h.loopback.try_recv().is_none());
    }

    #[tokio::test]
    async fn read_returns_majority_value_and_spreads_it() {
        let mut h = harness(3);
        let (op, mut rx) = operation(11, b"");
        h.actor.respond_read(op);
        assert!(matches!(h.self_sent(), Message::ReadRequest { .. }));

        for sender in [1, 2] {
            h.actor.respond_peer(Message::ReadResponse {
                sender,
                op_id: 11,
                key: KEY,
                value: b"seen".to_vec(),
            });
        }
        match h.self_sent() {
        | Message::Final { value, .. } => assert_eq!(value, b"seen"),
        | other => panic!("unexpected broadcast: {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"seen");
        assert!(h.actor.pending.is_empty());
    }

    #[tokio::test]
    async fn read_gives_up_once_no_majority_is_possible() {
        let mut h = harness(3);
        let (op, mut rx) = operation(11, b"");
        h.actor.respond_read(op);
        h.self_sent();

        h.actor.respond_peer(Message::ReadResponse { sender: 1, op_id: 11, key: KEY, value: b"a".to_vec() });
        h.actor.respond_peer(Message::ReadResponse { sender: 2, op_id: 11, key: KEY, value: b"b".to_vec() });
        assert!(rx.try_recv().is_err(), "still one answer outstanding");
        h.actor.respond_peer(Message::ReadResponse { sender: 0, op_id: 11, key: KEY, value: Vec::new() });

        // Three different answers: nothing was chosen.
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"");
        // No Final was broadcast for an undecided key.
        assert!(h.loopback.try_recv().is_none());
    }

    #[tokio::test]
    async fn read_with_empty_majority_returns_empty() {
        let mut h = harness(3);
        let (op, mut rx) = operation(11, b"");
        h.actor.respond_read(op);
        h.self_sent();

        for sender in [1, 2] {
            h.actor.respond_peer(Message::ReadResponse { sender, op_id: 11, key: KEY, value: Vec::new() });
        }
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"");
        assert!(h.loopback.try_recv().is_none());
    }

    #[tokio::test]
    async fn cleanup_discards_the_operation() {
        let mut h = harness(3);
        let (op, mut rx) = operation(9, b"mine");
        h.actor.respond_write(op);
        let n = match h.self_sent() {
        | Message::Phase1Request { n, .. } => n,
        | other => panic!("unexpected broadcast: {:?}", other),
        };

        h.actor.respond_cleanup(9);
        assert!(h.actor.pending.is_empty());
        assert!(rx.try_recv().is_err(), "reply channel closed without a send");

        // Late responses for the discarded operation fall through.
        h.actor.respond_peer(Message::Phase1Response {
            sender: 1,
            op_id: 9,
            key: KEY,
            n,
            accepted_n: Ballot::ZERO,
            value: Vec::new(),
        });
        h.actor.respond_retry(9);
        assert!(h.loopback.try_recv().is_none());
        assert!(h.actor.pending.is_empty());
    }
}

