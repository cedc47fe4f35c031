//! Higher-level API for a cluster server.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt;

use bytes::Bytes;
use rand_core::RngCore;

use crate::core::{CommittedIter, ReplicationState, State};
use crate::log::Log;
use crate::message::{LogIndex, Message, SendableMessage, ServerId, Term};

/// A cluster server, replicating a strongly-consistent log of opaque commands with its peers.
///
/// # Lifecycle
///
/// A [`Node`] is constructed booting and inert. The driver reads the durable triple
/// `(current_term, voted_for, log)` from stable storage, defaulting to `(0, none, empty)` on
/// first boot, and passes it to [`restore`], which enters the follower role. From there the node
/// is driven in three ways:
///
/// * When a message arrives from a peer: [`receive`] is called.
/// * Every time a fixed tick interval has elapsed: [`timer_tick`] is called.
/// * When a client submits a command: [`propose`] is called.
///
/// Each call mutates the internal state and returns messages to be sent to peers.
///
/// # Persistence
///
/// Whenever a call changes the durable triple, [`take_dirty`] reports it. The driver must then
/// complete a successful write of [`persistent_state`] to stable storage *before* delivering any
/// of the messages the call returned; a reply must never outrun the state it reflects.
///
/// # Timer ticks
///
/// Timeouts are driven by a timer ticking at a fixed interval, with the number of ticks between
/// timeouts configured by [`Config`]. The interval and [`Config`] must be the same on all peers
/// in a cluster. Election timeouts are re-randomized on every reset within
/// `[election_timeout_ticks, 2 * election_timeout_ticks)`.
///
/// # Message delivery
///
/// Delivery is best-effort: messages may be dropped, duplicated, or reordered across peers.
/// Replication retries ride on the heartbeat timer, and responses are correlated to requests by
/// id, so lost messages cost latency, never safety.
///
/// # Committed entries
///
/// Once a log entry is committed, meaning stored on a quorum with an entry of the current term
/// at or above it, it is yielded exactly once by [`take_committed`], in index order, for the
/// driver to hand to the application state machine.
///
/// [`receive`]: Self::receive
/// [`restore`]: Self::restore
/// [`propose`]: Self::propose
/// [`take_dirty`]: Self::take_dirty
/// [`persistent_state`]: Self::persistent_state
/// [`take_committed`]: Self::take_committed
/// [`timer_tick`]: Self::timer_tick
pub struct Node<Random> {
    state: State<Random>,
}

/// Configurable parameters of a cluster server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The minimum number of timer ticks between leadership elections.
    pub election_timeout_ticks: u32,

    /// The number of timer ticks between heartbeats sent to peers. Must be well below
    /// [`election_timeout_ticks`](Self::election_timeout_ticks).
    pub heartbeat_interval_ticks: u32,
}

/// An error returned when a command cannot be accepted into the log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProposeError {
    /// This server does not lead the latest known term; resubmit to the hinted leader.
    NotLeader {
        /// The leader of the current term, when this server knows one.
        hint: Option<ServerId>,
    },
    /// The durable state has not been restored yet.
    Booting,
}

impl<Random> Node<Random>
where
    Random: RngCore,
{
    /// Constructs a booting server with the given peers and configuration.
    ///
    /// Every server in a cluster must be constructed with the same peer set and `config`.
    /// `peers` may contain `server_id` or omit it to the same effect. `random` must produce
    /// different values on every server.
    pub fn new(
        server_id: ServerId,
        peers: BTreeSet<ServerId>,
        random: Random,
        config: Config,
    ) -> Self {
        Self {
            state: State::new(server_id, peers, random, config),
        }
    }

    /// Loads the recovered durable triple and enters the follower role. See
    /// [Lifecycle](Node#lifecycle).
    pub fn restore(&mut self, term: Term, voted_for: Option<ServerId>, log: Log) {
        self.state.restore(term, voted_for, log);
    }

    /// Requests appending a command with arbitrary `data` to the log, returning the index it was
    /// staged at and messages to be sent.
    ///
    /// A staged entry is not yet committed and may later be cancelled by a leader change; it is
    /// durable and replicated once the returned messages are flushed.
    ///
    /// # Errors
    ///
    /// If this server cannot accept the command, an error naming the likely leader is returned.
    #[must_use = "This function returns messages to be sent."]
    pub fn propose<T: Into<Bytes>>(
        &mut self,
        data: T,
    ) -> Result<(LogIndex, impl Iterator<Item = SendableMessage> + '_), ProposeError> {
        let index = self.state.propose(data.into())?;
        Ok((index, self.append_entries()))
    }

    /// Processes receipt of a `message` from the server `from`, returning messages to be sent.
    #[must_use = "This function returns messages to be sent."]
    pub fn receive(
        &mut self,
        message: Message,
        from: ServerId,
    ) -> impl Iterator<Item = SendableMessage> + '_ {
        let reply = self.state.receive(message, from);
        reply.into_iter().chain(self.append_entries())
    }

    /// Ticks forward this server's internal clock by one tick, returning messages to be sent.
    #[must_use = "This function returns messages to be sent."]
    pub fn timer_tick(&mut self) -> impl Iterator<Item = SendableMessage> + '_ {
        let messages = self.state.timer_tick();
        messages.into_iter().chain(self.append_entries())
    }

    /// Returns an iterator yielding committed entries not yet handed to the state machine, in
    /// index order, each exactly once over the lifetime of the server.
    pub fn take_committed(&mut self) -> CommittedIter<'_> {
        self.state.take_committed()
    }

    /// Whether durable state changed since the last call. See [Persistence](Node#persistence).
    pub fn take_dirty(&mut self) -> bool {
        self.state.take_dirty()
    }

    /// The durable triple, exactly as it must reach stable storage.
    pub fn persistent_state(&self) -> (Term, Option<ServerId>, &Log) {
        self.state.persistent_state()
    }

    /// Returns whether this server leads the latest known term.
    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Returns the leader of the latest known term, if any, along with the term.
    pub fn leader(&self) -> (Option<ServerId>, Term) {
        self.state.leader()
    }

    /// Returns this server's id.
    pub fn server_id(&self) -> ServerId {
        self.state.server_id()
    }

    /// Returns the ids of this server's peers.
    pub fn peers(&self) -> &BTreeSet<ServerId> {
        self.state.peers()
    }

    /// Returns the index of the last committed entry.
    pub fn commit_idx(&self) -> LogIndex {
        self.state.commit_idx()
    }

    /// Returns the replication state for the peer `peer`, while this server leads.
    pub fn replication_state(&self, peer: ServerId) -> Option<&ReplicationState> {
        self.state.replication_state(peer)
    }

    /// Returns a reference to the low-level state of the server.
    pub fn state(&self) -> &State<Random> {
        &self.state
    }

    /// Returns a mutable reference to the low-level state of the server.
    pub fn state_mut(&mut self) -> &mut State<Random> {
        &mut self.state
    }

    #[must_use = "This function returns messages to be sent."]
    fn append_entries(&mut self) -> impl Iterator<Item = SendableMessage> + '_ {
        let peers: Vec<ServerId> = self.state.peers().iter().copied().collect();
        peers
            .into_iter()
            .flat_map(move |peer| self.state.append_entries(peer))
    }
}

//
// ProposeError impls
//

impl fmt::Display for ProposeError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposeError::NotLeader { hint: Some(leader) } => {
                write!(fmt, "not the leader, try {}", leader)
            }
            ProposeError::NotLeader { hint: None } => write!(fmt, "not the leader"),
            ProposeError::Booting => write!(fmt, "still booting"),
        }
    }
}
