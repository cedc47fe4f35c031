//! Unstable, low-level API for the complete state of a single cluster server.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::iter;
use core::mem;

use bytes::Bytes;
use log::{debug, error, info, warn};
use rand_core::RngCore;

use crate::log::Log;
use crate::message::*;
use crate::node::{Config, ProposeError};

use self::RoleState::*;

/// Leader-side replication bookkeeping for one peer.
pub struct ReplicationState {
    /// The index of the next log entry to send to this peer.
    pub next_idx: LogIndex,

    /// The highest index known to be stored on this peer, used to advance the commit index.
    pub match_idx: LogIndex,

    /// The id of the append request in flight to this peer, if any. At most one append is
    /// outstanding per peer; a due heartbeat supersedes it.
    inflight: Option<MessageId>,

    /// Whether a heartbeat is due to be sent to this peer.
    send_heartbeat: bool,
}

/// The server's role, together with the state that exists only in that role.
enum RoleState {
    /// Freshly constructed; nothing happens until the durable triple is loaded.
    Booting,
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

struct FollowerState {
    /// The leader of the current term, once one has made contact.
    leader: Option<ServerId>,

    election_ticks: u32,
    random_election_ticks: u32,
}

struct CandidateState {
    /// Granted or denied, by voter. Peers that have not answered are absent; only granted votes
    /// count toward quorum.
    votes: BTreeMap<ServerId, bool>,

    election_ticks: u32,
}

struct LeaderState {
    followers: BTreeMap<ServerId, ReplicationState>,

    heartbeat_ticks: u32,
}

/// A request this server has sent and not yet seen answered.
struct PendingRequest {
    to: ServerId,
    message: Message,
}

/// The complete state of a cluster server.
///
/// Durable fields (`current_term`, `voted_for`, `log`) flip the dirty flag on every mutation; the
/// driver must persist the triple before flushing any message produced by the same call.
pub struct State<Random> {
    server_id: ServerId,
    peers: BTreeSet<ServerId>,
    random: Random,
    config: Config,

    current_term: Term,
    voted_for: Option<ServerId>,
    log: Log,

    commit_idx: LogIndex,
    last_applied: LogIndex,

    role: RoleState,

    next_msg_id: MessageId,
    outstanding: BTreeMap<MessageId, PendingRequest>,

    dirty: bool,
}

#[allow(missing_docs)]
impl<Random> State<Random>
where
    Random: RngCore,
{
    pub fn new(server_id: ServerId, mut peers: BTreeSet<ServerId>, random: Random, config: Config) -> Self {
        peers.remove(&server_id);
        Self {
            server_id,
            peers,
            random,
            config,
            current_term: Term::default(),
            voted_for: None,
            log: Log::new(),
            commit_idx: LogIndex::default(),
            last_applied: LogIndex::default(),
            role: Booting,
            next_msg_id: MessageId::default(),
            outstanding: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Loads the recovered durable triple and leaves boot, entering the follower role.
    ///
    /// Ignored in any role other than booting: a live server never reloads.
    pub fn restore(&mut self, term: Term, voted_for: Option<ServerId>, log: Log) {
        match &self.role {
            Booting => {
                info!(
                    "recovered at {} with {} entries, voted for {:?}",
                    term,
                    log.len(),
                    voted_for
                );
                self.current_term = term;
                self.voted_for = voted_for;
                self.log = log;
                let random_election_ticks = self.random_election_timeout();
                self.role = Follower(FollowerState {
                    leader: None,
                    election_ticks: random_election_ticks,
                    random_election_ticks,
                });
            }
            Follower(_) | Candidate(_) | Leader(_) => {
                warn!("ignored restore on a running server");
            }
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn peers(&self) -> &BTreeSet<ServerId> {
        &self.peers
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.voted_for
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn commit_idx(&self) -> LogIndex {
        self.commit_idx
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn is_leader(&self) -> bool {
        matches!(&self.role, Leader(_))
    }

    /// The leader of the latest known term, if any, along with the term.
    pub fn leader(&self) -> (Option<ServerId>, Term) {
        let leader = match &self.role {
            Booting | Candidate(_) => None,
            Follower(follower) => follower.leader,
            Leader(_) => Some(self.server_id),
        };
        (leader, self.current_term)
    }

    pub fn replication_state(&self, peer: ServerId) -> Option<&ReplicationState> {
        if let Leader(leader) = &self.role {
            leader.followers.get(&peer)
        } else {
            None
        }
    }

    /// The durable triple, exactly as it must reach stable storage.
    pub fn persistent_state(&self) -> (Term, Option<ServerId>, &Log) {
        (self.current_term, self.voted_for, &self.log)
    }

    /// Whether durable state changed since the last call. The driver must complete a storage
    /// write before sending anything produced by the call that set this.
    pub fn take_dirty(&mut self) -> bool {
        mem::replace(&mut self.dirty, false)
    }

    /// Counts down the election or heartbeat timer by one tick.
    pub fn timer_tick(&mut self) -> Vec<SendableMessage> {
        match &mut self.role {
            Booting => Vec::new(),
            Follower(FollowerState { election_ticks, .. })
            | Candidate(CandidateState { election_ticks, .. }) => {
                match election_ticks.saturating_sub(1) {
                    0 => {
                        info!("election timeout at {}", self.current_term);
                        self.timeout()
                    }
                    new_election_ticks => {
                        *election_ticks = new_election_ticks;
                        Vec::new()
                    }
                }
            }
            Leader(leader_state) => {
                match leader_state.heartbeat_ticks.saturating_sub(1) {
                    0 => {
                        leader_state.heartbeat_ticks = self.config.heartbeat_interval_ticks;
                        debug!("heartbeat due at {}", self.current_term);
                        for replication in leader_state.followers.values_mut() {
                            replication.send_heartbeat = true;
                        }
                    }
                    new_heartbeat_ticks => {
                        leader_state.heartbeat_ticks = new_heartbeat_ticks;
                    }
                }
                Vec::new()
            }
        }
    }

    /// Starts a new election: advances the term, votes for itself, and produces one stamped
    /// vote request per peer. A cluster of one becomes leader on the spot.
    pub fn timeout(&mut self) -> Vec<SendableMessage> {
        match &self.role {
            Follower(_) | Candidate(_) => {
                self.current_term = self.current_term.next();
                self.voted_for = Some(self.server_id);
                self.mark_dirty();
                self.outstanding.clear();
                let votes = iter::once((self.server_id, true)).collect();
                self.role = Candidate(CandidateState {
                    votes,
                    election_ticks: self.random_election_timeout(),
                });
                info!("became candidate at {}", self.current_term);
                self.try_become_leader();

                let mut requests = Vec::new();
                if let Candidate(_) = &self.role {
                    let last_log_idx = self.log.last_index();
                    let last_log_term = self.log.last_term();
                    let peers: Vec<ServerId> = self.peers.iter().copied().collect();
                    for peer in peers {
                        let message = self.stamp_request(
                            Rpc::VoteRequest(VoteRequest {
                                candidate_id: self.server_id,
                                last_log_idx,
                                last_log_term,
                            }),
                            peer,
                        );
                        requests.push(SendableMessage { message, to: peer });
                    }
                }
                requests
            }
            Booting | Leader(_) => Vec::new(),
        }
    }

    /// Appends a command to the log if this server leads the latest known term.
    pub fn propose(&mut self, data: Bytes) -> Result<LogIndex, ProposeError> {
        match &self.role {
            Leader(_) => {
                self.log.append(LogEntry {
                    term: self.current_term,
                    data,
                });
                self.mark_dirty();
                self.advance_commit_idx();
                Ok(self.log.last_index())
            }
            Booting => Err(ProposeError::Booting),
            Follower(follower) => Err(ProposeError::NotLeader {
                hint: follower.leader,
            }),
            Candidate(_) => Err(ProposeError::NotLeader { hint: None }),
        }
    }

    /// Produces the append request now due for one peer, if any.
    ///
    /// Sends when entries are pending and none are in flight, or when a heartbeat is due. A due
    /// heartbeat supersedes the in-flight request so a lost response cannot stall replication.
    pub fn append_entries(&mut self, to: ServerId) -> Option<SendableMessage> {
        let (send_heartbeat, next_idx, inflight) = match &self.role {
            Leader(leader_state) => {
                let replication = leader_state.followers.get(&to)?;
                (
                    replication.send_heartbeat,
                    replication.next_idx,
                    replication.inflight,
                )
            }
            Booting | Follower(_) | Candidate(_) => return None,
        };

        let send_entries = self.log.last_index() >= next_idx && inflight.is_none();
        if !send_heartbeat && !send_entries {
            return None;
        }

        let prev_log_idx = next_idx - 1;
        let prev_log_term = match self.log.term_at(prev_log_idx) {
            Some(term) => term,
            None => {
                error!("missing log term at {} to send to {}", prev_log_idx, to);
                return None;
            }
        };
        let entries = self.log.entries_from(next_idx).to_vec();
        let last_entry = prev_log_idx + entries.len() as u64;
        let leader_commit = self.commit_idx.min(last_entry);

        if let Some(superseded) = inflight {
            self.outstanding.remove(&superseded);
        }
        let message = self.stamp_request(
            Rpc::AppendRequest(AppendRequest {
                leader_id: self.server_id,
                prev_log_idx,
                prev_log_term,
                entries,
                leader_commit,
            }),
            to,
        );
        let msg_id = message.msg_id;
        if let Leader(leader_state) = &mut self.role {
            if let Some(replication) = leader_state.followers.get_mut(&to) {
                replication.send_heartbeat = false;
                replication.inflight = Some(msg_id);
            }
        }
        Some(SendableMessage { message, to })
    }

    /// Processes one inbound message, returning the reply to send, if any.
    pub fn receive(&mut self, message: Message, from: ServerId) -> Option<SendableMessage> {
        if from != self.server_id && !self.peers.contains(&from) {
            error!("received message from {} outside the cluster", from);
            return None;
        }
        if let Booting = &self.role {
            warn!("dropped message received while booting");
            return None;
        }

        self.update_term(from, &message);
        let Message { msg_id, term, rpc } = message;
        let reply = match rpc {
            Rpc::VoteRequest(request) => self.handle_vote_request(msg_id, term, request, from),
            Rpc::VoteResponse(response) => self.handle_vote_response(msg_id, term, response, from),
            Rpc::AppendRequest(request) => self.handle_append_request(msg_id, term, request, from),
            Rpc::AppendResponse(response) => {
                self.handle_append_response(msg_id, term, response, from)
            }
        };
        self.try_become_leader();
        self.advance_commit_idx();
        reply
    }

    /// Iterates committed entries not yet applied, advancing `last_applied` as it goes.
    pub fn take_committed(&mut self) -> CommittedIter<'_> {
        CommittedIter {
            log: &self.log,
            commit_idx: self.commit_idx,
            last_applied: &mut self.last_applied,
        }
    }

    //
    // message handlers
    //

    /// Any message with a newer term makes the receiver adopt that term and step down first.
    fn update_term(&mut self, from: ServerId, message: &Message) {
        if message.term > self.current_term {
            info!(
                "stepping down: {} from {} exceeds {}",
                message.term, from, self.current_term
            );
            let random_election_ticks = self.random_election_timeout();
            let election_ticks = match &self.role {
                Follower(FollowerState { election_ticks, .. })
                | Candidate(CandidateState { election_ticks, .. }) => *election_ticks,
                Booting | Leader(_) => random_election_ticks,
            };
            self.current_term = message.term;
            self.voted_for = None;
            self.role = Follower(FollowerState {
                leader: None,
                election_ticks,
                random_election_ticks,
            });
            self.outstanding.clear();
            self.mark_dirty();
        }
    }

    fn handle_vote_request(
        &mut self,
        msg_id: MessageId,
        msg_term: Term,
        request: VoteRequest,
        from: ServerId,
    ) -> Option<SendableMessage> {
        assert!(msg_term <= self.current_term);
        let last_log_idx = self.log.last_index();
        let last_log_term = self.log.last_term();
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term && request.last_log_idx >= last_log_idx);
        let grant = msg_term == self.current_term
            && log_ok
            && self
                .voted_for
                .map(|vote| vote == request.candidate_id)
                .unwrap_or(true);

        if grant {
            info!(
                "granted vote at {} to {} with {} at {}",
                self.current_term, request.candidate_id, request.last_log_idx, request.last_log_term
            );
            self.voted_for = Some(request.candidate_id);
            self.mark_dirty();
            if let Follower(follower) = &mut self.role {
                follower.election_ticks = follower.random_election_ticks;
            }
        } else if msg_term != self.current_term {
            info!(
                "denied vote for {} at stale {} < {}",
                request.candidate_id, msg_term, self.current_term
            );
        } else if let Some(vote) = &self.voted_for {
            info!(
                "denied vote at {} for {} as already cast for {}",
                self.current_term, request.candidate_id, vote
            );
        } else {
            info!(
                "denied vote at {} for {} with {} at {}: our log has {} at {}",
                self.current_term,
                request.candidate_id,
                request.last_log_idx,
                request.last_log_term,
                last_log_idx,
                last_log_term
            );
        }

        Some(SendableMessage {
            message: Message {
                msg_id,
                term: self.current_term,
                rpc: Rpc::VoteResponse(VoteResponse {
                    vote_granted: grant,
                }),
            },
            to: from,
        })
    }

    fn handle_vote_response(
        &mut self,
        msg_id: MessageId,
        msg_term: Term,
        response: VoteResponse,
        from: ServerId,
    ) -> Option<SendableMessage> {
        let request = self.claim_outstanding(msg_id, from)?;
        if !matches!(request.rpc, Rpc::VoteRequest(_)) {
            warn!("vote response {} from {} answers a non-vote request", msg_id, from);
            return None;
        }
        if msg_term < self.current_term {
            info!(
                "ignored vote response at stale {} < {} from {}",
                msg_term, self.current_term, from
            );
            return None;
        }
        if let Candidate(candidate) = &mut self.role {
            if response.vote_granted {
                info!("vote granted by {} at {}", from, self.current_term);
            } else {
                info!("vote denied by {} at {}", from, self.current_term);
            }
            candidate.votes.insert(from, response.vote_granted);
        }
        None
    }

    fn handle_append_request(
        &mut self,
        msg_id: MessageId,
        msg_term: Term,
        request: AppendRequest,
        from: ServerId,
    ) -> Option<SendableMessage> {
        assert!(msg_term <= self.current_term);
        if msg_term < self.current_term {
            info!(
                "refused append from {} at stale {} < {}",
                from, msg_term, self.current_term
            );
            return Some(self.append_response(msg_id, false, from));
        }

        // A request at our own term proves a live leader for it.
        match &mut self.role {
            Candidate(_) => {
                let random_election_ticks = self.random_election_timeout();
                self.role = Follower(FollowerState {
                    leader: Some(from),
                    election_ticks: random_election_ticks,
                    random_election_ticks,
                });
                info!("became follower of {} at {}", from, self.current_term);
            }
            Follower(follower) => {
                if follower.leader.is_none() {
                    info!("following {} at {}", from, self.current_term);
                }
                follower.leader = Some(from);
                follower.election_ticks = follower.random_election_ticks;
            }
            Leader(_) => {
                panic!(
                    "two leaders at {}: append request from {}",
                    self.current_term, from
                );
            }
            Booting => return None,
        }

        let log_ok = request.prev_log_idx == LogIndex(0)
            || self.log.term_at(request.prev_log_idx) == Some(request.prev_log_term);
        if !log_ok {
            warn!(
                "refused append from {}: no entry matching {} at {}",
                from, request.prev_log_term, request.prev_log_idx
            );
            return Some(self.append_response(msg_id, false, from));
        }

        let mut index = request.prev_log_idx;
        for entry in &request.entries {
            index = index + 1;
            match self.log.term_at(index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    assert!(index > self.commit_idx);
                    let cancelled = self.log.truncate_from(index);
                    info!("truncated {} conflicting entries from {}", cancelled, index);
                    self.log.append(entry.clone());
                    self.mark_dirty();
                }
                None => {
                    self.log.append(entry.clone());
                    self.mark_dirty();
                }
            }
        }

        let leader_commit = request.leader_commit.min(self.log.len());
        if leader_commit > self.commit_idx {
            debug!("committed through {} from {}", leader_commit, from);
            self.commit_idx = leader_commit;
        }

        Some(self.append_response(msg_id, true, from))
    }

    fn handle_append_response(
        &mut self,
        msg_id: MessageId,
        msg_term: Term,
        response: AppendResponse,
        from: ServerId,
    ) -> Option<SendableMessage> {
        let request = self.claim_outstanding(msg_id, from)?;
        let append = match &request.rpc {
            Rpc::AppendRequest(append) => append,
            _ => {
                warn!("append response {} from {} answers a non-append request", msg_id, from);
                return None;
            }
        };
        if msg_term < self.current_term {
            info!(
                "ignored append response at stale {} < {} from {}",
                msg_term, self.current_term, from
            );
            return None;
        }
        assert!(msg_term == self.current_term);

        if let Leader(leader_state) = &mut self.role {
            if let Some(replication) = leader_state.followers.get_mut(&from) {
                if replication.inflight == Some(msg_id) {
                    replication.inflight = None;
                }
                if response.success {
                    let last_sent = append.prev_log_idx + append.entries.len() as u64;
                    if last_sent > replication.match_idx {
                        replication.match_idx = last_sent;
                    }
                    replication.next_idx = replication.match_idx + 1;
                } else {
                    info!(
                        "append refused by {}, backing off from {}",
                        from, replication.next_idx
                    );
                    replication.next_idx = (replication.next_idx - 1).max(LogIndex(1));
                }
            }
        }
        None
    }

    //
    // transitions
    //

    /// Promotes a candidate holding a quorum of granted votes.
    fn try_become_leader(&mut self) {
        if let Candidate(candidate) = &self.role {
            let granted = candidate.votes.values().filter(|granted| **granted).count();
            if granted >= self.quorum_size() {
                info!("became leader at {}", self.current_term);
                let next_idx = self.log.last_index() + 1;
                self.role = Leader(LeaderState {
                    followers: (self.peers.iter().copied())
                        .map(|id| {
                            (
                                id,
                                ReplicationState {
                                    next_idx,
                                    match_idx: LogIndex::default(),
                                    inflight: None,
                                    // announce leadership at once with an empty append
                                    send_heartbeat: true,
                                },
                            )
                        })
                        .collect(),
                    heartbeat_ticks: self.config.heartbeat_interval_ticks,
                });
                self.advance_commit_idx();
            }
        }
    }

    /// Advances the commit index to the highest entry of the current term stored on a quorum.
    ///
    /// Entries from earlier terms are never counted directly; they commit once an entry of the
    /// current term above them does.
    fn advance_commit_idx(&mut self) {
        if let Leader(leader_state) = &self.role {
            let mut match_idxs: Vec<LogIndex> = (leader_state.followers.values())
                .map(|follower| follower.match_idx)
                .chain(iter::once(self.log.last_index()))
                .collect();
            match_idxs.sort_unstable();
            let agree_idx = (match_idxs.into_iter())
                .rev()
                .skip(self.quorum_size() - 1)
                .max();
            if let Some(agree_idx) = agree_idx {
                if agree_idx > self.commit_idx
                    && self.log.term_at(agree_idx) == Some(self.current_term)
                {
                    debug!("advanced commit from {} to {}", self.commit_idx, agree_idx);
                    self.commit_idx = agree_idx;
                }
            }
        }
    }

    //
    // helpers
    //

    /// Stamps an outbound request with a fresh id and records it for response correlation.
    fn stamp_request(&mut self, rpc: Rpc, to: ServerId) -> Message {
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.next();
        let message = Message {
            msg_id,
            term: self.current_term,
            rpc,
        };
        self.outstanding.insert(
            msg_id,
            PendingRequest {
                to,
                message: message.clone(),
            },
        );
        message
    }

    /// Resolves a response against the outstanding table, removing and returning the matched
    /// request. Unmatched or misdirected responses resolve to `None` and are dropped.
    fn claim_outstanding(&mut self, msg_id: MessageId, from: ServerId) -> Option<Message> {
        match self.outstanding.get(&msg_id) {
            Some(pending) if pending.to != from => {
                warn!(
                    "dropped response {} from {}: request went to {}",
                    msg_id, from, pending.to
                );
                return None;
            }
            Some(_) => {}
            None => {
                debug!("dropped response {} from {} with no outstanding request", msg_id, from);
                return None;
            }
        }
        self.outstanding.remove(&msg_id).map(|pending| pending.message)
    }

    fn append_response(&self, msg_id: MessageId, success: bool, to: ServerId) -> SendableMessage {
        SendableMessage {
            message: Message {
                msg_id,
                term: self.current_term,
                rpc: Rpc::AppendResponse(AppendResponse { success }),
            },
            to,
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn quorum_size(&self) -> usize {
        quorum_size(self.peers.len())
    }

    fn random_election_timeout(&mut self) -> u32 {
        random_election_timeout(&mut self.random, self.config.election_timeout_ticks)
    }
}

/// An iterator yielding committed entries in order, each exactly once over the server's lifetime.
pub struct CommittedIter<'a> {
    log: &'a Log,
    commit_idx: LogIndex,
    last_applied: &'a mut LogIndex,
}

impl Iterator for CommittedIter<'_> {
    type Item = (LogIndex, LogEntry);

    fn next(&mut self) -> Option<Self::Item> {
        if *self.last_applied < self.commit_idx {
            let index = *self.last_applied + 1;
            let entry = self.log.get(index)?.clone();
            *self.last_applied = index;
            Some((index, entry))
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.commit_idx.0 - self.last_applied.0) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for CommittedIter<'_> {}

impl iter::FusedIterator for CommittedIter<'_> {}

/// Computes the minimum size of a quorum for a cluster with `peer_count` peers besides this one.
///
/// A quorum is a strict majority of the whole cluster, this server included.
pub fn quorum_size(peer_count: usize) -> usize {
    (peer_count.saturating_add(1)) / 2 + 1
}

fn random_election_timeout(random: &mut impl RngCore, election_timeout_ticks: u32) -> u32 {
    let random = random
        .next_u32()
        .checked_rem(election_timeout_ticks)
        .unwrap_or(0);
    election_timeout_ticks.saturating_add(random)
}
