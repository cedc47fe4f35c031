//! Message types exchanged between the servers of a cluster.
//!
//! The top-level type is [`Message`]: a correlation id, the sender's term, and one of the four
//! [`Rpc`] shapes. Serialization lives outside this crate; the node layer owns the wire format and
//! maps these types onto it.

use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use bytes::Bytes;

/// A [`Message`] together with the peer it must be delivered to.
///
/// All routing is unicast: an election produces one stamped request per peer rather than a single
/// broadcast template, so every request owns a distinct [`MessageId`].
pub struct SendableMessage {
    /// The message to be sent.
    pub message: Message,

    /// The server the message is addressed to.
    pub to: ServerId,
}

/// A message sent between servers.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Correlates responses with requests. Requests carry a fresh id from the sender's monotonic
    /// counter; responses echo the id of the request they answer.
    pub msg_id: MessageId,

    /// The sender's term at the time the message was produced.
    pub term: Term,

    /// The Remote Procedure Call contained by this message.
    pub rpc: Rpc,
}

/// A Remote Procedure Call to another server.
#[derive(Clone, Debug, PartialEq)]
pub enum Rpc {
    /// A request for this term's leadership vote.
    VoteRequest(VoteRequest),

    /// A response to a [`VoteRequest`] granting or denying the vote.
    VoteResponse(VoteResponse),

    /// A request to append entries to the receiver's log; empty requests serve as heartbeats.
    AppendRequest(AppendRequest),

    /// A response to an [`AppendRequest`] accepting or refusing the append.
    AppendResponse(AppendResponse),
}

/// A request for this term's leadership vote.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VoteRequest {
    /// The id of the candidate requesting the vote.
    pub candidate_id: ServerId,

    /// The index of the last entry in the candidate's log.
    pub last_log_idx: LogIndex,

    /// The term of the last entry in the candidate's log.
    pub last_log_term: Term,
}

/// The response to a [`VoteRequest`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VoteResponse {
    /// Whether the vote was granted to the candidate.
    pub vote_granted: bool,
}

/// A request to append entries to the receiver's log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppendRequest {
    /// The id of the leader the request originates from.
    pub leader_id: ServerId,

    /// The index of the log entry immediately before the first entry in
    /// [`entries`](Self::entries).
    pub prev_log_idx: LogIndex,

    /// The term of the log entry at [`prev_log_idx`](Self::prev_log_idx).
    pub prev_log_term: Term,

    /// Consecutive log entries starting at `prev_log_idx + 1`. Empty for heartbeats.
    pub entries: Vec<LogEntry>,

    /// The highest index the leader knows to be committed, bounded by the last entry sent.
    pub leader_commit: LogIndex,
}

/// The response to an [`AppendRequest`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppendResponse {
    /// Whether the entries were appended. `false` signals a stale term or a log mismatch at
    /// `prev_log_idx`.
    pub success: bool,
}

/// An entry in a server's [log](crate::log::Log).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogEntry {
    /// The term of the leader that first appended this entry.
    pub term: Term,

    /// The opaque command payload, handed to the state machine once the entry commits.
    pub data: Bytes,
}

/// A monotonically non-decreasing logical epoch. Each election advances it by one.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Term(pub u64);

/// The stable identity of a server within a cluster.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ServerId(pub u64);

/// A 1-based position in a server's [log](crate::log::Log). Zero is the sentinel before the first
/// entry, with implicit term 0.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct LogIndex(pub u64);

/// A per-sender monotonic correlation id for outbound requests.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(pub u64);

//
// Message impls
//

impl fmt::Display for Message {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { msg_id, term, rpc } = self;
        fmt.debug_tuple("")
            .field(&format_args!("{}", msg_id))
            .field(&format_args!("{}", term))
            .field(&format_args!("{}", rpc))
            .finish()
    }
}

//
// Rpc impls
//

impl Rpc {
    /// Whether this call expects a response.
    pub fn is_request(&self) -> bool {
        match self {
            Rpc::VoteRequest(_) | Rpc::AppendRequest(_) => true,
            Rpc::VoteResponse(_) | Rpc::AppendResponse(_) => false,
        }
    }

    /// Whether this call answers a prior request.
    pub fn is_response(&self) -> bool {
        !self.is_request()
    }
}

impl fmt::Display for Rpc {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Rpc::VoteRequest(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::VoteResponse(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::AppendRequest(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::AppendResponse(msg) => fmt::Display::fmt(msg, fmt),
        }
    }
}

//
// VoteRequest impls
//

impl fmt::Display for VoteRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            candidate_id,
            last_log_idx,
            last_log_term,
        } = self;
        fmt.debug_struct("VoteRequest")
            .field("candidate_id", &format_args!("{}", candidate_id))
            .field("last_log_idx", &format_args!("{}", last_log_idx))
            .field("last_log_term", &format_args!("{}", last_log_term))
            .finish()
    }
}

//
// VoteResponse impls
//

impl fmt::Display for VoteResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { vote_granted } = self;
        fmt.debug_struct("VoteResponse")
            .field("vote_granted", vote_granted)
            .finish()
    }
}

//
// AppendRequest impls
//

impl fmt::Display for AppendRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            leader_id,
            prev_log_idx,
            prev_log_term,
            entries,
            leader_commit,
        } = self;
        fmt.debug_struct("AppendRequest")
            .field("leader_id", &format_args!("{}", leader_id))
            .field("prev_log_idx", &format_args!("{}", prev_log_idx))
            .field("prev_log_term", &format_args!("{}", prev_log_term))
            .field("entries", &entries.len())
            .field("leader_commit", &format_args!("{}", leader_commit))
            .finish()
    }
}

//
// AppendResponse impls
//

impl fmt::Display for AppendResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { success } = self;
        fmt.debug_struct("AppendResponse")
            .field("success", success)
            .finish()
    }
}

//
// Term impls
//

impl Term {
    /// The following term.
    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).unwrap_or_else(|| panic!("term overflow")))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(term) = self;
        fmt.debug_tuple("Term").field(term).finish()
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl AddAssign<u64> for Term {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.checked_add(rhs).unwrap_or_else(|| panic!("term overflow"));
    }
}

//
// ServerId impls
//

impl fmt::Display for ServerId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(id) = self;
        fmt.debug_tuple("Server").field(id).finish()
    }
}

//
// LogIndex impls
//

impl LogIndex {
    /// Subtraction checking for underflow. Returns `self - dec`, or `None` below the sentinel.
    pub fn checked_sub(self, dec: u64) -> Option<Self> {
        self.0.checked_sub(dec).map(Self)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(index) = self;
        fmt.debug_tuple("Index").field(index).finish()
    }
}

impl PartialOrd for LogIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for LogIndex {
    type Output = Self;
    fn add(self, inc: u64) -> Self {
        Self(self.0.checked_add(inc).unwrap_or_else(|| panic!("log index overflow")))
    }
}

impl Sub<u64> for LogIndex {
    type Output = Self;
    fn sub(self, dec: u64) -> Self {
        Self(self.0.saturating_sub(dec))
    }
}

//
// MessageId impls
//

impl MessageId {
    /// The following id.
    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).unwrap_or_else(|| panic!("message id overflow")))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(id) = self;
        fmt.debug_tuple("MsgId").field(id).finish()
    }
}
