//! The wire envelope exchanged between servers.
//!
//! Every message travels as one self-describing JSON document:
//!
//! ```json
//! {
//!   "_msgType": "AppendEntries",
//!   "_msgArgs": [["term", "3"], ["leaderId", "1"], ...],
//!   "_msgInfo": { "_msgFrom": 1, "_msgId": 42 }
//! }
//! ```
//!
//! Arguments are named and double-encoded: each value is serialized to JSON on its own and
//! embedded in the envelope as a string. Argument order is fixed per type but decoding goes by
//! name; unknown names are ignored. The `entries` argument carries `[index, entry]` pairs whose
//! indices must follow `prevLogIndex` contiguously.


use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use raft::message::{
    AppendRequest, AppendResponse, LogEntry, LogIndex, Message, MessageId, Rpc, ServerId, Term,
    VoteRequest, VoteResponse,
};

const APPEND_ENTRIES: &str = "AppendEntries";
const APPEND_ENTRIES_RESPONSE: &str = "AppendEntriesResponse";
const REQUEST_VOTE: &str = "RequestVote";
const REQUEST_VOTE_RESPONSE: &str = "RequestVoteResponse";

/// A failure to map a wire document onto a message.
///
/// The receiving side drops the document and logs; there is no negative reply for garbage.
#[derive(Debug)]
pub enum WireError {
    /// The outer envelope is not valid JSON of the expected shape.
    Envelope(serde_json::Error),
    /// The `_msgType` names no known message type.
    UnknownType(String),
    /// A required argument is absent.
    MissingArg(&'static str),
    /// An argument's blob does not decode as its expected type.
    BadArg(&'static str),
    /// The indices of the `entries` argument do not follow `prevLogIndex` contiguously.
    BrokenEntryIndices,
    /// A command payload is not a JSON document.
    BadPayload,
}

#[derive(Deserialize, Serialize)]
struct Envelope {
    #[serde(rename = "_msgType")]
    msg_type: String,
    #[serde(rename = "_msgArgs")]
    args: Vec<(String, String)>,
    #[serde(rename = "_msgInfo")]
    info: Info,
}

#[derive(Deserialize, Serialize)]
struct Info {
    #[serde(rename = "_msgFrom")]
    from: u64,
    #[serde(rename = "_msgId")]
    id: u64,
}

/// The JSON form of one log entry, shared by the wire format and the durable state layout.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WireEntry {
    #[serde(rename = "_entryTerm")]
    term: u64,
    #[serde(rename = "_entryData")]
    data: Value,
}

impl WireEntry {
    /// Reads an entry's opaque payload back as the JSON document it carries.
    ///
    /// # Errors
    ///
    /// If the payload is not a JSON document, an error is returned. Commands enter the log
    /// through [`payload_bytes`], so this only fires on foreign or corrupted data.
    pub fn from_entry(entry: &LogEntry) -> Result<Self, WireError> {
        let data = serde_json::from_slice(&entry.data).map_err(|_| WireError::BadPayload)?;
        Ok(Self {
            term: entry.term.0,
            data,
        })
    }

    pub fn into_entry(self) -> LogEntry {
        LogEntry {
            term: Term(self.term),
            data: payload_bytes(&self.data),
        }
    }
}

/// The compact, key-sorted serialization of a payload document.
///
/// Every server derives identical bytes from the same document, which keeps applied commands
/// byte-identical across the cluster.
pub fn payload_bytes(payload: &Value) -> Bytes {
    Bytes::from(serde_json::to_vec(payload).unwrap_or_else(|_| panic!("payload serialization")))
}

/// Encodes a message into its single-line wire document.
pub fn encode(message: &Message, from: ServerId) -> Result<String, WireError> {
    let (msg_type, args) = match &message.rpc {
        Rpc::AppendRequest(request) => (
            APPEND_ENTRIES,
            vec![
                arg("term", &message.term.0)?,
                arg("leaderId", &request.leader_id.0)?,
                arg("prevLogIndex", &request.prev_log_idx.0)?,
                arg("prevLogTerm", &request.prev_log_term.0)?,
                arg("entries", &indexed_entries(request)?)?,
                arg("leaderCommit", &request.leader_commit.0)?,
            ],
        ),
        Rpc::AppendResponse(response) => (
            APPEND_ENTRIES_RESPONSE,
            vec![
                arg("term", &message.term.0)?,
                arg("success", &response.success)?,
            ],
        ),
        Rpc::VoteRequest(request) => (
            REQUEST_VOTE,
            vec![
                arg("term", &message.term.0)?,
                arg("candidateId", &request.candidate_id.0)?,
                arg("lastLogIndex", &request.last_log_idx.0)?,
                arg("lastLogTerm", &request.last_log_term.0)?,
            ],
        ),
        Rpc::VoteResponse(response) => (
            REQUEST_VOTE_RESPONSE,
            vec![
                arg("term", &message.term.0)?,
                arg("voteGranted", &response.vote_granted)?,
            ],
        ),
    };
    let envelope = Envelope {
        msg_type: msg_type.to_string(),
        args,
        info: Info {
            from: from.0,
            id: message.msg_id.0,
        },
    };
    serde_json::to_string(&envelope).map_err(WireError::Envelope)
}

/// Decodes a wire document, returning the sender and the message it carried.
pub fn decode(line: &str) -> Result<(ServerId, Message), WireError> {
    let envelope: Envelope = serde_json::from_str(line).map_err(WireError::Envelope)?;
    let args = Args(&envelope.args);
    let term = Term(args.decode("term")?);
    let rpc = match envelope.msg_type.as_str() {
        APPEND_ENTRIES => {
            let prev_log_idx = LogIndex(args.decode("prevLogIndex")?);
            let indexed: Vec<(u64, WireEntry)> = args.decode("entries")?;
            let mut entries = Vec::with_capacity(indexed.len());
            for (offset, (index, entry)) in indexed.into_iter().enumerate() {
                if index != prev_log_idx.0 + 1 + offset as u64 {
                    return Err(WireError::BrokenEntryIndices);
                }
                entries.push(entry.into_entry());
            }
            Rpc::AppendRequest(AppendRequest {
                leader_id: ServerId(args.decode("leaderId")?),
                prev_log_idx,
                prev_log_term: Term(args.decode("prevLogTerm")?),
                entries,
                leader_commit: LogIndex(args.decode("leaderCommit")?),
            })
        }
        APPEND_ENTRIES_RESPONSE => Rpc::AppendResponse(AppendResponse {
            success: args.decode("success")?,
        }),
        REQUEST_VOTE => Rpc::VoteRequest(VoteRequest {
            candidate_id: ServerId(args.decode("candidateId")?),
            last_log_idx: LogIndex(args.decode("lastLogIndex")?),
            last_log_term: Term(args.decode("lastLogTerm")?),
        }),
        REQUEST_VOTE_RESPONSE => Rpc::VoteResponse(VoteResponse {
            vote_granted: args.decode("voteGranted")?,
        }),
        unknown => return Err(WireError::UnknownType(unknown.to_string())),
    };
    Ok((
        ServerId(envelope.info.from),
        Message {
            msg_id: MessageId(envelope.info.id),
            term,
            rpc,
        },
    ))
}

fn arg<T: Serialize>(name: &str, value: &T) -> Result<(String, String), WireError> {
    let blob = serde_json::to_string(value).map_err(WireError::Envelope)?;
    Ok((name.to_string(), blob))
}

fn indexed_entries(request: &AppendRequest) -> Result<Vec<(u64, WireEntry)>, WireError> {
    (request.entries.iter().enumerate())
        .map(|(offset, entry)| {
            Ok((
                request.prev_log_idx.0 + 1 + offset as u64,
                WireEntry::from_entry(entry)?,
            ))
        })
        .collect()
}

struct Args<'a>(&'a [(String, String)]);

impl Args<'_> {
    /// Finds the argument named `name` and decodes its blob. Unknown names are ignored.
    fn decode<T: serde::de::DeserializeOwned>(&self, name: &'static str) -> Result<T, WireError> {
        let (_, blob) = (self.0.iter())
            .find(|(arg_name, _)| arg_name.as_str() == name)
            .ok_or(WireError::MissingArg(name))?;
        serde_json::from_str(blob).map_err(|_| WireError::BadArg(name))
    }
}

//
// WireError impls
//

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Envelope(err) => write!(f, "bad envelope: {}", err),
            WireError::UnknownType(name) => write!(f, "unknown message type {:?}", name),
            WireError::MissingArg(name) => write!(f, "missing argument {:?}", name),
            WireError::BadArg(name) => write!(f, "undecodable argument {:?}", name),
            WireError::BrokenEntryIndices => write!(f, "entry indices are not contiguous"),
            WireError::BadPayload => write!(f, "payload is not a JSON document"),
        }
    }
}

impl std::error::Error for WireError {}
