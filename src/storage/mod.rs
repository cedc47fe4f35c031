//! Stable storage for the durable triple `(current_term, voted_for, log)`.
//!
//! The triple is one JSON document, `[term, votedForOrNull, {"_logEntries": [...]}]`, replaced
//! wholesale on every write. A server that has never run reads back
//! `[0, null, {"_logEntries": []}]`.


pub mod file;
pub mod in_memory;

use serde::{Deserialize, Serialize};

use raft::log::Log;
use raft::message::{ServerId, Term};

use crate::error::Error;
use crate::protocol::WireEntry;

/// The durable triple a server must carry across restarts.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedState {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub log: Log,
}

/// Atomic storage for the durable triple.
///
/// After a successful `write` returns, a `read` on this process or a fresh one must observe
/// exactly the written triple; a partial write must never become visible. Two stores addressing
/// the same name refer to the same durable object. One store must only ever be driven by one
/// live server.
pub trait Storage {
    /// Reads the last written triple, or [`PersistedState::initial`] if none was ever written.
    fn read(&self) -> Result<PersistedState, Error>;

    /// Replaces the stored triple, or fails leaving the previous one intact.
    fn write(&mut self, state: &PersistedState) -> Result<(), Error>;
}

#[derive(Deserialize, Serialize)]
struct Layout(u64, Option<u64>, LogLayout);

#[derive(Deserialize, Serialize)]
struct LogLayout {
    #[serde(rename = "_logEntries")]
    entries: Vec<WireEntry>,
}

impl PersistedState {
    /// The triple of a server that has never run: term 0, no vote, an empty log.
    pub fn initial() -> Self {
        Self {
            current_term: Term(0),
            voted_for: None,
            log: Log::new(),
        }
    }

    /// Serializes the triple into its durable document.
    pub fn to_json(&self) -> Result<String, Error> {
        let entries = (self.log.entries().iter())
            .map(WireEntry::from_entry)
            .collect::<Result<Vec<_>, _>>()?;
        let layout = Layout(
            self.current_term.0,
            self.voted_for.map(|id| id.0),
            LogLayout { entries },
        );
        serde_json::to_string(&layout).map_err(|err| Error::Storage(err.to_string()))
    }

    /// Parses a durable document back into the triple.
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let Layout(term, voted_for, log) =
            serde_json::from_str(raw).map_err(|err| Error::Storage(err.to_string()))?;
        Ok(Self {
            current_term: Term(term),
            voted_for: voted_for.map(ServerId),
            log: Log::from_entries(log.entries.into_iter().map(WireEntry::into_entry).collect()),
        })
    }
}
