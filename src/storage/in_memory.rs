//! In-memory storage, primarily for testing.

use super::{PersistedState, Storage};
use crate::error::Error;

/// Holds the serialized document in memory, exercising the same layout as the file store.
pub struct InMemoryStorage {
    raw: Option<String>,
    fail_writes: bool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            raw: None,
            fail_writes: false,
        }
    }

    /// Makes every subsequent write fail, leaving the stored state intact.
    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for InMemoryStorage {
    fn read(&self) -> Result<PersistedState, Error> {
        match &self.raw {
            Some(raw) => PersistedState::from_json(raw),
            None => Ok(PersistedState::initial()),
        }
    }

    fn write(&mut self, state: &PersistedState) -> Result<(), Error> {
        if self.fail_writes {
            return Err(Error::Storage("write refused".to_string()));
        }
        self.raw = Some(state.to_json()?);
        Ok(())
    }
}
