//! File-backed storage, one JSON document per server.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{PersistedState, Storage};
use crate::error::Error;

/// Stores the durable triple in a named JSON file, replaced atomically on every write.
///
/// Writes land in a sibling temporary file, reach the disk with `sync_all`, and take effect with
/// a rename; a crash at any point leaves either the old document or the new one, never a mix.
pub struct FileStorage {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl FileStorage {
    /// Addresses the durable object `<dir>/<name>.json`. Two stores built from the same
    /// directory and name refer to the same object.
    pub fn from_name(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{}.json", name)),
            tmp_path: dir.join(format!("{}.json.tmp", name)),
        }
    }
}

impl Storage for FileStorage {
    fn read(&self) -> Result<PersistedState, Error> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => PersistedState::from_json(&raw),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(PersistedState::initial()),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn write(&mut self, state: &PersistedState) -> Result<(), Error> {
        let raw = state.to_json()?;
        let mut file = File::create(&self.tmp_path)?;
        file.write_all(raw.as_bytes())?;
        file.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}
