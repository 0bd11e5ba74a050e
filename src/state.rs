//! Persisted map of output path to the signature that produced it.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Signature;
use crate::error::StateError;

const VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Stored {
    version: u32,
    signatures: BTreeMap<Utf8PathBuf, Signature>,
}

/// Last known signature of every output, keyed by absolute path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    signatures: BTreeMap<Utf8PathBuf, Signature>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the state written by [`save`](Self::save). A missing file is an
    /// empty state, and so is an unreadable one, with a warning.
    pub fn load(path: &Utf8Path) -> Result<Self, StateError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };

        match ciborium::from_reader::<Stored, _>(BufReader::new(file)) {
            Ok(stored) if stored.version == VERSION => Ok(Self {
                signatures: stored.signatures,
            }),
            Ok(stored) => {
                tracing::warn!(
                    "Ignoring build state '{path}' written by format version {}",
                    stored.version
                );
                Ok(Self::new())
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable build state '{path}': {e}");
                Ok(Self::new())
            }
        }
    }

    /// Writes the state next to `path` and renames it into place.
    pub fn save(&self, path: &Utf8Path) -> Result<(), StateError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let temp = path.with_extension("tmp");
        let stored = Stored {
            version: VERSION,
            signatures: self.signatures.clone(),
        };

        let mut writer = BufWriter::new(File::create(&temp)?);
        ciborium::into_writer(&stored, &mut writer)
            .map_err(|e| StateError::Encode(e.to_string()))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp, path)?;
        Ok(())
    }

    pub fn get(&self, path: &Utf8Path) -> Option<&Signature> {
        self.signatures.get(path)
    }

    pub fn put(&mut self, path: &Utf8Path, signature: Signature) {
        self.signatures.insert(path.to_owned(), signature);
    }

    /// Forces the output at `path` to be rebuilt by the next session.
    pub fn invalidate(&mut self, path: &Utf8Path) {
        self.put(path, Signature::invalid());
    }

    pub fn remove(&mut self, path: &Utf8Path) -> Option<Signature> {
        self.signatures.remove(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.signatures.keys().map(Utf8PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Deletes every file the state knows about and forgets it. Returns the
    /// number of files removed.
    pub fn clean(&mut self) -> Result<usize, StateError> {
        let mut removed = 0;

        for path in std::mem::take(&mut self.signatures).into_keys() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(removed)
    }
}
