use std::fs;
use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use super::session::TokenPair;

/// Session record file name in the cache directory
const SESSION_FILE: &str = "session.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed session record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Durable store for the credential pair.
///
/// The pair lives under a single file and is either fully present or
/// absent - a partial pair is never observable. `save` replaces the
/// record atomically (temp file, flush, rename), so the write is durable
/// before it returns and a crash mid-write cannot leave a torn record.
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Read the persisted pair, if any. A missing file is an absent
    /// session; a record that no longer parses is discarded.
    pub fn load(&self) -> Result<Option<TokenPair>, StoreError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        match serde_json::from_str(&contents) {
            Ok(pair) => Ok(Some(pair)),
            Err(err) => {
                debug!(error = %err, "discarding unreadable session record");
                fs::remove_file(&path)?;
                Ok(None)
            }
        }
    }

    /// Persist the pair, replacing any previous record.
    pub fn save(&self, pair: &TokenPair) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path();
        let tmp = self.dir.join(format!("{}.tmp", SESSION_FILE));
        let contents = serde_json::to_string_pretty(pair)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Remove the record. Both tokens go together; there is no partial
    /// clear.
    pub fn clear(&self) -> Result<(), StoreError> {
        let path = self.path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }
}
