use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::raft::state::{LogEntry, RaftState};

/// The durable fields of a peer, saved and restored as one atomic unit.
///
/// Persisting term and vote together is what guarantees a crash can never
/// leave `voted_for` recorded against a stale term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

/// The byte-level persistence collaborator.
///
/// `save` must be durable by the time it returns; the core calls it before
/// any externally observable effect of a state mutation (a vote reply, an
/// append acknowledgement, a submission result). A failed save is fatal to
/// the peer.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, bytes: &[u8]) -> Result<()>;

    /// Previously saved bytes, or `None` on first run.
    async fn load(&self) -> Result<Option<Vec<u8>>>;
}

/// Encode and save the durable fields of `state`.
pub async fn save_state(storage: &dyn Storage, state: &RaftState) -> Result<()> {
    let bytes = bincode::serialize(&state.persisted())?;
    storage.save(&bytes).await
}

/// Load and decode a previously persisted state, if any.
pub async fn load_state(storage: &dyn Storage) -> Result<Option<PersistedState>> {
    match storage.load().await? {
        Some(bytes) if !bytes.is_empty() => Ok(Some(bincode::deserialize(&bytes)?)),
        _ => Ok(None),
    }
}

/// In-memory storage. Sharing one instance across successive `RaftNode`
/// incarnations simulates a crash/restart in tests.
#[derive(Debug, Default)]
pub struct MemStorage {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn save(&self, bytes: &[u8]) -> Result<()> {
        *self.bytes.lock().expect("storage mutex poisoned") = Some(bytes.to_vec());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.bytes.lock().expect("storage mutex poisoned").clone())
    }
}

/// File-backed storage: write to a sibling temp file, fsync, then rename
/// over the target so a crash mid-save leaves the previous state intact.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn save(&self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;

        let tmp = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
