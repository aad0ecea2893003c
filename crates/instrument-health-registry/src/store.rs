//! Persisted snapshot storage.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use instrument_health_core::{AlertPolicy, OwnerMarker, Result, SessionIdentity, StatusRecord};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk form of the registry and its alert policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Format version
    pub version: u32,
    /// Registry that wrote the snapshot
    pub writer: OwnerMarker,
    /// Records keyed by identity
    #[serde(default)]
    pub records: BTreeMap<SessionIdentity, StatusRecord>,
    /// Alert policy at write time
    #[serde(default)]
    pub alert_policy: AlertPolicy,
}

impl PersistedSnapshot {
    /// Build a snapshot written by `writer`.
    pub fn new(
        writer: OwnerMarker,
        records: impl IntoIterator<Item = StatusRecord>,
        alert_policy: AlertPolicy,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            writer,
            records: records
                .into_iter()
                .map(|record| (record.identity().clone(), record))
                .collect(),
            alert_policy,
        }
    }
}

/// Where the registry persists its snapshot.
pub trait SnapshotStore: Send + Sync {
    /// Read the stored snapshot, `None` if nothing has been written yet.
    fn load(&self) -> Result<Option<PersistedSnapshot>>;

    /// Replace the stored snapshot.
    fn save(&self, snapshot: &PersistedSnapshot) -> Result<()>;

    /// Read the stored snapshot, build the next one from it with `merge`
    /// and save that, as one step against other writers of the store.
    ///
    /// An unreadable stored snapshot is handed to `merge` as `None`.
    fn update(
        &self,
        merge: &mut dyn FnMut(Option<PersistedSnapshot>) -> PersistedSnapshot,
    ) -> Result<()> {
        let next = merge(load_or_warn(self));
        self.save(&next)
    }
}

fn load_or_warn<S: SnapshotStore + ?Sized>(store: &S) -> Option<PersistedSnapshot> {
    store.load().unwrap_or_else(|e| {
        warn!("Could not read stored snapshot before write: {}", e);
        None
    })
}

/// Pretty-printed JSON file, replaced atomically on every save.
///
/// Writers serialize on an advisory lock held on a `<file>.lock` sibling, so
/// several processes can share one state file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by `path`. Parent directories are created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    // Released when the returned file is dropped.
    fn lock(&self) -> Result<File> {
        fs::create_dir_all(self.dir())?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn write(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let mut tmp = NamedTempFile::new_in(self.dir())?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedSnapshot>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let _lock = self.lock()?;
        self.write(snapshot)
    }

    fn update(
        &self,
        merge: &mut dyn FnMut(Option<PersistedSnapshot>) -> PersistedSnapshot,
    ) -> Result<()> {
        let _lock = self.lock()?;
        let next = merge(load_or_warn(self));
        self.write(&next)
    }
}

/// In-process store, used when no state file is wanted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<PersistedSnapshot>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with `snapshot`.
    pub fn with_snapshot(snapshot: PersistedSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    /// Last saved snapshot.
    pub fn snapshot(&self) -> Option<PersistedSnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedSnapshot>> {
        Ok(self.snapshot())
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }
}
