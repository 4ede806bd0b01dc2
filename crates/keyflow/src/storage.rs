// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Usage snapshot persistence.
//!
//! One JSON file per provider holds the accessor index, every credential
//! state, and the provider's global fair-cycle records. Writes go through a
//! unique temp file, fsync, and an atomic rename, so readers only ever see
//! the old or the new snapshot. Flushes coalesce: one write per interval or
//! per N mutations, whichever comes first, plus an unconditional flush at
//! shutdown. Storage failures are logged and swallowed; the next tick
//! retries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::Result;
use crate::state::{CredentialState, GlobalCycle};

/// Current snapshot schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Default seconds between coalesced flushes
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

/// Default mutation count that forces a flush early
pub const DEFAULT_FLUSH_AFTER_MUTATIONS: u32 = 50;

/// On-disk snapshot of one provider's usage state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Schema version; files older than [`SCHEMA_VERSION`] are migrated in
    /// memory on load
    #[serde(default)]
    pub schema_version: u32,
    /// Write time, ISO-8601
    #[serde(default)]
    pub updated_at: String,
    /// Accessor -> stable ID
    #[serde(default)]
    pub accessor_index: BTreeMap<String, String>,
    /// Stable ID -> full credential state
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialState>,
    /// Provider -> fair-cycle tracking key -> global cycle record
    #[serde(default)]
    pub fair_cycle_global: BTreeMap<String, BTreeMap<String, GlobalCycle>>,
}

impl UsageSnapshot {
    /// An empty, current-schema snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            accessor_index: BTreeMap::new(),
            credentials: BTreeMap::new(),
            fair_cycle_global: BTreeMap::new(),
        }
    }
}

/// Coalescing JSON persistence for one provider's usage state
#[derive(Debug)]
pub struct UsageStorage {
    path: PathBuf,
    flush_interval: Duration,
    flush_after_mutations: u32,
    pending: AtomicU32,
    last_flush: Mutex<Instant>,
}

impl UsageStorage {
    /// Storage backed by the given file path
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            flush_after_mutations: DEFAULT_FLUSH_AFTER_MUTATIONS,
            pending: AtomicU32::new(0),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Override the flush interval
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Override the mutation count that forces a flush
    #[must_use]
    pub fn with_flush_after_mutations(mut self, count: u32) -> Self {
        self.flush_after_mutations = count;
        self
    }

    /// The snapshot path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot from disk.
    ///
    /// A missing file yields `None`. A corrupt file is backed up beside the
    /// original and treated as absent; startup never fails on bad usage
    /// data. Older schema versions are migrated in memory (serde defaults
    /// fill the fields they lack) and rewritten at the next flush.
    #[must_use]
    pub fn load(&self) -> Option<UsageSnapshot> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "failed to read usage snapshot");
                return None;
            }
        };

        match serde_json::from_str::<UsageSnapshot>(&raw) {
            Ok(mut snapshot) => {
                if snapshot.schema_version < SCHEMA_VERSION {
                    info!(
                        path = %self.path.display(),
                        from = snapshot.schema_version,
                        to = SCHEMA_VERSION,
                        "migrating usage snapshot schema"
                    );
                    snapshot.schema_version = SCHEMA_VERSION;
                }
                Some(snapshot)
            }
            Err(err) => {
                let backup = self.path.with_extension("json.corrupt");
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    %err,
                    "corrupt usage snapshot, backing up and starting empty"
                );
                if let Err(err) = std::fs::rename(&self.path, &backup) {
                    warn!(%err, "failed to back up corrupt snapshot");
                }
                None
            }
        }
    }

    /// Count one mutation; returns true when a flush is due (mutation budget
    /// spent or interval elapsed)
    pub fn note_mutation(&self) -> bool {
        let pending = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= self.flush_after_mutations {
            return true;
        }
        self.last_flush.lock().elapsed() >= self.flush_interval
    }

    /// Whether any mutations are waiting to be written
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.pending.load(Ordering::Relaxed) > 0
    }

    /// Whether a coalesced flush is due: the mutation budget is spent or
    /// the interval has elapsed with writes pending
    #[must_use]
    pub fn flush_due(&self) -> bool {
        let pending = self.pending.load(Ordering::Relaxed);
        if pending == 0 {
            return false;
        }
        pending >= self.flush_after_mutations
            || self.last_flush.lock().elapsed() >= self.flush_interval
    }

    /// Write a snapshot atomically, resetting the coalescing counters on
    /// success. Errors are returned for the caller to log and swallow; the
    /// pending count is left intact so the next tick retries.
    pub async fn write(&self, snapshot: &UsageSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec_pretty(snapshot)?;
        atomic_write(&self.path, &data).await?;
        self.pending.store(0, Ordering::Relaxed);
        *self.last_flush.lock() = Instant::now();
        Ok(())
    }
}

/// Write-to-temp, fsync, rename. The temp name is unique per write so
/// concurrent flushes never collide, and the rename is atomic on POSIX.
async fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("usage"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(&temp_name);

    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await?;

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = tokio::fs::File::open(parent).await {
                // Best effort; rename durability needs the directory synced
                let _ = dir.sync_all().await;
            }
        }
    }

    Ok(())
}
