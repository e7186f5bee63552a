//! Persistent storage backend for starmerge.
//!
//! - [`PersistentTableStore`]: a catalog plus one frame file per table
//!   and fact partition; a commit rewrites only what it changed
//! - [`JournalAuditSink`]: append-only audit trail
//! - [`DirLock`]: one process per warehouse directory
//!
//! Every file uses the CRC32-framed codec in `codec`.

mod codec;
mod file_lock;
mod journal;
mod store;

pub use file_lock::{DirLock, LOCK_FILE};
pub use journal::{read_journal, JournalAuditSink};
pub use store::{PersistentTableStore, CATALOG_FILE, FACT_DIR, TABLE_DIR};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StarResult, ValidationError};

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Whether to fsync frames and directories on every commit.
    pub sync_on_write: bool,
    /// Largest single frame (one table or partition) a commit may write.
    pub max_frame_bytes: u64,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_frame_bytes: 512 * 1024 * 1024, // 512 MB
        }
    }
}

impl PersistentConfig {
    const MIN_FRAME_BYTES: u64 = 4 * 1024;

    /// Checks bounds.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for out-of-range sizes.
    pub fn validate(self) -> Result<Self, ValidationError> {
        let max_frame = u64::try_from(codec::MAX_FRAME_SIZE).unwrap_or(u64::MAX);
        if self.max_frame_bytes < Self::MIN_FRAME_BYTES || self.max_frame_bytes > max_frame {
            return Err(ValidationError::InvalidConfig {
                field: "max_frame_bytes".to_string(),
                reason: format!(
                    "must be between {} and {max_frame} bytes (got {})",
                    Self::MIN_FRAME_BYTES,
                    self.max_frame_bytes
                ),
            });
        }
        Ok(self)
    }
}

/// Opens or creates a persistent warehouse store in `path`.
///
/// # Errors
///
/// - If the configuration is invalid
/// - If another process holds the directory lock
/// - If a committed frame is corrupted
///
/// # Example
/// ```rust,ignore
/// use starmerge::storage::persistent::open_store;
///
/// let store = open_store("./warehouse", None)?;
/// ```
pub fn open_store(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> StarResult<PersistentTableStore> {
    let config = config.unwrap_or_default().validate()?;
    Ok(PersistentTableStore::open(path.as_ref(), config)?)
}
