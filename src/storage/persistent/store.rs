//! Durable table store: one frame file per table and per fact partition,
//! tied together by a catalog.
//!
//! ```text
//! <dir>/catalog.star                   revisions of everything committed
//! <dir>/tables/<table>.r<rev>.star     one conformed or dimension table
//! <dir>/facts/<start>.r<rev>.star      one fact partition
//! ```
//!
//! A commit writes only the frames of the tables and partitions it
//! carries, under their new revisions, then replaces the catalog through
//! a temp file and a rename. The rename is the commit point. Frames the
//! catalog does not name (superseded, or left by an interrupted commit)
//! are removed after the commit and swept again on open.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::codec;
use super::file_lock::DirLock;
use super::PersistentConfig;
use crate::fact::{FactLookup, FactManifest, FactPartition, FactQuery};
use crate::keys::KeyHighWater;
use crate::model::TableId;
use crate::storage::state::StoreState;
use crate::storage::traits::{Commit, StorageError, TableStore};
use crate::table::Table;

/// File naming every committed frame.
pub const CATALOG_FILE: &str = "catalog.star";
/// Directory of table frames.
pub const TABLE_DIR: &str = "tables";
/// Directory of fact partition frames.
pub const FACT_DIR: &str = "facts";
const FRAME_EXT: &str = "star";
const TEMP_SUFFIX: &str = "tmp";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Revisions of every committed frame plus allocator marks.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    key_high_water: KeyHighWater,
    tables: Vec<(TableId, u64)>,
    facts: Option<FactManifest>,
    partitions: Vec<(NaiveDate, u64)>,
}

impl Catalog {
    /// The catalog after `commit` (already prepared) is installed on `state`.
    fn after(state: &StoreState, commit: &Commit) -> Self {
        let mut tables: BTreeMap<TableId, u64> =
            state.tables.iter().map(|(id, t)| (*id, t.revision())).collect();
        tables.extend(commit.tables.iter().map(|t| (t.id(), t.revision())));

        let mut partitions: BTreeMap<NaiveDate, u64> =
            state.partitions.iter().map(|(start, p)| (*start, p.revision())).collect();
        let mut facts = state.facts.clone();
        if let Some(committed) = &commit.facts {
            partitions.extend(committed.partitions.iter().map(|p| (p.start(), p.revision())));
            facts = Some(committed.manifest.clone());
        }

        let mut key_high_water = state.key_high_water.clone();
        for (table, key) in &commit.key_high_water {
            let mark = key_high_water.entry(*table).or_insert(0);
            *mark = (*mark).max(*key);
        }

        Self {
            key_high_water,
            tables: tables.into_iter().collect(),
            facts,
            partitions: partitions.into_iter().collect(),
        }
    }

    fn frame_paths(&self, dir: &Path) -> Vec<PathBuf> {
        self.tables
            .iter()
            .map(|(id, revision)| table_path(dir, *id, *revision))
            .chain(
                self.partitions
                    .iter()
                    .map(|(start, revision)| partition_path(dir, *start, *revision)),
            )
            .collect()
    }
}

fn table_path(dir: &Path, table: TableId, revision: u64) -> PathBuf {
    dir.join(TABLE_DIR).join(format!("{table}.r{revision}.{FRAME_EXT}"))
}

fn partition_path(dir: &Path, start: NaiveDate, revision: u64) -> PathBuf {
    dir.join(FACT_DIR).join(format!("{start}.r{revision}.{FRAME_EXT}"))
}

fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Single-process durable store.
pub struct PersistentTableStore {
    dir: PathBuf,
    config: PersistentConfig,
    state: RwLock<StoreState>,
    sync_dir: fn(&Path) -> io::Result<()>,
    _lock: DirLock,
}

impl fmt::Debug for PersistentTableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentTableStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentTableStore {
    /// Opens (or creates) the warehouse in `dir`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` with `WouldBlock` if another process has it open
    /// - `StorageError::SerializationError` if a frame is corrupted
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir.join(TABLE_DIR))?;
        fs::create_dir_all(dir.join(FACT_DIR))?;
        let lock = DirLock::acquire(dir)?;

        let temp = Self::temp_path(dir);
        if temp.exists() {
            tracing::warn!(path = %temp.display(), "discarding catalog from an interrupted commit");
            fs::remove_file(&temp)?;
        }

        let catalog_path = dir.join(CATALOG_FILE);
        let catalog: Catalog = if catalog_path.exists() {
            read_frame(&catalog_path)?
        } else {
            Catalog::default()
        };

        let mut tables = BTreeMap::new();
        for (id, revision) in &catalog.tables {
            let path = table_path(dir, *id, *revision);
            let table: Table = read_frame(&path)?;
            if table.id() != *id || table.revision() != *revision {
                return Err(mismatch(&path));
            }
            tables.insert(*id, table);
        }
        let mut partitions = BTreeMap::new();
        for (start, revision) in &catalog.partitions {
            let path = partition_path(dir, *start, *revision);
            let partition: FactPartition = read_frame(&path)?;
            if partition.start() != *start || partition.revision() != *revision {
                return Err(mismatch(&path));
            }
            partitions.insert(*start, partition);
        }
        Self::sweep(dir, &catalog)?;

        let state = StoreState::restore(tables, catalog.facts, partitions, catalog.key_high_water);
        tracing::info!(
            dir = %dir.display(),
            tables = state.tables.len(),
            partitions = state.partitions.len(),
            facts = state.facts.as_ref().map_or(0, FactManifest::rows),
            "warehouse store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            state: RwLock::new(state),
            sync_dir: sync_directory,
            _lock: lock,
        })
    }

    /// Directory this store lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn temp_path(dir: &Path) -> PathBuf {
        dir.join(format!("{CATALOG_FILE}.{TEMP_SUFFIX}"))
    }

    /// Removes frames the catalog does not name.
    fn sweep(dir: &Path, catalog: &Catalog) -> Result<(), StorageError> {
        let live = catalog.frame_paths(dir);
        for sub in [TABLE_DIR, FACT_DIR] {
            for entry in fs::read_dir(dir.join(sub))? {
                let path = entry?.path();
                if !live.contains(&path) {
                    tracing::debug!(path = %path.display(), "removing unreferenced frame");
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    fn write_frame<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let frame =
            codec::encode(value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let size = u64::try_from(frame.len()).unwrap_or(u64::MAX);
        if size > self.config.max_frame_bytes {
            return Err(StorageError::BackendError(format!(
                "{}: frame of {size} bytes exceeds max_frame_bytes {}",
                path.display(),
                self.config.max_frame_bytes
            )));
        }

        let mut writer = BufWriter::new(File::create(path)?);
        codec::write_header(&mut writer)?;
        writer.write_all(&frame)?;
        let file = writer
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
        if self.config.sync_on_write {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Writes the frames a prepared commit introduces and returns the
    /// paths it supersedes.
    fn write_frames(
        &self,
        state: &StoreState,
        commit: &Commit,
    ) -> Result<Vec<PathBuf>, StorageError> {
        let mut superseded = Vec::new();
        for table in &commit.tables {
            self.write_frame(&table_path(&self.dir, table.id(), table.revision()), table)?;
            if let Some(old) = state.tables.get(&table.id()) {
                superseded.push(table_path(&self.dir, old.id(), old.revision()));
            }
        }
        if let Some(facts) = &commit.facts {
            for partition in &facts.partitions {
                let path = partition_path(&self.dir, partition.start(), partition.revision());
                self.write_frame(&path, partition)?;
                if let Some(old) = state.partitions.get(&partition.start()) {
                    superseded.push(partition_path(&self.dir, old.start(), old.revision()));
                }
            }
        }
        if self.config.sync_on_write {
            for sub in [TABLE_DIR, FACT_DIR] {
                (self.sync_dir)(&self.dir.join(sub))?;
            }
        }
        Ok(superseded)
    }
}

fn mismatch(path: &Path) -> StorageError {
    StorageError::SerializationError(format!(
        "{}: frame does not match its catalog entry",
        path.display()
    ))
}

fn read_frame<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => StorageError::SerializationError(format!(
            "{}: frame named by the catalog is missing",
            path.display()
        )),
        _ => StorageError::Io(e),
    })?;
    let mut reader = BufReader::new(file);
    let corrupt = |e: io::Error| match e.kind() {
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
            StorageError::SerializationError(format!("{}: {e}", path.display()))
        }
        _ => StorageError::Io(e),
    };
    let version = codec::read_header(&mut reader).map_err(corrupt)?;
    if version != codec::CODEC_VERSION {
        return Err(StorageError::SerializationError(format!(
            "{}: unsupported frame version {version}",
            path.display()
        )));
    }
    codec::decode(&mut reader).map_err(corrupt)
}

impl TableStore for PersistentTableStore {
    fn load(&self, table: TableId) -> Result<Table, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("table.load"))?;
        state.load(table)
    }

    fn load_fact_manifest(&self) -> Result<FactManifest, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("facts.manifest"))?;
        state.load_fact_manifest()
    }

    fn load_partition(&self, start: NaiveDate) -> Result<FactPartition, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("facts.partition"))?;
        state.load_partition(start)
    }

    fn lookup_facts(&self, query: &FactQuery) -> Result<FactLookup, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("facts.lookup"))?;
        Ok(state.lookup_facts(query))
    }

    fn contains(&self, table: TableId) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("table.contains"))?;
        Ok(state.contains(table))
    }

    fn key_high_water(&self) -> Result<KeyHighWater, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("keys.high_water"))?;
        Ok(state.key_high_water.clone())
    }

    fn commit(&self, mut commit: Commit) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("commit"))?;
        state.prepare(&mut commit)?;
        let superseded = self.write_frames(&state, &commit)?;

        let catalog = Catalog::after(&state, &commit);
        let temp = Self::temp_path(&self.dir);
        self.write_frame(&temp, &catalog)?;
        fs::rename(&temp, self.dir.join(CATALOG_FILE))?;

        // The new catalog is on disk; from here on the commit is published.
        state.install(commit);
        if self.config.sync_on_write {
            if let Err(err) = (self.sync_dir)(&self.dir) {
                tracing::error!(
                    dir = %self.dir.display(),
                    error = %err,
                    "catalog renamed but directory sync failed; commit may not survive a crash"
                );
            }
        }
        for path in superseded {
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "superseded frame not removed"
                );
            }
        }
        Ok(())
    }
}
