//! Append-only audit journal written by a background thread.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded AuditEntry]
//! [ENTRY 2: codec-encoded AuditEntry]
//! ...
//! ```
//!
//! The merge thread only enqueues. When the queue is full the entry is
//! dropped with a warning; the merge is never slowed down or failed by
//! the journal.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};

use super::codec;
use crate::audit::{AuditEntry, AuditSink};

/// Audit sink appending CRC-framed entries to a file.
#[derive(Debug)]
pub struct JournalAuditSink {
    path: PathBuf,
    tx: Option<Sender<AuditEntry>>,
    writer: Option<JoinHandle<()>>,
}

impl JournalAuditSink {
    /// Opens `path` for appending and starts the writer thread.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened, has a foreign header, or the
    /// thread cannot be spawned.
    pub fn open(path: &Path, queue_capacity: usize) -> IoResult<Self> {
        let fresh = !path.exists() || path.metadata()?.len() == 0;
        if !fresh {
            codec::read_header(&mut File::open(path)?)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut out = BufWriter::new(file);
        if fresh {
            codec::write_header(&mut out)?;
            out.flush()?;
        }

        let (tx, rx) = bounded::<AuditEntry>(queue_capacity.max(1));
        let journal_path = path.display().to_string();
        let writer = thread::Builder::new()
            .name("starmerge-audit-journal".to_string())
            .spawn(move || {
                for entry in rx {
                    let written = codec::encode(&entry).and_then(|frame| {
                        out.write_all(&frame)?;
                        out.flush()
                    });
                    if let Err(err) = written {
                        tracing::warn!(
                            journal = %journal_path,
                            error = %err,
                            operation = %entry.operation,
                            "audit entry lost"
                        );
                    }
                }
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drains the queue and stops the writer thread.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Closing the channel lets the writer drain queued entries, then exit.
        drop(self.tx.take());
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

impl AuditSink for JournalAuditSink {
    fn record(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                tracing::warn!(
                    operation = %entry.operation,
                    "audit journal queue full; entry dropped"
                );
            }
            Err(TrySendError::Disconnected(entry)) => {
                tracing::warn!(
                    operation = %entry.operation,
                    "audit journal writer stopped; entry dropped"
                );
            }
        }
    }
}

impl Drop for JournalAuditSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads every complete entry of a journal. A truncated final frame
/// (from a crash mid-write) is ignored.
///
/// # Errors
///
/// Fails on a foreign header or a corrupted frame.
pub fn read_journal(path: &Path) -> IoResult<Vec<AuditEntry>> {
    let mut reader = BufReader::new(File::open(path)?);
    codec::read_header(&mut reader)?;
    let mut entries = Vec::new();
    loop {
        match codec::decode::<AuditEntry>(&mut reader) {
            Ok(entry) => entries.push(entry),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err),
        }
    }
    Ok(entries)
}
