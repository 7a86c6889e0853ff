use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::document::Document;
use crate::core::errors::{Error, PoisonedLockExt, Result};
use crate::core::op::OpKind;

use super::record::WalRecord;

struct WalState {
    file: File,
    next_seq: u64,
}

/// Append-only, fsynced, monotonic sequence log of committed operations.
///
/// One log file per database (`wal_dir/wal.log`), newline-delimited JSON
/// records. The sequence counter and the file handle share one mutex so
/// the counter advances under the same lock that serializes appends,
/// rather than living as an independent atomic that could race the file
/// write it's meant to order.
pub struct Wal {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_writes: bool,
}

impl Wal {
    /// Opens (creating if absent) the log at `path`, scanning it to seed
    /// the sequence counter at `1 + max(seq seen)`, or `0` if empty — the
    /// counter itself, not file length, is the source of truth across
    /// restarts.
    pub fn open(path: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let max_seq = Self::scan_max_seq(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;

        Ok(Self {
            path,
            state: Mutex::new(WalState {
                file,
                next_seq: max_seq.map(|s| s + 1).unwrap_or(0),
            }),
            sync_writes,
        })
    }

    fn scan_max_seq(path: &Path) -> Result<Option<u64>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path).map_err(Error::Io)?;
        let reader = BufReader::new(file);
        let mut max_seq = None;
        let lines: Vec<String> = reader
            .lines()
            .collect::<std::io::Result<_>>()
            .map_err(Error::Io)?;
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalRecord>(line) {
                Ok(record) => max_seq = Some(max_seq.map_or(record.seq, |m: u64| m.max(record.seq))),
                Err(e) => {
                    if i == lines.len() - 1 {
                        warn!(error = %e, "discarding truncated trailing WAL record");
                    } else {
                        return Err(Error::ReplayFailed {
                            reason: format!("malformed WAL record at line {}: {}", i + 1, e),
                        });
                    }
                }
            }
        }
        Ok(max_seq)
    }

    /// Appends one record, assigning the next sequence number under the
    /// log mutex, and fsyncs immediately. Commits amortize this over a
    /// whole transaction by calling `append` once per operation and
    /// relying on the final call's fsync to cover everything written
    /// since the writer latch was acquired — earlier writes in the same
    /// transaction are already durable in the OS page cache by the time
    /// the last one syncs, and `sync_all` flushes the whole file, not
    /// just the last write.
    #[instrument(skip(self, doc), fields(coll, id, op = op.as_str()))]
    pub fn append(
        &self,
        op: OpKind,
        coll: &str,
        id: &str,
        doc: Option<Document>,
    ) -> Result<u64> {
        let mut state = self.state.lock().recover_poison();
        let seq = state.next_seq;
        state.next_seq += 1;

        let record = WalRecord {
            seq,
            ts: Utc::now(),
            op,
            coll: coll.to_string(),
            id: id.to_string(),
            doc,
        };

        let mut line = serde_json::to_vec(&record).map_err(|e| Error::serialization("WAL record", e))?;
        line.push(b'\n');
        state.file.write_all(&line).map_err(Error::Io)?;
        if self.sync_writes {
            state.file.sync_all().map_err(Error::Io)?;
        }
        Ok(seq)
    }

    /// Reads and parses every record currently on disk, in order. A
    /// trailing line that fails to parse is treated as a torn write from a
    /// crash mid-append and silently discarded; anything else propagates
    /// as `ReplayFailed`.
    pub fn read_all(&self) -> Result<Vec<WalRecord>> {
        let reader = BufReader::new(File::open(&self.path).map_err(Error::Io)?);
        let lines: Vec<String> = reader
            .lines()
            .collect::<std::io::Result<_>>()
            .map_err(Error::Io)?;

        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    if i == lines.len() - 1 {
                        warn!(error = %e, "discarding truncated trailing WAL record");
                        break;
                    }
                    return Err(Error::ReplayFailed {
                        reason: format!("malformed WAL record at line {}: {}", i + 1, e),
                    });
                }
            }
        }
        Ok(records)
    }

    /// Empties the log file and fsyncs. Called after replay completes and
    /// after a checkpoint.
    #[instrument(skip(self))]
    pub fn truncate(&self) -> Result<()> {
        let mut state = self.state.lock().recover_poison();
        state.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(Error::Io)?;
        state.file.sync_all().map_err(Error::Io)?;
        // Reopen in append mode so subsequent writes land after EOF rather
        // than overwriting from the file's current cursor position.
        state.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(Error::Io)?;
        info!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log file in bytes, used by the checkpoint
    /// operation-count/time heuristics' caller.
    pub fn len_bytes(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path).map_err(Error::Io)?.len())
    }
}
