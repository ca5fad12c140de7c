//! Durable per-session offline event queue.
//!
//! Each session owns one append-only JSONL file under `<data_dir>/queue/`.
//! Every record is appended with file locking and synced before the write
//! is considered done, so an event survives process termination the moment
//! `enqueue` returns. The current queue state (pending entries in sequence
//! order, next sequence number, failed entries) is a fold over the records.
//!
//! Sequence numbers strictly increase per session and act as the remote
//! store's idempotency key. Compaction drops confirmed entries but writes a
//! watermark first, so numbering never restarts.

use crate::{DomainEvent, Error, QueueEntry, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One record in the queue log
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum QueueRecord {
    Enqueued(QueueEntry),
    Attempt { sequence_no: u64, at: DateTime<Utc> },
    Confirmed { sequence_no: u64 },
    Failed { sequence_no: u64 },
    Watermark { next_sequence: u64 },
}

/// Folded view of a queue log
#[derive(Clone, Debug, Default)]
pub struct QueueState {
    /// Unconfirmed entries, in strictly increasing sequence order
    pub pending: Vec<QueueEntry>,
    /// Entries the remote permanently rejected; surfaced, never retried
    pub failed: Vec<QueueEntry>,
    /// Sequence number the next enqueued event will receive
    pub next_sequence: u64,
}

/// Handle to one session's durable queue file
pub struct EventQueue {
    session_id: Uuid,
    path: PathBuf,
}

impl EventQueue {
    pub fn for_session(queue_dir: &Path, session_id: Uuid) -> Self {
        Self {
            session_id,
            path: queue_dir.join(format!("{}.wal", session_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All session ids with a queue file under `queue_dir`
    pub fn sessions(queue_dir: &Path) -> Result<Vec<Uuid>> {
        if !queue_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(queue_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "wal").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    match Uuid::parse_str(stem) {
                        Ok(id) => ids.push(id),
                        Err(_) => tracing::warn!("Ignoring non-session queue file {:?}", path),
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Durably append one domain event, assigning the next sequence number.
    /// The append is locked, flushed and synced before returning.
    pub fn enqueue(&self, event: DomainEvent, now: DateTime<Utc>) -> Result<u64> {
        let state = self.load()?;
        let sequence_no = state.next_sequence;
        let entry = QueueEntry {
            session_id: self.session_id,
            sequence_no,
            event,
            confirmed: false,
            attempts: 0,
            last_attempt_at: None,
        };
        self.append_record(&QueueRecord::Enqueued(entry))?;
        tracing::debug!(
            session = %self.session_id,
            sequence_no,
            "Enqueued event {} at {}",
            sequence_no,
            now
        );
        Ok(sequence_no)
    }

    /// Record one delivery attempt for an entry
    pub fn record_attempt(&self, sequence_no: u64, at: DateTime<Utc>) -> Result<()> {
        self.append_record(&QueueRecord::Attempt { sequence_no, at })
    }

    /// Mark an entry acknowledged by the remote; it leaves the pending set
    pub fn mark_confirmed(&self, sequence_no: u64) -> Result<()> {
        self.append_record(&QueueRecord::Confirmed { sequence_no })
    }

    /// Mark an entry permanently rejected; it leaves the pending set but
    /// stays visible in `QueueState::failed`
    pub fn mark_failed(&self, sequence_no: u64) -> Result<()> {
        self.append_record(&QueueRecord::Failed { sequence_no })
    }

    /// Replay the log into the current queue state
    pub fn load(&self) -> Result<QueueState> {
        if !self.path.exists() {
            return Ok(QueueState {
                pending: Vec::new(),
                failed: Vec::new(),
                next_sequence: 1,
            });
        }

        let file = File::open(&self.path)?;
        file.lock_shared()?;
        let state = replay_records(BufReader::new(&file), &self.path)?;
        file.unlock()?;
        Ok(state)
    }

    /// Rewrite the log atomically, keeping only still-pending entries plus
    /// a watermark that preserves sequence numbering.
    ///
    /// The live file's exclusive lock is held across the read, the rewrite
    /// and the rename, so a concurrent append can never land in the inode
    /// being replaced.
    pub fn compact(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let live = lock_live_exclusive(&self.path, false)?;
        let state = replay_records(BufReader::new(&live), &self.path)?;

        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::Persistence("queue path missing parent".into()))?;
        let temp = tempfile::NamedTempFile::new_in(parent)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let watermark = QueueRecord::Watermark {
                next_sequence: state.next_sequence,
            };
            writer.write_all(serde_json::to_string(&watermark)?.as_bytes())?;
            writer.write_all(b"\n")?;
            for entry in &state.pending {
                let record = QueueRecord::Enqueued(entry.clone());
                writer.write_all(serde_json::to_string(&record)?.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        live.unlock()?;

        tracing::debug!(
            session = %self.session_id,
            pending = state.pending.len(),
            "Compacted queue"
        );
        Ok(())
    }

    fn append_record(&self, record: &QueueRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = lock_live_exclusive(&self.path, true)?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.sync_all()?;
        file.unlock()?;
        Ok(())
    }
}

fn replay_records(reader: impl BufRead, path: &Path) -> Result<QueueState> {
    let mut entries: BTreeMap<u64, QueueEntry> = BTreeMap::new();
    let mut failed: Vec<QueueEntry> = Vec::new();
    let mut next_sequence: u64 = 1;

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let record = match serde_json::from_str::<QueueRecord>(&line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    "Failed to parse queue record at line {} of {:?}: {}",
                    line_num + 1,
                    path,
                    e
                );
                continue;
            }
        };

        match record {
            QueueRecord::Enqueued(entry) => {
                next_sequence = next_sequence.max(entry.sequence_no + 1);
                entries.insert(entry.sequence_no, entry);
            }
            QueueRecord::Attempt { sequence_no, at } => {
                if let Some(entry) = entries.get_mut(&sequence_no) {
                    entry.attempts += 1;
                    entry.last_attempt_at = Some(at);
                }
            }
            QueueRecord::Confirmed { sequence_no } => {
                entries.remove(&sequence_no);
            }
            QueueRecord::Failed { sequence_no } => {
                if let Some(entry) = entries.remove(&sequence_no) {
                    failed.push(entry);
                }
            }
            QueueRecord::Watermark { next_sequence: w } => {
                next_sequence = next_sequence.max(w);
            }
        }
    }

    Ok(QueueState {
        pending: entries.into_values().collect(),
        failed,
        next_sequence,
    })
}

/// Open the file at `path` and take its exclusive lock, retrying when a
/// concurrent rewrite renamed a fresh inode over the path between the open
/// and the lock. The returned handle is guaranteed to be the live file.
fn lock_live_exclusive(path: &Path, append: bool) -> Result<File> {
    loop {
        let file = if append {
            OpenOptions::new().create(true).append(true).open(path)?
        } else {
            File::open(path)?
        };
        file.lock_exclusive()?;
        if is_live(&file, path)? {
            return Ok(file);
        }
        file.unlock()?;
    }
}

/// Whether `file` still is the file named by `path` (a rewrite replaces
/// the inode under the same name)
fn is_live(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let held = file.metadata()?;
    Ok(match std::fs::metadata(path) {
        Ok(current) => current.dev() == held.dev() && current.ino() == held.ino(),
        Err(_) => false,
    })
}
