//! Local durable storage for session aggregates and set logs.
//!
//! Each session is snapshotted to `sessions/<id>.json` with an atomic
//! temp-file-and-rename write, and its completed sets append to
//! `sets/<id>.wal` as JSONL with file locking. An interrupted process
//! reloads both and resumes without data loss.

use crate::{CompletedSet, Error, Result, Session, SyncStatus};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct SessionStore {
    sessions_dir: PathBuf,
    sets_dir: PathBuf,
}

impl SessionStore {
    /// Open a store rooted at `data_dir`, creating its layout if needed
    pub fn open(data_dir: &Path) -> Result<Self> {
        let sessions_dir = data_dir.join("sessions");
        let sets_dir = data_dir.join("sets");
        std::fs::create_dir_all(&sessions_dir)?;
        std::fs::create_dir_all(&sets_dir)?;
        Ok(Self {
            sessions_dir,
            sets_dir,
        })
    }

    pub fn session_path(&self, id: Uuid) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", id))
    }

    pub fn sets_path(&self, id: Uuid) -> PathBuf {
        self.sets_dir.join(format!("{}.wal", id))
    }

    // ------------------------------------------------------------------
    // Session aggregate snapshots
    // ------------------------------------------------------------------

    /// Atomically write the session snapshot
    pub fn save_session(&self, session: &Session) -> Result<()> {
        let path = self.session_path(session.id);
        let temp = NamedTempFile::new_in(&self.sessions_dir)?;
        temp.as_file().lock_exclusive()?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(session)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!(session = %session.id, "Saved session snapshot");
        Ok(())
    }

    /// Load one session snapshot; None if it was never saved
    pub fn load_session(&self, id: Uuid) -> Result<Option<Session>> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let session = serde_json::from_str::<Session>(&contents)
            .map_err(|e| Error::Persistence(format!("corrupt session snapshot {:?}: {}", path, e)))?;
        Ok(Some(session))
    }

    /// Load every stored session snapshot, newest created first.
    /// A corrupt snapshot is logged and skipped, not fatal.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let contents = std::fs::read_to_string(&path)?;
                match serde_json::from_str::<Session>(&contents) {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        tracing::warn!("Skipping corrupt session snapshot {:?}: {}", path, e)
                    }
                }
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Rename a terminal session's files out of the live set after rollup
    pub fn archive_session(&self, id: Uuid) -> Result<()> {
        let session_path = self.session_path(id);
        if session_path.exists() {
            std::fs::rename(&session_path, session_path.with_extension("json.processed"))?;
        }
        let sets_path = self.sets_path(id);
        if sets_path.exists() {
            std::fs::rename(&sets_path, sets_path.with_extension("wal.processed"))?;
        }
        tracing::debug!(session = %id, "Archived session files");
        Ok(())
    }

    /// Remove `.processed` leftovers under both directories
    pub fn cleanup_processed(&self) -> Result<usize> {
        let mut count = 0;
        for dir in [&self.sessions_dir, &self.sets_dir] {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "processed").unwrap_or(false) {
                    std::fs::remove_file(&path)?;
                    count += 1;
                }
            }
        }
        if count > 0 {
            tracing::info!("Cleaned up {} processed files", count);
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Set log
    // ------------------------------------------------------------------

    /// Append one completed set to the session's set log
    pub fn append_set(&self, set: &CompletedSet) -> Result<()> {
        let path = self.sets_path(set.session_id);
        let file = lock_live_exclusive(&path, true)?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(set)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.sync_all()?;
        file.unlock()?;

        tracing::debug!(session = %set.session_id, set = %set.id, "Appended set");
        Ok(())
    }

    /// Read the full set log for a session, in append order.
    /// Corrupt lines are logged and skipped.
    pub fn load_sets(&self, session_id: Uuid) -> Result<Vec<CompletedSet>> {
        let path = self.sets_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)?;
        file.lock_shared()?;
        let sets = read_set_lines(BufReader::new(&file));
        file.unlock()?;
        sets
    }

    /// Update one set's sync status, rewriting the log atomically.
    /// Returns whether the set was found. Only `sync_status` ever changes;
    /// everything else in the log is immutable.
    ///
    /// The live log's exclusive lock is held across the read, the rewrite
    /// and the rename, so a concurrent append can never land in the inode
    /// being replaced.
    pub fn mark_set_status(
        &self,
        session_id: Uuid,
        set_id: Uuid,
        status: SyncStatus,
    ) -> Result<bool> {
        let path = self.sets_path(session_id);
        if !path.exists() {
            return Ok(false);
        }
        let live = lock_live_exclusive(&path, false)?;
        let mut sets = read_set_lines(BufReader::new(&live))?;

        let Some(idx) = sets.iter().position(|s| s.id == set_id) else {
            live.unlock()?;
            return Ok(false);
        };
        if sets[idx].sync_status == status {
            live.unlock()?;
            return Ok(true);
        }
        sets[idx].sync_status = status;

        let temp = NamedTempFile::new_in(&self.sets_dir)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for set in &sets {
                writer.write_all(serde_json::to_string(set)?.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;
        live.unlock()?;
        Ok(true)
    }
}

fn read_set_lines(reader: impl BufRead) -> Result<Vec<CompletedSet>> {
    let mut sets = Vec::new();
    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CompletedSet>(&line) {
            Ok(set) => sets.push(set),
            Err(e) => {
                tracing::warn!("Failed to parse set at line {}: {}", line_num + 1, e);
            }
        }
    }
    Ok(sets)
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

fn is_live(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let held = file.metadata()?;
    Ok(match std::fs::metadata(path) {
        Ok(current) => current.dev() == held.dev() && current.ino() == held.ino(),
        Err(_) => false,
    })
}
