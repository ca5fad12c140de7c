//! The remote store boundary and a directory-backed implementation.
//!
//! The tracker only ever talks to the remote through the `RemoteStore`
//! trait: apply one event under a (session, sequence) idempotency key,
//! learn whether it was acknowledged, transiently unavailable, or
//! permanently rejected. Connectivity changes surface through the
//! `Connectivity` trait rather than any runtime-specific listener.

use crate::{DomainEvent, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Outcome of delivering one event to the remote store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteResponse {
    /// Applied (or already applied under the same idempotency key)
    Ack,
    /// Temporarily unavailable; the entry stays queued and is retried
    Transient(String),
    /// Rejected as invalid; the entry is marked failed and never retried
    Permanent(String),
}

/// The authoritative remote store, idempotent per (session_id, sequence_no)
pub trait RemoteStore {
    fn apply_event(
        &self,
        session_id: Uuid,
        sequence_no: u64,
        event: &DomainEvent,
    ) -> RemoteResponse;
}

/// Online/offline notifier the reconciler consults before draining
pub trait Connectivity {
    fn is_online(&self) -> bool;
}

/// Trivial connectivity: always online (single-machine setups, tests)
#[derive(Clone, Debug, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// One line in a remote session file
#[derive(Debug, Serialize, Deserialize)]
struct RemoteRecord {
    sequence_no: u64,
    event: DomainEvent,
}

/// Remote store backed by a directory (a mounted network share or a
/// synced folder). One JSONL file per session; idempotency is enforced by
/// tracking the highest sequence number already applied. An unreachable
/// root reads as offline and every delivery fails transiently.
#[derive(Clone, Debug)]
pub struct DirRemoteStore {
    root: PathBuf,
}

impl DirRemoteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_path(&self, session_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.jsonl", session_id))
    }

    /// Highest sequence number already recorded for a session
    fn last_applied(&self, path: &Path) -> Result<u64> {
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(path)?;
        file.lock_shared()?;
        let reader = BufReader::new(&file);
        let mut last = 0u64;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RemoteRecord>(&line) {
                Ok(record) => last = last.max(record.sequence_no),
                Err(e) => tracing::warn!("Skipping bad remote record in {:?}: {}", path, e),
            }
        }
        file.unlock()?;
        Ok(last)
    }

    /// Read back every event recorded for a session, in applied order
    pub fn applied_events(&self, session_id: Uuid) -> Result<Vec<(u64, DomainEvent)>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        file.lock_shared()?;
        let reader = BufReader::new(&file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<RemoteRecord>(&line) {
                events.push((record.sequence_no, record.event));
            }
        }
        file.unlock()?;
        Ok(events)
    }

    fn try_apply(
        &self,
        session_id: Uuid,
        sequence_no: u64,
        event: &DomainEvent,
    ) -> Result<RemoteResponse> {
        let path = self.session_path(session_id);
        let last = self.last_applied(&path)?;
        if sequence_no <= last {
            // Re-delivered under the same idempotency key: a no-op
            tracing::debug!(
                session = %session_id,
                sequence_no,
                "Duplicate delivery ignored"
            );
            return Ok(RemoteResponse::Ack);
        }

        let line = serde_json::to_string(&RemoteRecord {
            sequence_no,
            event: event.clone(),
        })?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.lock_exclusive()?;
        let mut writer = std::io::BufWriter::new(&file);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);
        file.sync_all()?;
        file.unlock()?;

        Ok(RemoteResponse::Ack)
    }
}

impl RemoteStore for DirRemoteStore {
    fn apply_event(
        &self,
        session_id: Uuid,
        sequence_no: u64,
        event: &DomainEvent,
    ) -> RemoteResponse {
        if !self.root.is_dir() {
            return RemoteResponse::Transient(format!(
                "remote directory {:?} unreachable",
                self.root
            ));
        }
        match self.try_apply(session_id, sequence_no, event) {
            Ok(response) => response,
            // IO trouble on a reachable share is assumed recoverable
            Err(e) => RemoteResponse::Transient(e.to_string()),
        }
    }
}

impl Connectivity for DirRemoteStore {
    fn is_online(&self) -> bool {
        self.root.is_dir()
    }
}
