//! Hash-chained audit trail of private-key accesses.
//!
//! Entries record the component and operation only, never key material.
//! Each entry hashes its predecessor, so truncation or edits in the middle
//! of a file break `verify_chain`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Granted,
    Denied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub operation: String,
    pub outcome: AuditOutcome,
    pub prev_hash: String,
    pub hash: String,
}

enum Sink {
    Memory(Vec<AuditEntry>),
    File { path: PathBuf, max_bytes: u64 },
}

struct LogState {
    last_seq: u64,
    last_hash: String,
    sink: Sink,
}

pub struct AuditLog {
    inner: Mutex<LogState>,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(LogState {
                last_seq: 0,
                last_hash: CHAIN_START.to_string(),
                sink: Sink::Memory(Vec::new()),
            }),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
                sink: Sink::File { path, max_bytes },
            }),
        })
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for entry in read_entries(path)? {
            last_seq = entry.seq;
            last_hash = entry.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn compute_hash(entry: &AuditEntry) -> String {
        let unsigned = serde_json::json!({
            "seq": entry.seq,
            "timestamp": entry.timestamp,
            "component": entry.component,
            "operation": entry.operation,
            "outcome": entry.outcome,
            "prev_hash": entry.prev_hash,
        });
        let mut hasher = Sha256::new();
        hasher.update(unsigned.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Append one access record and mirror it to the `eupay::audit` target.
    pub fn record(
        &self,
        component: &str,
        operation: &str,
        outcome: AuditOutcome,
    ) -> Result<AuditEntry> {
        tracing::info!(
            target: "eupay::audit",
            component,
            operation,
            outcome = ?outcome,
            "private key access"
        );
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if let Sink::File { path, max_bytes } = &state.sink {
            if rotate_if_needed(path, *max_bytes)? {
                state.last_hash = CHAIN_START.to_string();
            }
        }

        let mut entry = AuditEntry {
            seq: state.last_seq + 1,
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: operation.to_string(),
            outcome,
            prev_hash: state.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = Self::compute_hash(&entry);

        match &mut state.sink {
            Sink::Memory(entries) => entries.push(entry.clone()),
            Sink::File { path, .. } => {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(file, "{}", serde_json::to_string(&entry)?)?;
                file.flush()?;
            }
        }
        state.last_seq = entry.seq;
        state.last_hash = entry.hash.clone();
        Ok(entry)
    }

    /// Most recent entries first.
    pub fn read_recent(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let mut entries = self.current_entries()?;
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Check hashes and back-links of the active segment. A rotated segment
    /// restarts at `CHAIN_START` while `seq` keeps counting.
    pub fn verify_chain(&self) -> Result<bool> {
        let entries = self.current_entries()?;
        let mut prev = CHAIN_START.to_string();
        for entry in &entries {
            if entry.prev_hash != prev || Self::compute_hash(entry) != entry.hash {
                return Ok(false);
            }
            prev = entry.hash.clone();
        }
        Ok(true)
    }

    fn current_entries(&self) -> Result<Vec<AuditEntry>> {
        let state = self.inner.lock();
        match &state.sink {
            Sink::Memory(entries) => Ok(entries.clone()),
            Sink::File { path, .. } => read_entries(path),
        }
    }
}

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Returns true when the active file was rotated away.
fn rotate_if_needed(path: &Path, max_bytes: u64) -> Result<bool> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.len() >= max_bytes => {}
        _ => return Ok(false),
    }
    for i in (1..=MAX_ROTATIONS).rev() {
        let rotated = path_with_suffix(path, i);
        if rotated.exists() {
            if i == MAX_ROTATIONS {
                fs::remove_file(&rotated)?;
            } else {
                fs::rename(&rotated, path_with_suffix(path, i + 1))?;
            }
        }
    }
    fs::rename(path, path_with_suffix(path, 1))?;
    Ok(true)
}

fn path_with_suffix(path: &Path, index: usize) -> PathBuf {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "audit.log".to_string());
    path.with_file_name(format!("{}.{}", filename, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_log_chains_entries() {
        let log = AuditLog::in_memory();
        log.record("key_vault", "sign", AuditOutcome::Granted).unwrap();
        let second = log
            .record("key_vault", "agree_shared", AuditOutcome::Denied)
            .unwrap();
        assert_eq!(second.seq, 2);
        assert!(log.verify_chain().unwrap());
        let recent = log.read_recent(Some(1)).unwrap();
        assert_eq!(recent[0].operation, "agree_shared");
    }

    #[test]
    fn file_log_survives_reopen_and_rotates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let log = AuditLog::open(&path, 512).unwrap();
            for _ in 0..20 {
                log.record("key_vault", "sign", AuditOutcome::Granted).unwrap();
            }
        }
        assert!(path.with_file_name("audit.log.1").exists());
        let log = AuditLog::open(&path, 512).unwrap();
        let next = log.record("key_vault", "sign", AuditOutcome::Granted).unwrap();
        assert_eq!(next.seq, 21);
        assert!(log.verify_chain().unwrap());
    }

    #[test]
    fn edited_entry_breaks_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(&path, 1 << 20).unwrap();
        log.record("key_vault", "sign", AuditOutcome::Granted).unwrap();
        log.record("key_vault", "sign", AuditOutcome::Granted).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen("GRANTED", "DENIED", 1)).unwrap();
        assert!(!log.verify_chain().unwrap());
    }
}
