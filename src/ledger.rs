//! Append-only audit trail of access decisions.
//!
//! The on-disk ledger is a sequence of COBS-framed postcard records, each
//! terminated by a zero byte, so a torn final write never corrupts earlier
//! entries.

use chrono::{DateTime, Utc};
use facegate_oracle::ResidentId;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::decision::{AccessDecision, Outcome};
use crate::residents::Resident;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("audit ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding audit entry: {0}")]
    Codec(#[from] postcard::Error),
    #[error("audit ledger rejected entry: {0}")]
    Rejected(String),
}

/// Resident details as they were when the entry was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidentSnapshot {
    pub id: ResidentId,
    pub name: String,
    pub apartment: String,
    pub active: bool,
}

impl From<&Resident> for ResidentSnapshot {
    fn from(r: &Resident) -> Self {
        Self {
            id: r.id.clone(),
            name: r.name.clone(),
            apartment: r.apartment.clone(),
            active: r.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub id: Uuid,
    pub access_point: String,
    pub main_message: String,
    /// Decision confidence rounded to two decimals.
    pub confidence: f64,
    pub resident: Option<ResidentSnapshot>,
    pub decision: AccessDecision,
}

impl AccessLogEntry {
    pub fn new(decision: AccessDecision, resident: Option<&Resident>, access_point: &str) -> Self {
        let main_message = match decision.outcome() {
            Outcome::Granted => "Authorized",
            Outcome::Denied => "Unknown",
            Outcome::Inconclusive => "Error",
            Outcome::Enrolled => "Enrolled",
        };
        Self {
            id: Uuid::new_v4(),
            access_point: access_point.to_string(),
            main_message: main_message.to_string(),
            confidence: (decision.confidence() * 100.0).round() / 100.0,
            resident: resident.map(ResidentSnapshot::from),
            decision,
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.decision.timestamp()
    }
}

/// Write side of the audit trail. No update or delete; corrections are new
/// entries.
pub trait AuditLedger: Send + Sync {
    fn append(&self, entry: &AccessLogEntry) -> Result<(), LedgerError>;
}

pub struct FileLedger {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        drop_torn_tail(&path, &file).map_err(io_err)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every complete entry, oldest first.
    pub fn read_all(&self) -> Result<Vec<AccessLogEntry>, LedgerError> {
        load_entries(&self.path)
    }

    /// The newest `n` entries, oldest first.
    pub fn latest(&self, n: usize) -> Result<Vec<AccessLogEntry>, LedgerError> {
        let mut entries = self.read_all()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }
}

impl AuditLedger for FileLedger {
    fn append(&self, entry: &AccessLogEntry) -> Result<(), LedgerError> {
        let frame = postcard::to_allocvec_cobs(entry)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| LedgerError::Rejected("ledger lock poisoned".to_string()))?;
        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };
        file.write_all(&frame).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        Ok(())
    }
}

/// Cuts an unterminated frame left by an interrupted write, so the next
/// append starts on a frame boundary.
fn drop_torn_tail(path: &Path, file: &File) -> std::io::Result<()> {
    let data = std::fs::read(path)?;
    let keep = data.iter().rposition(|b| *b == 0).map_or(0, |i| i + 1);
    if keep < data.len() {
        warn!(
            "truncating {} bytes of a torn entry in {}",
            data.len() - keep,
            path.display()
        );
        file.set_len(keep as u64)?;
        file.sync_data()?;
    }
    Ok(())
}

pub fn load_entries(path: &Path) -> Result<Vec<AccessLogEntry>, LedgerError> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let data = std::fs::read(path).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for frame in data.split_inclusive(|b| *b == 0) {
        if frame.last() != Some(&0) {
            warn!(
                "ignoring {} trailing bytes of a torn entry in {}",
                frame.len(),
                path.display()
            );
            continue;
        }
        let mut frame = frame.to_vec();
        match postcard::from_bytes_cobs(&mut frame) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(
                "skipping undecodable {}-byte entry in {}: {e}",
                frame.len(),
                path.display()
            ),
        }
    }
    Ok(entries)
}

/// In-process ledger, for dry runs and tests.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<AccessLogEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AccessLogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditLedger for MemoryLedger {
    fn append(&self, entry: &AccessLogEntry) -> Result<(), LedgerError> {
        self.entries
            .lock()
            .map_err(|_| LedgerError::Rejected("ledger lock poisoned".to_string()))?
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{decide, Mode, Thresholds};
    use facegate_oracle::{Confidence, RecognitionOutcome};

    fn entry(id: &str, confidence: f64) -> AccessLogEntry {
        let decision = decide(
            &Mode::Identify,
            &RecognitionOutcome::Matched {
                resident_id: ResidentId::from(id),
                confidence: Confidence::new(confidence),
                distance: None,
            },
            &Thresholds::default(),
        );
        AccessLogEntry::new(decision, None, "Main Gate")
    }

    #[test]
    fn test_entry_rounds_confidence() {
        let e = entry("R1", 0.8534567);
        assert_eq!(e.confidence, 0.85);
        assert_eq!(e.decision.confidence(), 0.8534567);
        assert_eq!(e.main_message, "Authorized");
    }

    #[test]
    fn test_file_ledger_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("ledger.bin");
        let ledger = FileLedger::open(&path).unwrap();

        let written: Vec<_> = (0..5).map(|i| entry(&format!("R{i}"), 0.7)).collect();
        for e in &written {
            ledger.append(e).unwrap();
        }

        assert_eq!(ledger.read_all().unwrap(), written);
        let latest = ledger.latest(2).unwrap();
        assert_eq!(latest, written[3..].to_vec());
        assert_eq!(ledger.latest(50).unwrap().len(), 5);
    }

    #[test]
    fn test_reopen_keeps_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.bin");
        let first = entry("R1", 0.9);
        FileLedger::open(&path).unwrap().append(&first).unwrap();

        let ledger = FileLedger::open(&path).unwrap();
        let second = entry("R2", 0.2);
        ledger.append(&second).unwrap();

        assert_eq!(ledger.read_all().unwrap(), vec![first, second]);
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.bin");
        let ledger = FileLedger::open(&path).unwrap();
        let kept = entry("R1", 0.9);
        ledger.append(&kept).unwrap();

        let mut torn = postcard::to_allocvec_cobs(&entry("R2", 0.9)).unwrap();
        torn.truncate(torn.len() / 2);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn).unwrap();

        assert_eq!(load_entries(&path).unwrap(), vec![kept]);
    }

    #[test]
    fn test_append_after_torn_write_keeps_entries_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.bin");
        let first = entry("R1", 0.9);
        FileLedger::open(&path).unwrap().append(&first).unwrap();

        let mut torn = postcard::to_allocvec_cobs(&entry("R2", 0.9)).unwrap();
        torn.truncate(torn.len() / 2);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn).unwrap();
        drop(file);

        let ledger = FileLedger::open(&path).unwrap();
        let third = entry("R3", 0.8);
        ledger.append(&third).unwrap();

        assert_eq!(ledger.read_all().unwrap(), vec![first, third]);
    }

    #[test]
    fn test_corrupt_frame_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.bin");
        let ledger = FileLedger::open(&path).unwrap();
        let first = entry("R1", 0.9);
        ledger.append(&first).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x07, 0xff, 0xff, 0x00]).unwrap();
        drop(file);

        let last = entry("R2", 0.7);
        ledger.append(&last).unwrap();
        assert_eq!(load_entries(&path).unwrap(), vec![first, last]);
    }

    #[test]
    fn test_memory_ledger() {
        let ledger = MemoryLedger::new();
        assert!(ledger.is_empty());
        ledger.append(&entry("R1", 0.9)).unwrap();
        assert_eq!(ledger.len(), 1);
    }
}
