//! Worker process records.
//!
//! One JSON file per record in a shared directory, written atomically via
//! write-then-rename, so status tooling can inspect workers from outside
//! the supervisor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub handler_name: String,
    pub driver: String,
    pub pid: u32,
    pub hostname: String,
    pub channels: Vec<String>,
    pub status: WorkerStatus,
    pub started_at_ns: u64,
    pub last_heartbeat_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at_ns: Option<u64>,
    pub message_count: u64,
    pub error_count: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl WorkerRecord {
    pub fn heartbeat_alive(&self, now_ns: u64, threshold_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_heartbeat_ns) < threshold_ns
    }

    /// Whether the recorded pid still exists on this host.
    pub fn os_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let res = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if res == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let res = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if res == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "localhost".to_string()
    }
}

#[cfg(not(unix))]
pub fn hostname() -> String {
    "localhost".to_string()
}

/// File-backed store of worker records.
pub struct ProcessRecordStore {
    dir: PathBuf,
}

impl ProcessRecordStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Atomic save: the record appears whole or not at all.
    pub fn save(&self, record: &WorkerRecord) -> Result<()> {
        let tmp = self.dir.join(format!("{}.json.tmp", record.id));
        let target = self.record_path(&record.id);
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        std::fs::rename(tmp, target)?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<WorkerRecord> {
        let raw = std::fs::read_to_string(self.record_path(id))
            .map_err(|_| Error::Fatal(format!("no worker record '{id}'")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// All records, newest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<WorkerRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => log::debug!("skipping record {}: {err}", path.display()),
            }
        }
        records.sort_by(|a, b| b.started_at_ns.cmp(&a.started_at_ns));
        Ok(records)
    }

    /// Remove records whose process is gone and whose heartbeat is stale.
    pub fn cleanup_stale(&self, now_ns: u64, heartbeat_threshold_ns: u64) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for record in self.list()? {
            if !record.os_alive() && !record.heartbeat_alive(now_ns, heartbeat_threshold_ns) {
                self.remove(&record.id)?;
                removed.push(record.id);
            }
        }
        Ok(removed)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let records = self.list()?;
        for record in &records {
            self.remove(&record.id)?;
        }
        Ok(records.len())
    }
}

fn read_record(path: &Path) -> Result<WorkerRecord> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
