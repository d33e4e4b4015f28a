// SPDX-License-Identifier: Apache-2.0

//! Audit Trail
//!
//! Append-only forensic log of blocked queries, sensitive data access and
//! administrative actions. [`AuditSink`] is the seam; [`AuditStore`] keeps
//! recent events in memory and optionally appends them to a rotating
//! JSONL file.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::AuditError;
use super::types::AuditEvent;

/// Maximum entries to keep in memory for fast access
const MEMORY_CACHE_SIZE: usize = 1000;

/// Destination for audit events
///
/// Failures are reported to the caller, which logs them; they never abort
/// query execution.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Audit store with optional file persistence
pub struct AuditStore {
    entries: RwLock<VecDeque<AuditEvent>>,
    memory_capacity: usize,
    /// `None` keeps everything in memory
    log: Option<Mutex<AuditFile>>,
    log_path: Option<PathBuf>,
    /// Maximum entries to retain in the file
    max_entries: usize,
}

/// Append and rotate both happen under the owning mutex
struct AuditFile {
    path: PathBuf,
    /// Lines currently in the file
    lines: usize,
}

impl AuditStore {
    /// Memory-only store holding the most recent `capacity` events
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(MEMORY_CACHE_SIZE))),
            memory_capacity: capacity,
            log: None,
            log_path: None,
            max_entries: capacity,
        }
    }

    /// Store backed by `<dir>/audit.jsonl`, reloading recent events from it
    pub fn with_dir(dir: &Path, max_entries: usize) -> Result<Self, AuditError> {
        fs::create_dir_all(dir)?;

        let path = dir.join("audit.jsonl");
        let mut store = Self {
            entries: RwLock::new(VecDeque::with_capacity(MEMORY_CACHE_SIZE)),
            memory_capacity: MEMORY_CACHE_SIZE,
            log: None,
            log_path: Some(path.clone()),
            max_entries,
        };
        let lines = store.load_recent_entries();
        store.log = Some(Mutex::new(AuditFile { path, lines }));

        Ok(store)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Fills the memory cache from the file; returns the file's line count
    fn load_recent_entries(&self) -> usize {
        let Some(path) = self.log_path.as_ref().filter(|p| p.exists()) else {
            return 0;
        };

        match File::open(path) {
            Ok(file) => {
                let mut entries = self.entries.write();
                let mut lines = 0;
                for line in BufReader::new(file).lines().map_while(Result::ok) {
                    lines += 1;
                    if let Ok(event) = serde_json::from_str::<AuditEvent>(&line) {
                        if entries.len() >= self.memory_capacity {
                            entries.pop_front();
                        }
                        entries.push_back(event);
                    }
                }
                debug!("Loaded {} audit events from file", entries.len());
                lines
            }
            Err(e) => {
                warn!("Failed to load audit log file: {}", e);
                0
            }
        }
    }

    fn append_to_file(path: &Path, event: &AuditEvent) -> Result<(), AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let mut writer = BufWriter::new(file);
        let json = serde_json::to_string(event)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;

        Ok(())
    }

    /// Appends one event, rotating once the file exceeds `max_entries`
    ///
    /// Rotation keeps the newest 3/4.
    fn persist(&self, log: &Mutex<AuditFile>, event: &AuditEvent) -> Result<(), AuditError> {
        let mut file = log.lock();
        Self::append_to_file(&file.path, event)?;
        file.lines += 1;

        if file.lines <= self.max_entries {
            return Ok(());
        }

        match rotate_file(&file.path, self.max_entries * 3 / 4) {
            Ok(removed) => {
                file.lines = file.lines.saturating_sub(removed);
                info!("Rotated audit log, removed {} old entries", removed);
            }
            Err(e) => error!("Failed to rotate audit log: {}", e),
        }
        Ok(())
    }

    /// Recent events, most recent first
    pub fn entries(&self, filter: &AuditFilter, limit: usize, offset: usize) -> Vec<AuditEvent> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> AuditStats {
        let entries = self.entries.read();
        let now = Utc::now();
        let last_hour = now - Duration::hours(1);
        let last_day = now - Duration::days(1);

        let mut stats = AuditStats::default();
        for event in entries.iter() {
            stats.total += 1;
            if event.timestamp >= last_hour {
                stats.last_hour += 1;
            }
            if event.timestamp >= last_day {
                stats.last_day += 1;
            }
            *stats.by_action.entry(event.action.clone()).or_insert(0) += 1;
        }
        stats
    }

    /// Export the in-memory events as a JSON array
    pub fn export(&self) -> Result<String, AuditError> {
        let entries = self.entries.read();
        let events: Vec<&AuditEvent> = entries.iter().collect();
        Ok(serde_json::to_string_pretty(&events)?)
    }
}

impl AuditSink for AuditStore {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        {
            let mut entries = self.entries.write();
            if entries.len() >= self.memory_capacity {
                entries.pop_front();
            }
            entries.push_back(event.clone());
        }

        if let Some(log) = &self.log {
            self.persist(log, event)?;
        }

        Ok(())
    }
}

/// Rewrites the file keeping only its last `keep_count` lines
fn rotate_file(path: &Path, keep_count: usize) -> std::io::Result<usize> {
    let lines: Vec<String> = BufReader::new(File::open(path)?)
        .lines()
        .map_while(Result::ok)
        .collect();

    let total = lines.len();
    if total <= keep_count {
        return Ok(0);
    }
    let skip = total - keep_count;

    // Write to temp file then rename
    let temp_path = path.with_extension("jsonl.tmp");
    {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        for line in lines.iter().skip(skip) {
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
    }
    fs::rename(&temp_path, path)?;

    Ok(skip)
}

/// Narrows [`AuditStore::entries`]
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub principal: Option<String>,
    pub action: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn action(action: &str) -> Self {
        Self {
            action: Some(action.to_string()),
            ..Self::default()
        }
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if self.principal.as_ref().is_some_and(|p| *p != event.principal) {
            return false;
        }
        if self.action.as_ref().is_some_and(|a| *a != event.action) {
            return false;
        }
        if self.from_date.is_some_and(|from| event.timestamp < from) {
            return false;
        }
        if self.to_date.is_some_and(|to| event.timestamp > to) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: u64,
    pub last_hour: u64,
    pub last_day: u64,
    pub by_action: HashMap<String, u64>,
}
