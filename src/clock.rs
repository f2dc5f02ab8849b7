//! # Version Clock
//!
//! Produces the per-node sequence number stamped onto every locally
//! originated write. The counter must be strictly monotonic across process
//! restarts: `(node_id, seq)` is the global identity of a write attempt,
//! and a reused seq would make remote dedup trackers silently drop a
//! legitimate new write.
//!
//! Durability is an append-only JSONL file at `<storage_path>.seq`, one
//! record per issued sequence:
//!
//! ```text
//! {"seq":41,"updated":"2026-07-30T09:12:44.017Z"}
//! {"seq":42,"updated":"2026-07-30T09:12:44.561Z"}
//! ```
//!
//! Recovery scans the whole file and keeps the last parseable record,
//! which tolerates a torn final line from a crash mid-append. A record is
//! appended at construction time, before the clock hands out anything, so
//! a crash between increment and append can never re-issue an observed
//! value after restart.
//!
//! Persistence failures never block `next()`: the clock stays monotonic in
//! memory and `sequence_persistence_errors` is incremented.

use chrono::{SecondsFormat, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::metrics::Metrics;

#[derive(Debug, Serialize, Deserialize)]
struct SeqRecord {
    seq: u64,
    updated: String,
}

struct ClockInner {
    current: u64,
    file: Option<File>,
}

/// Durable, strictly monotonic per-node sequence counter.
pub struct VersionClock {
    path: Option<PathBuf>,
    inner: Mutex<ClockInner>,
    metrics: Arc<Metrics>,
}

impl VersionClock {
    /// Open (or create) the clock at `path`, recovering the highest
    /// persisted sequence.
    pub fn open(path: impl AsRef<Path>, metrics: Arc<Metrics>) -> Self {
        let path = path.as_ref().to_path_buf();
        let recovered = Self::recover(&path);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                error!("sequence clock: cannot open {}: {}", path.display(), e);
                metrics.incr(&metrics.sequence_persistence_errors);
                e
            })
            .ok();

        let clock = Self {
            path: Some(path),
            inner: Mutex::new(ClockInner {
                current: recovered,
                file,
            }),
            metrics,
        };
        // Re-persist the recovered value before first use. If the previous
        // run crashed between increment and append, this pins the floor at
        // something >= every seq that run could have emitted minus the lost
        // tail; issuing starts above it either way because next() persists
        // before returning.
        clock.persist_locked(&mut clock.inner.lock().unwrap_or_else(|e| e.into_inner()), recovered);
        clock
    }

    /// An ephemeral clock with no backing file. Used when persistence is
    /// disabled; monotonicity then only holds within the process lifetime.
    pub fn ephemeral(metrics: Arc<Metrics>) -> Self {
        Self {
            path: None,
            inner: Mutex::new(ClockInner {
                current: 0,
                file: None,
            }),
            metrics,
        }
    }

    /// The last issued sequence (0 if none ever issued).
    pub fn current(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).current
    }

    /// Issue the next sequence: increment, persist, return.
    pub fn next(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.current += 1;
        let issued = inner.current;
        self.persist_locked(&mut inner, issued);
        issued
    }

    fn persist_locked(&self, inner: &mut ClockInner, seq: u64) {
        let Some(file) = inner.file.as_mut() else {
            return;
        };
        let record = SeqRecord {
            seq,
            updated: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let result = serde_json::to_string(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .and_then(|line| writeln!(file, "{}", line))
            .and_then(|_| file.flush());
        if let Err(e) = result {
            self.metrics.incr(&self.metrics.sequence_persistence_errors);
            if self.metrics.sequence_persistence_errors.load(Ordering::Relaxed) == 1 {
                if let Some(path) = &self.path {
                    error!("sequence clock: persist to {} failed: {}", path.display(), e);
                }
            }
        }
    }

    /// Read the last valid record from the sequence file. Unreadable files
    /// and unparseable tails fall back to the last good line; a file with
    /// no good lines recovers to 0.
    fn recover(path: &Path) -> u64 {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => return 0,
        };
        let mut last = 0u64;
        let mut bad_lines = 0usize;
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SeqRecord>(&line) {
                Ok(record) => last = record.seq,
                Err(_) => bad_lines += 1,
            }
        }
        if bad_lines > 0 {
            warn!(
                "sequence clock: ignored {} corrupt record(s) in {}",
                bad_lines,
                path.display()
            );
        }
        last
    }
}
