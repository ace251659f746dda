//! Append-only event log plus derived statistics.
//!
//! One JSON document per line. Appends are serialized through a mutex and
//! never propagate failure to the caller: a sync that succeeded must not be
//! reported as failed because the log disk was full. Entries are immutable
//! once written.

use crate::outcome::{BulkDistribution, DistributionAttempt, DomainOutcome, OutcomeStatus, SyncRun};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CertificateSync,
    CertificateDistribution,
    BulkDistribution,
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "certificate_sync" => Ok(EventKind::CertificateSync),
            "certificate_distribution" => Ok(EventKind::CertificateDistribution),
            "bulk_distribution" => Ok(EventKind::BulkDistribution),
            other => Err(format!(
                "unknown event type {other:?}; expected certificate_sync, \
                 certificate_distribution or bulk_distribution"
            )),
        }
    }
}

/// Payload of a `certificate_sync` entry: one completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub run_id: Uuid,
    pub status: OutcomeStatus,
    pub domains: Vec<String>,
    pub results: Vec<DomainOutcome>,
}

impl From<&SyncRun> for SyncEvent {
    fn from(run: &SyncRun) -> Self {
        Self {
            run_id: run.id,
            status: run.status(),
            domains: run.domains(),
            results: run.results.clone(),
        }
    }
}

/// Payload of a `certificate_distribution` entry: one host attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionEvent {
    pub domain: String,
    #[serde(flatten)]
    pub attempt: DistributionAttempt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum LogEvent {
    CertificateSync(SyncEvent),
    CertificateDistribution(DistributionEvent),
    BulkDistribution(BulkDistribution),
}

impl LogEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LogEvent::CertificateSync(_) => EventKind::CertificateSync,
            LogEvent::CertificateDistribution(_) => EventKind::CertificateDistribution,
            LogEvent::BulkDistribution(_) => EventKind::BulkDistribution,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// Counts derived by folding the full history. Never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub total_syncs: u64,
    pub total_distributions: u64,
    pub successful_distributions: u64,
    pub failed_distributions: u64,
}

pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn append_sync(&self, run: &SyncRun) {
        self.append(LogEvent::CertificateSync(SyncEvent::from(run)));
    }

    pub fn append_distribution(&self, domain: &str, attempt: &DistributionAttempt) {
        self.append(LogEvent::CertificateDistribution(DistributionEvent {
            domain: domain.to_string(),
            attempt: attempt.clone(),
        }));
    }

    pub fn append_bulk(&self, bulk: &BulkDistribution) {
        self.append(LogEvent::BulkDistribution(bulk.clone()));
    }

    /// Append an entry. A failure here is logged and swallowed: the
    /// operation being recorded already happened.
    pub fn append(&self, event: LogEvent) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            event,
        };
        if let Err(e) = self.try_append(&entry) {
            warn!(path = %self.path.display(), error = %e, "failed to append event log entry");
        }
    }

    fn try_append(&self, entry: &LogEntry) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    /// Read entries, newest first, optionally filtered by kind and capped
    /// at `limit`. Lines that fail to parse are skipped with a warning so
    /// one corrupt line cannot hide the rest of the history.
    pub fn query(
        &self,
        kind: Option<EventKind>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<LogEntry>> {
        let mut entries = self.read_all()?;
        if let Some(kind) = kind {
            entries.retain(|e| e.event.kind() == kind);
        }
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Fold the full history into aggregate counts. Distribution counts
    /// come from the per-host `certificate_distribution` entries; the
    /// `bulk_distribution` rollups describe the same attempts and are not
    /// double-counted.
    pub fn stats(&self) -> anyhow::Result<LogStats> {
        let mut stats = LogStats::default();
        for entry in self.read_all()? {
            match entry.event {
                LogEvent::CertificateSync(_) => stats.total_syncs += 1,
                LogEvent::CertificateDistribution(event) => {
                    stats.total_distributions += 1;
                    if event.attempt.status == OutcomeStatus::Success {
                        stats.successful_distributions += 1;
                    } else {
                        stats.failed_distributions += 1;
                    }
                }
                LogEvent::BulkDistribution(_) => {}
            }
        }
        Ok(stats)
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        if self.path.exists() {
            std::fs::write(&self.path, b"")?;
        }
        Ok(())
    }

    fn read_all(&self) -> anyhow::Result<Vec<LogEntry>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "skipping unparsable event log line"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::DomainOutcome;
    use tempfile::tempdir;

    fn sample_run(domain: &str) -> SyncRun {
        SyncRun {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results: vec![DomainOutcome::success(domain, vec![])],
        }
    }

    #[test]
    fn query_is_newest_first_and_filterable() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.log"));
        log.append_sync(&sample_run("a.example"));
        log.append_sync(&sample_run("b.example"));
        log.append_distribution(
            "b.example",
            &DistributionAttempt::success("web-1", vec!["b.pem".into()]),
        );

        let all = log.query(None, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event.kind(), EventKind::CertificateDistribution);

        let syncs = log.query(Some(EventKind::CertificateSync), None).unwrap();
        assert_eq!(syncs.len(), 2);
        match &syncs[0].event {
            LogEvent::CertificateSync(event) => assert_eq!(event.domains, vec!["b.example"]),
            other => panic!("unexpected entry: {other:?}"),
        }

        let limited = log.query(None, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn stats_fold_matches_history() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.log"));
        for _ in 0..3 {
            log.append_sync(&sample_run("a.example"));
        }
        let attempts = vec![
            DistributionAttempt::success("web-1", vec!["a.pem".into()]),
            DistributionAttempt::success("web-2", vec!["a.pem".into()]),
            DistributionAttempt::failed("web-3", "unreachable", vec![]),
        ];
        for attempt in &attempts {
            log.append_distribution("a.example", attempt);
        }
        log.append_bulk(&BulkDistribution::from_attempts("a.example", attempts));

        let stats = log.stats().unwrap();
        assert_eq!(
            stats,
            LogStats {
                total_syncs: 3,
                total_distributions: 3,
                successful_distributions: 2,
                failed_distributions: 1,
            }
        );
    }

    #[test]
    fn append_never_fails_the_caller() {
        // A directory path cannot be opened for append; the call must still
        // return normally.
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path());
        log.append_sync(&sample_run("a.example"));
    }

    #[test]
    fn clear_truncates() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.log"));
        log.append_sync(&sample_run("a.example"));
        log.clear().unwrap();
        assert!(log.query(None, None).unwrap().is_empty());
        assert_eq!(log.stats().unwrap(), LogStats::default());
    }
}
