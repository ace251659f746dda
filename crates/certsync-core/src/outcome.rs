//! Result records produced by a sync run and by distribution attempts.
//! Immutable once a run completes; the event log persists them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
    /// Some files landed before the failure. Distribution only.
    Partial,
}

/// Outcome of fetching and materializing one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainOutcome {
    pub domain: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl DomainOutcome {
    pub fn success(domain: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            domain: domain.into(),
            status: OutcomeStatus::Success,
            error: None,
            files,
        }
    }

    pub fn error(domain: impl Into<String>, error: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            domain: domain.into(),
            status: OutcomeStatus::Error,
            error: Some(error.into()),
            files,
        }
    }
}

/// One orchestrator invocation across all configured domains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<DomainOutcome>,
}

impl SyncRun {
    /// Rolled-up status: success when every domain succeeded, error when
    /// every domain failed, partial otherwise. An empty run is a success.
    pub fn status(&self) -> OutcomeStatus {
        let successes = self
            .results
            .iter()
            .filter(|r| r.status == OutcomeStatus::Success)
            .count();
        if successes == self.results.len() {
            OutcomeStatus::Success
        } else if successes == 0 {
            OutcomeStatus::Error
        } else {
            OutcomeStatus::Partial
        }
    }

    pub fn domains(&self) -> Vec<String> {
        self.results.iter().map(|r| r.domain.clone()).collect()
    }
}

/// Outcome of pushing one domain's artifacts to one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionAttempt {
    pub host: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl DistributionAttempt {
    pub fn success(host: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            host: host.into(),
            status: OutcomeStatus::Success,
            error: None,
            files,
        }
    }

    pub fn failed(host: impl Into<String>, error: impl Into<String>, files: Vec<String>) -> Self {
        let files_transferred = files;
        Self {
            host: host.into(),
            status: if files_transferred.is_empty() {
                OutcomeStatus::Error
            } else {
                OutcomeStatus::Partial
            },
            error: Some(error.into()),
            files: files_transferred,
        }
    }
}

/// Aggregate of one domain's distribution across all hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDistribution {
    pub domain: String,
    pub total_hosts: usize,
    pub successful: usize,
    pub failed: usize,
    pub attempts: Vec<DistributionAttempt>,
}

impl BulkDistribution {
    pub fn from_attempts(domain: impl Into<String>, attempts: Vec<DistributionAttempt>) -> Self {
        let successful = attempts
            .iter()
            .filter(|a| a.status == OutcomeStatus::Success)
            .count();
        Self {
            domain: domain.into(),
            total_hosts: attempts.len(),
            successful,
            failed: attempts.len() - successful,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_counts_partial_as_failed() {
        let bulk = BulkDistribution::from_attempts(
            "example.com",
            vec![
                DistributionAttempt::success("alpha", vec!["a.pem".into()]),
                DistributionAttempt::failed("bravo", "unreachable", vec![]),
                DistributionAttempt::failed("charlie", "disk full", vec!["a.pem".into()]),
            ],
        );
        assert_eq!(bulk.total_hosts, 3);
        assert_eq!(bulk.successful, 1);
        assert_eq!(bulk.failed, 2);
        assert_eq!(bulk.attempts[2].status, OutcomeStatus::Partial);
    }

    #[test]
    fn run_status_rollup() {
        let mut run = SyncRun {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results: vec![DomainOutcome::success("a.example", vec![])],
        };
        assert_eq!(run.status(), OutcomeStatus::Success);
        run.results
            .push(DomainOutcome::error("b.example", "boom", vec![]));
        assert_eq!(run.status(), OutcomeStatus::Partial);
        run.results.remove(0);
        assert_eq!(run.status(), OutcomeStatus::Error);
    }
}
