//! Run serialization and the cron-driven sync loop.
//!
//! One process-wide run token guards `run_all`: cron fires and manual
//! triggers both acquire it, and whoever finds it taken is rejected on the
//! spot — triggers are never queued, so two runs can never interleave their
//! writes to the output directory or their distribution attempts.

use certsync_core::schedule::CronSchedule;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::sync::{RunError, SyncOrchestrator};
use certsync_core::outcome::SyncRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// The single mutual-exclusion token for sync runs. Cheap to clone; clones
/// share the state.
#[derive(Clone)]
pub struct RunToken {
    state: Arc<Mutex<RunState>>,
}

impl RunToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState::Idle)),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Take the token, or learn that a run is in flight. The guard returns
    /// the token on drop, including on panic or early return.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        let mut state = self.state.lock();
        if *state == RunState::Running {
            return None;
        }
        *state = RunState::Running;
        Some(RunGuard {
            state: self.state.clone(),
        })
    }
}

impl Default for RunToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RunGuard {
    state: Arc<Mutex<RunState>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        *self.state.lock() = RunState::Idle;
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    /// Another run holds the token. Not queued; try again later.
    #[error("a sync run is already in progress")]
    Busy,
    #[error(transparent)]
    Run(#[from] RunError),
}

/// Run one sync pass under the token. Both manual triggers and the cron
/// loop funnel through here.
pub async fn trigger_sync(
    orchestrator: &SyncOrchestrator,
    token: &RunToken,
) -> Result<SyncRun, TriggerError> {
    let _guard = token.try_acquire().ok_or(TriggerError::Busy)?;
    let run = orchestrator.run_all().await?;
    Ok(run)
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the cron loop. Fire errors are logged and the loop keeps going;
/// only shutdown stops it.
pub fn spawn_scheduler(
    schedule: CronSchedule,
    orchestrator: Arc<SyncOrchestrator>,
    token: RunToken,
) -> (JoinHandle<()>, SchedulerHandle) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!("scheduler started");
        loop {
            let now = Utc::now();
            let next = match schedule.next_after(now) {
                Some(next) => next,
                None => {
                    error!("schedule has no future fire time; scheduler stopping");
                    return;
                }
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, "scheduler sleeping until next fire");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler shutting down");
                        return;
                    }
                }
            }

            match trigger_sync(&orchestrator, &token).await {
                Ok(run) => {
                    info!(run_id = %run.id, "scheduled sync finished");
                }
                Err(TriggerError::Busy) => {
                    warn!("scheduled sync skipped: a run is already in progress");
                }
                Err(e) => {
                    // The loop outlives any failed run; the next fire still
                    // happens.
                    warn!(error = %e, "scheduled sync failed");
                }
            }
        }
    });

    (handle, SchedulerHandle { shutdown_tx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_rejects_second_acquire_until_released() {
        let token = RunToken::new();
        assert_eq!(token.state(), RunState::Idle);

        let guard = token.try_acquire().expect("first acquire");
        assert_eq!(token.state(), RunState::Running);
        assert!(token.try_acquire().is_none());
        // Clones share the same state.
        assert!(token.clone().try_acquire().is_none());

        drop(guard);
        assert_eq!(token.state(), RunState::Idle);
        assert!(token.try_acquire().is_some());
    }
}
