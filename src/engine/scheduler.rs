//! Cycle scheduler.
//!
//! Polls the session store for due sessions and runs each on its own
//! tokio task. The persisted `next_run_at` column is the queue, so pending
//! runs survive a restart.

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::runner::CycleRunner;
use crate::storage::SessionStore;
use crate::types::{CycleError, CycleOutcome};

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Removes a user id from the in-flight set when the task ends, panics
/// included.
struct InFlightGuard {
    set: InFlight,
    user_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.user_id);
    }
}

pub struct Scheduler {
    store: SessionStore,
    runner: Arc<CycleRunner>,
    poll_interval: Duration,
    in_flight: InFlight,
}

impl Scheduler {
    pub fn new(store: SessionStore, runner: Arc<CycleRunner>, poll_interval: Duration) -> Self {
        Self {
            store,
            runner,
            poll_interval,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Startup recovery for sessions left ACTIVE by a previous process.
    ///
    /// Claims held by cycles of the previous process are dropped first.
    /// With `resume`, active sessions without a pending run are then queued
    /// for immediate execution. Without it, every active session is stopped.
    pub async fn recover(&self, resume: bool) -> Result<u64, CycleError> {
        let released = self.store.release_claims().await?;
        if released > 0 {
            warn!(released, "Dropped cycle claims left by the previous process");
        }
        if resume {
            let requeued = self.store.requeue_orphans(Utc::now()).await?;
            let active = self.store.count_active().await?;
            info!(active, requeued, "Resuming active sessions");
            Ok(requeued)
        } else {
            let stopped = self.store.deactivate_all().await?;
            if stopped > 0 {
                warn!(stopped, "resume_on_restart disabled, deactivated sessions left running");
            }
            Ok(stopped)
        }
    }

    /// Number of cycles currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Spawn a cycle for every due session that is not already running.
    pub async fn run_due(&self) -> Result<Vec<JoinHandle<Option<CycleOutcome>>>, CycleError> {
        let due = self.store.due_sessions(Utc::now()).await?;
        let mut handles = Vec::with_capacity(due.len());

        for session in due {
            let user_id = session.user_id;
            {
                let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if !set.insert(user_id.clone()) {
                    debug!(user_id = %user_id, "Cycle already in flight, skipping");
                    continue;
                }
            }

            let guard = InFlightGuard {
                set: self.in_flight.clone(),
                user_id: user_id.clone(),
            };
            let runner = self.runner.clone();

            handles.push(tokio::spawn(async move {
                let _guard = guard;
                match runner.run(&user_id).await {
                    Ok(outcome) => {
                        debug!(user_id = %user_id, ?outcome, "Scheduled cycle finished");
                        Some(outcome)
                    }
                    Err(e) => {
                        error!(user_id = %user_id, error = %e, "Scheduled cycle errored");
                        None
                    }
                }
            }));
        }

        Ok(handles)
    }

    /// Poll until `shutdown` resolves. Cycles already spawned keep running
    /// on their own tasks.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(poll_ms = self.poll_interval.as_millis() as u64, "Scheduler running");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_due().await {
                        Ok(handles) if !handles.is_empty() => {
                            debug!(spawned = handles.len(), "Dispatched due cycles");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Failed to poll due sessions"),
                    }
                }
                _ = &mut shutdown => {
                    info!(in_flight = self.in_flight(), "Scheduler stopping");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
