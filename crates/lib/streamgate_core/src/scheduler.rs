//! Expiry scheduler — time-based reminders and trial revocations.
//!
//! Jobs are plain data keyed by job id; a single timer-driven loop fires
//! each one exactly once and hands the action to the engine over a channel.
//! The queue is a volatile projection of the entitlement store: it is
//! re-derived on startup, never persisted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many days before expiry the reminder fires.
pub const REMINDER_LEAD_DAYS: i64 = 3;

/// Action bound to a scheduled job.
///
/// Data only — no captured closures — so the queue can be rebuilt from the
/// entitlement store after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    /// Deliver the pre-formatted "expires soon" notice to the identity.
    Reminder {
        user_id: i64,
        expires_at: DateTime<Utc>,
    },
    /// Delete the login's entitlement record. The trial tracker is left
    /// untouched; trial usage is permanent.
    RevokeTrial { login: String },
}

/// Job id for a login's pre-expiry reminder.
pub fn reminder_job_id(login: &str) -> String {
    format!("reminder:{login}")
}

/// Job id for a login's trial revocation.
pub fn revoke_job_id(login: &str) -> String {
    format!("revoke:{login}")
}

struct Inner {
    jobs: Mutex<HashMap<String, (DateTime<Utc>, JobAction)>>,
    wake: Notify,
    fired: mpsc::UnboundedSender<JobAction>,
}

/// Process-wide job queue with an explicit lifecycle: construct, `start`
/// the driver, shut down through the cancellation token.
#[derive(Clone)]
pub struct ExpiryScheduler {
    inner: Arc<Inner>,
}

impl ExpiryScheduler {
    /// Create the scheduler and the receiving end of its fired-job channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobAction>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                fired,
            }),
        };
        (scheduler, rx)
    }

    /// Schedule a job, replacing any existing job with the same id.
    ///
    /// A reminder whose fire time has already passed is silently skipped:
    /// "three days before expiry" has no meaning after the fact. A past-due
    /// revocation is still queued and fires immediately, so a
    /// late-recovering process purges expired trials.
    pub async fn schedule(&self, job_id: &str, fire_at: DateTime<Utc>, action: JobAction) {
        if fire_at <= Utc::now() {
            if let JobAction::Reminder { .. } = action {
                debug!(job_id, "reminder time already past, skipping");
                return;
            }
        }

        self.inner
            .jobs
            .lock()
            .await
            .insert(job_id.to_string(), (fire_at, action));
        self.inner.wake.notify_one();
    }

    /// Cancel a scheduled job. No-op if absent or already fired; a job the
    /// driver has claimed completes, and cannot fire a second time.
    pub async fn cancel(&self, job_id: &str) {
        if self.inner.jobs.lock().await.remove(job_id).is_some() {
            debug!(job_id, "job cancelled");
            self.inner.wake.notify_one();
        }
    }

    /// Number of queued jobs.
    pub async fn len(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawn the timer-driven dispatch loop.
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let next = inner.jobs.lock().await.values().map(|(at, _)| *at).min();
                match next {
                    None => {
                        tokio::select! {
                            _ = inner.wake.notified() => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                    Some(fire_at) => {
                        let now = Utc::now();
                        if fire_at <= now {
                            Self::fire_due(&inner, now).await;
                        } else {
                            let wait = (fire_at - now).to_std().unwrap_or_default();
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = inner.wake.notified() => {}
                                _ = shutdown.cancelled() => break,
                            }
                        }
                    }
                }
            }
            debug!("expiry scheduler stopped");
        })
    }

    /// Remove and dispatch every job due at `now`. Removal happens under
    /// the queue lock before dispatch, so each job is consumed exactly once
    /// even when `cancel` races a firing.
    async fn fire_due(inner: &Inner, now: DateTime<Utc>) {
        let mut due: Vec<(String, JobAction)> = Vec::new();
        {
            let mut jobs = inner.jobs.lock().await;
            jobs.retain(|job_id, (fire_at, action)| {
                if *fire_at <= now {
                    due.push((job_id.clone(), action.clone()));
                    false
                } else {
                    true
                }
            });
        }

        for (job_id, action) in due {
            debug!(job_id, "job due");
            if inner.fired.send(action).is_err() {
                warn!(job_id, "job receiver dropped, discarding action");
            }
        }
    }
}
