//! Subscription engine — the per-identity state machine.
//!
//! Owns every read-modify-write against the entitlement store; transitions
//! serialize per login so racing confirmations, trial requests, and
//! revocations apply in some serial order and never lose an update.
//! Provisioning and notifications run after the store commit and are
//! best-effort: failures there are logged and reported, never rolled back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::claims::PaymentClaim;
use crate::credentials::{DEFAULT_CREDENTIAL_LEN, generate_credential};
use crate::models::{EXPIRY_DISPLAY_FORMAT, Entitlement, login_for};
use crate::notify::Notifier;
use crate::provision::Provisioner;
use crate::scheduler::{
    ExpiryScheduler, JobAction, REMINDER_LEAD_DAYS, reminder_job_id, revoke_job_id,
};
use crate::store::{EntitlementStore, StoreError, TrialTracker};

/// Trial entitlements last this long.
pub const TRIAL_DURATION_HOURS: i64 = 8;

/// Default lifetime for administrator-created accounts.
pub const DEFAULT_ADMIN_DAYS: i64 = 30;

/// Map a confirmed payment amount to the number of extension days.
///
/// Each tariff has two denominations, one per payment channel (bank
/// transfer in RUB, wallet transfer in USDT).
pub fn extension_days(amount: u32) -> Option<i64> {
    match amount {
        100 | 1 => Some(30),
        300 | 3 => Some(90),
        600 | 6 => Some(180),
        _ => None,
    }
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown payment amount: {0}")]
    UnknownAmount(u32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Freshly issued or extended account details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedAccount {
    pub login: String,
    pub credential: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a trial request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    /// The identity already holds an unexpired entitlement.
    AlreadyActive,
    /// The one-time trial was consumed earlier.
    AlreadyUsed,
    Activated(IssuedAccount),
}

/// Result of an administrator deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// Result of an administrator-created account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(IssuedAccount),
    LoginTaken,
}

/// Read-only view of an identity's subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountStatus {
    /// No record, or a record whose expiry has passed.
    Inactive,
    Active {
        login: String,
        credential: String,
        expires_at: DateTime<Utc>,
        is_trial: bool,
    },
}

/// Engine-level configuration injected at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chat identity of the administrator.
    pub admin_id: i64,
    /// Address users point their players at.
    pub server_address: String,
}

/// The subscription engine. Composes the store, the trial tracker, the
/// expiry scheduler, the provisioning adapter, and the notification sink.
pub struct SubscriptionEngine {
    store: EntitlementStore,
    trials: TrialTracker,
    scheduler: ExpiryScheduler,
    provisioner: Arc<dyn Provisioner>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    /// Per-login critical sections; every read-modify-write holds the
    /// login's lock, including the revocation path.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SubscriptionEngine {
    pub fn new(
        store: EntitlementStore,
        trials: TrialTracker,
        scheduler: ExpiryScheduler,
        provisioner: Arc<dyn Provisioner>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            trials,
            scheduler,
            provisioner,
            notifier,
            config,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, login: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(login.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Activate the one-time trial for `user_id`.
    pub async fn request_trial(&self, user_id: i64) -> Result<TrialOutcome, EngineError> {
        let login = login_for(user_id);
        let lock = self.lock_for(&login);
        let guard = lock.lock().await;

        let now = Utc::now();
        if let Some(existing) = self.store.get(&login).await? {
            if existing.is_active(now) {
                return Ok(TrialOutcome::AlreadyActive);
            }
        }
        if self.trials.has_used(user_id).await? {
            return Ok(TrialOutcome::AlreadyUsed);
        }

        let credential = generate_credential(DEFAULT_CREDENTIAL_LEN);
        let expires_at = now + Duration::hours(TRIAL_DURATION_HOURS);
        let record = Entitlement {
            login: login.clone(),
            user_id: Some(user_id),
            credential: credential.clone(),
            expires_at,
            is_trial: true,
        };
        self.store.put(&record).await?;
        self.trials.mark_used(user_id).await?;
        drop(guard);

        info!(login, %expires_at, "trial activated");
        self.provision(&login, &credential).await;
        self.scheduler
            .schedule(
                &revoke_job_id(&login),
                expires_at,
                JobAction::RevokeTrial {
                    login: login.clone(),
                },
            )
            .await;
        self.notify_admin(&format!(
            "User {user_id} activated the {TRIAL_DURATION_HOURS}-hour trial.\n\
             Login: {login}\nCredential: {credential}\nExpires: {}",
            expires_at.format(EXPIRY_DISPLAY_FORMAT)
        ))
        .await;

        Ok(TrialOutcome::Activated(IssuedAccount {
            login,
            credential,
            expires_at,
        }))
    }

    /// Apply a confirmed payment: extend (or create) the identity's
    /// entitlement by the tariff mapped from the claimed amount.
    ///
    /// The new expiry stacks on the current one when it is still in the
    /// future, and on now otherwise; a user never loses days they already
    /// paid for. An existing credential is kept so renewals don't force a
    /// player reconfiguration.
    pub async fn confirm_payment(&self, claim: &PaymentClaim) -> Result<IssuedAccount, EngineError> {
        let days = extension_days(claim.amount).ok_or(EngineError::UnknownAmount(claim.amount))?;
        let login = login_for(claim.user_id);
        let lock = self.lock_for(&login);
        let guard = lock.lock().await;

        let now = Utc::now();
        let existing = self.store.get(&login).await?;
        let base = match &existing {
            Some(record) if record.is_active(now) => record.expires_at,
            _ => now,
        };
        let expires_at = base + Duration::days(days);
        let credential = existing
            .map(|record| record.credential)
            .unwrap_or_else(|| generate_credential(DEFAULT_CREDENTIAL_LEN));

        let record = Entitlement {
            login: login.clone(),
            user_id: Some(claim.user_id),
            credential: credential.clone(),
            expires_at,
            is_trial: false,
        };
        self.store.put(&record).await?;
        drop(guard);

        info!(login, amount = claim.amount, days, %expires_at, "payment applied");
        self.provision(&login, &credential).await;
        // The record is no longer a trial; a pending revocation must not
        // delete it.
        self.scheduler.cancel(&revoke_job_id(&login)).await;
        self.scheduler
            .schedule(
                &reminder_job_id(&login),
                expires_at - Duration::days(REMINDER_LEAD_DAYS),
                JobAction::Reminder {
                    user_id: claim.user_id,
                    expires_at,
                },
            )
            .await;

        let account = IssuedAccount {
            login,
            credential,
            expires_at,
        };
        self.notify_user(
            claim.user_id,
            &format!(
                "Your payment of {} {} via {} is confirmed.\n\n\
                 Your connection details:\n{}\n\nThank you for using our service!",
                claim.amount,
                claim.channel.currency(),
                claim.channel,
                self.connection_details(&account)
            ),
        )
        .await;

        Ok(account)
    }

    /// Pass an administrator's rejection back to the user. No state change.
    pub async fn reject_payment(&self, user_id: i64) {
        self.notify_user(
            user_id,
            "Your payment was rejected by the administrator.\n\
             Check the transfer details and try again.",
        )
        .await;
    }

    /// Remove a login outright: delete the record, cancel its scheduled
    /// jobs, and tell the affected user if the login maps to one.
    pub async fn admin_delete(&self, login: &str) -> Result<DeleteOutcome, EngineError> {
        let lock = self.lock_for(login);
        let guard = lock.lock().await;

        let Some(record) = self.store.get(login).await? else {
            return Ok(DeleteOutcome::AlreadyGone);
        };
        self.store.delete(login).await?;
        drop(guard);

        self.scheduler.cancel(&reminder_job_id(login)).await;
        self.scheduler.cancel(&revoke_job_id(login)).await;
        info!(login, "entitlement deleted by administrator");

        if let Some(user_id) = record.user_id {
            self.notify_user(
                user_id,
                "Your subscription was removed by the administrator.\n\
                 Contact support if you have questions.",
            )
            .await;
        }

        Ok(DeleteOutcome::Deleted)
    }

    /// Create an account by hand. Rejected when the login is already taken.
    pub async fn admin_create(
        &self,
        login: &str,
        credential: Option<String>,
        days: Option<i64>,
    ) -> Result<CreateOutcome, EngineError> {
        let lock = self.lock_for(login);
        let guard = lock.lock().await;

        if self.store.get(login).await?.is_some() {
            return Ok(CreateOutcome::LoginTaken);
        }

        let credential = credential.unwrap_or_else(|| generate_credential(DEFAULT_CREDENTIAL_LEN));
        let expires_at = Utc::now() + Duration::days(days.unwrap_or(DEFAULT_ADMIN_DAYS));
        let record = Entitlement {
            login: login.to_string(),
            user_id: None,
            credential: credential.clone(),
            expires_at,
            is_trial: false,
        };
        self.store.put(&record).await?;
        drop(guard);

        info!(login, %expires_at, "account created by administrator");
        self.provision(login, &credential).await;

        Ok(CreateOutcome::Created(IssuedAccount {
            login: login.to_string(),
            credential,
            expires_at,
        }))
    }

    /// Read-only subscription status for an identity. A present record
    /// whose expiry has passed reports as inactive.
    pub async fn query_status(&self, user_id: i64) -> Result<AccountStatus, EngineError> {
        let login = login_for(user_id);
        let now = Utc::now();
        match self.store.get(&login).await? {
            Some(record) if record.is_active(now) => Ok(AccountStatus::Active {
                login: record.login,
                credential: record.credential,
                expires_at: record.expires_at,
                is_trial: record.is_trial,
            }),
            _ => Ok(AccountStatus::Inactive),
        }
    }

    /// All entitlement records, for administrator enumeration.
    pub async fn list_accounts(&self) -> Result<Vec<Entitlement>, EngineError> {
        Ok(self.store.list().await?)
    }

    /// Consume one fired scheduler action.
    pub async fn handle_job(&self, action: JobAction) {
        match action {
            JobAction::Reminder {
                user_id,
                expires_at,
            } => {
                self.notify_user(
                    user_id,
                    &format!(
                        "Reminder: your subscription expires in {REMINDER_LEAD_DAYS} days \
                         (on {}).\nRenew it to keep access to the service.",
                        expires_at.format(EXPIRY_DISPLAY_FORMAT)
                    ),
                )
                .await;
            }
            JobAction::RevokeTrial { login } => {
                if let Err(err) = self.revoke_trial(&login).await {
                    warn!(login, %err, "trial revocation failed");
                }
            }
        }
    }

    /// Drain fired scheduler jobs until the channel closes or shutdown is
    /// requested; on shutdown, jobs that already fired are still handled.
    pub async fn run_jobs(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<JobAction>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                action = rx.recv() => match action {
                    Some(action) => self.handle_job(action).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    while let Ok(action) = rx.try_recv() {
                        self.handle_job(action).await;
                    }
                    break;
                }
            }
        }
    }

    /// Rebuild the volatile job queue from the entitlement store.
    ///
    /// Trials get a revocation at expiry, which fires immediately when the
    /// expiry already passed. Paid accounts with a chat identity get the
    /// pre-expiry reminder, which is skipped when its time already passed.
    pub async fn rehydrate(&self) -> Result<(), EngineError> {
        let records = self.store.list().await?;
        let count = records.len();
        for record in records {
            if record.is_trial {
                self.scheduler
                    .schedule(
                        &revoke_job_id(&record.login),
                        record.expires_at,
                        JobAction::RevokeTrial {
                            login: record.login.clone(),
                        },
                    )
                    .await;
            } else if let Some(user_id) = record.user_id {
                self.scheduler
                    .schedule(
                        &reminder_job_id(&record.login),
                        record.expires_at - Duration::days(REMINDER_LEAD_DAYS),
                        JobAction::Reminder {
                            user_id,
                            expires_at: record.expires_at,
                        },
                    )
                    .await;
            }
        }
        info!(records = count, "job queue rebuilt from the store");
        Ok(())
    }

    /// Connection details block shared by account and confirmation texts.
    pub fn connection_details(&self, account: &IssuedAccount) -> String {
        format!(
            "Address: {}\nLogin: {}\nCredential: {}\nExpires: {}",
            self.config.server_address,
            account.login,
            account.credential,
            account.expires_at.format(EXPIRY_DISPLAY_FORMAT)
        )
    }

    /// Delete a login's record if it is still a trial. Takes the same
    /// per-login lock as renewals, so a revocation racing a confirmation
    /// cannot delete the freshly paid record.
    async fn revoke_trial(&self, login: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(login);
        let _guard = lock.lock().await;

        match self.store.get(login).await? {
            Some(record) if record.is_trial => {
                self.store.delete(login).await?;
                info!(login, "trial expired, record removed");
            }
            _ => debug!(login, "revocation found nothing to purge"),
        }
        Ok(())
    }

    /// Best-effort provisioning; a failure is logged and reported to the
    /// administrator while the committed store write stands.
    async fn provision(&self, login: &str, credential: &str) {
        if let Err(err) = self.provisioner.apply_and_restart(login, credential).await {
            warn!(login, %err, "provisioning failed");
            self.notify_admin(&format!(
                "Warning: provisioning for {login} failed: {err}.\n\
                 The entitlement is stored; re-apply manually."
            ))
            .await;
        }
    }

    async fn notify_user(&self, user_id: i64, text: &str) {
        if let Err(err) = self.notifier.notify(user_id, text, None).await {
            warn!(user_id, %err, "notification failed");
        }
    }

    async fn notify_admin(&self, text: &str) {
        self.notify_user(self.config.admin_id, text).await;
    }
}
