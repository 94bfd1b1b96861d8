//! Engine integration tests over an ephemeral SQLite store.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use streamgate_core::claims::{PaymentClaim, new_transfer_id};
use streamgate_core::engine::{
    AccountStatus, CreateOutcome, DeleteOutcome, EngineConfig, EngineError, SubscriptionEngine,
    TrialOutcome,
};
use streamgate_core::models::{Entitlement, PayChannel, login_for};
use streamgate_core::notify::{DeliveryError, Keyboard, Notifier};
use streamgate_core::provision::{ProvisionError, Provisioner};
use streamgate_core::scheduler::{ExpiryScheduler, JobAction};
use streamgate_core::store::{self, EntitlementStore, TrialTracker};

const ADMIN_ID: i64 = 999;

/// Notifier that records every delivery instead of sending it.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(i64, String)>>,
}

impl RecordingNotifier {
    fn sent_to(&self, user_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .expect("notifier lock")
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        user_id: i64,
        text: &str,
        _buttons: Option<Keyboard>,
    ) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .expect("notifier lock")
            .push((user_id, text.to_string()));
        Ok(())
    }
}

/// Provisioner that records applied logins.
#[derive(Default)]
struct RecordingProvisioner {
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn apply_and_restart(
        &self,
        login: &str,
        _credential: &str,
    ) -> Result<(), ProvisionError> {
        self.applied
            .lock()
            .expect("provisioner lock")
            .push(login.to_string());
        Ok(())
    }
}

/// Provisioner that always fails.
struct FailingProvisioner;

#[async_trait]
impl Provisioner for FailingProvisioner {
    async fn apply_and_restart(
        &self,
        _login: &str,
        _credential: &str,
    ) -> Result<(), ProvisionError> {
        Err(ProvisionError::Command("media server unreachable".into()))
    }
}

struct TestEnv {
    _dir: TempDir,
    engine: Arc<SubscriptionEngine>,
    scheduler: ExpiryScheduler,
    jobs_rx: mpsc::UnboundedReceiver<JobAction>,
    store: EntitlementStore,
    trials: TrialTracker,
    notifier: Arc<RecordingNotifier>,
}

async fn build_env(provisioner: Arc<dyn Provisioner>) -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("streamgate.db").display());
    let pool = store::connect(&url).await.expect("connect");
    store::migrate(&pool).await.expect("migrate");

    let store = EntitlementStore::new(pool.clone());
    let trials = TrialTracker::new(pool);
    let (scheduler, jobs_rx) = ExpiryScheduler::new();
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = Arc::new(SubscriptionEngine::new(
        store.clone(),
        trials.clone(),
        scheduler.clone(),
        provisioner,
        notifier.clone(),
        EngineConfig {
            admin_id: ADMIN_ID,
            server_address: "http://stream.example:8090".into(),
        },
    ));

    TestEnv {
        _dir: dir,
        engine,
        scheduler,
        jobs_rx,
        store,
        trials,
        notifier,
    }
}

async fn env() -> TestEnv {
    build_env(Arc::new(RecordingProvisioner::default())).await
}

fn claim(user_id: i64, amount: u32) -> PaymentClaim {
    PaymentClaim {
        user_id,
        username: None,
        amount,
        unique_id: new_transfer_id(),
        channel: PayChannel::Sbp,
    }
}

fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let drift = (actual - expected).num_seconds().abs();
    assert!(drift <= 5, "expected {expected}, got {actual} ({drift}s off)");
}

#[tokio::test]
async fn second_trial_request_is_rejected() {
    let env = env().await;

    let first = env.engine.request_trial(42).await.expect("first trial");
    assert!(matches!(first, TrialOutcome::Activated(_)));

    let second = env.engine.request_trial(42).await.expect("second trial");
    assert_eq!(second, TrialOutcome::AlreadyActive);

    let records = env.store.list().await.expect("list");
    assert_eq!(records.len(), 1, "exactly one record after two requests");
}

#[tokio::test]
async fn trial_is_one_time_even_after_revocation() {
    let env = env().await;

    let outcome = env.engine.request_trial(42).await.expect("trial");
    let TrialOutcome::Activated(account) = outcome else {
        panic!("expected activation, got {outcome:?}");
    };
    assert_close(account.expires_at, Utc::now() + Duration::hours(8));
    assert!(env.trials.has_used(42).await.expect("has_used"));

    // Fire the revocation as the scheduler driver would.
    env.engine
        .handle_job(JobAction::RevokeTrial {
            login: account.login.clone(),
        })
        .await;

    assert_eq!(env.store.get(&account.login).await.expect("get"), None);
    assert_eq!(
        env.engine.query_status(42).await.expect("status"),
        AccountStatus::Inactive
    );
    // The usage flag outlives the deleted entitlement.
    assert_eq!(
        env.engine.request_trial(42).await.expect("retry"),
        TrialOutcome::AlreadyUsed
    );
}

#[tokio::test]
async fn trial_activation_provisions_the_media_server() {
    let provisioner = Arc::new(RecordingProvisioner::default());
    let env = build_env(provisioner.clone()).await;

    env.engine.request_trial(42).await.expect("trial");

    let applied = provisioner.applied.lock().expect("provisioner lock");
    assert_eq!(*applied, vec!["User42".to_string()]);
}

#[tokio::test]
async fn trial_activation_notifies_the_administrator() {
    let env = env().await;
    env.engine.request_trial(7).await.expect("trial");

    let admin_messages = env.notifier.sent_to(ADMIN_ID);
    assert_eq!(admin_messages.len(), 1);
    assert!(admin_messages[0].contains("User7"));
}

#[tokio::test]
async fn first_payment_creates_entitlement_from_now() {
    let env = env().await;

    let account = env
        .engine
        .confirm_payment(&claim(7, 300))
        .await
        .expect("confirm");

    assert_eq!(account.login, "User7");
    assert_close(account.expires_at, Utc::now() + Duration::days(90));

    let record = env
        .store
        .get("User7")
        .await
        .expect("get")
        .expect("record present");
    assert!(!record.is_trial);
    assert_eq!(record.user_id, Some(7));

    // The paying user got their connection details.
    assert_eq!(env.notifier.sent_to(7).len(), 1);
}

#[tokio::test]
async fn renewal_stacks_on_a_future_expiry() {
    let env = env().await;

    let first = env
        .engine
        .confirm_payment(&claim(7, 300))
        .await
        .expect("first confirm");
    let second = env
        .engine
        .confirm_payment(&claim(7, 100))
        .await
        .expect("second confirm");

    assert_close(second.expires_at, first.expires_at + Duration::days(30));
    // The credential survives renewals.
    assert_eq!(second.credential, first.credential);
}

#[tokio::test]
async fn expired_base_extends_from_now() {
    let env = env().await;

    env.store
        .put(&Entitlement {
            login: login_for(7),
            user_id: Some(7),
            credential: "keepme12345".into(),
            expires_at: Utc::now() - Duration::days(10),
            is_trial: false,
        })
        .await
        .expect("seed record");

    let account = env
        .engine
        .confirm_payment(&claim(7, 100))
        .await
        .expect("confirm");

    // Days already lost are not resurrected; the extension runs from now.
    assert_close(account.expires_at, Utc::now() + Duration::days(30));
    assert_eq!(account.credential, "keepme12345");
}

#[tokio::test]
async fn unknown_amount_is_rejected_without_a_write() {
    let env = env().await;

    let err = env
        .engine
        .confirm_payment(&claim(7, 50))
        .await
        .expect_err("50 is not a tariff");
    assert!(matches!(err, EngineError::UnknownAmount(50)));

    assert!(env.store.list().await.expect("list").is_empty());
    assert!(env.notifier.sent_to(7).is_empty());
}

#[tokio::test]
async fn concurrent_confirmations_both_apply() {
    let env = env().await;
    let engine = env.engine.clone();

    let claim_a = claim(7, 100);
    let claim_b = claim(7, 300);
    let (a, b) = tokio::join!(
        engine.confirm_payment(&claim_a),
        engine.confirm_payment(&claim_b),
    );
    a.expect("first confirm");
    b.expect("second confirm");

    let record = env
        .store
        .get("User7")
        .await
        .expect("get")
        .expect("record present");
    // Whatever the serialization order, both extensions count.
    assert_close(record.expires_at, Utc::now() + Duration::days(120));
}

#[tokio::test]
async fn payment_confirmation_supersedes_trial_revocation() {
    let env = env().await;

    env.engine.request_trial(7).await.expect("trial");
    assert_eq!(env.scheduler.len().await, 1);

    env.engine
        .confirm_payment(&claim(7, 100))
        .await
        .expect("confirm");

    // The revocation is gone; only the reminder remains, and a revocation
    // firing late finds a paid record and leaves it alone.
    assert_eq!(env.scheduler.len().await, 1);
    env.engine
        .handle_job(JobAction::RevokeTrial {
            login: login_for(7),
        })
        .await;
    let record = env.store.get("User7").await.expect("get");
    assert!(record.is_some(), "paid record must survive a stale revocation");
}

#[tokio::test]
async fn admin_delete_is_idempotent_and_cancels_jobs() {
    let env = env().await;

    env.engine.request_trial(42).await.expect("trial");
    let login = login_for(42);
    assert_eq!(env.scheduler.len().await, 1);

    assert_eq!(
        env.engine.admin_delete(&login).await.expect("delete"),
        DeleteOutcome::Deleted
    );
    assert!(env.scheduler.is_empty().await);
    assert_eq!(env.store.get(&login).await.expect("get"), None);
    // The affected user was told.
    assert!(!env.notifier.sent_to(42).is_empty());

    assert_eq!(
        env.engine.admin_delete(&login).await.expect("second delete"),
        DeleteOutcome::AlreadyGone
    );
}

#[tokio::test]
async fn admin_create_rejects_a_taken_login() {
    let env = env().await;

    let created = env
        .engine
        .admin_create("couch42", Some("sofa-secret".into()), None)
        .await
        .expect("create");
    let CreateOutcome::Created(account) = created else {
        panic!("expected creation, got {created:?}");
    };
    assert_eq!(account.credential, "sofa-secret");
    assert_close(account.expires_at, Utc::now() + Duration::days(30));

    assert_eq!(
        env.engine
            .admin_create("couch42", None, Some(7))
            .await
            .expect("second create"),
        CreateOutcome::LoginTaken
    );
}

#[tokio::test]
async fn status_treats_expired_records_as_inactive() {
    let env = env().await;

    env.store
        .put(&Entitlement {
            login: login_for(7),
            user_id: Some(7),
            credential: "stale-secret".into(),
            expires_at: Utc::now() - Duration::seconds(30),
            is_trial: false,
        })
        .await
        .expect("seed record");

    assert_eq!(
        env.engine.query_status(7).await.expect("status"),
        AccountStatus::Inactive
    );
}

#[tokio::test]
async fn provisioning_failure_does_not_roll_back_the_entitlement() {
    let env = build_env(Arc::new(FailingProvisioner)).await;

    let outcome = env.engine.request_trial(42).await.expect("trial");
    assert!(matches!(outcome, TrialOutcome::Activated(_)));

    // The store write stands and the administrator was warned.
    assert!(env.store.get("User42").await.expect("get").is_some());
    let admin_messages = env.notifier.sent_to(ADMIN_ID);
    assert!(
        admin_messages.iter().any(|m| m.contains("provisioning")),
        "admin should see a provisioning warning, got {admin_messages:?}"
    );
}

#[tokio::test]
async fn rehydration_rebuilds_jobs_from_the_store() {
    let mut env = env().await;

    // A live trial, a paid account with a distant expiry, a paid account
    // already inside the reminder window, and an admin-created account.
    for record in [
        Entitlement {
            login: login_for(1),
            user_id: Some(1),
            credential: "c1".into(),
            expires_at: Utc::now() + Duration::hours(4),
            is_trial: true,
        },
        Entitlement {
            login: login_for(2),
            user_id: Some(2),
            credential: "c2".into(),
            expires_at: Utc::now() + Duration::days(20),
            is_trial: false,
        },
        Entitlement {
            login: login_for(3),
            user_id: Some(3),
            credential: "c3".into(),
            expires_at: Utc::now() + Duration::days(1),
            is_trial: false,
        },
        Entitlement {
            login: "manual1".into(),
            user_id: None,
            credential: "c4".into(),
            expires_at: Utc::now() + Duration::days(20),
            is_trial: false,
        },
    ] {
        env.store.put(&record).await.expect("seed record");
    }

    env.engine.rehydrate().await.expect("rehydrate");

    // User1's revocation and User2's reminder. User3's reminder time has
    // passed and manual1 has nobody to remind.
    assert_eq!(env.scheduler.len().await, 2);
    assert!(env.jobs_rx.try_recv().is_err(), "nothing fired yet");
}

#[tokio::test]
async fn expired_trial_is_purged_end_to_end_after_restart() {
    let env = env().await;

    // A trial whose expiry passed while the process was down.
    env.store
        .put(&Entitlement {
            login: login_for(5),
            user_id: Some(5),
            credential: "c5".into(),
            expires_at: Utc::now() - Duration::minutes(1),
            is_trial: true,
        })
        .await
        .expect("seed record");
    env.trials.mark_used(5).await.expect("mark used");

    let shutdown = CancellationToken::new();
    env.scheduler.start(shutdown.clone());
    let jobs = tokio::spawn(
        env.engine
            .clone()
            .run_jobs(env.jobs_rx, shutdown.clone()),
    );

    env.engine.rehydrate().await.expect("rehydrate");

    // The revocation fires immediately and the record is purged.
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
    loop {
        if env.store.get("User5").await.expect("get").is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "revocation did not fire in time"
        );
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    assert_eq!(
        env.engine.query_status(5).await.expect("status"),
        AccountStatus::Inactive
    );
    assert_eq!(
        env.engine.request_trial(5).await.expect("trial"),
        TrialOutcome::AlreadyUsed
    );

    shutdown.cancel();
    jobs.await.expect("job loop exits");
}
