//! Streamgate bot binary.
//!
//! Wires configuration, storage, the subscription engine, the expiry
//! scheduler, and the Telegram long-poll loop together.

mod config;
mod handlers;
mod menus;
mod telegram;
mod throttle;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use streamgate_core::engine::{EngineConfig, SubscriptionEngine};
use streamgate_core::provision::MediaServerProvisioner;
use streamgate_core::scheduler::ExpiryScheduler;
use streamgate_core::store::{self, EntitlementStore, TrialTracker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,streamgate_bot=debug,streamgate_core=debug".parse().unwrap()),
        )
        .init();

    let config = config::Config::parse();
    info!(
        admin_id = config.admin_id,
        database_url = %config.database_url,
        "starting streamgate_bot"
    );

    let pool = store::connect(&config.database_url).await?;
    info!("running database migrations");
    store::migrate(&pool).await?;

    let entitlements = EntitlementStore::new(pool.clone());
    let trials = TrialTracker::new(pool);

    let shutdown = CancellationToken::new();
    let (scheduler, jobs_rx) = ExpiryScheduler::new();
    let driver = scheduler.start(shutdown.clone());

    let bot = telegram::Bot::new(&config.bot_token);
    let notifier = Arc::new(telegram::TelegramNotifier::new(bot.clone()));
    let provisioner = Arc::new(MediaServerProvisioner::new(config.restart_command.clone()));

    let engine = Arc::new(SubscriptionEngine::new(
        entitlements,
        trials,
        scheduler,
        provisioner,
        notifier,
        EngineConfig {
            admin_id: config.admin_id,
            server_address: config.server_address.clone(),
        },
    ));

    // The job queue is a volatile projection of the store; rebuild it
    // before taking any traffic.
    engine.rehydrate().await?;
    let jobs = tokio::spawn(engine.clone().run_jobs(jobs_rx, shutdown.clone()));

    let handlers = handlers::BotHandlers::new(bot.clone(), engine, config.clone());

    info!("polling for updates");
    let mut offset = 0i64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            updates = bot.get_updates(offset, config.poll_timeout) => match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        handlers.handle_update(update).await;
                    }
                }
                Err(err) => {
                    error!(%err, "getUpdates failed");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
    }

    // Stop the driver first so nothing new fires, then drain in-flight jobs.
    shutdown.cancel();
    let _ = driver.await;
    let _ = jobs.await;
    info!("streamgate_bot stopped");

    Ok(())
}
