use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tracing::{error, info, warn};

use pmb_bridge::BridgeTransport;
use pmb_core::{
    config::Config,
    credentials::CredentialRepository,
    guard::AdmissionGuard,
    pipeline::MessagePipeline,
    session::SessionManager,
    state::BotStateStore,
    store::{DurableStore, FileStore, SqliteStore},
    timer::{Scheduler, TokioScheduler},
};
use pmb_openai::OpenAiReplyGenerator;

const INITIAL_CONNECT_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pmb_core::logging::init("pmb")?;

    let cfg = Config::load().context("loading configuration")?;
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new());

    let fallback: Arc<dyn DurableStore> = Arc::new(FileStore::new(cfg.data_dir.join("store")));
    let primary: Option<Arc<dyn DurableStore>> = match cfg.database_url.as_deref() {
        Some(url) => match SqliteStore::connect(url).await {
            Ok(store) => {
                info!("database store connected");
                Some(Arc::new(store) as Arc<dyn DurableStore>)
            }
            Err(e) => {
                warn!(error = %e, "database store unavailable; using file store only");
                None
            }
        },
        None => None,
    };

    let mut credential_stores: Vec<Arc<dyn DurableStore>> = Vec::new();
    credential_stores.extend(primary.clone());
    credential_stores.push(fallback.clone());
    let credentials = CredentialRepository::new(credential_stores);

    let state = BotStateStore::init(
        cfg.state.clone(),
        &cfg.guard,
        primary,
        fallback,
        scheduler.clone(),
    )
    .await;

    let guard = Arc::new(AdmissionGuard::new(cfg.guard.clone()));
    let sweeper = guard.start_sweeper(scheduler.as_ref());

    let session = SessionManager::new(
        cfg.session.clone(),
        Arc::new(BridgeTransport::new(cfg.bridge.clone())),
        credentials,
        scheduler.clone(),
    );

    if cfg.reset_credentials {
        session
            .reset_credentials()
            .await
            .context("resetting stored session credentials")?;
        info!("stored session credentials cleared; a new pairing will start");
    }

    let replies = Arc::new(OpenAiReplyGenerator::new(cfg.ai.clone())?);
    let pipeline = Arc::new(MessagePipeline::new(
        cfg.owner_id.clone(),
        cfg.reply_in_groups,
        guard,
        state.clone(),
        replies,
        Arc::new(session.clone()),
    ));
    let pipeline_task = tokio::spawn(pipeline.run(session.subscribe()));

    info!(
        data_dir = %cfg.data_dir.display(),
        bridge = %cfg.bridge.command.display(),
        "pmb started"
    );

    connect_with_retries(&session).await;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");

    session.disconnect().await;
    if let Err(e) = session.flush_credentials().await {
        warn!(error = %e, "final credential save failed");
    }
    state.shutdown().await;
    sweeper.cancel();
    pipeline_task.abort();

    Ok(())
}

/// Initial connect. Later disconnects are recovered by the session manager.
async fn connect_with_retries(session: &SessionManager) {
    for attempt in 1..=INITIAL_CONNECT_ATTEMPTS {
        match session.connect().await {
            Ok(()) => return,
            Err(e) => {
                let delay = Duration::from_secs(2u64.pow(attempt));
                warn!(attempt, error = %e, delay_s = delay.as_secs(), "initial connect failed");
                if attempt < INITIAL_CONNECT_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    error!(
        attempts = INITIAL_CONNECT_ATTEMPTS,
        "could not connect; staying up for owner intervention"
    );
}
