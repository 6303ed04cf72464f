//! Sync Monitor: runs the client sync engine against a live service.
//!
//! Logs in (or restores the stored session), keeps the cache fresh through the
//! push channel and the poller, and logs every collection change until Ctrl-C.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sync_engine::{Credential, EngineConfig, StoreSubscription, SyncEngine};
use sync_telemetry::{init_telemetry, log_event, TelemetryConfig};

const COMPONENT: &str = "sync-monitor";

/// Sync Monitor: drive the client sync engine and log every change
#[derive(Parser, Debug)]
#[command(name = "sync-monitor")]
#[command(about = "Keep a local cache in sync with the messaging service and log changes")]
struct Args {
    /// REST API base URL (overrides SYNC_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Push channel URL (overrides SYNC_WS_URL)
    #[arg(long)]
    ws_url: Option<String>,

    /// Bearer token; without it the stored credential is restored
    #[arg(long)]
    token: Option<String>,

    /// Conversation whose transcript is kept in sync
    #[arg(long)]
    conversation: Option<String>,

    /// Poll interval in seconds, 0 disables polling (overrides SYNC_POLL_INTERVAL_SECS)
    #[arg(long)]
    poll_secs: Option<u64>,

    /// Send one message to --conversation after the initial sync
    #[arg(long)]
    send: Option<String>,

    /// Log level (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut telemetry = TelemetryConfig::for_service(COMPONENT);
    if let Some(level) = &args.log_level {
        telemetry = telemetry.with_log_level(level.clone());
    }
    let _telemetry = init_telemetry(telemetry).context("failed to initialize logging")?;

    let mut config = EngineConfig::from_env().context("invalid SYNC_* environment")?;
    if let Some(url) = args.api_url {
        config.api_base_url = url;
    }
    if let Some(url) = args.ws_url {
        config.ws_url = url;
    }
    if let Some(secs) = args.poll_secs {
        config.poll_interval_secs = secs;
    }

    let engine = SyncEngine::from_config(config).context("failed to build sync engine")?;
    let _subscriptions = watch_store(&engine);
    watch_channel(&engine);

    let restored = engine.start();
    match args.token {
        Some(token) => {
            let epoch = engine
                .login(Credential::new(token))
                .context("failed to persist credential")?;
            log_event!(info, COMPONENT, "Logged in", epoch = %epoch);
        }
        None if restored => log_event!(info, COMPONENT, "Restored stored session"),
        None => bail!("no --token given and no stored credential to restore"),
    }

    if let Some(conversation) = &args.conversation {
        if let Err(e) = engine.open_conversation(conversation).await {
            log_event!(warn, COMPONENT, "Initial transcript load failed", conversation = %conversation, error = %e);
        }
    }

    if let Some(text) = &args.send {
        match engine.send_message(text).await {
            Ok(receipt) => log_event!(
                info,
                COMPONENT,
                "Message sent",
                temp_id = %receipt.temp_id,
                status = ?receipt.status
            ),
            Err(e) => log_event!(error, COMPONENT, "Message not sent", error = %e),
        }
    }

    log_event!(info, COMPONENT, "Monitoring; press Ctrl-C to log out");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    engine.logout();
    engine.shutdown().await;
    log_event!(info, COMPONENT, "Logged out", at = %chrono::Utc::now());
    Ok(())
}

fn watch_store(engine: &Arc<SyncEngine>) -> Vec<StoreSubscription> {
    let store = engine.store();

    let mut subscriptions = vec![store.user.subscribe(|user| match user.as_ref() {
        Some(user) => log_event!(info, COMPONENT, "User changed", id = %user.id()),
        None => log_event!(info, COMPONENT, "User cleared"),
    })];

    for collection in [&store.clients, &store.messages, &store.scheduled, &store.nudges] {
        let name = collection.name();
        subscriptions.push(collection.subscribe(move |records| {
            let provisional = records.iter().filter(|r| r.is_provisional()).count();
            log_event!(
                info,
                COMPONENT,
                "Collection changed",
                collection = name,
                count = records.len(),
                provisional = provisional
            );
        }));
    }

    subscriptions
}

fn watch_channel(engine: &Arc<SyncEngine>) {
    let mut state_rx = engine.channel().watch_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            log_event!(info, COMPONENT, "Channel state", state = %state);
        }
    });
}
