use std::sync::Arc;

use anyhow::{Context, Result};
use apify_client::ApifyClient;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use postsync_common::{Channel, Config};
use postsync_reconciler::notify::{Broadcaster, NoopBroadcaster, WebhookBroadcaster};
use postsync_reconciler::platform::ApifyPlatform;
use postsync_reconciler::store::FileRecordStore;
use postsync_reconciler::{Orchestrator, ReconcileDeps, ReconcileScheduler, ReconcileSettings};

#[derive(Parser)]
#[command(name = "postsync", about = "Reconcile published posts and keep their metrics fresh")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, env = "POSTSYNC_LOG_JSON", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile every configured channel on the run interval until Ctrl-C.
    Run,
    /// Run one reconciliation pass and print the report(s) as JSON.
    Once {
        /// Only this channel. Defaults to every configured channel.
        #[arg(long)]
        channel: Option<Channel>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("postsync=info".parse()?);
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Postsync reconciler starting...");

    let config = Config::from_env()?;
    config.log_redacted();

    let store = Arc::new(FileRecordStore::open(&config.store_path).await?);

    // Webhook if configured, otherwise Noop
    let broadcaster: Arc<dyn Broadcaster> = match &config.webhook_url {
        Some(url) => {
            info!("Webhook notifications enabled");
            Arc::new(WebhookBroadcaster::new(url.clone()))
        }
        None => {
            info!("No POSTSYNC_WEBHOOK_URL set, notifications disabled");
            Arc::new(NoopBroadcaster)
        }
    };

    let token = config
        .apify_api_token
        .clone()
        .context("APIFY_API_TOKEN is required")?;
    let platform = Arc::new(ApifyPlatform::new(ApifyClient::new(token), config.profiles.clone()));

    let deps = ReconcileDeps::builder()
        .platform(platform)
        .store(store)
        .broadcaster(broadcaster)
        .build();
    let settings = ReconcileSettings::from_config(&config);

    let orchestrators: Vec<Arc<Orchestrator>> = config
        .channels
        .iter()
        .map(|&channel| Arc::new(Orchestrator::new(channel, settings.clone(), deps.clone())))
        .collect();
    let scheduler = ReconcileScheduler::new(orchestrators, config.run_interval);

    match cli.command {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    let _ = shutdown_tx.send(true);
                }
            });
            scheduler.run(shutdown_rx).await;
        }
        Command::Once { channel } => {
            let channels: Vec<Channel> = match channel {
                Some(c) => vec![c],
                None => config.channels.clone(),
            };
            for channel in channels {
                let report = scheduler
                    .trigger_now(channel)
                    .await
                    .with_context(|| format!("Channel {channel} is not configured"))?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
    }

    info!("Postsync reconciler stopped");
    Ok(())
}
