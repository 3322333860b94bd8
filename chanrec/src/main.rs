mod cli;

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chanrec::config::AppConfig;
use chanrec::logging::{LoggingGuard, init_logging};
use chanrec::monitor::{AppToken, HelixPoller, MonitorScheduler};
use chanrec::recorder::{ChatRecorder, FfmpegFinalizer, StreamlinkCapture, TwitchIrcFeed};
use chanrec::registry::{
    ChannelRegistry, JsonFileRegistry, MemoryRegistry, normalize_channel_name,
};
use chanrec::service::ChannelService;
use chanrec::supervisor::{FinalizeOutcome, RecordingSupervisor};
use chanrec::utils::http_client;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let logging = init_logging(&config.logging).context("initializing logging")?;
    let registry = build_registry(&config).await?;

    match cli.command {
        Command::Run => run(config, registry, &logging).await,
        Command::Add { name } => {
            ensure_persistent(&config)?;
            let name = ChannelService::registry_only(registry).add(&name).await?;
            println!("Added {name}");
            Ok(())
        }
        Command::Remove { name } => {
            ensure_persistent(&config)?;
            // A running monitor notices on its next tick and finalizes.
            ChannelService::registry_only(registry).delete(&name).await?;
            println!("Removed {name}");
            Ok(())
        }
        Command::List => {
            for name in registry.list().await? {
                println!("{name}");
            }
            Ok(())
        }
    }
}

/// Registry from `[registry]`.
///
/// Seed channels populate an in-memory registry, or a registry file that does
/// not exist yet.
async fn build_registry(config: &AppConfig) -> anyhow::Result<Arc<dyn ChannelRegistry>> {
    let seeds: Vec<String> = config
        .registry
        .channels
        .iter()
        .filter_map(|name| match normalize_channel_name(name) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!(channel = %name, error = %e, "Ignoring configured channel");
                None
            }
        })
        .collect();

    let Some(path) = &config.registry.path else {
        return Ok(Arc::new(MemoryRegistry::with_channels(seeds)));
    };

    let registry = JsonFileRegistry::new(path);
    let exists = tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("checking registry file {}", path.display()))?;
    if !exists {
        for name in &seeds {
            registry.add(name).await?;
        }
        info!(path = %path.display(), seeded = seeds.len(), "Created channel registry");
    }
    Ok(Arc::new(registry))
}

fn ensure_persistent(config: &AppConfig) -> anyhow::Result<()> {
    if config.registry.path.is_none() {
        bail!("registry.path must be set to manage channels from the command line");
    }
    Ok(())
}

async fn run(
    config: AppConfig,
    registry: Arc<dyn ChannelRegistry>,
    logging: &LoggingGuard,
) -> anyhow::Result<()> {
    config.validate()?;
    http_client::install_rustls_provider();

    let client = http_client::build_client(config.monitor.request_timeout())?;
    let token = AppToken::fetch(
        client.clone(),
        config.twitch.client_id.clone(),
        config.twitch.client_secret.clone(),
    )
    .await
    .context("obtaining Twitch app access token")?;
    let poller = Arc::new(HelixPoller::new(client, Arc::new(token)));

    let feed = TwitchIrcFeed::new(
        config.twitch.oauth_token.clone(),
        config.twitch.nickname.clone(),
    );
    let supervisor = RecordingSupervisor::new(
        Arc::new(StreamlinkCapture::new(config.capture.clone())),
        ChatRecorder::new(Arc::new(feed)),
        Arc::new(FfmpegFinalizer::new(
            config.finalize.clone(),
            &config.storage.channels_dir,
        )),
        &config.storage.temp_dir,
    );
    let scheduler = MonitorScheduler::new(
        registry,
        poller,
        supervisor.clone(),
        config.monitor.poll_interval(),
        config.monitor.max_concurrent_checks,
    );

    let cancel = CancellationToken::new();
    logging.start_retention_cleanup(cancel.clone());

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_cancel.cancel();
    });

    scheduler.run(cancel).await;

    for (channel, outcome) in supervisor.shutdown().await {
        match outcome {
            FinalizeOutcome::Archived(paths) => {
                info!(channel = %channel, ?paths, "Recording finalized on shutdown")
            }
            FinalizeOutcome::Failed(reason) => {
                warn!(channel = %channel, %reason, "Recording could not be finalized on shutdown")
            }
        }
    }

    info!("chanrec stopped");
    Ok(())
}
