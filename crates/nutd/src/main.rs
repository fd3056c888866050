use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use nutd::Config;
use nutd::Engine;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "nutd")]
#[command(about = "Poll Network UPS Tools servers and expose UPS status", long_about = None)]
struct Args {
    /// Config file; repeat to layer files (e.g. base + secrets)
    #[arg(short, long = "config", default_value = "nutd.toml")]
    config: Vec<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_files(&args.config).context("Failed to load configuration")?;

    if args.check {
        for (entry_id, entry) in &config.entries {
            entry
                .to_config_entry(entry_id)
                .with_context(|| format!("Invalid entry {}", entry_id))?;
        }
        println!(
            "Configuration OK ({} entries from {} files)",
            config.entries.len(),
            args.config.len()
        );
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(config.logging.targets())
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("nutd starting");
    tracing::info!("Loaded config from: {:?}", args.config);

    let mut engine = Engine::new();
    engine.register_integrations_from_config(&config);
    let entries = engine
        .add_entries_from_config(&config)
        .context("Failed to add config entries")?;

    let api = config.api.clone().map(|api| {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let reader = engine.state_reader();
        let handle = tokio::spawn(async move {
            if let Err(e) = nutd::api::serve(api.listen, api.port, reader, shutdown_rx).await {
                tracing::error!("HTTP API server failed: {:#}", e);
            }
        });
        (shutdown_tx, handle)
    });

    let loaded = engine.setup_all().await;
    tracing::info!("{} of {} entries loaded, entering main loop", loaded, entries);
    tracing::info!("Press Ctrl+C to exit");

    engine.run(shutdown_signal()).await;

    tracing::info!("Unloading entries...");
    engine.shutdown().await;

    if let Some((shutdown_tx, handle)) = api {
        let _ = shutdown_tx.send(());
        if let Err(e) = handle.await {
            tracing::error!("HTTP API task failed: {}", e);
        }
    }

    tracing::info!("nutd shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
            tracing::info!("Received SIGTERM");
        }
        Err(e) => tracing::error!("Failed to install SIGTERM handler: {}", e),
    }
}
