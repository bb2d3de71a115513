use anyhow::Result;
use lib_campaign::{CachedResolver, CampaignPipeline, EventBus, InMemoryBus, InMemoryStore, RedisBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod campaign_logic;
use campaign_logic::{config, downstream, logger, monitor, state};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    let (config, config_notes) = config::load_config();
    let _log_guard = logger::setup_logging(&config.log_dir, &config.log_level)?;
    for note in config_notes {
        warn!("{}", note);
    }

    let bus: Arc<dyn EventBus> = match &config.bus_url {
        Some(url) => {
            info!("Using redis event bus");
            Arc::new(RedisBus::new(url)?)
        }
        None => {
            info!("Using in-process event bus");
            Arc::new(InMemoryBus::default())
        }
    };

    let pipeline = CampaignPipeline::start(config.pipeline.clone(), bus).await;

    let store = Arc::new(InMemoryStore::new());
    if config.seed_entities {
        state::seed_demo_entities(&store, &config.pipeline.simulator.project_id);
    }
    let resolver = Arc::new(CachedResolver::new(store, config.pipeline.cache.clone()));
    let sweeper_cancel = CancellationToken::new();
    let sweeper_handle = resolver.spawn_sweeper(sweeper_cancel.clone());

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let app_state = state::AppState::new(pipeline.clone(), resolver, shutdown_tx.clone());

    let mut downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        Duration::from_secs(config.health_interval_seconds),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal, or for the server to stop on its own
    let finished_early = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
            None
        }
        _ = terminate() => {
            info!("SIGTERM received, initiating shutdown.");
            None
        }
        result = &mut downstream_handle => Some(result),
    };

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let downstream_result = match finished_early {
        Some(result) => result,
        None => downstream_handle.await,
    };
    match downstream_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Downstream server failed: {:#}", e),
        Err(e) => error!("Downstream task panicked: {}", e),
    }
    let _ = monitor_handle.await;

    sweeper_cancel.cancel();
    let _ = sweeper_handle.await;
    pipeline.shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
