use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tollgate_config::GatewayConfig;

use tollgate::api;
use tollgate::billing::expirer;
use tollgate::context::AppState;
use tollgate::pricing::loader::PricingLoader;
use tollgate::ratelimit;
use tollgate::store::Store;

#[derive(Debug, Parser)]
#[command(
    name = "tollgate",
    about = "Authenticating, billing proxy for OpenAI-compatible completion services"
)]
struct Cli {
    /// JSON config file; the environment is used when absent.
    #[arg(long, short = 'C')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::init_with_level(log::Level::Info)?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::from_env()?,
    };
    if !config.admin_enabled() {
        log::warn!("TOLLGATE_ADMIN_TOKEN is empty; the admin API is disabled");
    }

    let store = Store::open(&config.database_path)?;
    store.seed_default_pricing()?;

    let state = AppState::build(config, store)?;

    tokio::spawn(Arc::clone(&state.health).run());
    tokio::spawn(expirer::run(Arc::clone(&state.store)));

    if !state.config.pricing_url.is_empty() {
        let loader = Arc::new(PricingLoader::new(
            state.config.pricing_url.clone(),
            state.config.pricing_cache_dir.clone(),
            Arc::clone(&state.store),
        ));
        tokio::spawn(async move {
            loader.initialize().await;
            loader.run().await;
        });
    }

    {
        let limiter = Arc::clone(&state.limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ratelimit::SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        });
    }

    let port = state.config.port;
    let grace = Duration::from_secs(state.config.shutdown_grace_secs);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("Server starting on port {port}");

    axum::serve(listener, api::app(state))
        .with_graceful_shutdown(shutdown_signal(grace))
        .await?;

    log::info!("Server exited");
    Ok(())
}

async fn shutdown_signal(grace: Duration) {
    let terminate = async {
        #[cfg(unix)]
        {
            let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
            sig.recv().await;
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    log::info!("Shutting down server...");

    // Cap the connection drain at the configured grace period.
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        log::warn!("Drain period elapsed, forcing exit");
        std::process::exit(0);
    });
}
