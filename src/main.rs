use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod canonical;
mod channel;
mod config;
mod connection_tracker;
mod error;
mod executor;
mod http;
mod metrics;
mod metrics_store;
mod middleware;
mod model_mapper;
mod pipeline;
mod processor;
mod selector;
mod store;
mod strategy;
mod stream_persist;
mod transformer;

use config::Config;
use connection_tracker::ConnectionTracker;
use executor::ReqwestExecutor;
use metrics_store::MetricsStore;
use store::InMemoryStore;

#[derive(Parser)]
#[command(name = "axonhub-gateway")]
#[command(about = "LLM API gateway: channel routing, retries, and streaming persistence", long_about = None)]
struct Cli {
    /// Path to the gateway config file
    #[arg(short, long, env = "AXONHUB_CONFIG", default_value = "~/.axonhub/config.json")]
    config: String,

    /// Server host override
    #[arg(long)]
    host: Option<String>,

    /// Server port override
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "axonhub_gateway=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    tracing::info!(path = %cli.config, "loaded gateway config");
    tracing::info!(channel_count = config.channels().len(), "channels configured");

    if std::env::var("AXONHUB_ROUTING_DEBUG").is_ok() {
        strategy::set_debug_routing(true);
        tracing::info!("routing debug enabled via AXONHUB_ROUTING_DEBUG");
    }

    let store = Arc::new(InMemoryStore::with_channels(config.channels().to_vec()));
    let executor = Arc::new(ReqwestExecutor::new(config.http_client()));
    let metrics = Arc::new(MetricsStore::new());
    let connections = Arc::new(ConnectionTracker::new(config.max_connections_per_channel()));

    let state = http::AppState {
        repo: store.clone(),
        store: store.clone(),
        executor,
        metrics,
        connections,
    };

    let app = http::router(state);

    let host = cli.host.unwrap_or_else(|| config.host().to_string());
    let port = cli.port.unwrap_or_else(|| config.port());
    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, port));
    tracing::info!(%addr, "axonhub-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
