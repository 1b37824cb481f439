//! Serve the keyword tracker over HTTP.
use envconfig::Envconfig;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use tracker::config::Config;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let listener = TcpListener::bind(config.address).await?;

    tracker::server::serve(config, listener, shutdown()).await
}
