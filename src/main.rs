use anyhow::{Context, Result};
use certmux::{
    Config, Service, WebHandler,
    certificate_authority::{CertificateAuthority, RcgenAuthority, SerialAllocator},
    rustls::crypto::aws_lc_rs,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log_level)?;

    let ca = RcgenAuthority::new(
        Arc::new(SerialAllocator::new()),
        aws_lc_rs::default_provider(),
    );
    let ca = Arc::new(match config.cache_capacity {
        Some(capacity) => ca.with_cache_capacity(capacity),
        None => ca,
    });

    let root_pem = ca
        .root()
        .await
        .context("cannot start without a root certificate")?
        .pem();

    info!(addr = %config.listen_addr, "Starting");

    Service::builder()
        .with_addr(config.listen_addr)
        .with_ca(ca)
        .with_http_handler(WebHandler::new(root_pem))
        .with_config(&config)
        .build()
        .start(shutdown_signal())
        .await
        .context("service stopped with an error")
}
