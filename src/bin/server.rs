//! Concierge HTTP 服务
//!
//! 监听地址取环境变量 CONCIERGE_BIND，默认 127.0.0.1:8000。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use concierge::{agent::create_coordinator, config::load_config, gateway, observability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let coordinator = create_coordinator(&cfg)
        .await
        .context("Failed to create coordinator")?;

    let bind = std::env::var("CONCIERGE_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid CONCIERGE_BIND address: {}", bind))?;

    gateway::serve(addr, Arc::new(coordinator))
        .await
        .context("Server error")?;
    Ok(())
}
