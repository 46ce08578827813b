/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use videortc_core::config::AppConfig;
use videortc_core::runtime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let cfg = AppConfig::from_env()?;
    info!("videortc service {} starting", videortc_core::version());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!("ctrl-c handler: {e}"),
        }
        let _ = shutdown_tx.send(true);
    });

    runtime::run(cfg, shutdown_rx).await
}
