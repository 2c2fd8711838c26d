use std::path::PathBuf;

use anyhow::Context;

use crate::ferry::{config, logging, proxy};

pub async fn run(
    config_path: Option<PathBuf>,
    listen_override: Option<String>,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let listen_addr = listen_override
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| cfg.listen_addr.clone());

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        listen_addr = %listen_addr,
        buffer_size = cfg.buffer_size,
        max_handshake_bytes = cfg.max_handshake_bytes,
        "ferry: starting"
    );

    proxy::serve(
        &listen_addr,
        proxy::TunnelOptions {
            buffer_size: cfg.buffer_size,
            max_handshake_bytes: cfg.max_handshake_bytes,
        },
    )
    .await
}
