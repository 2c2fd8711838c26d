pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod proxy;
pub mod socks;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    listen_override: Option<String>,
) -> anyhow::Result<()> {
    app::run(config_path, listen_override).await
}
