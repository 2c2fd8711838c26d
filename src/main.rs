mod ferry;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "ferry", version, about = "Ferry - minimal SOCKS4/4a proxy")]
struct Cli {
    /// Path to Ferry config file (.toml/.yaml/.yml). If omitted, uses FERRY_CONFIG; then auto-detects ferry.toml > ferry.yaml > ferry.yml from CWD; then falls back to the OS default path (Linux: /etc/ferry/ferry.toml; others: user config dir). A missing file runs with built-in defaults.
    #[arg(long, env = "FERRY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Listen address override, e.g. ":2011" or "127.0.0.1:2011".
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ferry::run(cli.config, cli.listen).await
}
