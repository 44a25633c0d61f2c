use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use subcaster::cli;
use subcaster::cli::Cli;
use subcaster::config::EngineConfig;

#[tokio::main]
async fn main() {
    EngineConfig::ensure_config_exists();
    let logging_level = EngineConfig::from_env().logging.level;

    let default_filter = format!("subcaster={logging_level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let exit_code = cli::run(cli).await;
    std::process::exit(exit_code);
}
