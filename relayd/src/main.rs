use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relayd::options::Options;
use relayd::server;

fn main() -> Result<()> {
    let options = Options::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        config = %options.config_path,
        base_id = options.base_id,
        epoch = options.restart_epoch,
        workers = options.worker_count(),
        "starting"
    );

    server::run(options)
}
