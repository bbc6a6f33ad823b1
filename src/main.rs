#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use fanout_gateway::{config, server};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fanout-gateway",
    about = "Fan-out API gateway with response aggregation"
)]
struct Cli {
    /// Path to the gateway config file. Falls back to $GATEWAY_CONFIG,
    /// then ./config.json.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address override. Defaults to 0.0.0.0:<server.port>.
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_thread_count();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: config::resolve_path(cli.config),
        listen: cli.listen,
    }))
}
