//! Boots a Forest router process from a config file: loads persisted
//! tables, binds interface sockets, and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use forest_core::config::RouterConfig;
use forest_core::router_core::RouterCore;

#[derive(Parser, Debug)]
#[command(name = "forest-router", about = "Forest overlay router data plane")]
struct Args {
    /// Path to the router's TOML config file.
    #[arg(short, long, default_value = "router.toml")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match RouterConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %args.config.display(), "failed to load config");
            std::process::exit(1);
        }
    };

    let router = match RouterCore::new(&config) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize router");
            std::process::exit(2);
        }
    };

    if let Err(e) = router.start() {
        tracing::error!(error = %e, "failed to start router threads");
        std::process::exit(2);
    }

    tracing::info!(router_name = %config.router_name, my_adr = %config.my_adr, "router running");

    // `RouterCore::shutdown` exists for embedders and tests that hold an
    // `Arc<RouterCore>`; this process has no signal-handling dependency in
    // its stack, so it runs until the OS terminates it and relies on
    // process exit to reclaim sockets and threads.
    router.join();
    tracing::info!("router stopped");
}
