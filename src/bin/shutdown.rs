//! Shut down a streamvault cluster, or one node of it.
//!
//! ```text
//! streamvault-shutdown <config.toml> [--force] [--node N]
//! ```
//!
//! Exits non-zero when any shard could not be flushed or any node could not
//! be reached; the report names them.

use std::path::PathBuf;
use std::process::ExitCode;
use streamvault::observability::{init_tracing, LogFormat};
use streamvault::{perform_shutdown_scoped, Config, Error, ShutdownScope};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing(LogFormat::from_env());

    let mut config_path = None;
    let mut graceful = true;
    let mut scope = ShutdownScope::Cluster;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--force" => graceful = false,
            "--node" => match args.next().and_then(|n| n.parse().ok()) {
                Some(id) => scope = ShutdownScope::Node(id),
                None => return usage("--node needs a numeric node id"),
            },
            _ if config_path.is_none() => config_path = Some(PathBuf::from(arg)),
            other => return usage(&format!("unexpected argument {}", other)),
        }
    }
    let Some(config_path) = config_path else {
        return usage("missing config path");
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    match perform_shutdown_scoped(&config, scope, graceful).await {
        Ok(report) => {
            println!("shutdown complete: {}", report);
            ExitCode::SUCCESS
        }
        Err(Error::ShutdownIncomplete(report)) => {
            println!("shutdown incomplete: {}", report);
            for (node, shard) in report.failed_shards() {
                println!("  node {} shard {} not flushed", node, shard);
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("shutdown failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn usage(problem: &str) -> ExitCode {
    eprintln!("{}", problem);
    eprintln!("usage: streamvault-shutdown <config.toml> [--force] [--node N]");
    ExitCode::from(2)
}
