//! streamvault node
//!
//! ```text
//! streamvault-node [config.toml]                 run a node
//! streamvault-node coordinator <addr>            run the coordination service
//! ```
//!
//! Ctrl-C triggers a graceful shutdown of this node; a second Ctrl-C
//! escalates it to a forced one.
//!
//! | Variable | Description |
//! |----------|-------------|
//! | RUST_LOG | log filter (default `info`) |
//! | LOG_FORMAT | `json` for JSON lines |
//! | STREAMVAULT_NODE_ID | overrides `node_id` |
//! | STREAMVAULT_CLUSTER_NAME | overrides `cluster_name` |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use streamvault::cluster::coordinator::InMemoryCoordinator;
use streamvault::cluster::remote::CoordinationServer;
use streamvault::observability::{init_tracing, LogFormat};
use streamvault::{Config, Node};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing(LogFormat::from_env());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("coordinator") => {
            let addr = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:2379");
            run_coordinator(addr).await
        }
        path => run_node(path.map(PathBuf::from)).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run_coordinator(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let server = CoordinationServer::bind(addr, InMemoryCoordinator::new()).await?;
    info!(addr = %server.local_addr()?, "coordination service listening");
    let cancel = CancellationToken::new();
    let serve = tokio::spawn(server.serve(cancel.clone()));
    signal::ctrl_c().await?;
    cancel.cancel();
    serve.await?;
    Ok(())
}

async fn run_node(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => Config::load(&path)?,
        None => {
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };
    let node = Node::start_from_config(config).await?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!(node_id = node.node_id(), "interrupt received, shutting down");
            let orchestrator = node.orchestrator().clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("second interrupt, forcing shutdown");
                    orchestrator.escalate();
                }
            });
            let report = node.shutdown(true).await?;
            info!(%report, "shutdown finished");
            if !report.is_success() {
                return Err(format!("unflushed shards: {:?}", report.failed_shards()).into());
            }
        }
        _ = node.stopped() => {
            info!(node_id = node.node_id(), phase = ?node.phase(), "stopped by admin request");
        }
    }
    Ok(())
}
