//! drover daemon binary — runs the orchestration loops, or (as
//! `drover-daemon permission-hook <ticket_id>`) acts as the agent's
//! pre-execution permission filter: request JSON on stdin, decision JSON
//! on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use drover_core::clock::SystemClock;
use drover_core::config::Config;
use drover_store::Store;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("permission-hook") {
        return run_permission_hook(&args).await;
    }

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        Config::default()
    });
    init_logging(&config.general.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "drover daemon starting");
    let daemon = drover_daemon::daemon::Daemon::new(config).await?;

    // Ctrl-c triggers graceful shutdown: loops stop, live agent sessions
    // get the kill ladder, workers finalize their tickets.
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}

/// Hook mode: consult the ticket's approved patterns and the deny-list,
/// answer on stdout, exit. The agent treats any malfunction as "ask".
async fn run_permission_hook(args: &[String]) -> Result<()> {
    let ticket_id: i64 = args
        .get(2)
        .context("usage: drover-daemon permission-hook <ticket_id>")?
        .parse()
        .context("ticket id must be an integer")?;

    let config = Config::load().unwrap_or_default();
    let store_path = config.store.path.replace(
        "~/",
        &format!("{}/", std::env::var("HOME").unwrap_or_else(|_| ".".into())),
    );
    let store = Store::new(&store_path, Arc::new(SystemClock))
        .await
        .context("failed to open the drover database")?;

    let request = std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?;
    let response = drover_agents::permission::hook_decision(&store, ticket_id, &request).await?;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

fn init_logging(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();
}
