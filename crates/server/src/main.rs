mod app;
mod demo;

use anyhow::Context;
use tracing::{error, info, warn};

use cairn_infra::{CommandWorkerPool, ServerConfig};

const DEMO_MESSAGES: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cairn_observability::init();

    // The only place errors become process exit codes.
    if let Err(err) = run().await {
        error!(error = ?err, "cairn-server failed");
        return Err(err);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("loading configuration")?;
    info!(
        concurrency = config.concurrency,
        lease_renew_interval_ms = config.lease_renew_interval.as_millis() as u64,
        lock_ttl_ms = config.lock_ttl.as_millis() as u64,
        snapshot_strategy = ?config.snapshot_strategy,
        "configuration loaded"
    );

    let services = app::build(&config).await?;
    for command in demo::commands(DEMO_MESSAGES) {
        services.dispatcher.submit(command).context("submitting demo command")?;
    }

    let mut pool = CommandWorkerPool::spawn(config.concurrency, services.processor.clone());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("shutdown requested, finishing in-flight commands");
        }
        result = pool.wait() => {
            return result.context("command workers stopped");
        }
    }

    pool.shutdown();
    match tokio::time::timeout(app::SHUTDOWN_GRACE, pool.wait()).await {
        Ok(result) => result.context("command workers stopped")?,
        Err(_) => warn!(grace_secs = app::SHUTDOWN_GRACE.as_secs(), "workers did not stop in time"),
    }

    info!("cairn-server stopped");
    Ok(())
}
