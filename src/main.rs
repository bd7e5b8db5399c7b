use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use spend_governor::events::LoggingListener;
use spend_governor::{Governor, GovernorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("spend_governor=info".parse()?),
        )
        .init();

    let config = match std::env::var("GOVERNOR_CONFIG") {
        Ok(path) if !path.trim().is_empty() => {
            let path = PathBuf::from(path);
            GovernorConfig::from_file(&path)
                .and_then(GovernorConfig::with_env_overrides)
                .with_context(|| format!("loading {}", path.display()))?
        }
        _ => GovernorConfig::from_env().context("loading config from environment")?,
    };

    let governor = Governor::new(config)?;
    let subscription = governor.subscribe(Arc::new(LoggingListener));

    info!("Spend governor running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let report = governor.emergency_kill("operator shutdown").await;
    info!(
        signalled = report.signalled,
        forced = report.forced,
        "Runs stopped"
    );
    governor.shutdown().await;
    subscription.closed().await;
    Ok(())
}
