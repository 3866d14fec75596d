use anyhow::Context;
use clap::Parser;
use sacmes_core::{PeakCurrentAnalyzer, RelayConfig, RelayHub};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// SACMES relay between instrument agents and browser viewers
#[derive(Debug, Parser)]
#[command(name = "sacmes-server", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "SACMES_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:5000
    #[arg(long)]
    bind: Option<String>,

    /// Bearer token agents must present
    #[arg(long)]
    token: Option<String>,

    /// Maximum concurrent analysis tasks
    #[arg(long)]
    capacity: Option<usize>,

    /// Clustered state store URL (redis://...)
    #[arg(long)]
    store_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(bind) = &self.bind {
            config.bind.clone_from(bind);
        }
        if let Some(token) = &self.token {
            config.auth_token = Some(token.clone());
        }
        if let Some(capacity) = self.capacity {
            config.dispatch_capacity = capacity;
        }
        if let Some(url) = &self.store_url {
            config.store.url = Some(url.clone());
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = RelayConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;
    let addr = sacmes_server::bind_address(&config.bind)?;

    tracing::info!(
        version = sacmes_server::VERSION,
        capacity = config.dispatch_capacity,
        grace_secs = config.grace_period_secs,
        auth = config.auth_token.is_some(),
        "starting relay"
    );

    let hub = RelayHub::open(config, Arc::new(PeakCurrentAnalyzer)).await;
    let sweeper = hub.spawn_pending_sweeper(Duration::from_secs(5));

    let shutdown_hub = Arc::clone(&hub);
    let (bound, server) = sacmes_server::spawn(Arc::clone(&hub), addr, async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("signal handler failed: {e}");
        }
        shutdown_hub.shutdown();
    })
    .context("binding listener")?;

    server.await.context("server task")?;
    sweeper.abort();
    tracing::info!(addr = %bound, "relay stopped");
    Ok(())
}
