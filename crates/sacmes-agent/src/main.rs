use anyhow::Context;
use clap::Parser;
use sacmes_agent::{default_identity_file, AgentClient, AgentConfig, IdentityFile};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Stream instrument files to a SACMES relay
#[derive(Debug, Parser)]
#[command(name = "sacmes-agent", version, about)]
struct Cli {
    /// Directory the instrument writes measurement files into
    #[arg(short, long, env = "SACMES_WATCH_DIR")]
    dir: PathBuf,

    /// Relay agent endpoint
    #[arg(long, env = "SACMES_SERVER_URL", default_value = "ws://127.0.0.1:5000/agent")]
    server: String,

    /// Bearer token for the relay
    #[arg(long, env = "SACMES_AUTH_TOKEN")]
    token: Option<String>,

    /// Identity file (created on first run)
    #[arg(long, env = "SACMES_IDENTITY_FILE")]
    identity_file: Option<PathBuf>,

    /// Directory re-scan period in seconds
    #[arg(long, default_value_t = 2)]
    poll_secs: u64,

    /// Connection attempts before giving up (0 = forever)
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Seconds of relay silence before reconnecting
    #[arg(long, default_value_t = 60)]
    liveness_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
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

    let mut config = AgentConfig::new(&cli.server, &cli.dir)?
        .with_identity_file(cli.identity_file.clone().unwrap_or_else(default_identity_file));
    if let Some(token) = &cli.token {
        config = config.with_auth_token(token.clone());
    }
    config.delivery.poll_interval = Duration::from_secs(cli.poll_secs.max(1));
    config.reconnect.max_attempts = cli.max_attempts;
    config.liveness_timeout = Duration::from_secs(cli.liveness_secs);
    config.validate()?;

    anyhow::ensure!(cli.dir.is_dir(), "{} is not a directory", cli.dir.display());
    let identity = IdentityFile::load_or_create(&config.identity_file)
        .context("loading agent identity")?;
    tracing::info!(
        version = sacmes_agent::VERSION,
        identity = %identity.identity(),
        dir = %cli.dir.display(),
        server = %config.server_url,
        "agent starting"
    );

    let mut client = AgentClient::new(config, identity.identity().clone());
    tokio::select! {
        result = client.run() => result.context("agent stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("signal handler")?;
            tracing::info!("interrupted");
        }
    }
    Ok(())
}
