use anyhow::Context;
use clap::Parser;
use design_relay_lib::config::{load_config, load_config_from, RelayConfig};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::time::Duration;

const LOG_FILE: &str = "design-relay.log";

/// Local broker between MCP tool consumers and the design editor plugin
#[derive(Debug, Parser)]
#[command(name = "design-relay", version, about)]
struct Cli {
    /// Config file (default: ~/.design-relay/config.json)
    #[arg(long, env = "DESIGN_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the consumer socket
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Directory for cached assets
    #[arg(long)]
    asset_dir: Option<PathBuf>,

    /// Write logs to <DIR>/design-relay.log instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Extension socket port candidate, in order; repeat to add more
    #[arg(long = "port")]
    ports: Vec<u16>,

    /// Tool call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Auto-activation grace period in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Keep running after the last tool consumer disconnects
    #[arg(long)]
    no_idle_exit: bool,
}

impl Cli {
    fn apply(self, mut config: RelayConfig) -> RelayConfig {
        if let Some(dir) = self.runtime_dir {
            config.runtime_dir = dir;
        }
        if let Some(dir) = self.asset_dir {
            config.asset_dir = dir;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = Some(dir);
        }
        if !self.ports.is_empty() {
            config.port_candidates = self.ports;
        }
        if let Some(ms) = self.timeout_ms {
            config.tool_call_timeout_ms = ms;
        }
        if let Some(ms) = self.grace_ms {
            config.auto_activate_grace_ms = ms;
        }
        if self.no_idle_exit {
            config.exit_when_idle = false;
        }
        config
    }
}

fn init_logging(config: &RelayConfig) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(dir) = &config.log_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let path = dir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }

    builder.init();
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .map_err(anyhow::Error::msg)?;
    let config = cli.apply(config);

    init_logging(&config)?;
    log::info!("design-relay {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let grace = Duration::from_millis(config.shutdown_grace_ms);
    let result = runtime.block_on(design_relay_lib::run(config));
    // Blocking file work still in flight must not hold up process exit
    runtime.shutdown_timeout(grace);
    result?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        eprintln!("design-relay: {:#}", e);
        std::process::exit(1);
    }
}
