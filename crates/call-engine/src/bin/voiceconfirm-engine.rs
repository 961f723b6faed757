//! VoiceConfirm call engine process

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use voiceconfirm_call_engine::config::CallEngineConfig;
use voiceconfirm_call_engine::logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
use voiceconfirm_call_engine::server::CallEngineServerBuilder;

#[derive(Parser, Debug)]
#[command(name = "voiceconfirm-engine")]
#[command(about = "Outbound order-confirmation call engine")]
pub struct Args {
    /// Configuration file (TOML); VOICECONFIRM__* environment variables override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HTTP listen address, overrides general.bind_address
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut logging = LoggingConfig::new(parse_log_level(&args.log_level)?, "voiceconfirm-engine");
    if args.json_logs {
        logging = logging.with_json();
    }
    setup_logging(logging)?;
    log_welcome("voiceconfirm-engine", env!("CARGO_PKG_VERSION"));

    let mut config = CallEngineConfig::load(args.config.as_deref())
        .with_context(|| format!("loading configuration from {:?}", args.config))?;
    if let Some(bind) = args.bind {
        config.general.bind_address = bind;
    }
    info!("📡 Instance {} binding {}", config.general.instance_id, config.general.bind_address);

    let mut server = CallEngineServerBuilder::new()
        .with_config(config)
        .build()
        .await
        .context("building call engine")?;

    server.start();
    server.run().await?;
    Ok(())
}
