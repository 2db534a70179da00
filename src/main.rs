//! # Wally - Minimal Wayland Compositor
//!
//! Serves the core Wayland protocol on a Unix socket and presents frames
//! through the headless renderer at the primary output's refresh rate.

use anyhow::Result;
use clap::Parser;
use log::{error, info};

use wally::{WallyCompositor, WallyConfig};

#[derive(Parser)]
#[command(name = "wally")]
#[command(about = "A minimal Wayland compositor core")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/wally/wally.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Socket name inside the runtime directory
    #[arg(short, long)]
    socket: Option<String>,

    /// Refresh rate of the primary output in mHz
    #[arg(long)]
    refresh: Option<u32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match WallyConfig::load(&cli.config) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            None
        }
    };
    let loaded = config.is_some();
    let mut config = config.unwrap_or_default();

    // Initialize logging
    let level = if cli.debug || config.general.debug {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    info!("🚀 Starting Wally - Minimal Wayland Compositor");
    info!(
        "📄 Version: {} ({}, built {})",
        wally::VERSION,
        env!("WALLY_GIT_COMMIT"),
        env!("WALLY_BUILD_DATE")
    );
    if loaded {
        info!("✅ Configuration loaded from: {}", cli.config);
    } else {
        info!("📝 Using default configuration");
    }

    // Override config with CLI flags
    if let Some(socket) = cli.socket {
        config.server.socket_name = socket;
    }
    if let Some(refresh) = cli.refresh {
        if let Some(primary) = config.outputs.first_mut() {
            primary.refresh_mhz = refresh;
        }
    }
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("wally-io")
        .build()?;

    let compositor = WallyCompositor::new(&config);
    let result = runtime.block_on(compositor.run(&config));
    if let Err(e) = &result {
        error!("❌ Compositor failed: {:#}", e);
    }
    result
}
