//! MJPEG relay server

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use mjpeg_relay::config::Config;
use mjpeg_relay::{web, FrameRelay};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "mjpeg-relay")]
#[command(about = "Relay the latest uploaded frame of each stream as MJPEG")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults are used if config.toml is absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP server to
    #[arg(long)]
    bind_ip: Option<String>,

    /// Port for the HTTP server
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load(DEFAULT_CONFIG_PATH).context("Failed to load config.toml")?
        }
        None => {
            info!("No config file found, using defaults");
            Config::default()
        }
    };

    if let Some(bind_ip) = &cli.bind_ip {
        config.server.bind_ip = bind_ip.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("MJPEG relay starting");

    let config = load_config(&cli)?;

    info!(
        bind = %config.bind_addr(),
        default_freq = config.relay.default_freq,
        target_width = config.relay.target_width,
        max_streams = config.relay.max_streams,
        "Configuration loaded"
    );

    let relay = FrameRelay::from_config(&config.relay);

    let stats_relay = relay.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        let mut previous = stats_relay.stats().snapshot();
        let mut since = Instant::now();

        loop {
            interval.tick().await;
            let current = stats_relay.stats().snapshot();
            let elapsed = since.elapsed().as_secs_f64();

            info!(
                streams = stats_relay.store().len(),
                viewers = current.viewers_active,
                stored = current.frames_stored,
                rejected = current.frames_rejected,
                codec_failures = current.codec_failures,
                render_aborts = current.render_aborts,
                chunks_per_sec = %format!("{:.1}", current.chunks_per_sec(&previous, elapsed)),
                kbps = %format!("{:.0}", current.bitrate_kbps(&previous, elapsed)),
                "Stats"
            );

            previous = current;
            since = Instant::now();
        }
    });

    // Wait for Ctrl+C; open MJPEG streams never finish on their own, so the
    // server is not drained gracefully.
    tokio::select! {
        result = web::run_server(&config, relay) => {
            if let Err(e) = &result {
                error!(error = %e, "Web server failed");
            }
            result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
        }
    }

    Ok(())
}
