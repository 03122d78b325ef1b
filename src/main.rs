use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use winglet_telemetry::geo_math::GeoPoint;
use winglet_telemetry::log_format::FeedLogFormat;
use winglet_telemetry::settings::{TelemetryConfig, config_path};

mod commands;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "winglet-telemetry")]
#[command(about = "ADS-B and GPS telemetry ingestion for the winglet badge")]
#[command(version)]
struct Cli {
    /// Config file (default: $WINGLET_TELEMETRY_CONFIG, then ./winglet-telemetry.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to both feeds and log a summary until interrupted
    Monitor {
        /// Seconds between summaries
        #[arg(long, default_value = "10")]
        report_seconds: u64,
    },
    /// Replay a captured BaseStation file and print the aircraft table as JSON
    ReplaySbs {
        file: PathBuf,

        /// Reference latitude for distance/bearing (default: [position] from config)
        #[arg(long, allow_hyphen_values = true, requires = "ref_lon")]
        ref_lat: Option<f32>,

        /// Reference longitude for distance/bearing
        #[arg(long, allow_hyphen_values = true, requires = "ref_lat")]
        ref_lon: Option<f32>,

        /// Aircraft decay threshold (default: [adsb] decay_seconds from config)
        #[arg(long)]
        decay_seconds: Option<u64>,
    },
    /// Replay a captured NMEA file and print the final fix and satellites as JSON
    ReplayNmea { file: PathBuf },
}

fn init_tracing() {
    // Logs go to stderr so replay JSON on stdout stays clean
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(FeedLogFormat)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = TelemetryConfig::load_or_default(&config_path(cli.config))?;

    match cli.command {
        Commands::Monitor { report_seconds } => {
            commands::handle_monitor(config, Duration::from_secs(report_seconds.max(1))).await
        }
        Commands::ReplaySbs {
            file,
            ref_lat,
            ref_lon,
            decay_seconds,
        } => {
            let reference = match (ref_lat, ref_lon) {
                (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
                _ => config.position.seed(),
            };
            commands::handle_replay_sbs(
                &file,
                reference,
                decay_seconds.unwrap_or(config.adsb.decay_seconds),
            )
        }
        Commands::ReplayNmea { file } => commands::handle_replay_nmea(&file),
    }
}
