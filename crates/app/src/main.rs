use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use camera_bridge_core::{AppConfig, Bridge, BridgeError, FrameShape, SyntheticBackend};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

fn main() -> camera_bridge_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { bridge, duration } => run_bridge(bridge.resolve()?, duration),
        Commands::Config { bridge } => print_config(&bridge.resolve()?),
    }
}

fn run_bridge(config: AppConfig, duration_secs: u64) -> camera_bridge_core::Result<()> {
    let settings = config.bridge;
    tracing::info!(
        index = settings.device_index,
        frequency = settings.frequency,
        segment_id = %settings.segment_id,
        duration_secs,
        "starting bridge"
    );

    let backend = SyntheticBackend::new().with_channels(settings.shape.channels);
    let mut bridge = Bridge::webcam(backend, settings);
    let mut reader = bridge.reader();
    bridge.start()?;

    let run_for = Duration::from_secs(duration_secs);
    let started = Instant::now();
    let mut window_start = Instant::now();
    let mut window_count = 0u64;
    let mut total = 0u64;

    while started.elapsed() < run_for {
        match reader.wait_for_next(Duration::from_millis(500))? {
            Some(record) => {
                total += 1;
                window_count += 1;
                if window_start.elapsed() >= Duration::from_secs(1) {
                    let (height, width, channels) = record.extended().dimensions();
                    tracing::info!(
                        iteration = record.iteration(),
                        timestamp = ?record.timestamp(),
                        observations = window_count,
                        height,
                        width,
                        channels,
                        "reading observations"
                    );
                    window_start = Instant::now();
                    window_count = 0;
                }
            }
            None if !bridge.is_running() => break,
            None => {}
        }
    }

    bridge.stop()?;
    tracing::info!(observations = total, "bridge finished");

    match bridge.take_fatal_error() {
        Some(err) => {
            tracing::error!(%err, "bridge terminated on a fatal error");
            Err(Arc::try_unwrap(err)
                .unwrap_or_else(|shared| BridgeError::msg(shared.to_string())))
        }
        None => Ok(()),
    }
}

fn print_config(config: &AppConfig) -> camera_bridge_core::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Fixed-frequency camera bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a bridge on the synthetic camera and read its observations.
    Run {
        #[command(flatten)]
        bridge: BridgeArgs,
        /// How long to read observations for, in seconds.
        #[arg(short, long, default_value_t = 20)]
        duration: u64,
    },
    /// Print the effective configuration as JSON.
    Config {
        #[command(flatten)]
        bridge: BridgeArgs,
    },
}

#[derive(Args, Debug)]
struct BridgeArgs {
    /// JSON configuration file. Flags below take precedence over it.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Index of the camera to open.
    #[arg(long)]
    index: Option<i32>,
    /// Sampling frequency in ticks per second.
    #[arg(long)]
    frequency: Option<f64>,
    /// Segment identifier handed to the publication transport.
    #[arg(long)]
    segment_id: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    channels: Option<u32>,
}

impl BridgeArgs {
    fn resolve(&self) -> camera_bridge_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };

        let bridge = &mut config.bridge;
        if let Some(index) = self.index {
            bridge.device_index = index;
        }
        if let Some(frequency) = self.frequency {
            bridge.frequency = frequency;
        }
        if let Some(segment_id) = &self.segment_id {
            bridge.segment_id = segment_id.clone();
        }
        let shape = bridge.shape;
        bridge.shape = FrameShape::new(
            self.width.unwrap_or(shape.width),
            self.height.unwrap_or(shape.height),
            self.channels.unwrap_or(shape.channels),
        );

        bridge.validate()?;
        Ok(config)
    }
}
