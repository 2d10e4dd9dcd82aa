//! camserver: camera acquisition, live frame broadcast and recording

use std::path::PathBuf;
use std::time::Duration;

use camserver::{capture, CamServer, Config};
use clap::Parser;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "camserver", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    frame_port: Option<u16>,

    #[arg(long)]
    command_port: Option<u16>,

    #[arg(long)]
    telemetry_port: Option<u16>,

    /// Acquisition rate in Hz
    #[arg(short, long)]
    rate: Option<f64>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    offset_x: Option<u32>,

    #[arg(long)]
    offset_y: Option<u32>,

    /// Root directory for recording sessions
    #[arg(short, long)]
    log_dir: Option<PathBuf>,

    /// Start recording immediately
    #[arg(long, conflicts_with = "disable_logging")]
    enable_logging: bool,

    #[arg(long)]
    disable_logging: bool,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Seconds between statistics reports
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,

    /// Per-frame debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        let server = &mut config.server;
        if let Some(port) = self.frame_port {
            server.frame_port = port;
        }
        if let Some(port) = self.command_port {
            server.command_port = port;
        }
        if let Some(port) = self.telemetry_port {
            server.telemetry_port = port;
        }

        let capture = &mut config.capture;
        if let Some(rate) = self.rate {
            capture.rate_hz = rate;
        }
        if let Some(width) = self.width {
            capture.width = width;
        }
        if let Some(height) = self.height {
            capture.height = height;
        }
        if let Some(x) = self.offset_x {
            capture.offset_x = x;
        }
        if let Some(y) = self.offset_y {
            capture.offset_y = y;
        }

        let recording = &mut config.recording;
        if let Some(dir) = &self.log_dir {
            recording.root_dir = dir.clone();
        }
        if self.enable_logging {
            recording.enabled = true;
        }
        if self.disable_logging {
            recording.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize error handling and logging
    color_eyre::install()?;
    let filter = if cli.verbose {
        EnvFilter::new("camserver=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camserver=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camserver {} launching...", camserver::VERSION);

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let cancel = CancellationToken::new();
    let backend = capture::open_backend(&config.capture)?;
    let app = CamServer::start(&config, backend, cancel.clone())?;
    info!(
        "Ready: frames on {}, commands on {}",
        app.frame_addr(),
        app.command_addr()
    );

    let deadline = async {
        match cli.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut report = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    report.tick().await;

    let reason = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break "interrupted",
            _ = cancel.cancelled() => break "exit requested",
            _ = &mut deadline => break "duration elapsed",
            _ = report.tick() => app.report(),
        }
    };
    info!("Stopping: {}", reason);

    tokio::task::spawn_blocking(move || app.shutdown()).await?;

    info!("camserver shut down");
    Ok(())
}
