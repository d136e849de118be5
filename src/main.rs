//! Binocle: low-latency stereo camera viewer

use std::path::PathBuf;
use std::time::Duration;

use binocle::capture::{Eye, FrameSource, TestPattern, V4l2Source};
use binocle::record::MjpegFileSink;
use binocle::{display, utils, BackendKind, Config, LoggingConfig, RenderMode, SourceKind, Viewer};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "binocle", version, about = "Low-latency stereo camera viewer")]
struct Cli {
    /// Left camera, as the N in /dev/videoN
    #[arg(long, value_name = "INDEX")]
    left: Option<usize>,

    /// Right camera, as the N in /dev/videoN
    #[arg(long, value_name = "INDEX")]
    right: Option<usize>,

    /// Record a side-by-side stream into DIR (current directory if omitted)
    #[arg(long, value_name = "DIR", num_args = 0..=1, default_missing_value = ".")]
    record: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    #[arg(long, value_enum)]
    mode: Option<RenderMode>,

    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,

    /// Print the capture devices found and exit
    #[arg(long)]
    list_devices: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(left) = self.left {
            config.capture.left_device = left;
        }
        if let Some(right) = self.right {
            config.capture.right_device = right;
        }
        if let Some(dir) = &self.record {
            config.record.enabled = true;
            config.record.directory = dir.clone();
        }
        if let Some(backend) = self.backend {
            config.display.backend = backend;
        }
        if let Some(mode) = self.mode {
            config.display.mode = mode;
        }
        if let Some(source) = self.source {
            config.capture.source = source;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    init_tracing(&config.logging);

    if cli.list_devices {
        let devices = utils::list_capture_devices();
        if devices.is_empty() {
            println!("no capture devices found");
        }
        for device in devices {
            println!(
                "{}\t{}\t{:?}\tpreferred {:?}",
                device.path,
                device.card,
                device.formats,
                device.preferred_format()
            );
        }
        return Ok(());
    }

    let duration = match cli.duration {
        Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => return Err(eyre!("invalid --duration {secs}")),
        None => None,
    };

    info!("Binocle launching...");
    let format = config.capture.frame_format();
    let mut viewer = Viewer::new(config.clone());

    for (eye, index) in [
        (Eye::Left, config.capture.left_device),
        (Eye::Right, config.capture.right_device),
    ] {
        let source: Box<dyn FrameSource> = match config.capture.source {
            SourceKind::V4l2 => Box::new(V4l2Source::new(index, &config.capture)),
            SourceKind::Pattern => {
                Box::new(TestPattern::new(eye.name(), format).with_phase(eye.index() as u8 * 128))
            }
        };
        viewer.spawn_capture(eye, source)?;
    }

    if config.record.enabled {
        let sink = MjpegFileSink::new(&config.record)?;
        viewer.spawn_recorder(Box::new(sink))?;
    }

    let backend = match display::initialize(&config.display, format, viewer.frames()) {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "display initialization failed");
            viewer.shutdown();
            return Err(e.into());
        }
    };

    let report = viewer.run(backend, duration);
    let stats = viewer.stats();
    viewer.shutdown();
    let report = report?;

    info!(
        submitted = report.submitted,
        dropped = report.dropped,
        render_failures = report.render_failures,
        avg_latency_ms = stats.avg_latency_ms,
        p99_latency_ms = stats.p99_latency_ms,
        "Binocle shutting down"
    );
    Ok(())
}
