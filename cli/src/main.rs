use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bartrack_core::{
    FrameCoordinator, Readout, Scheduler, Services, SessionError, TrackerConfig,
    config::TimestampSource,
    detection::OnnxBarDetector,
    pose::{DEFAULT_POSE_INPUT_SIZE, OnnxPoseEstimator},
    runtime::configure_ort_dylib,
    session::PacedClock,
    video::{CaptureSource, FfmpegCapture, VideoWriter, list_video_devices},
};

#[cfg(target_os = "macos")]
const DEFAULT_DEVICE_FORMAT: &str = "avfoundation";
#[cfg(target_os = "windows")]
const DEFAULT_DEVICE_FORMAT: &str = "dshow";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const DEFAULT_DEVICE_FORMAT: &str = "v4l2";

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "bartrack",
    version,
    about = "Track a barbell and the lifter's arms, with live bar velocity",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a tracking session; press Enter to stop.
    Track(TrackArgs),

    /// List the camera input devices FFmpeg can open.
    Devices,
}

#[derive(Args)]
struct TrackArgs {
    /// Video file or stream URL to track
    #[arg(short, long, conflicts_with = "device", required_unless_present = "device")]
    source: Option<PathBuf>,

    /// Camera device (e.g. /dev/video0, or "0" on macOS)
    #[arg(short, long)]
    device: Option<String>,

    /// FFmpeg input format used to open --device
    #[arg(long, default_value = DEFAULT_DEVICE_FORMAT)]
    device_format: String,

    /// Barbell detection ONNX model path
    #[arg(long, default_value = "models/bar_detector.onnx")]
    detector_model: PathBuf,

    /// MoveNet pose ONNX model path
    #[arg(long, default_value = "models/movenet.onnx")]
    pose_model: PathBuf,

    /// Square input size of the pose model
    #[arg(long, default_value_t = DEFAULT_POSE_INPUT_SIZE)]
    pose_input: u32,

    /// JSON tracker config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Detection confidence threshold (0–1, strictly exceeded)
    #[arg(long)]
    threshold: Option<f32>,

    /// Tick rate of the frame clock
    #[arg(long)]
    fps: Option<u32>,

    /// Timestamp observations with frame presentation time instead of wall time
    #[arg(long)]
    stream_time: bool,

    /// Write the annotated surface to this video file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write a JSON session report here after stopping
    #[arg(long)]
    report: Option<PathBuf>,

    /// Stop automatically after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Track(args) => cmd_track(args),
        Commands::Devices => cmd_devices(),
    }
}

// ── track ─────────────────────────────────────────────────────────────────────

fn cmd_track(args: TrackArgs) -> Result<()> {
    let config = resolve_config(&args)?;

    let source = match (&args.source, &args.device) {
        (Some(path), _) => CaptureSource::Path(path.clone()),
        (None, Some(device)) => CaptureSource::Device {
            format: args.device_format.clone(),
            path: device.clone(),
        },
        (None, None) => anyhow::bail!("either --source or --device is required"),
    };
    info!(?source, "bartrack session");

    configure_ort_dylib();

    let detector = OnnxBarDetector::load(&args.detector_model)
        .map_err(|e| SessionError::model_load("detection", &e))?;
    let pose = OnnxPoseEstimator::load(&args.pose_model, args.pose_input)
        .map_err(|e| SessionError::model_load("pose", &e))?;

    let mut coordinator = FrameCoordinator::new(
        config.clone(),
        Services {
            detector: Box::new(detector),
            pose: Box::new(pose),
            capture: Box::new(FfmpegCapture::new(source)),
        },
    );
    coordinator.start()?;

    let mut writer = args
        .output
        .as_ref()
        .map(|path| {
            VideoWriter::create(path, config.fps)
                .with_context(|| format!("failed to create output: {}", path.display()))
        })
        .transpose()?;

    // Stop command: Enter on stdin flips the session to idle.
    let stop = coordinator.handle();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        stop.stop();
    });

    let pb = spinner("Tracking… press Enter to stop");
    let stop = coordinator.handle();
    let max_frames = args.max_frames;
    let mut frames = 0u64;
    let mut scheduler = Scheduler::new(PacedClock::new(config.fps));

    let ticks = scheduler.run(&mut coordinator, |coordinator, _outcome, now_ms| {
        pb.set_message(status_line(coordinator.readout()));

        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write(coordinator.surface().frame(), now_ms) {
                warn!("output disabled after write error: {e:#}");
                writer = None;
            }
        }

        frames += 1;
        if max_frames.is_some_and(|limit| frames >= limit) {
            stop.stop();
        }
    });

    pb.finish_with_message(format!("Stopped after {ticks} frames."));

    if let Some(w) = writer {
        w.finish().context("failed to finalise annotated output")?;
    }

    let readout = coordinator.readout();
    println!("Bar coordinates : {}", readout.bar_coordinates_text());
    println!("Bar velocity    : {}", readout.velocity_text());
    println!("Time between    : {}", readout.elapsed_text());
    println!("Arm joints      : {}", readout.arms_text());

    if let Some(path) = &args.report {
        let report = serde_json::to_string_pretty(&coordinator.report())
            .context("failed to serialise session report")?;
        std::fs::write(path, report)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
        info!(path = %path.display(), "session report written");
    }

    Ok(())
}

fn resolve_config(args: &TrackArgs) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(threshold) = args.threshold {
        config.confidence_threshold = threshold;
    }
    if let Some(fps) = args.fps {
        config.fps = fps;
    }
    if args.stream_time {
        config.timestamps = TimestampSource::Stream;
    }
    config.validate()?;
    Ok(config)
}

fn status_line(readout: &Readout) -> String {
    format!(
        "bar {} | {} | Δt {} | arms {}",
        readout.bar_coordinates_text(),
        readout.velocity_text(),
        readout.elapsed_text(),
        readout.arms_text()
    )
}

// ── devices ───────────────────────────────────────────────────────────────────

fn cmd_devices() -> Result<()> {
    let devices = list_video_devices()?;
    if devices.is_empty() {
        println!("No video input devices available in this FFmpeg build.");
        return Ok(());
    }
    for (name, description) in devices {
        println!("{name:<16} {description}");
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "bartrack",
            "track",
            "--source",
            "lift.mp4",
            "--threshold",
            "0.65",
            "--fps",
            "60",
            "--stream-time",
        ])
        .unwrap();
        let Commands::Track(args) = cli.command else {
            panic!("expected track");
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.confidence_threshold, 0.65);
        assert_eq!(config.fps, 60);
        assert_eq!(config.timestamps, TimestampSource::Stream);
    }

    #[test]
    fn source_and_device_conflict() {
        let parsed = Cli::try_parse_from([
            "bartrack", "track", "--source", "a.mp4", "--device", "/dev/video0",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn track_requires_an_input() {
        assert!(Cli::try_parse_from(["bartrack", "track"]).is_err());
    }
}
