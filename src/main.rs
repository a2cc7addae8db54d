use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fake_camera::config::{CameraConfig, ConfigStore, SequencerShape};
use fake_camera::metadata::RequestTemplate;
use fake_camera::pipeline::{CameraMessage, CaptureRequest, Notify, StreamConfig};
use fake_camera::sensor::{BufferStatus, PixelFormat, StreamBuffer};
use fake_camera::FakeCamera;

const RAW_STREAM: i32 = 1;
const JPEG_STREAM: i32 = 2;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// fake-camera command line arguments
#[derive(Parser, Debug)]
#[command(name = "fake-camera")]
#[command(version, about = "Run a short capture session against a simulated camera", long_about = None)]
struct CliArgs {
    /// Camera config file (JSON, created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of capture requests to submit
    #[arg(short = 'n', long, default_value_t = 5)]
    frames: u32,

    /// Directory the final RAW and JPEG buffers are written to
    #[arg(short = 'o', long, value_name = "DIR", default_value = "capture")]
    output: PathBuf,

    /// Simulated hour of day (overrides config)
    #[arg(long, value_name = "HOUR")]
    hour: Option<u32>,

    /// Hand requests to a configure thread instead of waiting for the sensor
    #[arg(long)]
    staged: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.json_logs);

    tracing::info!("Starting fake-camera v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => {
            let store = ConfigStore::open(path)
                .await
                .with_context(|| format!("loading {}", path.display()))?;
            (*store.get()).clone()
        }
        None => CameraConfig::default(),
    };
    if let Some(hour) = args.hour {
        config.sensor.hour = hour;
    }
    if args.staged {
        config.pipeline.shape = SequencerShape::Staged;
    }

    let mut camera = FakeCamera::new(config)?;
    let messages = camera
        .take_messages()
        .context("camera message channel already taken")?;
    let streams = session_streams(&camera)?;
    camera.configure_streams(&streams)?;

    let collector = tokio::spawn(collect(messages));

    let frames = args.frames;
    // Submission blocks on the sensor, keep it off the async workers
    let camera = tokio::task::spawn_blocking(move || -> anyhow::Result<FakeCamera> {
        let settings = camera.default_request_settings(RequestTemplate::StillCapture)?;
        for frame_number in 1..=frames {
            let settings = (frame_number == 1).then(|| settings.clone());
            let outputs = streams.iter().map(StreamConfig::buffer).collect();
            camera
                .process_capture_request(CaptureRequest::new(frame_number, settings, outputs))
                .map_err(|rejected| anyhow::anyhow!("{}", rejected))?;
        }
        if !camera.wait_until_idle(Duration::from_secs(10)) {
            tracing::warn!("Camera did not drain within 10s");
        }
        camera.close();
        Ok(camera)
    })
    .await??;

    let stats = camera.sensor().stats();
    // Dropping the camera closes the message channel and ends the collector
    drop(camera);
    let last = collector.await?;

    tracing::info!(
        "Sensor captured {} frames ({} delivered, {} overruns)",
        stats.frames_captured,
        stats.frames_delivered,
        stats.overruns
    );
    write_buffers(&args.output, &last).await?;
    Ok(())
}

/// RAW and JPEG streams at sensor size, as far as the profile allows
fn session_streams(camera: &FakeCamera) -> anyhow::Result<Vec<StreamConfig>> {
    let res = camera.sensor().resolution();
    let caps = camera.capabilities();
    let streams: Vec<StreamConfig> = [(RAW_STREAM, PixelFormat::Raw16), (JPEG_STREAM, PixelFormat::Blob)]
        .into_iter()
        .filter(|(_, format)| caps.allows_format(*format))
        .map(|(id, format)| StreamConfig::output(id, format, res.width, res.height))
        .collect();
    if streams.is_empty() {
        bail!("camera profile {:?} supports neither RAW nor JPEG output", camera.config().profile);
    }
    Ok(streams)
}

/// Log every message and keep the last good buffer of each stream
async fn collect(mut messages: mpsc::UnboundedReceiver<CameraMessage>) -> HashMap<i32, StreamBuffer> {
    let mut last = HashMap::new();
    while let Some(message) = messages.recv().await {
        match message {
            CameraMessage::Notify(Notify::ShutterOpened {
                frame_number,
                timestamp_ns,
            }) => tracing::debug!("Frame {}: shutter at {} ns", frame_number, timestamp_ns),
            CameraMessage::Notify(Notify::Error {
                frame_number,
                code,
                stream_id,
            }) => tracing::warn!("Frame {}: {:?} error (stream {:?})", frame_number, code, stream_id),
            CameraMessage::Result(result) => {
                tracing::info!(
                    "Frame {}: {} result with {} buffer(s)",
                    result.frame_number,
                    if result.is_partial() { "partial" } else { "full" },
                    result.output_buffers.len()
                );
                for buffer in result.output_buffers {
                    if buffer.status == BufferStatus::Ok {
                        last.insert(buffer.stream_id, buffer);
                    }
                }
            }
        }
    }
    last
}

async fn write_buffers(dir: &Path, buffers: &HashMap<i32, StreamBuffer>) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for buffer in buffers.values() {
        let (name, bytes) = match buffer.format {
            PixelFormat::Blob => ("capture.jpg", &buffer.data()[..buffer.bytes_used()]),
            _ => ("capture.raw", buffer.data()),
        };
        let path = dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(
            "Wrote {} ({} {}x{}, {} bytes)",
            path.display(),
            buffer.format,
            buffer.width,
            buffer.height,
            bytes.len()
        );
    }
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "fake_camera=error",
        LogLevel::Warn => "fake_camera=warn",
        LogLevel::Info => "fake_camera=info",
        LogLevel::Debug => "fake_camera=debug",
        LogLevel::Trace => "fake_camera=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
