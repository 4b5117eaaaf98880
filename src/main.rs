use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rgb_streamer::{
    Frame, GstDownstream, Pacing, Pipeline, RotationMode, SinkKind, StreamConfig, StreamOutcome,
};
use tracing_subscriber::filter::LevelFilter;

/// Stream synthetic RGB frames through the JPEG pipeline.
#[derive(Parser, Debug)]
#[command(name = "streamer")]
#[command(about = "🎞️ Feed raw RGB frames into a fixed-rate JPEG pipeline")]
#[command(long_about = "Feed synthetic RGB frames into a fixed-rate JPEG pipeline.
The sink is 'app' (in-process callback), 'tcp' (TCP stream server), 'push' (latest-wins
publish channel on an ephemeral port) or a path to an AVI file.")]
struct Args {
    /// Output selection
    #[arg(default_value = "app", help = "Sink: app, tcp, push, or an output file path")]
    sink: String,

    /// Streaming duration
    #[arg(short, long, default_value = "10s",
          help = "How long to stream: 30s (30 seconds), 2m (2 minutes), 1h (1 hour)")]
    duration: String,

    #[arg(short = 'f', long, default_value_t = 30, help = "Output frames per second")]
    fps: u32,

    #[arg(long, default_value_t = 1024, help = "Input frame width")]
    width: u32,

    #[arg(long, default_value_t = 600, help = "Input frame height")]
    height: u32,

    #[arg(long, help = "Output width (default: half the input width)")]
    out_width: Option<u32>,

    #[arg(long, help = "Output height (default: half the input height)")]
    out_height: Option<u32>,

    #[arg(long, default_value_t = 0xAA, help = "Byte value every frame is filled with")]
    fill: u8,

    /// Rotation code, 1 rotates the output by 90 degrees
    #[arg(short, long, default_value_t = 0)]
    rotation: i32,

    #[arg(long, help = "Let the pipeline pull frames instead of feeding them")]
    pull: bool,

    #[arg(long, value_enum, default_value_t = PacingArg::Realtime)]
    pacing: PacingArg,

    #[arg(short, long, action = clap::ArgAction::Count, help = "More logging (-v debug, -vv trace)")]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PacingArg {
    Downstream,
    Realtime,
}

impl From<PacingArg> for Pacing {
    fn from(arg: PacingArg) -> Self {
        match arg {
            PacingArg::Downstream => Pacing::Downstream,
            PacingArg::Realtime => Pacing::Realtime,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let seconds = parse_duration(&args.duration)?;
    let sink: SinkKind = args.sink.parse()?;
    let (width, height) = (args.width, args.height);
    let config = StreamConfig::new(
        args.fps,
        args.out_width.unwrap_or(width / 2),
        args.out_height.unwrap_or(height / 2),
        sink,
    )
    .with_rotation(RotationMode::from(args.rotation))
    .with_pacing(args.pacing.into());

    let output_bytes = Arc::new(AtomicU64::new(0));
    let mut builder = Pipeline::builder()
        .downstream(GstDownstream::new())
        .on_ready(|| log::info!("Pipeline ready"))
        .on_end_of_stream(|outcome| match outcome {
            StreamOutcome::Completed => log::info!("Stream completed"),
            StreamOutcome::Failed(reason) => log::error!("Stream failed: {}", reason),
        })
        .on_output({
            let output_bytes = Arc::clone(&output_bytes);
            move |chunk| {
                output_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        });
    if args.pull {
        let fill = args.fill;
        builder = builder.source(move || Frame::filled(width, height, fill).ok());
    }

    let mut pipeline = builder.build();
    pipeline.init()?;
    pipeline.run(config)?;
    if let Some(endpoint) = pipeline.endpoint() {
        println!("Streaming data on port {}", endpoint.port());
    }

    let deadline = Instant::now() + Duration::from_secs(u64::from(seconds));
    if args.pull {
        thread::sleep(deadline.saturating_duration_since(Instant::now()));
    } else {
        let frame = vec![args.fill; width as usize * height as usize * 3];
        let interval = Duration::from_secs(1) / args.fps.max(1);
        while Instant::now() < deadline {
            pipeline.feed(width, height, &frame)?;
            thread::sleep(interval);
        }
    }

    let report = pipeline.stop()?;
    let mailbox = pipeline.mailbox_stats();
    let sink = pipeline.sink_stats();
    println!(
        "{} frames submitted, {} overwritten before encoding, {} bytes of output, {} published, {} publish failures",
        report.frames_submitted,
        mailbox.overwritten,
        output_bytes.load(Ordering::Relaxed),
        sink.published,
        sink.send_failures
    );
    if let Some(failure) = report.failure {
        anyhow::bail!("stream failed: {}", failure);
    }
    Ok(())
}

/// Streaming time from "90", "30s", "2m" or "1h", in seconds.
fn parse_duration(text: &str) -> Result<u32> {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<u32>() {
        return Ok(seconds);
    }

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("Invalid duration: {:?}", text))?;
    let (count, unit) = text.split_at(split);
    let count: u32 = count
        .parse()
        .with_context(|| format!("Invalid number in duration {:?}", text))?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => anyhow::bail!("Unknown duration unit {:?}, expected s, m or h", other),
    };
    count
        .checked_mul(scale)
        .ok_or_else(|| anyhow::anyhow!("Duration {:?} is too long", text))
}
