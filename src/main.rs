//! ndwarp - resample raw detector frames
//!
//! Reads a file of raw frames, applies either the configured affine warp or
//! the detector restoration to each frame, and writes the resampled frames
//! back out in the same element type.

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ndwarp::{BufferData, Config, ElementType, ImageBuffer, Pipeline, PipelineMode};

/// ndwarp - geometric resampling of raw detector frames
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw input file (one or more frames, native byte order)
    #[arg(short, long)]
    input: PathBuf,

    /// Raw output file
    #[arg(short, long)]
    output: PathBuf,

    /// Frame width in pixels
    #[arg(long)]
    width: usize,

    /// Frame height in pixels
    #[arg(long)]
    height: usize,

    /// Element type (int8, uint8, int16, uint16, int32, uint32, float32, float64)
    #[arg(short, long, default_value = "uint16")]
    dtype: String,

    /// Override the pipeline mode from the config file (warp or restore)
    #[arg(short, long)]
    mode: Option<String>,

    /// Configuration file path
    #[arg(short, long, default_value = "ndwarp.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_mode(name: &str) -> Result<PipelineMode> {
    match name.to_ascii_lowercase().as_str() {
        "warp" => Ok(PipelineMode::Warp),
        "restore" => Ok(PipelineMode::Restore),
        other => bail!("Unknown mode '{}', expected warp or restore", other),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("ndwarp v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_or_create(&args.config)?;
    if let Some(mode) = &args.mode {
        config.pipeline.mode = parse_mode(mode)?;
    }
    let dtype: ElementType = args.dtype.parse()?;

    if config.pipeline.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.pipeline.threads)
            .build_global()
            .context("Failed to configure worker threads")?;
    }
    info!(
        "Mode: {:?}, frame {}x{} {}, {} worker threads",
        config.pipeline.mode,
        args.width,
        args.height,
        dtype,
        rayon::current_num_threads()
    );

    let restore_on_start =
        config.pipeline.mode == PipelineMode::Restore || config.restoration.load_on_start;
    let pipeline = Pipeline::new(Arc::new(RwLock::new(config)));

    if restore_on_start {
        pipeline
            .set_load(true)
            .context("Failed to load calibration matrices")?;
    }

    let raw = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read input {:?}", args.input))?;
    let frame_bytes = args.width * args.height * dtype.size_bytes();
    if frame_bytes == 0 {
        bail!("Frame size must be nonzero");
    }
    if raw.len() % frame_bytes != 0 {
        warn!(
            "Input holds {} trailing bytes that do not form a whole frame",
            raw.len() % frame_bytes
        );
    }
    let frame_count = raw.len() / frame_bytes;
    info!("Processing {} frame(s) from {:?}", frame_count, args.input);

    let file = std::fs::File::create(&args.output)
        .with_context(|| format!("Failed to create output {:?}", args.output))?;
    let mut writer = BufWriter::new(file);

    let mut last_stats_time = Instant::now();
    let stats_interval = Duration::from_secs(10);

    for (index, chunk) in raw.chunks_exact(frame_bytes).enumerate() {
        let data = BufferData::from_ne_bytes(dtype, chunk)?;
        let frame = ImageBuffer::new(vec![args.width, args.height], data)?;

        let output = pipeline
            .process(&frame)
            .with_context(|| format!("Failed to process frame {}", index))?;
        writer
            .write_all(output.data().as_bytes())
            .with_context(|| format!("Failed to write frame {}", index))?;

        debug!(
            "Frame {}: {:.3} ms",
            index,
            pipeline.stats().last_run_time_ms
        );

        if last_stats_time.elapsed() >= stats_interval {
            let stats = pipeline.stats();
            info!(
                "Performance: {} frames, {:.3} ms/frame average",
                stats.frames,
                stats.average_run_time_ms()
            );
            last_stats_time = Instant::now();
        }
    }

    writer.flush().context("Failed to flush output")?;

    let stats = pipeline.stats();
    info!(
        "Wrote {} frame(s) to {:?} ({:.3} ms/frame average, {} table build(s))",
        stats.frames,
        args.output,
        stats.average_run_time_ms(),
        stats.rebuilds
    );

    Ok(())
}
