//! Replays captured raw device streams through the acquisition pipeline.
//!
//! The capture is fed to the decoder in transport-sized chunks; a consumer
//! thread takes containers from the exchange and writes them as CSV tables.

mod output;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use evcap_core::{
    DataExchange, FrameDecoder, LogLevel, Notifications, PackedDecoder, Producer,
    ProducerStats, ProtocolDecoder, SessionConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use output::{ContainerCsvWriter, PolarityColumns, RowCounts};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    /// 16-bit packed words (DV Explorer class USB cameras)
    Packed,
    /// 4-byte serial frames (eDVS class devices)
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

/// Event-camera capture replay tool.
///
/// Decodes a raw byte capture of either wire protocol into polarity, special
/// and IMU CSV tables.
#[derive(Parser, Debug)]
#[command(name = "evcap")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw capture file
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Wire protocol of the capture
    #[arg(short, long, value_enum, default_value_t = Protocol::Packed)]
    protocol: Protocol,

    /// Directory for the CSV tables
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Column order of the polarity table, each of x, y, p, t once
    #[arg(short, long, default_value = "x,y,p,t")]
    format: String,

    /// Bytes handed to the decoder per transport chunk
    #[arg(long, default_value_t = 8192)]
    chunk_size: usize,

    /// Commit a container once any event kind reaches this count (0 disables)
    #[arg(long, default_value_t = 4096)]
    max_packet_size: u32,

    /// Commit a container after this many microseconds
    #[arg(long, default_value_t = 10_000)]
    max_interval: u32,

    /// Capacity of the container exchange
    #[arg(long, default_value_t = 256)]
    queue_size: u32,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Suppress progress output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_tracing(args: &Args) {
    let default_level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match args.log_format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let columns = PolarityColumns::from_str(&args.format).context("Invalid --format")?;

    let stem = args
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("capture")
        .to_string();

    let config = SessionConfig::builder(format!("replay {stem}"))
        .log_level(if args.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Notice
        })
        .max_packet_size(args.max_packet_size)
        .max_interval(args.max_interval)
        .exchange_size(args.queue_size)
        .watermarks(args.queue_size / 4, args.queue_size * 3 / 4)
        .build()
        .context("Invalid pipeline settings")?;

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {:?}", args.output_dir))?;

    let input = File::open(&args.input)
        .with_context(|| format!("Failed to open {:?}", args.input))?;

    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .context("Invalid progress template")?,
        );
        pb.set_message(format!(
            "Replaying {:?}...",
            args.input.file_name().unwrap_or_default()
        ));
        pb
    };

    let start_time = Instant::now();
    let replay = match args.protocol {
        Protocol::Packed => replay(
            PackedDecoder::default(),
            input,
            &args,
            &config,
            &stem,
            columns,
            &progress,
        )?,
        Protocol::Frame => replay(
            FrameDecoder::default(),
            input,
            &args,
            &config,
            &stem,
            columns,
            &progress,
        )?,
    };
    let total_duration = start_time.elapsed();

    progress.finish_with_message(format!(
        "Done! {} containers, {} events in {:.2}s",
        replay.containers,
        replay.rows.polarity + replay.rows.special + replay.rows.imu6,
        total_duration.as_secs_f64()
    ));

    if replay.stats.containers_dropped > 0 {
        tracing::warn!(
            dropped = replay.stats.containers_dropped,
            "containers were dropped; raise --queue-size"
        );
    }

    if !args.quiet {
        let events_per_sec = replay.rows.polarity as f64 / total_duration.as_secs_f64();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Protocol:     {:?}", args.protocol);
        eprintln!("  Output:       {:?}", args.output_dir.join(format!("{stem}_*.csv")));
        eprintln!("  Bytes:        {}", replay.bytes);
        eprintln!("  Containers:   {}", replay.containers);
        eprintln!("  Polarity:     {}", replay.rows.polarity);
        eprintln!("  Special:      {}", replay.rows.special);
        eprintln!("  IMU samples:  {}", replay.rows.imu6);
        eprintln!("  Skipped:      {} bytes", replay.stats.skipped_bytes);
        eprintln!("  Dropped:      {} containers", replay.stats.containers_dropped);
        eprintln!("  Resets:       {}", replay.stats.resets);
        eprintln!("  Big wraps:    {}", replay.stats.big_wraps);
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
        eprintln!("  Throughput:   {:.0} events/s", events_per_sec);
    }

    Ok(())
}

struct Replay {
    bytes: u64,
    containers: u64,
    rows: RowCounts,
    stats: ProducerStats,
}

/// Runs the decoder over `input` while a consumer thread writes the tables.
fn replay<D: ProtocolDecoder>(
    decoder: D,
    mut input: File,
    args: &Args,
    config: &SessionConfig,
    stem: &str,
    columns: PolarityColumns,
    progress: &ProgressBar,
) -> Result<Replay> {
    let mut writer = ContainerCsvWriter::create(&args.output_dir, stem, columns)
        .context("Failed to create CSV output")?;
    writer
        .write_headers(decoder.geometry())
        .context("Failed to write CSV headers")?;

    // The reader pauses between the high and the low watermark.
    let paused = Arc::new(AtomicBool::new(false));
    let (on_high, on_low) = (Arc::clone(&paused), Arc::clone(&paused));

    let exchange = Arc::new(DataExchange::new(Arc::clone(&config.exchange)));
    exchange.init(
        Notifications::new()
            .on_high_watermark(move || on_high.store(true, Ordering::Release))
            .on_low_watermark(move || on_low.store(false, Ordering::Release))
            .on_shrink({
                let paused = Arc::clone(&paused);
                move || paused.store(false, Ordering::Release)
            }),
    );

    let running = Arc::new(AtomicBool::new(true));
    let mut producer = Producer::new(
        decoder,
        Arc::clone(&config.packets),
        Arc::clone(&exchange),
        Arc::clone(&running),
        Arc::clone(&config.log),
    );
    producer.start();

    let consumer = {
        let exchange = Arc::clone(&exchange);
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("evcap consumer".to_string())
            .spawn(move || -> Result<(ContainerCsvWriter<File>, u64)> {
                let mut containers = 0u64;
                while let Some(container) = exchange.get(&running) {
                    writer
                        .write_container(&container)
                        .context("Failed to write CSV rows")?;
                    containers += 1;
                }
                writer.flush().context("Failed to flush CSV output")?;
                Ok((writer, containers))
            })
            .context("Failed to spawn consumer thread")?
    };

    let mut buffer = vec![0u8; args.chunk_size.max(1)];
    let mut bytes = 0u64;
    let read_result = loop {
        while paused.load(Ordering::Acquire) && !consumer.is_finished() {
            thread::sleep(Duration::from_micros(200));
        }
        if consumer.is_finished() {
            break Ok(());
        }

        let n = match input.read(&mut buffer) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(error) => break Err(error),
        };
        bytes += n as u64;
        producer.process(&buffer[..n]);
        progress.set_message(format!("Decoded {} bytes", bytes));
        progress.tick();
    };
    producer.flush();
    producer.stop();

    // Consumer drains what is queued, then sees the cleared flag.
    running.store(false, Ordering::Release);
    let (writer, containers) = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("Consumer thread panicked"))??;
    read_result.with_context(|| format!("Failed to read {:?}", args.input))?;

    Ok(Replay {
        bytes,
        containers,
        rows: writer.counts(),
        stats: producer.stats(),
    })
}
