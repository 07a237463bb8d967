use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{debug, info, LevelFilter};
use serde::Deserialize;

use cstream_codecs::{codec_by_id, codec_by_name, SoftDeflateDevice};
use cstream_core::format::BLOCK_HEADER_SIZE;
use cstream_core::framing::CHECKSUM_TRAILER_SIZE;
use cstream_core::{
    BlockHeader, CodecEngine, DecodeAdapter, DecodeConfig, EncodeAdapter, EncodeConfig, EngineConfig,
    FrameHeader, FramingKind, IoSink, IoSource, PipelineAdapter, PipelineConfig, Sink,
    StreamStats, GZIP_EXTRA_HEADER_SIZE,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "cstream",
    about = "Buffered compressed streams: compress, decompress, and inspect block or gzip-member output",
    version
)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// TOML file with [engine], [encode], [decode] and [pipeline] tables
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a file ("-" for stdin/stdout)
    Compress {
        input: PathBuf,
        output: PathBuf,
        /// Compressor: none | lz4 | zlib | zstd
        #[arg(short, long, default_value = "zstd")]
        codec: String,
        /// Compression level 0..=9
        #[arg(short, long)]
        level: Option<u8>,
        /// Engine worker threads
        #[arg(short, long)]
        threads: Option<usize>,
        /// Framing: unframed | checksum | gzip-extra
        #[arg(short, long)]
        framing: Option<String>,
        /// Offload to an accelerator instead of the block engine ("soft")
        #[arg(long)]
        hardware: Option<String>,
        /// Channels exposed by the software accelerator
        #[arg(long, default_value_t = 2)]
        channels: usize,
    },
    /// Decompress block-engine or gzip-member output
    Decompress {
        input: PathBuf,
        output: PathBuf,
        /// Framing of a block stream; detected when omitted
        #[arg(short, long)]
        framing: Option<String>,
    },
    /// Walk the frames of a compressed file and print statistics
    Inspect {
        file: PathBuf,
        /// Framing of a block stream; detected when omitted
        #[arg(short, long)]
        framing: Option<String>,
        /// Print one line per frame
        #[arg(long)]
        frames: bool,
    },
}

/// Optional settings file. Command-line flags win over it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    engine: EngineConfig,
    encode: EncodeConfig,
    decode: DecodeConfig,
    pipeline: PipelineConfig,
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
    let config: CliConfig = toml::from_str(&text).with_context(|| format!("parsing config {:?}", path))?;
    debug!("loaded config from {:?}: {:?}", path, config);
    Ok(config)
}

fn open_input(path: &Path) -> anyhow::Result<Box<dyn Read>> {
    if path.to_str() == Some("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(path).with_context(|| format!("opening input file {:?}", path))?;
    Ok(Box::new(BufReader::new(file)))
}

fn open_output(path: &Path) -> anyhow::Result<Box<dyn Write>> {
    if path.to_str() == Some("-") {
        return Ok(Box::new(io::stdout().lock()));
    }
    let file = File::create(path).with_context(|| format!("creating output file {:?}", path))?;
    Ok(Box::new(BufWriter::new(file)))
}

/// Copy everything from `src` into `dst`, treating a short write as fatal.
fn pump(src: &mut dyn Read, dst: &mut dyn Sink, buf_len: usize) -> anyhow::Result<u64> {
    let mut buf = vec![0u8; buf_len];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        let written = dst.write(&buf[..n])?;
        if written != n {
            anyhow::bail!("compressor accepted {} of {} bytes", written, n);
        }
        total += n as u64;
    }
}

/// What the first bytes of a compressed input look like.
enum Detected {
    /// Concatenated gzip members from an accelerator.
    GzipMembers,
    /// Block-engine frames.
    Blocks { framing: FramingKind, codec_id: u8 },
    Empty,
}

fn detect(head: &[u8], framing: Option<FramingKind>) -> anyhow::Result<Detected> {
    if head.is_empty() {
        return Ok(Detected::Empty);
    }
    let framing = match framing {
        Some(kind) => kind,
        None if head.starts_with(&[0x1f, 0x8b]) => {
            // A deflate payload can start with bytes that parse as a block
            // header; only a member length that matches the block decides it.
            let inner = head.get(GZIP_EXTRA_HEADER_SIZE..).unwrap_or_default();
            let member_len = FrameHeader::from_bytes(head).map(|f| f.block_len as usize);
            match (BlockHeader::peek(inner), member_len) {
                (Ok(Some(block)), Ok(len)) if len == GZIP_EXTRA_HEADER_SIZE + block.block_len as usize => {
                    FramingKind::GzipExtra
                }
                _ => return Ok(Detected::GzipMembers),
            }
        }
        None => FramingKind::Unframed,
    };
    let offset = framing.build().header_len();
    let header = BlockHeader::peek(head.get(offset..).unwrap_or_default())?
        .context("input is too short to hold a block header")?;
    Ok(Detected::Blocks {
        framing,
        codec_id: header.codec_id,
    })
}

fn parse_framing(name: Option<&str>) -> anyhow::Result<Option<FramingKind>> {
    name.map(FramingKind::from_name).transpose()
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn report(stats: &StreamStats, elapsed: std::time::Duration) {
    eprintln!("  frames      : {}", stats.frames);
    eprintln!("  raw size    : {}", human_bytes(stats.raw_bytes));
    eprintln!("  encoded     : {}", human_bytes(stats.encoded_bytes));
    eprintln!("  ratio       : {:.2}x", stats.ratio());
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((stats.raw_bytes as f64 / elapsed.as_secs_f64().max(1e-9)) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
}

// ── Subcommand implementations ─────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn run_compress(
    config: CliConfig,
    input: PathBuf,
    output: PathBuf,
    codec_name: &str,
    level: Option<u8>,
    threads: Option<usize>,
    framing: Option<FramingKind>,
    hardware: Option<&str>,
    channels: usize,
) -> anyhow::Result<()> {
    let mut src = open_input(&input)?;
    let dst = IoSink::new(open_output(&output)?);
    let t0 = Instant::now();

    let stats = match hardware {
        Some("soft") => {
            let mut pipeline_config = config.pipeline;
            if let Some(kind) = framing {
                pipeline_config.framing = kind;
            }
            let device_level = u32::from(level.unwrap_or(config.encode.level));
            let device = SoftDeflateDevice::new(channels).with_level(device_level);
            let block = pipeline_config.input_block;
            let mut adapter = PipelineAdapter::open(dst, &device, pipeline_config)?;
            let slots = adapter.slot_count();
            eprintln!("  accelerator : soft deflate, {} slots", slots);
            pump(src.as_mut(), &mut adapter, block * slots)?;
            adapter.close()?
        }
        Some(other) => anyhow::bail!("unknown accelerator '{}'. Valid options: soft", other),
        None => {
            let codec = codec_by_name(codec_name)?;
            let mut engine_config = config.engine;
            if let Some(n) = threads {
                engine_config.threads = n;
            }
            let engine = CodecEngine::new(codec, engine_config)?;
            let mut encode_config = config.encode;
            if let Some(l) = level {
                encode_config.level = l;
            }
            if let Some(kind) = framing {
                encode_config.framing = kind;
            }
            eprintln!("  codec       : {} (level {})", engine.codec().name(), encode_config.level);
            let chunk = encode_config.max_chunk;
            let mut adapter = EncodeAdapter::open(dst, engine, encode_config)?;
            pump(src.as_mut(), &mut adapter, chunk * 4)?;
            adapter.close()?
        }
    };

    info!("compressed {:?} -> {:?}", input, output);
    report(&stats, t0.elapsed());
    Ok(())
}

fn run_decompress(
    config: CliConfig,
    input: PathBuf,
    output: PathBuf,
    framing: Option<FramingKind>,
) -> anyhow::Result<()> {
    let mut src = open_input(&input)?;
    let mut head = Vec::with_capacity(64);
    (&mut src).take(64).read_to_end(&mut head)?;
    let detected = detect(&head, framing)?;
    let src = io::Cursor::new(head).chain(src);
    let mut dst = open_output(&output)?;
    let t0 = Instant::now();

    let stats = match detected {
        Detected::Empty => StreamStats::default(),
        Detected::GzipMembers => {
            eprintln!("  format      : gzip members");
            let mut decoder = flate2::read::MultiGzDecoder::new(src);
            let raw_bytes = io::copy(&mut decoder, &mut dst)?;
            StreamStats {
                raw_bytes,
                ..StreamStats::default()
            }
        }
        Detected::Blocks { framing, codec_id } => {
            let codec = codec_by_id(codec_id)?;
            eprintln!("  format      : {} blocks, {} framing", codec.name(), framing.build().name());
            let engine = CodecEngine::new(codec, config.engine)?;
            let mut decode_config = config.decode;
            decode_config.framing = framing;
            let mut adapter = DecodeAdapter::open(IoSource::new(src), engine, decode_config)?;
            let mut buf = vec![0u8; 256 * 1024];
            loop {
                let n = adapter.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                dst.write_all(&buf[..n])?;
            }
            adapter.close()?
        }
    };
    dst.flush()?;

    report(&stats, t0.elapsed());
    Ok(())
}

fn run_inspect(file: PathBuf, framing: Option<FramingKind>, show_frames: bool) -> anyhow::Result<()> {
    let data = std::fs::read(&file).with_context(|| format!("reading {:?}", file))?;
    println!("=== {:?} ===", file);
    println!();
    println!("  file on disk : {}", human_bytes(data.len() as u64));

    match detect(&data, framing)? {
        Detected::Empty => println!("  (empty)"),
        Detected::GzipMembers => inspect_members(&data, show_frames)?,
        Detected::Blocks { framing, .. } => inspect_blocks(&data, framing, show_frames)?,
    }
    Ok(())
}

/// Hop from member to member using the length in each extra field.
fn inspect_members(data: &[u8], show_frames: bool) -> anyhow::Result<()> {
    let mut offset = 0usize;
    let mut stats = StreamStats::default();
    if show_frames {
        println!();
        println!("  {:>8}  {:>14}  {:>12}  {:>12}", "member", "offset", "member len", "raw");
        println!("  {}", "-".repeat(52));
    }
    while offset < data.len() {
        let header = FrameHeader::from_bytes(&data[offset..])
            .with_context(|| format!("member at offset {}", offset))?;
        let len = header.block_len as usize;
        if len < GZIP_EXTRA_HEADER_SIZE + 8 || offset + len > data.len() {
            anyhow::bail!("member at offset {} claims {} bytes; file is truncated or corrupt", offset, len);
        }
        let isize_at = offset + len - 4;
        let raw = u32::from_le_bytes(data[isize_at..isize_at + 4].try_into()?);
        if show_frames {
            println!(
                "  {:>8}  {:>14}  {:>12}  {:>12}",
                stats.frames,
                offset,
                human_bytes(len as u64),
                human_bytes(u64::from(raw))
            );
        }
        stats.frames += 1;
        stats.raw_bytes += u64::from(raw);
        stats.encoded_bytes += len as u64;
        offset += len;
    }

    println!();
    println!("  format       : gzip members with length extra field");
    println!("  members      : {}", stats.frames);
    println!("  raw size     : {}", human_bytes(stats.raw_bytes));
    println!("  ratio        : {:.2}x", stats.ratio());
    Ok(())
}

fn inspect_blocks(data: &[u8], framing: FramingKind, show_frames: bool) -> anyhow::Result<()> {
    let policy = framing.build();
    let (header_len, trailer_len) = (policy.header_len(), policy.trailer_len());
    let mut offset = 0usize;
    let mut stats = StreamStats::default();
    let mut codec_id = None;

    if show_frames {
        println!();
        println!(
            "  {:>8}  {:>14}  {:>6}  {:>12}  {:>12}  {:>7}",
            "frame", "offset", "codec", "block len", "raw", "splits"
        );
        println!("  {}", "-".repeat(68));
    }
    while offset < data.len() {
        let block_at = offset + header_len;
        let header = BlockHeader::peek(data.get(block_at..).unwrap_or_default())
            .with_context(|| format!("frame at offset {}", offset))?
            .with_context(|| format!("frame at offset {} is truncated", offset))?;
        let total = header_len + header.block_len as usize + trailer_len;
        if offset + total > data.len() {
            anyhow::bail!("frame at offset {} needs {} bytes; file is truncated", offset, total);
        }
        let block_end = block_at + header.block_len as usize;
        policy.unseal(&data[offset..block_at], &data[block_at..block_end], &data[block_end..offset + total])?;

        if show_frames {
            println!(
                "  {:>8}  {:>14}  {:>6}  {:>12}  {:>12}  {:>7}",
                stats.frames,
                offset,
                header.codec_id,
                human_bytes(u64::from(header.block_len)),
                human_bytes(u64::from(header.raw_len)),
                header.split_count()
            );
        }
        codec_id.get_or_insert(header.codec_id);
        stats.frames += 1;
        stats.raw_bytes += u64::from(header.raw_len);
        stats.encoded_bytes += total as u64;
        offset += total;
    }

    let codec_name = match codec_id {
        Some(id) => codec_by_id(id).map(|c| c.name().to_string()).unwrap_or_else(|_| format!("id {id}")),
        None => "-".to_string(),
    };
    println!();
    println!("  format       : block frames ({} framing)", policy.name());
    println!("  codec        : {}", codec_name);
    println!("  frames       : {}", stats.frames);
    println!("  raw size     : {}", human_bytes(stats.raw_bytes));
    println!("  ratio        : {:.2}x", stats.ratio());
    println!(
        "  overhead     : {} per frame",
        human_bytes((header_len + BLOCK_HEADER_SIZE + trailer_len) as u64)
    );
    if trailer_len == CHECKSUM_TRAILER_SIZE {
        println!("  checksums    : all {} verified", stats.frames);
    }
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Compress {
            input,
            output,
            codec,
            level,
            threads,
            framing,
            hardware,
            channels,
        } => run_compress(
            config,
            input,
            output,
            &codec,
            level,
            threads,
            parse_framing(framing.as_deref())?,
            hardware.as_deref(),
            channels,
        ),
        Commands::Decompress {
            input,
            output,
            framing,
        } => run_decompress(config, input, output, parse_framing(framing.as_deref())?),
        Commands::Inspect { file, framing, frames } => {
            run_inspect(file, parse_framing(framing.as_deref())?, frames)
        }
    }
}
