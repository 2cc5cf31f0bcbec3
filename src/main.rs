use clap::{ArgAction, Parser, Subcommand};
use lzextract::codec::LzopCodec;
use lzextract::{
    Codec, CodecRegistry, ContainerType, DigestSink, DirectorySink, ExtractOptions,
    Extractor, FailurePolicy, FileSource, LzopHeader, LzopOptions, LzopReader,
};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lzx", about = "Streaming restore of compressed tar archives")]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace).  RUST_LOG also works.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract one or more archives into a directory
    Extract {
        #[arg(required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Archives extracted at once (needs the `parallel` feature)
        #[arg(short, long, default_value = "1")]
        jobs: usize,
        /// Stop starting new archives after the first failure
        #[arg(long)]
        abort_on_error: bool,
        /// Container type for every input instead of guessing from the
        /// extension: plain, lzop, lz4, zstd, brotli, lzma
        #[arg(short = 't', long = "type")]
        container: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a BLAKE3 digest for every entry without writing anything
    List {
        #[arg(required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
        #[arg(short = 't', long = "type")]
        container: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Compress a file (usually a tar) into a single container
    Compress {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// lzop block size in KiB
        #[arg(long, default_value = "256")]
        block_size: usize,
        /// Codec: lzop (default), lz4, zstd, brotli, lzma, plain
        #[arg(short, long, default_value = "lzop")]
        codec: String,
    },
    /// Show the header of an .lzo file
    Info {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { inputs, output_dir, jobs, abort_on_error, container, json } => {
            let sources = build_sources(&inputs, container.as_deref())?;
            let options = ExtractOptions {
                concurrency:    jobs.max(1),
                failure_policy: if abort_on_error { FailurePolicy::AbortOnFirst } else { FailurePolicy::BestEffort },
                ..ExtractOptions::default()
            };
            let sink = DirectorySink::new(&output_dir);
            let report = Extractor::new(CodecRegistry::default(), options).run(&sink, &sources);

            if json {
                println!("{}", serde_json::to_string_pretty(&report.summary())?);
            } else {
                for s in &report.sources {
                    println!("  {:<40} {:>6} {:>8} entries {:>14} B", s.path, s.container.name(), s.entries, s.bytes);
                }
                for path in &report.skipped {
                    println!("  {:<40} skipped", path);
                }
                println!("Extracted {} entries to {}", report.entries(), output_dir.display());
            }
            report.into_result()?;
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { inputs, container, json } => {
            let sources = build_sources(&inputs, container.as_deref())?;
            let sink = DigestSink::new();
            let report = Extractor::default().run(&sink, &sources);
            let digests = sink.into_digests();

            if json {
                println!("{}", serde_json::to_string_pretty(&digests)?);
            } else {
                for d in &digests {
                    println!("{}  {:>12}  {}:{}", d.hex(), d.size, d.source, d.name);
                }
            }
            report.into_result()?;
        }

        // ── Compress ─────────────────────────────────────────────────────────
        Commands::Compress { input, output, block_size, codec } => {
            let container = ContainerType::from_name(&codec)
                .ok_or_else(|| format!("unknown codec '{}'", codec))?;
            let codec: Arc<dyn Codec> = match container {
                ContainerType::Lzop => Arc::new(LzopCodec { options: lzop_options(&input, block_size)? }),
                other => CodecRegistry::default().lookup(other)?,
            };

            let mut src = BufReader::new(File::open(&input)?);
            let n = match compress_file(codec.as_ref(), &mut src, &output) {
                Ok(n) => n,
                Err(e) => {
                    if let Err(rm) = std::fs::remove_file(&output) {
                        tracing::debug!(error = %rm, path = %output.display(), "could not remove partial output");
                    }
                    return Err(e);
                }
            };

            let packed = std::fs::metadata(&output)?.len();
            println!("Compressed {} → {} ({} → {} bytes, {})",
                     input.display(), output.display(), n, packed, container);
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let mut reader = LzopReader::new(BufReader::new(File::open(&input)?));
            let header: LzopHeader = reader.read_header()?.clone();
            let plain = io::copy(&mut reader, &mut io::sink())?;

            let mtime = chrono::DateTime::<chrono::Utc>::from_timestamp(header.mtime as i64, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| header.mtime.to_string());

            println!("── lzop file ───────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Name           {}", header.name_lossy());
            println!("  Version        {:#06x} (lib {:#06x}, needs {:#06x})",
                     header.version, header.lib_version, header.version_needed);
            println!("  Method         {} (level {})", header.method_name(), header.level);
            println!("  Flags          {:#010x}", header.flags);
            println!("  Mode           {:o}", header.mode);
            println!("  Modified       {}", mtime);
            println!("  Blocks         {}", reader.blocks_read);
            println!("  Plain size     {} B", plain);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(io::stderr)
        .init();
}

fn build_sources(inputs: &[PathBuf], container: Option<&str>) -> Result<Vec<FileSource>, Box<dyn std::error::Error>> {
    let forced = match container {
        Some(name) => Some(ContainerType::from_name(name).ok_or_else(|| format!("unknown container type '{}'", name))?),
        None => None,
    };
    inputs
        .iter()
        .map(|path| match forced {
            Some(t) => Ok(FileSource::with_type(path, t)),
            None => FileSource::new(path).map_err(Into::into),
        })
        .collect()
}

/// Compress into a fresh `output`.  The caller removes it on error.
fn compress_file(codec: &dyn Codec, src: &mut dyn io::Read, output: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    let mut dst = BufWriter::new(File::create(output)?);
    let n = codec.compress_stream(src, &mut dst)?;
    dst.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(n)
}

fn lzop_options(input: &Path, block_size_kib: usize) -> io::Result<LzopOptions> {
    let meta = std::fs::metadata(input)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(LzopOptions {
        block_size: block_size_kib.max(1) * 1024,
        name:       input.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        mode:       file_mode(&meta),
        mtime,
        ..LzopOptions::default()
    })
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    lzextract::io_stream::DEFAULT_MODE
}
