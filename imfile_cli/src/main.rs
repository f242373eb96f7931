use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use imfile_codecs::HybridRunner;
use imfile_core::{
    AccessMode, Context, Image, PixelFormat, Policy, ShellRunner, DEFAULT_PERMISSIONS,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "imtool",
    about = "Inspect, annotate and convert IM image files",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Compression method config (name:compress:decompress per line)
    #[arg(long, global = true, env = "IMAGE_COMPRESSION_FILE")]
    config: Option<PathBuf>,

    /// Allow `create` to overwrite an existing file
    #[arg(
        long,
        global = true,
        env = "IMAGE_CLOBBER",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    clobber: bool,

    /// Compress newly created images with this method index (non-numeric
    /// values select method 0)
    #[arg(long, global = true, env = "IMAGE_COMPRESS", value_parser = parse_method_index)]
    compress_method: Option<usize>,

    /// Store every updated image compressed when it is closed
    #[arg(
        long,
        global = true,
        env = "IMAGE_FORCE_COMPRESS",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    force_compress: bool,

    /// Store every updated image uncompressed when it is closed
    #[arg(
        long,
        global = true,
        env = "IMAGE_FORCE_UNCOMPRESS",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    force_uncompress: bool,

    /// Directory for uncompressed shadow files
    #[arg(long, global = true, env = "IMAGE_TEMPDIR")]
    temp_dir: Option<PathBuf>,

    /// Always run compression commands through the shell
    #[arg(long, global = true)]
    shell_only: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print pixel format, extents, statistics and compression state
    Header {
        file: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List info fields
    Info { file: PathBuf },
    /// Set an info field (an empty value removes it)
    SetInfo {
        file: PathBuf,
        name: String,
        value: String,
    },
    /// Remove an info field
    DelInfo { file: PathBuf, name: String },
    /// Replace the info fields of DEST with those of SOURCE
    CopyInfo { source: PathBuf, dest: PathBuf },
    /// Print the title, or replace it when TITLE is given
    Title { file: PathBuf, title: Option<String> },
    /// Recompute and store min/max (and optionally the histogram) of a Grey image
    Stats {
        file: PathBuf,
        #[arg(long)]
        histogram: bool,
    },
    /// Create an image with zeroed pixels
    Create {
        file: PathBuf,
        /// grey | color | colorpacked | byte | short | long | real | complex | userpacked
        #[arg(short, long, default_value = "grey")]
        format: PixelFormat,
        /// Extents, slowest dimension first, e.g. 4,5,6
        #[arg(short, long, value_delimiter = ',', required = true)]
        dims: Vec<usize>,
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Rewrite an image with its pixels compressed
    Compress {
        file: PathBuf,
        /// Method index (defaults to --compress-method, then 0)
        #[arg(short, long)]
        method: Option<usize>,
    },
    /// Rewrite an image with its pixels uncompressed
    Decompress { file: PathBuf },
    /// List the configured compression methods
    Methods,
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Method index from `--compress-method`/`IMAGE_COMPRESS`. Anything that is
/// not a number selects method 0.
fn parse_method_index(value: &str) -> Result<usize, std::convert::Infallible> {
    Ok(value.trim().parse().unwrap_or(0))
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "imtool=debug,imfile_core=debug,imfile_codecs=debug"
    } else {
        "imtool=info,imfile_core=info,imfile_codecs=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_context(args: &GlobalArgs, method_override: Option<usize>) -> Arc<Context> {
    let policy = Policy {
        clobber: args.clobber,
        compress_method: method_override.or(args.compress_method),
        force_compress: args.force_compress,
        force_decompress: args.force_uncompress,
        temp_dir: args.temp_dir.clone(),
    };
    let mut builder = Context::builder().policy(policy);
    if let Some(config) = &args.config {
        builder = builder.config_file(config);
    }
    builder = if args.shell_only {
        builder.runner(ShellRunner)
    } else {
        builder.runner(HybridRunner::default())
    };
    builder.build()
}

fn open(ctx: &Arc<Context>, file: &Path, mode: AccessMode) -> anyhow::Result<Image> {
    Image::open(ctx, file, mode).with_context(|| format!("opening image {:?}", file))
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

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_header(ctx: &Arc<Context>, file: PathBuf, json: bool) -> anyhow::Result<()> {
    let mut image = open(ctx, &file, AccessMode::Read)?;
    let header = image.header()?;
    let compression = image.compression_info();

    if json {
        let doc = serde_json::json!({
            "file": file,
            "title": image.title(),
            "header": header,
            "compression": compression,
            "byte_swap": image.byte_swap_required(),
            "source": image.source_format(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        let table = image.address_table();
        println!("=== IM image: {:?} ===", file);
        println!();
        println!("  title          : {}", image.title());
        println!("  pixel format   : {} (code {})", header.format, header.format.code());
        println!("  element size   : {}", header.element_size);
        println!("  extents        : {:?}", header.extents);
        println!("  pixel count    : {}", header.pixel_count);
        println!(
            "  pixel bytes    : {}",
            human_bytes(header.pixel_count * header.element_size as u64)
        );
        if let Some((min, max)) = header.max_min {
            println!("  min / max      : {} / {}", min, max);
        }
        println!("  byte swap      : {}", image.byte_swap_required());
        println!("  compressed     : {}", compression.compressed);
        if let Some(method) = compression.method {
            println!(
                "  method         : {} ({})",
                method,
                compression.method_name.as_deref().unwrap_or("unnamed")
            );
            println!("  ratio          : {:.3}", compression.ratio);
        }
        println!("  pixels offset  : {}", table.pixels);
        println!("  info offset    : {}", table.info);
        println!("  info fields    : {}", image.info_fields().len());
    }
    image.close()?;
    Ok(())
}

fn run_info(ctx: &Arc<Context>, file: PathBuf) -> anyhow::Result<()> {
    let image = open(ctx, &file, AccessMode::Read)?;
    for (name, value) in image.info_fields().iter() {
        println!("{} = {}", name, value);
    }
    image.close()?;
    Ok(())
}

fn run_set_info(ctx: &Arc<Context>, file: PathBuf, name: &str, value: &str) -> anyhow::Result<()> {
    let mut image = open(ctx, &file, AccessMode::Update)?;
    image.put_info(name, value)?;
    image.close()?;
    info!(field = name, "info field updated");
    Ok(())
}

fn run_del_info(ctx: &Arc<Context>, file: PathBuf, name: &str) -> anyhow::Result<()> {
    let mut image = open(ctx, &file, AccessMode::Update)?;
    let removed = image.remove_info(name)?;
    image.close()?;
    if !removed {
        anyhow::bail!("no info field named '{}'", name);
    }
    Ok(())
}

fn run_copy_info(ctx: &Arc<Context>, source: PathBuf, dest: PathBuf) -> anyhow::Result<()> {
    let src = open(ctx, &source, AccessMode::Read)?;
    let mut dst = open(ctx, &dest, AccessMode::Update)?;
    dst.copy_info_from(&src)?;
    dst.close()?;
    src.close()?;
    Ok(())
}

fn run_title(ctx: &Arc<Context>, file: PathBuf, title: Option<String>) -> anyhow::Result<()> {
    match title {
        Some(title) => {
            let mut image = open(ctx, &file, AccessMode::Update)?;
            image.set_title(&title)?;
            image.close()?;
        }
        None => {
            let image = open(ctx, &file, AccessMode::Read)?;
            println!("{}", image.title());
            image.close()?;
        }
    }
    Ok(())
}

fn run_stats(ctx: &Arc<Context>, file: PathBuf, histogram: bool) -> anyhow::Result<()> {
    let mut image = open(ctx, &file, AccessMode::Update)?;
    let (min, max) = image.max_min()?;
    println!("  min / max : {} / {}", min, max);
    if histogram {
        let buckets = image.histogram()?;
        for (i, count) in buckets.iter().enumerate().filter(|(_, c)| **c > 0) {
            println!("  {:>6} : {}", min + i as i32, count);
        }
    }
    image.close()?;
    Ok(())
}

fn run_create(
    ctx: &Arc<Context>,
    file: PathBuf,
    format: PixelFormat,
    dims: &[usize],
    title: Option<String>,
) -> anyhow::Result<()> {
    let mut image = Image::create(ctx, &file, DEFAULT_PERMISSIONS, format, dims)
        .with_context(|| format!("creating image {:?}", file))?;
    if let Some(title) = title {
        image.set_title(&title)?;
    }
    let compressed = image.is_compressed();
    let bytes = image.pixel_count() * image.element_size() as u64;
    image.close()?;

    eprintln!("  format      : {}", format);
    eprintln!("  extents     : {:?}", dims);
    eprintln!("  pixel bytes : {}", human_bytes(bytes));
    eprintln!("  compressed  : {}", compressed);
    Ok(())
}

fn run_compress(ctx: &Arc<Context>, file: PathBuf) -> anyhow::Result<()> {
    let before = std::fs::metadata(&file)?.len();
    let image = open(ctx, &file, AccessMode::Update)?;
    image.close_compressed()?;
    let after = std::fs::metadata(&file)?.len();

    let image = open(ctx, &file, AccessMode::Read)?;
    let compression = image.compression_info();
    image.close()?;

    eprintln!(
        "  method      : {} ({})",
        compression.method.unwrap_or_default(),
        compression.method_name.as_deref().unwrap_or("unnamed")
    );
    eprintln!("  file before : {}", human_bytes(before));
    eprintln!("  file after  : {}", human_bytes(after));
    eprintln!("  ratio       : {:.3}", compression.ratio);
    Ok(())
}

fn run_decompress(ctx: &Arc<Context>, file: PathBuf) -> anyhow::Result<()> {
    let before = std::fs::metadata(&file)?.len();
    let image = open(ctx, &file, AccessMode::Update)?;
    image.close_uncompressed()?;
    let after = std::fs::metadata(&file)?.len();

    eprintln!("  file before : {}", human_bytes(before));
    eprintln!("  file after  : {}", human_bytes(after));
    Ok(())
}

fn run_methods(ctx: &Arc<Context>) -> anyhow::Result<()> {
    let registry = ctx.registry()?;
    println!("  {:>5}  {:<12}  {:<32}  decompress", "index", "name", "compress");
    println!("  {}", "-".repeat(72));
    for (i, method) in registry.methods().iter().enumerate() {
        println!(
            "  {:>5}  {:<12}  {:<32}  {}",
            i, method.name, method.compress, method.decompress
        );
    }
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let method_override = match &cli.command {
        Commands::Compress { method, .. } => *method,
        _ => None,
    };
    let ctx = build_context(&cli.global, method_override);
    debug!(config = ?cli.global.config, "context ready");

    match cli.command {
        Commands::Header { file, json } => run_header(&ctx, file, json),
        Commands::Info { file } => run_info(&ctx, file),
        Commands::SetInfo { file, name, value } => run_set_info(&ctx, file, &name, &value),
        Commands::DelInfo { file, name } => run_del_info(&ctx, file, &name),
        Commands::CopyInfo { source, dest } => run_copy_info(&ctx, source, dest),
        Commands::Title { file, title } => run_title(&ctx, file, title),
        Commands::Stats { file, histogram } => run_stats(&ctx, file, histogram),
        Commands::Create {
            file,
            format,
            dims,
            title,
        } => run_create(&ctx, file, format, &dims, title),
        Commands::Compress { file, .. } => run_compress(&ctx, file),
        Commands::Decompress { file } => run_decompress(&ctx, file),
        Commands::Methods => run_methods(&ctx),
    }
}
