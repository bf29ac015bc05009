//! CLI binary for inkpress.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig` / `OptimizationProfile` / `BatchOptions`, writes the
//! outputs and prints a summary.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inkpress::pipeline::input::{
    load_input, resolve_inputs, CONVERT_EXTENSIONS, OPTIMIZE_EXTENSIONS,
};
use inkpress::{
    convert_batch, inspect, optimize_batch, write_output, BatchInput, BatchOptions,
    BatchProgressCallback, BatchReport, BitDepth, ConversionConfig, FileState, FileSummary,
    ImageArchiveRenderer, OptimizationProfile, Optimizer, Orientation, OutputArtifact,
    ProgressCallback, ZipArchiver,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar over files, one log line per finished file.
/// Files complete out of order, so every line carries the file name.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new(verb: &str) -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix(verb.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.reset_eta();
    }

    fn on_file_state(&self, _index: usize, name: &str, state: FileState) {
        if matches!(state, FileState::Rendering | FileState::Processing) {
            self.bar.set_message(name.to_string());
        }
    }

    fn on_page_complete(&self, _index: usize, page: usize, total_pages: usize) {
        self.bar.set_message(format!("page {page}/{total_pages}"));
    }

    fn on_file_complete(&self, _index: usize, name: &str, output_len: usize) {
        self.bar.println(format!(
            "  {} {:<40}  {}",
            green("✓"),
            name,
            dim(&format!("{output_len:>9} bytes")),
        ));
        self.bar.inc(1);
    }

    fn on_file_error(&self, _index: usize, name: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let first_line = error.lines().next().unwrap_or(error);
        let msg = if first_line.chars().count() > 80 {
            format!("{}\u{2026}", first_line.chars().take(79).collect::<String>())
        } else {
            first_line.to_string()
        };
        self.bar
            .println(format!("  {} {:<40}  {}", red("✗"), name, red(&msg)));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_files: usize, success_count: usize) {
        let failed = total_files.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} files done",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} files done  ({} failed)",
                if failed == total_files {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_files,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a folder of comics to 2-bit containers for the X4
  inkpress convert comics/ -o out/

  # 1-bit, landscape, stronger contrast through full dithering
  inkpress convert vol1.cbz -o out/ --bits 1 --orientation 90 --dither 1.0

  # Bundle every container into one zip and print a JSON report
  inkpress convert comics/ -o out/ --bundle out/all.zip --json

  # Optimize EPUBs for e-paper, keeping embedded fonts
  inkpress optimize library/ -o cleaned/ --recursive --keep-fonts

  # Optimize with a saved profile
  inkpress optimize book.epub -o cleaned/ --profile x4.json

  # Show the header, metadata and TOC of a container
  inkpress inspect out/vol1.xtch

ENVIRONMENT VARIABLES:
  INKPRESS_OUTPUT         Output directory
  INKPRESS_BITS           Container bit depth (1 or 2)
  INKPRESS_CONCURRENCY    Files processed at once
  INKPRESS_PROFILE        Optimization profile JSON file
  RUST_LOG                Override log filter (e.g. inkpress=debug)
"#;

/// Prepare books for e-ink readers.
#[derive(Parser, Debug)]
#[command(
    name = "inkpress",
    version,
    about = "Prepare books for e-ink readers: XTC/XTCH page containers and e-paper EPUBs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "INKPRESS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "INKPRESS_QUIET")]
    quiet: bool,

    /// Disable the progress bar.
    #[arg(long, global = true, env = "INKPRESS_NO_PROGRESS")]
    no_progress: bool,

    /// Print a JSON report on stdout.
    #[arg(long, global = true, env = "INKPRESS_JSON")]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render image packages (CBZ/ZIP) into XTC/XTCH page containers.
    Convert(ConvertArgs),
    /// Restructure EPUBs for small monochrome screens.
    Optimize(OptimizeArgs),
    /// Print header, metadata and table of contents of a container.
    Inspect {
        /// Container file (.xtc / .xtch).
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Input files or directories.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory to write outputs into.
    #[arg(short, long, env = "INKPRESS_OUTPUT", default_value = ".")]
    output: PathBuf,

    /// Descend into subdirectories of directory inputs.
    #[arg(short, long)]
    recursive: bool,

    /// Files processed at once.
    #[arg(short, long, env = "INKPRESS_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    #[command(flatten)]
    batch: BatchArgs,

    /// Bits per pixel: 1 (XTC) or 2 (XTCH).
    #[arg(long, env = "INKPRESS_BITS", default_value_t = 2,
          value_parser = clap::value_parser!(u8).range(1..=2))]
    bits: u8,

    /// Panel width in pixels.
    #[arg(long, env = "INKPRESS_WIDTH", default_value_t = 480)]
    width: u32,

    /// Panel height in pixels.
    #[arg(long, env = "INKPRESS_HEIGHT", default_value_t = 800)]
    height: u32,

    /// Rotation applied to rendered pages: 0, 90, 180 or 270.
    #[arg(long, env = "INKPRESS_ORIENTATION", default_value_t = 0)]
    orientation: u16,

    /// Error-diffusion strength, 0.0 (threshold) to 1.0.
    #[arg(long, env = "INKPRESS_DITHER", default_value_t = 1.0)]
    dither: f32,

    /// Invert output levels.
    #[arg(long, env = "INKPRESS_DARK_MODE")]
    dark_mode: bool,

    /// Blocking dither workers shared by all files (default: CPU count).
    #[arg(long, env = "INKPRESS_DITHER_WORKERS")]
    dither_workers: Option<usize>,

    /// Also pack every container into this zip file.
    #[arg(long)]
    bundle: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct OptimizeArgs {
    #[command(flatten)]
    batch: BatchArgs,

    /// Start from a JSON profile; flags below override it.
    #[arg(long, env = "INKPRESS_PROFILE")]
    profile: Option<PathBuf>,

    /// Keep embedded fonts and font-family declarations.
    #[arg(long)]
    keep_fonts: bool,

    /// Keep images in color.
    #[arg(long)]
    no_grayscale: bool,

    /// Longest image side in pixels.
    #[arg(long)]
    max_image_size: Option<u32>,

    /// JPEG re-encode quality (1–100).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: Option<u8>,

    /// Do not add the e-paper stylesheet.
    #[arg(long)]
    no_inject: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar gives the per-file feedback, so library INFO logs are
    // hidden while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Inspect { ref file } => run_inspect(file, cli.json).await,
        Command::Convert(ref args) => run_convert(args, &cli, show_progress).await,
        Command::Optimize(ref args) => run_optimize(args, &cli, show_progress).await,
    }
}

// ── Subcommands ──────────────────────────────────────────────────────────────

async fn run_inspect(file: &Path, json: bool) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let summary = inspect(&bytes).context("Failed to inspect container")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
        );
        return Ok(());
    }

    let h = &summary.header;
    println!("File:         {}", file.display());
    println!("Title:        {}", summary.metadata.title);
    println!("Author:       {}", summary.metadata.author);
    println!("Format:       {}-bit, version {}", h.bit_depth, h.version);
    println!("Panel:        {}x{} @ {}°", h.width, h.height, h.orientation_degrees);
    println!("Pages:        {}", summary.page_count);
    println!("Size:         {} bytes", summary.file_size);
    println!("Chapters:     {}", summary.chapters.len());
    for chapter in &summary.chapters {
        println!("  {:>5}  {}", chapter.start_page + 1, chapter.title);
    }
    Ok(())
}

async fn run_convert(args: &ConvertArgs, cli: &Cli, show_progress: bool) -> Result<()> {
    let orientation = Orientation::from_degrees(args.orientation)
        .with_context(|| format!("Orientation must be 0, 90, 180 or 270 (got {})", args.orientation))?;
    let bit_depth = BitDepth::from_bits(args.bits)
        .with_context(|| format!("Bit depth must be 1 or 2 (got {})", args.bits))?;
    let config = ConversionConfig::builder()
        .dimensions(args.width, args.height)
        .orientation(orientation)
        .bit_depth(bit_depth)
        .dither_strength(args.dither)
        .dark_mode(args.dark_mode)
        .build()
        .context("Invalid configuration")?;

    let (inputs, load_failures) = load_inputs(&args.batch, CONVERT_EXTENSIONS).await?;
    let progress = progress_callback(show_progress, "Converting");
    let mut options = BatchOptions::builder().concurrency(args.batch.concurrency);
    if let Some(n) = args.dither_workers {
        options = options.dither_workers(n);
    }
    if let Some(cb) = progress {
        options = options.progress_callback(cb);
    }
    let options = options.build().context("Invalid configuration")?;

    let report = convert_batch(inputs, Arc::new(ImageArchiveRenderer), &config, &options).await;
    write_outputs(&report, &args.batch.output).await?;

    if let Some(ref bundle) = args.bundle {
        let bytes = report
            .bundle(&ZipArchiver)
            .context("Failed to assemble bundle")?;
        tokio::fs::write(bundle, bytes)
            .await
            .with_context(|| format!("Failed to write {}", bundle.display()))?;
    }

    finish(&report, load_failures, cli)
}

async fn run_optimize(args: &OptimizeArgs, cli: &Cli, show_progress: bool) -> Result<()> {
    let profile = build_profile(args).await?;
    let (inputs, load_failures) = load_inputs(&args.batch, OPTIMIZE_EXTENSIONS).await?;

    let mut options = BatchOptions::builder().concurrency(args.batch.concurrency);
    if let Some(cb) = progress_callback(show_progress, "Optimizing") {
        options = options.progress_callback(cb);
    }
    let options = options.build().context("Invalid configuration")?;

    let optimizer = Optimizer::new(profile);
    let report = optimize_batch(inputs, &optimizer, &options).await;
    write_outputs(&report, &args.batch.output).await?;

    if !cli.quiet && !cli.json {
        for file in report.outputs() {
            let r = &file.report;
            eprintln!(
                "   {}  fonts -{}  css {} ({} decl.)  images {}/{}  {}",
                dim(&file.name),
                r.fonts_removed,
                r.stylesheets_sanitized,
                r.declarations_dropped,
                r.images_converted,
                r.images_resized,
                if r.warnings.is_empty() {
                    String::new()
                } else {
                    cyan(&format!("{} warnings", r.warnings.len()))
                },
            );
        }
    }

    finish(&report, load_failures, cli)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Map optimize flags onto a profile, starting from `--profile` when given.
async fn build_profile(args: &OptimizeArgs) -> Result<OptimizationProfile> {
    let base = match args.profile {
        Some(ref path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read profile from {:?}", path))?;
            OptimizationProfile::from_json(&json).context("Invalid profile")?
        }
        None => OptimizationProfile::default(),
    };

    OptimizationProfile::builder()
        .css(base.css)
        .strip_fonts(base.strip_fonts && !args.keep_fonts)
        .grayscale(base.grayscale && !args.no_grayscale)
        .max_image_dimension(args.max_image_size.unwrap_or(base.max_image_dimension))
        .jpeg_quality(args.quality.unwrap_or(base.jpeg_quality))
        .contrast_boost(base.contrast_boost)
        .inject_stylesheet(base.inject_stylesheet && !args.no_inject)
        .build()
        .context("Invalid profile")
}

/// Resolve and read every input. Unreadable files are reported and skipped
/// so the rest of the batch still runs.
async fn load_inputs(
    args: &BatchArgs,
    extensions: &[&str],
) -> Result<(Vec<BatchInput>, Vec<FileSummary>)> {
    let paths = resolve_inputs(&args.inputs, extensions, args.recursive)
        .context("Failed to resolve inputs")?;
    if paths.is_empty() {
        bail!("No input files found (expected {})", extensions.join(", "));
    }

    let mut inputs = Vec::with_capacity(paths.len());
    let mut failures = Vec::new();
    for (index, path) in paths.iter().enumerate() {
        match load_input(path).await {
            Ok(input) => inputs.push(input),
            Err(e) => {
                eprintln!("{} {}", red("✗"), e);
                failures.push(FileSummary {
                    index,
                    input: path.display().to_string(),
                    state: FileState::Failed,
                    output: None,
                    bytes: None,
                    error_kind: Some(e.kind()),
                    error: Some(e.to_string()),
                });
            }
        }
    }
    Ok((inputs, failures))
}

fn progress_callback(show: bool, verb: &str) -> Option<ProgressCallback> {
    show.then(|| CliProgressCallback::new(verb) as Arc<dyn BatchProgressCallback>)
}

async fn write_outputs<T: OutputArtifact>(report: &BatchReport<T>, dir: &Path) -> Result<()> {
    for artifact in report.outputs() {
        write_output(dir, artifact)
            .await
            .context("Failed to write output")?;
    }
    Ok(())
}

/// Print the summary (JSON or text) and fail when any file failed.
fn finish<T: OutputArtifact>(
    report: &BatchReport<T>,
    load_failures: Vec<FileSummary>,
    cli: &Cli,
) -> Result<()> {
    let failed = report.stats.failed + load_failures.len();

    if cli.json {
        let mut files = report.summaries();
        files.extend(load_failures);
        let json = serde_json::json!({
            "stats": report.stats,
            "files": files,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        eprintln!(
            "   {}/{} files in {}ms",
            report.stats.completed,
            report.stats.total_files + load_failures.len(),
            report.stats.duration_ms
        );
    }

    if failed > 0 {
        bail!("{failed} file(s) failed");
    }
    Ok(())
}
