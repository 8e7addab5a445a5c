//! CLI entry point for `threadline`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use threadline::config::{self, Config};
use threadline::model::raw::load_records;
use threadline::pipeline::ProgressFn;
use threadline::{export, AttachmentStore, CancelToken, Engine, RunOutput, RunSummary};

/// Evidence threading and deduplication for email archives.
#[derive(Parser)]
#[command(name = "threadline", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Thread and deduplicate a JSON Lines batch, writing the output tables
    Run {
        /// Upstream records, one JSON object per line
        input: PathBuf,
        /// Output directory (must not exist)
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Process a batch and print statistics without writing anything
    Stats {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the standard location
        #[arg(long)]
        save: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Run { input, output } => cmd_run(&input, &output, config),
        Commands::Stats { input, json } => cmd_stats(&input, json, config),
        Commands::Config { save } => cmd_config(&config, save),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_path = config::log_file_path(config);
    let log_dir = log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "threadline.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "threadline", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn cmd_config(config: &Config, save: bool) -> anyhow::Result<()> {
    config.validate()?;
    print!("{}", toml::to_string_pretty(config)?);
    if save {
        config::save_config(config)?;
        if let Some(path) = config::config_file_path() {
            eprintln!("  Saved to {}", path.display());
        }
    }
    Ok(())
}

/// Run the engine over a file of records, showing progress.
fn process(input: &Path, config: Config) -> anyhow::Result<(AttachmentStore, RunOutput, Duration)> {
    if !input.exists() {
        anyhow::bail!("File not found: {}", input.display());
    }
    let engine = Engine::new(config)?;
    let records = load_records(input)?;

    let pb = ProgressBar::new(records.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Canonicalizing [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let store = engine.new_store();
    let progress: &ProgressFn<'_> = &|current, total| {
        pb.set_length(total);
        pb.set_position(current);
    };
    let output = engine.run_with_store(records, &store, &CancelToken::new(), Some(progress))?;
    pb.finish_and_clear();

    Ok((store, output, start.elapsed()))
}

/// Thread a batch and write every output table.
fn cmd_run(input: &Path, output_dir: &Path, config: Config) -> anyhow::Result<()> {
    let (store, output, elapsed) = process(input, config)?;
    export::write_run(&output, &store, output_dir)?;
    print_summary_table(input, &output.summary(), elapsed);
    println!("  {:<22} {}", "Output", output_dir.display());
    println!();
    Ok(())
}

/// Show statistics for a batch.
fn cmd_stats(input: &Path, json: bool, config: Config) -> anyhow::Result<()> {
    let (_store, output, elapsed) = process(input, config)?;
    let summary = output.summary();
    if json {
        let stats = serde_json::json!({
            "file": input.to_string_lossy(),
            "processing_time_ms": elapsed.as_millis(),
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_summary_table(input, &summary, elapsed);
    }
    Ok(())
}

/// Print a run summary in a human-readable table.
fn print_summary_table(input: &Path, s: &RunSummary, elapsed: Duration) {
    use humansize::{format_size, BINARY};

    println!();
    println!("  {:<22} {}", "File", input.display());
    println!("  {:<22} {}", "Run", s.run_id);
    println!("  {:<22} {} ({})", "Ruleset", s.ruleset_version, &s.ruleset_hash.to_hex()[..12]);
    println!("  {:<22} {}", "Messages", s.messages);
    println!("  {:<22} {}", "Threads", s.thread_groups);
    println!("  {:<22} {}", "Thread links", s.thread_links);
    println!(
        "  {:<22} {} ({:.1}%)",
        "Inclusive",
        s.inclusive_messages,
        if s.messages == 0 {
            0.0
        } else {
            s.inclusive_messages as f64 / s.messages as f64 * 100.0
        }
    );
    println!("  {:<22} {}", "Near-dup groups", s.near_dup_groups);
    println!(
        "  {:<22} {} unique, {} references, {}",
        "Attachments",
        s.attachments,
        s.attachment_references,
        format_size(s.attachment_bytes, BINARY)
    );
    println!("  {:<22} {:.2?}", "Processing time", elapsed);

    if !s.anomalies.is_empty() {
        println!();
        println!("  Anomalies:");
        for (kind, count) in &s.anomalies {
            println!("    {count:>6}  {kind}");
        }
    }
    println!();
}
