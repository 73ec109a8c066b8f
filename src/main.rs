use clap::{Args, Parser, Subcommand};
use docexport::{
    list_incomplete_runs, DownloadConfig, DownloadOrchestrator, ProgressReporter, RunResult,
    RunStatus, SqliteSource, StorageMode, StorageSettings, DEFAULT_PARALLEL,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "docexport")]
#[command(about = "Export a document library onto local disk, resuming interrupted runs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export a library, resuming its latest incomplete run if any
    Download {
        /// Library ID to export
        #[arg(short, long)]
        library: i64,

        /// Base directory holding run directories
        #[arg(short, long, default_value = "downloads")]
        output: PathBuf,

        #[command(flatten)]
        source: SourceArgs,
    },
    /// Continue a specific run directory
    Resume {
        /// Run directory holding download_progress.json
        #[arg(long)]
        run_dir: PathBuf,

        #[command(flatten)]
        source: SourceArgs,
    },
    /// List incomplete runs available for resume
    ListRuns {
        /// Base directory holding run directories
        #[arg(short, long, default_value = "downloads")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Path to the library SQLite database
    #[arg(short, long)]
    database: PathBuf,

    /// Number of documents reconstructed concurrently (1-10)
    #[arg(short, long, default_value_t = DEFAULT_PARALLEL as u8, value_parser = clap::value_parser!(u8).range(1..=10))]
    parallel: u8,

    /// Storage mode used when the database does not record one (database, filesystem)
    #[arg(long)]
    storage_mode: Option<StorageMode>,

    /// Root of filesystem chunk storage
    #[arg(long)]
    storage_root: Option<PathBuf>,
}

impl SourceArgs {
    fn config(&self, output_dir: PathBuf) -> DownloadConfig {
        let storage = match (self.storage_mode, &self.storage_root) {
            (Some(mode), root) => Some(StorageSettings {
                mode,
                root: root.clone(),
            }),
            (None, Some(root)) => Some(StorageSettings {
                mode: StorageMode::Filesystem,
                root: Some(root.clone()),
            }),
            (None, None) => None,
        };
        DownloadConfig {
            output_dir,
            storage,
        }
    }
}

/// Progress bar plus log lines printed above it.
struct ConsoleReporter {
    pb: indicatif::ProgressBar,
}

impl ConsoleReporter {
    fn new() -> Self {
        let pb = indicatif::ProgressBar::new(0);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("█▓▒░ "),
        );
        pb.set_message("📦 Exporting documents");
        Self { pb }
    }
}

impl ProgressReporter for ConsoleReporter {
    fn progress(&self, current: u64, total: u64) {
        self.pb.set_length(total);
        self.pb.set_position(current);
    }

    fn log(&self, message: &str) {
        self.pb.println(message);
    }
}

fn print_summary(result: &RunResult) {
    match result.status {
        RunStatus::NotFound => {
            eprintln!("❌ Library not found or deleted");
            return;
        }
        RunStatus::Completed => println!("✅ Export completed"),
        RunStatus::Cancelled => println!("⏸️  Export cancelled, partial progress saved"),
    }

    println!("   Documents: {}", result.total_documents);
    println!("   Exported:  {}", result.success_count);
    println!("   Skipped:   {}", result.skipped_count);
    println!("   Failed:    {}", result.failed_count);
    if result.resumed {
        println!("   Resumed a previous run");
    }
    if let Some(run_dir) = &result.run_dir {
        println!("   Output:    {}", run_dir.display());
    }
    let elapsed = std::time::Duration::from_secs(result.elapsed.as_secs());
    println!("   Elapsed:   {}", humantime::format_duration(elapsed));
    if result.status == RunStatus::Cancelled {
        println!("   Run the same command again to resume.");
    }
}

/// Cancels the token on Ctrl-C so in-flight documents finish cleanly.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing in-flight documents");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("docexport={}", log_level))
        .init();

    info!("🚀 docexport - document library exporter");

    let result = match cli.command {
        Command::ListRuns { output } => {
            let runs = list_incomplete_runs(&output).await;
            if runs.is_empty() {
                println!("No incomplete runs in {}", output.display());
            }
            for run in runs {
                println!(
                    "{}  library {} '{}'  {}/{} exported, {} failed, updated {}",
                    run.download_path.display(),
                    run.library_id,
                    run.library_name,
                    run.successful_documents.len(),
                    run.total_documents,
                    run.failed_documents.len(),
                    run.last_update_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
            return Ok(());
        }
        Command::Download {
            library,
            output,
            source,
        } => {
            let orchestrator = DownloadOrchestrator::new(
                SqliteSource::connect(&source.database).await?,
                source.config(output),
            );
            let reporter = ConsoleReporter::new();
            let result = orchestrator
                .run(library, source.parallel as usize, &reporter, cancel_on_ctrl_c())
                .await;
            reporter.pb.finish_and_clear();
            result?
        }
        Command::Resume { run_dir, source } => {
            let base_dir = run_dir.parent().map(PathBuf::from).unwrap_or_default();
            let orchestrator = DownloadOrchestrator::new(
                SqliteSource::connect(&source.database).await?,
                source.config(base_dir),
            );
            let reporter = ConsoleReporter::new();
            let result = orchestrator
                .resume(&run_dir, source.parallel as usize, &reporter, cancel_on_ctrl_c())
                .await;
            reporter.pb.finish_and_clear();
            result?
        }
    };

    print_summary(&result);
    if result.status == RunStatus::NotFound {
        std::process::exit(1);
    }
    Ok(())
}
