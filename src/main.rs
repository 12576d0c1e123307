use bill_intake::config::Config;
use bill_intake::cache::CacheService;
use bill_intake::clean::{TextCleaner, extract_key_values};
use bill_intake::jobs::{JobQueue, JobRegistry};
use bill_intake::llm::{ChatClient, CompletionClient};
use bill_intake::normalize::{Normalizer, detect_file_type};
use bill_intake::patterns::PatternExtractor;
use bill_intake::pipeline::Pipeline;
use bill_intake::reconcile;
use bill_intake::store::{Store, files};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bill-intake", about = "Extract and reconcile utility bills")]
struct Cli {
    /// TOML config; defaults apply when the file is missing
    #[arg(long, global = true, default_value = "bill_intake.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register files with a project and process them in the background
    Process {
        #[arg(long)]
        project: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run the regex pass on one file and print it with diagnostics; no LLM, no database
    Extract { file: PathBuf },
    /// Merge duplicate accounts and meters within a project
    Merge {
        #[arg(long)]
        project: String,
    },
    /// Drop cached extractions produced by a bill file
    Invalidate { file_id: i64 },
}

fn llm_client(cfg: &Config) -> Option<Arc<dyn CompletionClient>> {
    match ChatClient::from_config(&cfg.llm) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "LLM disabled, only regex extraction will run");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load_or_default(&cli.config)?;

    if let Command::Extract { file } = &cli.command {
        let detected = detect_file_type(file, cfg.normalizer.min_native_chars);
        let doc = Normalizer::new(cfg.normalizer.clone()).normalize(file)?;
        let cleaned = TextCleaner::new(cfg.cleaner.clone()).clean(&doc.text);
        let result = PatternExtractor::new(cfg.extraction.electric_success_threshold).extract(&cleaned.text);
        info!(?detected, method = doc.method.as_str(), chars = doc.char_count, success = result.success, "Regex pass finished");
        let report = json!({
            "detected_type": detected,
            "method": doc.method.as_str(),
            "cleaning": cleaned.stats,
            "key_values": extract_key_values(&doc.text),
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let store = Arc::new(Store::open(&cfg.storage.db_path)?);
    match cli.command {
        Command::Process { project, files: paths } => {
            let pipeline = Arc::new(Pipeline::new(&cfg, store.clone(), llm_client(&cfg)));
            let queue = JobQueue::new(Arc::new(JobRegistry::new()), cfg.jobs.max_workers)
                .with_retention(Duration::from_secs(cfg.jobs.retention_secs));

            for path in paths {
                let size = std::fs::metadata(&path).map(|m| m.len() as i64).unwrap_or(0);
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let file_id = store.with_conn(|conn| {
                    files::register_file(conn, &project, &filename, &path.to_string_lossy(), size)
                })?;
                pipeline.submit(&queue, file_id)?;
                info!(file_id, %filename, "Queued");
            }

            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            while queue.active_count() > 0 {
                ticker.tick().await;
                for status in queue.all_statuses().iter().filter(|s| !s.state.is_terminal()) {
                    debug!(file_id = status.file_id, progress = status.progress, message = ?status.message, "Polling");
                }
            }
            queue.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&queue.all_statuses())?);
        }
        Command::Extract { .. } => {}
        Command::Merge { project } => {
            let report = reconcile::merge_duplicates(&store, &project)?;
            info!(
                accounts_merged = report.accounts_merged,
                meters_merged = report.meters_merged,
                empty_accounts_removed = report.empty_accounts_removed,
                "Merge finished"
            );
        }
        Command::Invalidate { file_id } => {
            if !CacheService::new(store).invalidate(file_id) {
                warn!(file_id, "cache invalidation failed");
            }
        }
    }

    Ok(())
}
