use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::info;
use photo_hub::config::AppConfig;
use photo_hub::jobs::{self, ScanRequest, ScanStatus, TaskStore};
use photo_hub::store::Store;
use photo_hub::stores::sqlite::SqliteStore;
use photo_hub::web_server;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "photo-hub", version, about = "Index, describe and search a photo library")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default).
    Serve,
    /// Scan a directory and analyze every photo found.
    Scan {
        directory: String,
        /// en, zh or auto; defaults to the configured language.
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        no_recursive: bool,
        /// Re-analyze photos that already have a result for the model.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Keyword search over descriptions and tags.
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Stats,
    /// List groups of files with identical content.
    Duplicates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new()?;

    env_logger::Builder::new()
        .filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    info!("Starting photo-hub with model {}", config.model);
    let store = Arc::new(SqliteStore::open(&config.db_path).await?);
    let config = Arc::new(config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            web_server::start_web_server(config, store).await?;
        }
        Command::Scan {
            directory,
            language,
            no_recursive,
            force,
            max_concurrent,
            batch_size,
        } => {
            let request = ScanRequest {
                directory,
                recursive: config.recursive && !no_recursive,
                skip_existing: config.skip_existing && !force,
                language: language.unwrap_or_else(|| config.language.clone()),
                max_concurrent,
                batch_size,
            };
            run_scan(config, store, request).await?;
        }
        Command::Search { query, limit } => {
            let hits = store.search(&query, limit).await?;
            if hits.is_empty() {
                println!("No photos match {:?}", query);
            }
            for hit in hits {
                println!("{} [{}]", hit.path, hit.llm_model);
                println!("    {}", hit.description);
                if !hit.tags.is_empty() {
                    println!("    tags: {}", hit.tags.join(", "));
                }
            }
        }
        Command::Stats => {
            let stats = store.stats().await?;
            println!("photos:    {}", stats.total_photos);
            println!("analyses:  {}", stats.total_analyses);
            println!("models:    {}", stats.models_used);
        }
        Command::Duplicates => {
            let groups = store.find_duplicates().await?;
            if groups.is_empty() {
                println!("No duplicates found");
            }
            for (i, group) in groups.iter().enumerate() {
                println!("Group {} ({} files):", i + 1, group.len());
                for path in group {
                    println!("    {}", path);
                }
            }
        }
    }

    info!("photo-hub finished");
    Ok(())
}

async fn run_scan(
    config: Arc<AppConfig>,
    store: Arc<SqliteStore>,
    request: ScanRequest,
) -> Result<()> {
    let tasks = Arc::new(TaskStore::new(config.task_retention.clone()));
    let task_id = tasks.create(request).task_id;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, finishing in-flight work");
            on_interrupt.cancel();
        }
    });

    jobs::run_scan_job(config, store, tasks.clone(), task_id, cancel).await;

    let Some(task) = tasks.get(&task_id) else {
        bail!("scan task {} disappeared", task_id);
    };
    if task.status == ScanStatus::Error {
        bail!(task.error_message.unwrap_or_else(|| "scan failed".into()));
    }
    println!(
        "Scanned {} photos: {} analyzed, {} failed, {} skipped",
        task.total_files, task.successful_analyses, task.failed_analyses, task.skipped_files
    );
    Ok(())
}
