use crate::analyzer::Analyzer;
use crate::analyzers::create_analyzer;
use crate::config::{AppConfig, TaskRetentionConfig};
use crate::error::AppError;
use crate::metadata::{Language, PhotoIdentity, PhotoMetadata};
use crate::pipeline::{BatchScheduler, ProgressEvent};
use crate::processor;
use crate::store::Store;
use crate::stores::batched::BatchStore;
use crate::stores::sqlite::SqliteStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const PROGRESS_SCANNING: f64 = 0.1;
const PROGRESS_ANALYZING: f64 = 0.2;

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub directory: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl ScanRequest {
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            recursive: true,
            skip_existing: true,
            language: default_language(),
            max_concurrent: None,
            batch_size: None,
        }
    }

    /// Scheduler for this request, with unset limits taken from `config`.
    pub fn scheduler(&self, config: &AppConfig) -> Result<BatchScheduler, AppError> {
        Ok(BatchScheduler::new(
            self.max_concurrent.unwrap_or(config.max_concurrent),
            self.batch_size.unwrap_or(config.batch_size),
        )?
        .with_deadline(config.run_deadline_secs.map(Duration::from_secs)))
    }

    /// Prompt language; an empty or `auto` request defers to `config.language`.
    pub fn prompt_language(&self, config: &AppConfig) -> Language {
        if self.language.trim().is_empty() {
            return Language::normalize(&config.language);
        }
        match Language::normalize(&self.language) {
            Language::Auto => Language::normalize(&config.language),
            language => language,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Scanning,
    Analyzing,
    Completed,
    Error,
}

impl ScanStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Error)
    }
}

/// Status of one scan run as exposed to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ScanTask {
    pub task_id: Uuid,
    pub status: ScanStatus,
    pub progress: f64,
    pub current_file: Option<String>,
    pub total_files: usize,
    pub processed_files: usize,
    pub successful_analyses: usize,
    pub failed_analyses: usize,
    pub skipped_files: usize,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub request: ScanRequest,
}

impl ScanTask {
    fn new(request: ScanRequest) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            status: ScanStatus::Pending,
            progress: 0.0,
            current_file: None,
            total_files: 0,
            processed_files: 0,
            successful_analyses: 0,
            failed_analyses: 0,
            skipped_files: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            request,
        }
    }
}

struct Entry {
    seq: u64,
    task: ScanTask,
}

#[derive(Default)]
struct Registry {
    next_seq: u64,
    entries: HashMap<Uuid, Entry>,
}

/// Scan tasks keyed by id, bounded in count and age.
///
/// Finished tasks older than `max_age_secs` are dropped, and when more than
/// `max_tasks` remain the oldest finished ones go first, then the oldest
/// overall.
pub struct TaskStore {
    retention: TaskRetentionConfig,
    registry: Mutex<Registry>,
}

impl TaskStore {
    pub fn new(retention: TaskRetentionConfig) -> Self {
        Self {
            retention,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create(&self, request: ScanRequest) -> ScanTask {
        let task = ScanTask::new(request);
        let mut registry = self.registry();
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.entries.insert(
            task.task_id,
            Entry {
                seq,
                task: task.clone(),
            },
        );
        self.prune(&mut registry, Utc::now(), Some(task.task_id));
        task
    }

    pub fn get(&self, task_id: &Uuid) -> Option<ScanTask> {
        self.registry()
            .entries
            .get(task_id)
            .map(|entry| entry.task.clone())
    }

    /// Applies `f` to the task; false when it no longer exists.
    pub fn update<F>(&self, task_id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut ScanTask),
    {
        match self.registry().entries.get_mut(task_id) {
            Some(entry) => {
                f(&mut entry.task);
                true
            }
            None => false,
        }
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Vec<ScanTask> {
        let mut registry = self.registry();
        self.prune(&mut registry, Utc::now(), None);
        let mut entries: Vec<&Entry> = registry.entries.values().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, registry: &mut Registry, now: DateTime<Utc>, keep: Option<Uuid>) {
        let max_age = ChronoDuration::seconds(self.retention.max_age_secs as i64);
        registry.entries.retain(|_, entry| match entry.task.completed_at {
            Some(done) if entry.task.status.is_finished() => now - done <= max_age,
            _ => true,
        });

        while registry.entries.len() > self.retention.max_tasks {
            let victim = registry
                .entries
                .iter()
                .filter(|(id, _)| Some(**id) != keep)
                .min_by_key(|(_, entry)| (!entry.task.status.is_finished(), entry.seq))
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    log::debug!("Evicting scan task {}", id);
                    registry.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Counts reported by a finished scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub total_files: usize,
    pub analyzed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Runs a whole scan and leaves the task in `Completed` or `Error`.
pub async fn run_scan_job(
    config: Arc<AppConfig>,
    store: Arc<SqliteStore>,
    tasks: Arc<TaskStore>,
    task_id: Uuid,
    cancel: CancellationToken,
) {
    let outcome = match create_analyzer(&config) {
        Ok(analyzer) => {
            execute_scan(&config, store, analyzer.as_ref(), &tasks, task_id, &cancel).await
        }
        Err(e) => Err(e),
    };
    finish_task(&tasks, task_id, outcome);
}

pub fn finish_task(tasks: &TaskStore, task_id: Uuid, outcome: Result<ScanReport, AppError>) {
    let updated = tasks.update(&task_id, |task| {
        task.completed_at = Some(Utc::now());
        task.current_file = None;
        match &outcome {
            Ok(_) => {
                task.status = ScanStatus::Completed;
                task.progress = 1.0;
            }
            Err(e) => {
                task.status = ScanStatus::Error;
                task.error_message = Some(e.to_string());
            }
        }
    });
    match outcome {
        Ok(report) => log::info!("Scan task {} completed: {:?}", task_id, report),
        Err(e) => log::error!("Scan task {} failed: {}", task_id, e),
    }
    if !updated {
        log::warn!("Scan task {} was evicted before it finished", task_id);
    }
}

/// Scans the requested directory, saves photo metadata and analyzes every
/// photo that still needs it with `analyzer`.
pub async fn execute_scan(
    config: &AppConfig,
    store: Arc<SqliteStore>,
    analyzer: &dyn Analyzer,
    tasks: &TaskStore,
    task_id: Uuid,
    cancel: &CancellationToken,
) -> Result<ScanReport, AppError> {
    let request = tasks
        .get(&task_id)
        .map(|task| task.request)
        .ok_or_else(|| AppError::NotFound(format!("scan task {}", task_id)))?;
    let scheduler = request.scheduler(config)?;
    let root = PathBuf::from(&request.directory);
    if !root.is_dir() {
        return Err(AppError::InvalidRequest(format!(
            "directory not found: {}",
            request.directory
        )));
    }

    tasks.update(&task_id, |task| {
        task.status = ScanStatus::Scanning;
        task.progress = PROGRESS_SCANNING;
    });
    let (photos, scan_stats) = scan_directory(config, &root, request.recursive).await?;
    log::info!("Found {} photos in {}", photos.len(), request.directory);

    for photo in &photos {
        if let Err(e) = store.save_photo(photo).await {
            log::error!("Failed to save metadata for {}: {}", photo.path, e);
        }
    }

    let mut pending: Vec<PhotoIdentity> = Vec::with_capacity(photos.len());
    let mut already_analyzed = 0;
    for photo in photos {
        if request.skip_existing
            && store.get_existing(&photo.path, analyzer.model()).await?.is_some()
        {
            log::debug!("Skipping already analyzed photo {}", photo.path);
            already_analyzed += 1;
        } else {
            pending.push(photo.path);
        }
    }

    let total_files = pending.len();
    let skipped = scan_stats.skipped + already_analyzed;
    tasks.update(&task_id, |task| {
        task.status = ScanStatus::Analyzing;
        task.progress = PROGRESS_ANALYZING;
        task.total_files = total_files;
        task.skipped_files = skipped;
    });

    let batch_store = BatchStore::new(store, config.store_batch_size);
    let on_item = |event: &ProgressEvent| {
        tasks.update(&task_id, |task| {
            task.processed_files = event.processed;
            if event.succeeded {
                task.successful_analyses += 1;
            } else {
                task.failed_analyses += 1;
            }
            task.current_file = Some(event.identity.clone());
            task.progress = analyzing_progress(event.processed, total_files);
        });
    };

    let run = scheduler
        .run(
            analyzer,
            &pending,
            request.prompt_language(config),
            Some(&batch_store),
            &on_item,
            cancel,
        )
        .await;
    // Results already produced are kept even when the run aborts.
    batch_store.flush().await?;
    let summary = run?;

    Ok(ScanReport {
        total_files,
        analyzed: summary.processed,
        successful: summary.succeeded,
        failed: summary.failures.len(),
        skipped,
    })
}

fn analyzing_progress(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return PROGRESS_ANALYZING + 0.8;
    }
    PROGRESS_ANALYZING + 0.8 * (processed as f64 / total as f64)
}

async fn scan_directory(
    config: &AppConfig,
    root: &Path,
    recursive: bool,
) -> Result<(Vec<PhotoMetadata>, processor::ScanStats), AppError> {
    let root = root.to_path_buf();
    let extensions = config.allowed_extensions.clone();
    tokio::task::spawn_blocking(move || processor::scan_photos(&root, recursive, &extensions))
        .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retention(max_tasks: usize, max_age_secs: u64) -> TaskRetentionConfig {
        TaskRetentionConfig {
            max_tasks,
            max_age_secs,
        }
    }

    fn finish(tasks: &TaskStore, id: Uuid) {
        tasks.update(&id, |t| {
            t.status = ScanStatus::Completed;
            t.completed_at = Some(Utc::now());
        });
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: ScanRequest = serde_json::from_str(r#"{"directory": "/photos"}"#).unwrap();
        assert!(request.recursive);
        assert!(request.skip_existing);
        assert_eq!(request.language, "auto");
        assert_eq!(request.max_concurrent, None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ScanStatus::Analyzing).unwrap(), "\"analyzing\"");
    }

    #[test]
    fn test_list_is_newest_first_and_limited() {
        let tasks = TaskStore::new(retention(10, 3600));
        let ids: Vec<Uuid> = (0..4)
            .map(|i| tasks.create(ScanRequest::new(format!("/p{}", i))).task_id)
            .collect();

        let listed: Vec<Uuid> = tasks.list(3).iter().map(|t| t.task_id).collect();
        assert_eq!(listed, vec![ids[3], ids[2], ids[1]]);
    }

    #[test]
    fn test_eviction_prefers_finished_tasks() {
        let tasks = TaskStore::new(retention(2, 3600));
        let first = tasks.create(ScanRequest::new("/a")).task_id;
        let second = tasks.create(ScanRequest::new("/b")).task_id;
        finish(&tasks, second);

        let third = tasks.create(ScanRequest::new("/c")).task_id;
        assert_eq!(tasks.len(), 2);
        assert!(tasks.get(&first).is_some());
        assert!(tasks.get(&second).is_none());
        assert!(tasks.get(&third).is_some());

        // Nothing finished: oldest goes.
        let fourth = tasks.create(ScanRequest::new("/d")).task_id;
        assert!(tasks.get(&first).is_none());
        assert!(tasks.get(&fourth).is_some());
    }

    #[test]
    fn test_expired_finished_tasks_are_pruned() {
        let tasks = TaskStore::new(retention(10, 60));
        let old = tasks.create(ScanRequest::new("/old")).task_id;
        let running = tasks.create(ScanRequest::new("/running")).task_id;
        tasks.update(&old, |t| {
            t.status = ScanStatus::Error;
            t.completed_at = Some(Utc::now() - ChronoDuration::seconds(120));
        });

        let listed = tasks.list(10);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, running);
        assert!(tasks.get(&old).is_none());
    }

    #[test]
    fn test_update_of_unknown_task() {
        let tasks = TaskStore::new(retention(1, 60));
        assert!(!tasks.update(&Uuid::new_v4(), |t| t.progress = 0.5));
    }

    #[test]
    fn test_progress_curve() {
        assert!((analyzing_progress(0, 10) - 0.2).abs() < 1e-9);
        assert!((analyzing_progress(5, 10) - 0.6).abs() < 1e-9);
        assert!((analyzing_progress(10, 10) - 1.0).abs() < 1e-9);
        assert!((analyzing_progress(0, 0) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_directory_ends_in_error() {
        let config = Arc::new(AppConfig::default());
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let tasks = Arc::new(TaskStore::new(retention(10, 60)));
        let id = tasks
            .create(ScanRequest::new("/definitely/not/a/dir"))
            .task_id;

        run_scan_job(config, store, tasks.clone(), id, CancellationToken::new()).await;

        let task = tasks.get(&id).unwrap();
        assert_eq!(task.status, ScanStatus::Error);
        assert!(task.error_message.unwrap().contains("directory not found"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_model_ends_in_error() {
        let config = Arc::new(AppConfig {
            model: "gpt-4o".into(),
            ..AppConfig::default()
        });
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let tasks = Arc::new(TaskStore::new(retention(10, 60)));
        let id = tasks.create(ScanRequest::new("/tmp")).task_id;

        run_scan_job(config, store, tasks.clone(), id, CancellationToken::new()).await;

        let task = tasks.get(&id).unwrap();
        assert_eq!(task.status, ScanStatus::Error);
        assert!(task.error_message.unwrap().contains("unrecognized model"));
    }

    #[test]
    fn test_auto_language_defers_to_config() {
        let config = AppConfig {
            language: "zh".into(),
            ..AppConfig::default()
        };
        let mut request = ScanRequest::new("/photos");
        assert_eq!(request.prompt_language(&config), Language::Zh);
        request.language = "  ".into();
        assert_eq!(request.prompt_language(&config), Language::Zh);
        request.language = "en".into();
        assert_eq!(request.prompt_language(&config), Language::En);
    }

    #[test]
    fn test_request_limits_override_config() {
        let config = AppConfig::default();
        let request = ScanRequest {
            max_concurrent: Some(7),
            ..ScanRequest::new("/photos")
        };
        let scheduler = request.scheduler(&config).unwrap();
        assert_eq!(scheduler.max_concurrent(), 7);
        assert_eq!(scheduler.batch_size(), config.batch_size);
    }

    #[tokio::test]
    async fn test_oversized_concurrency_ends_in_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Arc::new(AppConfig {
            model: "mock".into(),
            ..AppConfig::default()
        });
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let tasks = Arc::new(TaskStore::new(retention(10, 60)));
        let request = ScanRequest {
            max_concurrent: Some(usize::MAX),
            ..ScanRequest::new(dir.path().to_string_lossy())
        };
        let id = tasks.create(request).task_id;

        run_scan_job(config, store, tasks.clone(), id, CancellationToken::new()).await;

        let task = tasks.get(&id).unwrap();
        assert_eq!(task.status, ScanStatus::Error);
        assert!(task.error_message.unwrap().contains("max_concurrent"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_api_key_ends_in_error() {
        let config = Arc::new(AppConfig {
            model: "qwen-vl-max".into(),
            api_key: None,
            qwen_api_key: None,
            ..AppConfig::default()
        });
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let tasks = Arc::new(TaskStore::new(retention(10, 60)));
        let id = tasks.create(ScanRequest::new("/tmp")).task_id;

        run_scan_job(config, store, tasks.clone(), id, CancellationToken::new()).await;

        let task = tasks.get(&id).unwrap();
        assert_eq!(task.status, ScanStatus::Error);
        assert!(task.error_message.unwrap().contains("API key"));
    }
}
