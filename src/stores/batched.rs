use crate::error::AppError;
use crate::metadata::{AnalysisResult, StoreStats};
use crate::store::{BulkWriter, Store};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of writing one pending batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    pub fell_back: bool,
}

/// Bulk upsert first; if the transaction fails, every item gets its own
/// single-row attempt. Never returns an error.
pub async fn bulk_or_each<W: BulkWriter + ?Sized>(
    writer: &W,
    batch: Vec<AnalysisResult>,
) -> FlushReport {
    if batch.is_empty() {
        return FlushReport::default();
    }
    match writer.upsert_many(&batch).await {
        Ok(written) => {
            log::info!("Flushed {} analysis results to database", written);
            FlushReport {
                written,
                failed: 0,
                fell_back: false,
            }
        }
        Err(e) => {
            log::error!(
                "Failed to flush batch of {} analysis results, writing individually: {}",
                batch.len(),
                e
            );
            let mut report = FlushReport {
                fell_back: true,
                ..FlushReport::default()
            };
            for result in batch {
                let (path, model) = (result.photo_path.clone(), result.llm_model.clone());
                match writer.add(result).await {
                    Ok(()) => report.written += 1,
                    Err(e) => {
                        log::error!("Failed to save result for {} ({}): {}", path, model, e);
                        report.failed += 1;
                    }
                }
            }
            report
        }
    }
}

/// Buffers results in memory and writes them in bulk.
///
/// A flush fires automatically when the buffer reaches `batch_size`; the
/// caller must still `flush` at the end of a run for the remainder.
pub struct BatchStore<W: BulkWriter> {
    inner: Arc<W>,
    batch_size: usize,
    pending: Mutex<Vec<AnalysisResult>>,
}

impl<W: BulkWriter> BatchStore<W> {
    pub fn new(inner: Arc<W>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            inner,
            batch_size,
            pending: Mutex::new(Vec::with_capacity(batch_size)),
        }
    }

    pub fn inner(&self) -> &Arc<W> {
        &self.inner
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Writes whatever is pending and reports how it went.
    pub async fn flush_report(&self) -> FlushReport {
        let mut pending = self.pending.lock().await;
        let batch = std::mem::take(&mut *pending);
        bulk_or_each(self.inner.as_ref(), batch).await
    }
}

#[async_trait]
impl<W: BulkWriter + 'static> Store for BatchStore<W> {
    async fn add(&self, result: AnalysisResult) -> Result<(), AppError> {
        let mut pending = self.pending.lock().await;
        pending.push(result);
        if pending.len() >= self.batch_size {
            let batch = std::mem::replace(&mut *pending, Vec::with_capacity(self.batch_size));
            let report = bulk_or_each(self.inner.as_ref(), batch).await;
            log::debug!("Automatic flush: {:?}", report);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), AppError> {
        let report = self.flush_report().await;
        if report.failed > 0 {
            log::warn!("{} analysis results could not be saved", report.failed);
        }
        Ok(())
    }

    async fn get_existing(
        &self,
        identity: &str,
        model: &str,
    ) -> Result<Option<AnalysisResult>, AppError> {
        let buffered = {
            let pending = self.pending.lock().await;
            pending
                .iter()
                .rev()
                .find(|r| r.photo_path == identity && r.llm_model == model)
                .cloned()
        };
        match buffered {
            Some(result) => Ok(Some(result)),
            None => self.inner.get_existing(identity, model).await,
        }
    }

    async fn stats(&self) -> Result<StoreStats, AppError> {
        self.inner.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::sqlite::SqliteStore;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn result(i: usize, model: &str) -> AnalysisResult {
        AnalysisResult {
            photo_path: format!("/photos/{:03}.jpg", i),
            llm_model: model.to_string(),
            description: format!("photo {}", i),
            people: vec![],
            locations: vec![],
            objects: vec![],
            tags: vec!["photo".into()],
            generated_at: Utc::now(),
        }
    }

    /// In-memory writer whose bulk path always fails and whose single-row
    /// path rejects chosen photos.
    #[derive(Default)]
    struct FlakyWriter {
        rows: StdMutex<HashMap<(String, String), AnalysisResult>>,
        bulk_calls: AtomicUsize,
        reject: Vec<String>,
    }

    #[async_trait]
    impl Store for FlakyWriter {
        async fn add(&self, result: AnalysisResult) -> Result<(), AppError> {
            if self.reject.contains(&result.photo_path) {
                return Err(AppError::Generic("constraint violated".into()));
            }
            self.rows
                .lock()
                .unwrap()
                .insert((result.photo_path.clone(), result.llm_model.clone()), result);
            Ok(())
        }

        async fn flush(&self) -> Result<(), AppError> {
            Ok(())
        }

        async fn get_existing(
            &self,
            identity: &str,
            model: &str,
        ) -> Result<Option<AnalysisResult>, AppError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&(identity.to_string(), model.to_string()))
                .cloned())
        }

        async fn stats(&self) -> Result<StoreStats, AppError> {
            Ok(StoreStats {
                total_analyses: self.rows.lock().unwrap().len() as i64,
                ..StoreStats::default()
            })
        }
    }

    #[async_trait]
    impl BulkWriter for FlakyWriter {
        async fn upsert_many(&self, _results: &[AnalysisResult]) -> Result<usize, AppError> {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Generic("database is locked".into()))
        }
    }

    #[tokio::test]
    async fn test_last_partial_batch_needs_explicit_flush() {
        let sqlite = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let store = BatchStore::new(sqlite.clone(), 10);

        for i in 0..23 {
            store.add(result(i, "mock")).await.unwrap();
        }
        assert_eq!(sqlite.stats().await.unwrap().total_analyses, 20);
        assert_eq!(store.pending_len().await, 3);

        store.flush().await.unwrap();
        assert_eq!(sqlite.stats().await.unwrap().total_analyses, 23);
        assert_eq!(store.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_flush_on_empty_buffer_is_noop() {
        let writer = Arc::new(FlakyWriter::default());
        let store = BatchStore::new(writer.clone(), 5);
        store.flush().await.unwrap();
        assert_eq!(store.flush_report().await, FlushReport::default());
        assert_eq!(writer.bulk_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bulk_failure_falls_back_to_single_rows() {
        let writer = Arc::new(FlakyWriter {
            reject: vec!["/photos/001.jpg".to_string()],
            ..FlakyWriter::default()
        });
        let store = BatchStore::new(writer.clone(), 100);
        for i in 0..4 {
            store.add(result(i, "mock")).await.unwrap();
        }

        let report = store.flush_report().await;
        assert!(report.fell_back);
        assert_eq!(report.written, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(writer.stats().await.unwrap().total_analyses, 3);
        assert_eq!(store.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_automatic_flush_survives_bulk_failure() {
        let writer = Arc::new(FlakyWriter::default());
        let store = BatchStore::new(writer.clone(), 2);
        for i in 0..4 {
            store.add(result(i, "mock")).await.unwrap();
        }
        assert_eq!(writer.bulk_calls.load(Ordering::SeqCst), 2);
        assert_eq!(writer.stats().await.unwrap().total_analyses, 4);
    }

    #[tokio::test]
    async fn test_get_existing_sees_buffered_results() {
        let sqlite = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let store = BatchStore::new(sqlite.clone(), 50);
        store.add(result(7, "mock")).await.unwrap();

        assert!(sqlite.get_existing("/photos/007.jpg", "mock").await.unwrap().is_none());
        assert!(store.get_existing("/photos/007.jpg", "mock").await.unwrap().is_some());
        assert!(store.get_existing("/photos/007.jpg", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_adds_lose_nothing() {
        let sqlite = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let store = Arc::new(BatchStore::new(sqlite.clone(), 7));

        let mut handles = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add(result(i, "mock")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        store.flush().await.unwrap();
        assert_eq!(sqlite.stats().await.unwrap().total_analyses, 40);
    }
}
