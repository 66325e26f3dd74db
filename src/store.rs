use crate::error::AppError;
use crate::metadata::{AnalysisResult, StoreStats};
use async_trait::async_trait;

/// Persistence for analysis results, keyed by (photo identity, model identity).
///
/// `add` may buffer; callers must `flush` once after the last `add` of a run.
#[async_trait]
pub trait Store: Send + Sync {
    async fn add(&self, result: AnalysisResult) -> Result<(), AppError>;
    async fn flush(&self) -> Result<(), AppError>;
    async fn get_existing(
        &self,
        identity: &str,
        model: &str,
    ) -> Result<Option<AnalysisResult>, AppError>;
    async fn stats(&self) -> Result<StoreStats, AppError>;
}

/// A store that can also write many results in one transaction.
///
/// `Store::add` on an implementor must be an immediate single-row upsert; the
/// batching layer relies on it as the per-item fallback.
#[async_trait]
pub trait BulkWriter: Store {
    async fn upsert_many(&self, results: &[AnalysisResult]) -> Result<usize, AppError>;
}
