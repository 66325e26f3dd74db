use crate::error::AnalysisError;
use crate::metadata::{AnalysisResult, Language};
use crate::rate_limiter::AdaptiveRateLimiter;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// How the scheduler paces calls after each attempt.
#[derive(Clone)]
pub enum Pacing {
    /// Report every outcome to the limiter, then wait its current delay.
    Adaptive(Arc<AdaptiveRateLimiter>),
    /// Sleep a constant amount after every call.
    Fixed(Duration),
    Unpaced,
}

/// Turns one image plus a language into a structured description.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Model identity stored alongside every result.
    fn model(&self) -> &str;

    async fn analyze(
        &self,
        identity: &str,
        language: Language,
    ) -> Result<AnalysisResult, AnalysisError>;

    fn pacing(&self) -> Pacing {
        Pacing::Unpaced
    }

    /// Advisory; implementations may ignore it.
    fn set_concurrency_limit(&self, _max_concurrent: usize) {}

    /// Advisory; implementations may ignore it.
    fn set_batch_size(&self, _batch_size: usize) {}

    async fn set_rate_limit_delay(&self, _seconds: f64) {}
}
