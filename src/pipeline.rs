use crate::analyzer::{Analyzer, Pacing};
use crate::error::{AnalysisError, AppError};
use crate::metadata::{AnalysisResult, Language, PhotoIdentity};
use crate::store::Store;
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Emitted after every item, in completion order.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub processed: usize,
    pub total: usize,
    pub identity: PhotoIdentity,
    pub succeeded: bool,
}

pub trait ProgressSink: Send + Sync {
    fn on_item(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_item(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Sink that drops every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_item(&self, _event: &ProgressEvent) {}
}

#[derive(Debug)]
pub struct ItemFailure {
    pub identity: PhotoIdentity,
    pub error: AnalysisError,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    /// Successful results; only retained when the run has no store to hand them to.
    pub results: Vec<AnalysisResult>,
    pub failures: Vec<ItemFailure>,
    pub processed: usize,
    pub succeeded: usize,
}

/// Fans analysis of many photos out to an analyzer with a hard ceiling on
/// in-flight calls.
///
/// Identities are taken in chunks of `batch_size`; a chunk is fully resolved
/// before the next one starts. A failed item is logged and recorded in the
/// summary, and only an unavailable analyzer aborts the run.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    max_concurrent: usize,
    batch_size: usize,
    deadline: Option<Duration>,
}

impl BatchScheduler {
    pub fn new(max_concurrent: usize, batch_size: usize) -> Result<Self, AppError> {
        if max_concurrent == 0 {
            return Err(AppError::InvalidRequest("max_concurrent must be at least 1".into()));
        }
        if max_concurrent > Semaphore::MAX_PERMITS {
            return Err(AppError::InvalidRequest(format!(
                "max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if batch_size == 0 {
            return Err(AppError::InvalidRequest("batch_size must be at least 1".into()));
        }
        Ok(Self {
            max_concurrent,
            batch_size,
            deadline: None,
        })
    }

    /// Overall time budget for a run; unfinished items resolve as cancelled.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Analyzes every identity and hands each success to `store`.
    ///
    /// Store writes run beside the fan-out on their own future, so a slow
    /// flush never holds up in-flight analyses. The run returns once every
    /// queued result has been handed to the store.
    pub async fn run(
        &self,
        analyzer: &dyn Analyzer,
        identities: &[PhotoIdentity],
        language: Language,
        store: Option<&dyn Store>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, AppError> {
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<AnalysisResult>();
        let sink = store.map(|_| results_tx);

        let writer = async move {
            let Some(store) = store else { return };
            while let Some(result) = results_rx.recv().await {
                let path = result.photo_path.clone();
                if let Err(e) = store.add(result).await {
                    log::error!("Failed to store result for {}: {}", path, e);
                }
            }
        };
        let fan_out = self.fan_out(analyzer, identities, language, sink, progress, cancel);

        let (summary, ()) = tokio::join!(fan_out, writer);
        summary
    }

    /// Drops `sink` on return, which lets the writer drain and finish.
    async fn fan_out(
        &self,
        analyzer: &dyn Analyzer,
        identities: &[PhotoIdentity],
        language: Language,
        sink: Option<UnboundedSender<AnalysisResult>>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, AppError> {
        analyzer.set_concurrency_limit(self.max_concurrent);
        analyzer.set_batch_size(self.batch_size);

        let total = identities.len();
        let semaphore = Semaphore::new(self.max_concurrent);
        let run_token = cancel.child_token();
        // Cancels the run token (and stops the deadline timer) when the run ends.
        let _run_guard = run_token.clone().drop_guard();
        if let Some(limit) = self.deadline {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        log::warn!("Run deadline of {:?} reached, cancelling remaining items", limit);
                        token.cancel();
                    }
                }
            });
        }

        log::info!(
            "Analyzing {} photos with {} (max_concurrent={}, batch_size={})",
            total,
            analyzer.model(),
            self.max_concurrent,
            self.batch_size
        );

        let mut summary = RunSummary::default();
        for (chunk_index, chunk) in identities.chunks(self.batch_size).enumerate() {
            log::debug!("Starting chunk {} ({} photos)", chunk_index + 1, chunk.len());
            let semaphore = &semaphore;
            let token = &run_token;
            let mut in_flight: FuturesUnordered<_> = chunk
                .iter()
                .map(|identity| async move {
                    let outcome = analyze_one(analyzer, identity, language, semaphore, token).await;
                    (identity, outcome)
                })
                .collect();

            while let Some((identity, outcome)) = in_flight.next().await {
                summary.processed += 1;
                let succeeded = outcome.is_ok();
                match outcome {
                    Ok(result) => {
                        summary.succeeded += 1;
                        match &sink {
                            Some(sink) => {
                                if sink.send(result).is_err() {
                                    log::error!("Store writer stopped, dropping result for {}", identity);
                                }
                            }
                            None => summary.results.push(result),
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        log::error!("Analyzer unavailable, aborting run: {}", e);
                        return Err(AppError::Infrastructure(e.to_string()));
                    }
                    Err(AnalysisError::Cancelled) => {
                        log::warn!("Analysis of {} cancelled", identity);
                        summary.failures.push(ItemFailure {
                            identity: identity.clone(),
                            error: AnalysisError::Cancelled,
                        });
                    }
                    Err(e) => {
                        log::error!("Failed to analyze {}: {}", identity, e);
                        summary.failures.push(ItemFailure {
                            identity: identity.clone(),
                            error: e,
                        });
                    }
                }
                progress.on_item(&ProgressEvent {
                    processed: summary.processed,
                    total,
                    identity: identity.clone(),
                    succeeded,
                });
            }
        }

        log::info!(
            "Analysis finished: {} succeeded, {} failed",
            summary.succeeded,
            summary.failures.len()
        );
        Ok(summary)
    }
}

/// One item under one permit. The permit is held until pacing completes and
/// is released on every exit path by drop.
async fn analyze_one(
    analyzer: &dyn Analyzer,
    identity: &str,
    language: Language,
    semaphore: &Semaphore,
    cancel: &CancellationToken,
) -> Result<AnalysisResult, AnalysisError> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
        permit = semaphore.acquire() => permit.map_err(|_| AnalysisError::Cancelled)?,
    };

    log::debug!("Analyzing {}", identity);
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
        outcome = analyzer.analyze(identity, language) => outcome,
    };

    pace(analyzer.pacing(), outcome.is_ok(), cancel).await;
    outcome
}

async fn pace(pacing: Pacing, success: bool, cancel: &CancellationToken) {
    match pacing {
        Pacing::Adaptive(limiter) => {
            limiter.record_outcome(success).await;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = limiter.wait() => {}
            }
        }
        Pacing::Fixed(delay) => {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Pacing::Unpaced => {}
    }
}
