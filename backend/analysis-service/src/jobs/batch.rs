//! Batch analysis job
//!
//! Runs a list of requests through the orchestrator in fixed-size batches,
//! with bounded concurrency inside each batch and an optional pause between
//! batches to stay under provider quotas.

use crate::model::{AIAnalysis, AnalysisRequest};
use crate::orchestrator::Orchestrator;
use crate::AnalysisError;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Requests per batch
    pub batch_size: usize,
    /// Requests in flight at once within a batch
    pub concurrency: usize,
    /// Pause between batches
    pub batch_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: 4,
            batch_delay: Duration::from_millis(100),
        }
    }
}

/// Outcome for one content item
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub content_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AIAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    fn from_result(content_id: String, result: Result<AIAnalysis, AnalysisError>) -> Self {
        match result {
            Ok(analysis) => Self {
                content_id,
                analysis: Some(analysis),
                error: None,
            },
            Err(e) => Self {
                content_id,
                analysis: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Statistics from a batch run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub total_processed: u64,
    /// Analyses confident enough to skip human review
    pub auto_approved: u64,
    pub needs_review: u64,
    pub error_count: u64,
    pub batches_processed: u64,
    /// Requests not started because the job was cancelled
    pub skipped: u64,
}

pub struct BatchJob {
    orchestrator: Arc<Orchestrator>,
    settings: BatchSettings,
}

impl BatchJob {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: BatchSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    /// Analyze every request, stopping early when `cancel` fires.
    ///
    /// Items come back in completion order within a batch.
    pub async fn run(
        &self,
        requests: Vec<AnalysisRequest>,
        cancel: CancellationToken,
    ) -> (Vec<BatchItem>, BatchStats) {
        let batch_size = self.settings.batch_size.max(1);
        let concurrency = self.settings.concurrency.max(1);
        let total = requests.len();

        info!(
            total,
            batch_size,
            concurrency,
            "Starting batch analysis"
        );

        let mut stats = BatchStats::default();
        let mut items = Vec::with_capacity(total);
        let mut pending = requests.into_iter().peekable();

        while pending.peek().is_some() {
            if cancel.is_cancelled() {
                stats.skipped = pending.count() as u64;
                warn!(skipped = stats.skipped, "Batch analysis cancelled");
                break;
            }

            let batch: Vec<AnalysisRequest> = pending.by_ref().take(batch_size).collect();
            debug!(
                batch = stats.batches_processed + 1,
                count = batch.len(),
                "Processing batch"
            );

            let results: Vec<BatchItem> = stream::iter(batch)
                .map(|request| {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let cancel = cancel.clone();
                    async move {
                        let content_id = request.content_id.clone();
                        let result = orchestrator.process_with_cancel(request, cancel).await;
                        BatchItem::from_result(content_id, result)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for item in results {
                stats.total_processed += 1;
                match &item.analysis {
                    Some(analysis) if analysis.requires_manual_verification => {
                        stats.needs_review += 1
                    }
                    Some(_) => stats.auto_approved += 1,
                    None => {
                        stats.error_count += 1;
                        error!(
                            content_id = %item.content_id,
                            error = item.error.as_deref().unwrap_or_default(),
                            "Failed to analyze content"
                        );
                    }
                }
                items.push(item);
            }
            stats.batches_processed += 1;

            if pending.peek().is_some() && !self.settings.batch_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.batch_delay) => {}
                }
            }
        }

        info!(
            total_processed = stats.total_processed,
            auto_approved = stats.auto_approved,
            needs_review = stats.needs_review,
            errors = stats.error_count,
            batches = stats.batches_processed,
            "Batch analysis completed"
        );

        (items, stats)
    }
}
