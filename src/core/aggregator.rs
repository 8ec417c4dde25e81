use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use super::types::{BatchId, BatchSummary, ItemEvent, UploadId, UploadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
}

/// Folds a batch's item events into a [`BatchSummary`].
///
/// A summary is produced only when the derived counts change, at most once
/// per item event. Once every item is final the aggregator emits one last
/// summary and ignores everything after it.
pub struct StatusAggregator {
    batch_id: BatchId,
    total: usize,
    outcomes: HashMap<UploadId, Outcome>,
    last: Option<BatchSummary>,
    finished: bool,
}

impl StatusAggregator {
    pub fn new(batch_id: BatchId, total: usize) -> Self {
        Self {
            batch_id,
            total,
            outcomes: HashMap::new(),
            last: None,
            finished: false,
        }
    }

    pub fn summary(&self) -> BatchSummary {
        let completed_count = self.outcomes
            .values()
            .filter(|outcome| **outcome == Outcome::Succeeded)
            .count();
        let failed_count = self.outcomes.len() - completed_count;
        let all_done = completed_count + failed_count >= self.total;

        BatchSummary {
            batch_id: self.batch_id,
            completed_count,
            failed_count,
            total_count: self.total,
            all_done,
            all_succeeded: all_done && failed_count == 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_summary(&self) -> Option<BatchSummary> {
        self.last
    }

    /// Applies one item event, returning the new summary if it differs from the last one.
    pub fn apply(&mut self, event: &ItemEvent) -> Option<BatchSummary> {
        if self.finished || event.batch_id != self.batch_id {
            return None;
        }

        let outcome = match event.status {
            UploadStatus::Succeeded => Some(Outcome::Succeeded),
            UploadStatus::Failed if event.is_final() => Some(Outcome::Failed),
            _ => None,
        };

        match outcome {
            Some(outcome) => {
                self.outcomes.insert(event.item_id, outcome);
            }
            None => {
                self.outcomes.remove(&event.item_id);
            }
        }

        let summary = self.summary();
        if self.last == Some(summary) {
            return None;
        }

        self.last = Some(summary);
        self.finished = summary.all_done;
        Some(summary)
    }

    /// Consumes item events until the batch is done, handing every changed
    /// summary to `on_summary`. Dropping the receiver on return unsubscribes.
    pub async fn run<F>(mut self, mut events: mpsc::UnboundedReceiver<ItemEvent>, mut on_summary: F) -> Option<BatchSummary>
    where
        F: FnMut(BatchSummary) + Send,
    {
        while let Some(event) = events.recv().await {
            if let Some(summary) = self.apply(&event) {
                debug!(
                    batch_id = %summary.batch_id,
                    completed = summary.completed_count,
                    failed = summary.failed_count,
                    total = summary.total_count,
                    remaining = summary.remaining(),
                    "Batch summary changed"
                );
                on_summary(summary);
            }

            if self.is_finished() {
                break;
            }
        }

        self.last_summary()
    }
}
