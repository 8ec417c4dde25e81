use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use reqwest::Client;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use super::aggregator::StatusAggregator;
use super::errors::Result;
use super::job::{JobReporter, JobUpdate, UploadJob};
use super::manager::BatchHandle;
use super::queue::JobQueue;
use super::source::{cleanup_scratch, SourceRef};
use super::store::StateStore;
use super::types::{
    BatchId, BatchSummary, Failure, ItemEvent, UploadConfig, UploadEvent, UploadId, UploadItem,
    UploadStatus,
};

/// 上传管理器命令
pub(crate) enum ManagerCommand {
    /// 提交一个批次（已校验）
    Submit {
        sources: Vec<SourceRef>,
        destination: String,
        reply: oneshot::Sender<BatchHandle>,
    },

    /// 取消批次
    Cancel {
        batch_id: BatchId,
        reply: oneshot::Sender<()>,
    },

    /// 订阅批次条目事件
    Subscribe {
        batch_id: BatchId,
        reply: oneshot::Sender<Option<mpsc::UnboundedReceiver<ItemEvent>>>,
    },

    /// 获取批次信息
    GetBatch {
        batch_id: BatchId,
        reply: oneshot::Sender<Option<Vec<UploadItem>>>,
    },

    /// 获取条目信息
    GetItem {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadItem>>,
    },

    /// 列出所有存活的批次
    ListBatches {
        reply: oneshot::Sender<Vec<BatchId>>,
    },

    /// 关闭
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Messages from tasks the worker spawned.
enum WorkerMessage {
    Job(JobUpdate),
    Finished {
        id: UploadId,
        attempt: u32,
        result: Result<()>,
    },
    RetryDue {
        id: UploadId,
        attempt: u32,
    },
    Released(BatchId),
}

struct BatchEntry {
    /// 按 index 排序
    items: Vec<UploadId>,
    cancellation_token: CancellationToken,
    subscribers: Vec<mpsc::UnboundedSender<ItemEvent>>,
}

struct ItemEntry {
    item: UploadItem,
    join_handle: Option<JoinHandle<()>>,
}

impl ItemEntry {
    fn transition(&mut self, next: UploadStatus) {
        debug_assert!(
            self.item.status.can_transition_to(next),
            "invalid transition {} -> {}",
            self.item.status,
            next
        );
        self.item.status = next;
    }
}

/// Single writer of all item state. Jobs, retry timers and aggregators only
/// talk to it through messages.
pub(crate) struct SchedulerWorker {
    config: UploadConfig,
    client: Client,
    store: Option<Arc<dyn StateStore>>,
    batches: HashMap<BatchId, BatchEntry>,
    items: HashMap<UploadId, ItemEntry>,
    queue: JobQueue,
    event_tx: broadcast::Sender<UploadEvent>,
    message_tx: mpsc::UnboundedSender<WorkerMessage>,
    dirty: bool,
}

impl SchedulerWorker {
    pub(crate) async fn run(
        config: UploadConfig,
        client: Client,
        store: Option<Arc<dyn StateStore>>,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (message_tx, mut message_rx) = mpsc::unbounded_channel();
        let mut worker = Self {
            queue: JobQueue::new(config.max_concurrent),
            config,
            client,
            store,
            batches: HashMap::new(),
            items: HashMap::new(),
            event_tx,
            message_tx,
            dirty: false,
        };

        if let Some(dir) = worker.config.scratch_dir.clone() {
            let removed = cleanup_scratch(&dir).await;
            if removed > 0 {
                info!(dir = %dir.display(), removed, "Removed leftover scratch files");
            }
        }

        // 恢复之前的状态
        if let Err(err) = worker.restore().await {
            warn!(error = %err, "Failed to restore upload state");
        }

        loop {
            worker.process_queue();
            worker.persist().await;

            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        worker.shutdown().await;
                        break;
                    };
                    if !worker.handle_command(command).await {
                        break;
                    }
                }
                Some(message) = message_rx.recv() => worker.handle_message(message),
            }
        }
    }

    /// Returns `false` once the worker has shut down.
    async fn handle_command(&mut self, command: ManagerCommand) -> bool {
        match command {
            ManagerCommand::Submit { sources, destination, reply } => {
                let handle = self.submit(sources, destination);
                let _ = reply.send(handle);
            }
            ManagerCommand::Cancel { batch_id, reply } => {
                self.cancel_batch(batch_id);
                let _ = reply.send(());
            }
            ManagerCommand::Subscribe { batch_id, reply } => {
                let _ = reply.send(self.subscribe(batch_id));
            }
            ManagerCommand::GetBatch { batch_id, reply } => {
                let items = self.batches.get(&batch_id).map(|batch| {
                    batch.items
                        .iter()
                        .filter_map(|id| self.items.get(id))
                        .map(|entry| entry.item.clone())
                        .collect()
                });
                let _ = reply.send(items);
            }
            ManagerCommand::GetItem { upload_id, reply } => {
                let item = self.items.get(&upload_id).map(|entry| entry.item.clone());
                let _ = reply.send(item);
            }
            ManagerCommand::ListBatches { reply } => {
                let _ = reply.send(self.batches.keys().copied().collect());
            }
            ManagerCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }

        true
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Job(JobUpdate::Opened { id, size }) => {
                if let Some(entry) = self.items.get_mut(&id) {
                    entry.item.size_bytes = Some(size);
                    self.dirty = true;
                }
            }
            WorkerMessage::Job(JobUpdate::Progress { id, percent }) => {
                let changed = match self.items.get_mut(&id) {
                    Some(entry) if entry.item.status == UploadStatus::Uploading
                        && percent > entry.item.progress_percent =>
                    {
                        entry.item.progress_percent = percent.min(100);
                        true
                    }
                    _ => false,
                };

                if changed {
                    self.publish(id);
                }
            }
            WorkerMessage::Finished { id, attempt, result } => {
                self.finish_job(id, attempt, result);
            }
            WorkerMessage::RetryDue { id, attempt } => {
                let due = self.items.get(&id).is_some_and(|entry| {
                    entry.item.status == UploadStatus::Queued && entry.item.attempt == attempt
                });
                if due {
                    debug!(upload_id = %id, attempt, "Retry is due");
                    self.queue.push(id);
                }
            }
            WorkerMessage::Released(batch_id) => self.release_batch(batch_id),
        }
    }

    fn submit(&mut self, sources: Vec<SourceRef>, destination: String) -> BatchHandle {
        let batch_id = BatchId::new();
        let total = sources.len();
        let created_at = Utc::now();

        let items: Vec<UploadItem> = sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| UploadItem {
                id: UploadId::new(),
                batch_id,
                index,
                total,
                display_name: source.resolve_display_name(),
                source,
                destination: destination.clone(),
                size_bytes: None,
                progress_percent: 0,
                status: UploadStatus::Queued,
                attempt: 0,
                failure: None,
                created_at,
                started_at: None,
                completed_at: None,
            })
            .collect();

        info!(batch_id = %batch_id, total, destination = %destination, "Batch submitted");

        self.insert_batch(batch_id, items.clone());
        let summaries = self.spawn_aggregator(batch_id, total);
        let (events_tx, events) = mpsc::unbounded_channel();
        self.attach_subscriber(batch_id, events_tx);

        for item in &items {
            self.queue.push(item.id);
        }
        self.dirty = true;

        BatchHandle {
            batch_id,
            items,
            events,
            summaries,
        }
    }

    fn insert_batch(&mut self, batch_id: BatchId, items: Vec<UploadItem>) {
        let ids = items.iter().map(|item| item.id).collect();

        for item in items {
            self.items.insert(item.id, ItemEntry {
                item,
                join_handle: None,
            });
        }

        self.batches.insert(batch_id, BatchEntry {
            items: ids,
            cancellation_token: CancellationToken::new(),
            subscribers: Vec::new(),
        });
    }

    /// Adds a subscriber and replays the current state of every item to it.
    fn attach_subscriber(&mut self, batch_id: BatchId, tx: mpsc::UnboundedSender<ItemEvent>) -> bool {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return false;
        };

        for id in &batch.items {
            if let Some(entry) = self.items.get(id) {
                let _ = tx.send(entry.item.snapshot());
            }
        }

        batch.subscribers.push(tx);
        true
    }

    fn subscribe(&mut self, batch_id: BatchId) -> Option<mpsc::UnboundedReceiver<ItemEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach_subscriber(batch_id, tx).then_some(rx)
    }

    fn spawn_aggregator(&mut self, batch_id: BatchId, total: usize) -> mpsc::UnboundedReceiver<BatchSummary> {
        let (summary_tx, summary_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.attach_subscriber(batch_id, events_tx);

        let event_tx = self.event_tx.clone();
        let message_tx = self.message_tx.clone();
        let aggregator = StatusAggregator::new(batch_id, total);

        tokio::spawn(async move {
            let last = aggregator
                .run(events_rx, move |summary| {
                    let _ = event_tx.send(UploadEvent::Summary(summary));
                    let _ = summary_tx.send(summary);
                })
                .await;

            // 最终汇总已发出，可以释放条目
            if last.is_some_and(|summary| summary.all_done) {
                let _ = message_tx.send(WorkerMessage::Released(batch_id));
            }
        });

        summary_rx
    }

    fn process_queue(&mut self) {
        while let Some(id) = self.queue.next_ready() {
            if !self.start_job(id) {
                self.queue.finish();
            }
        }
    }

    fn start_job(&mut self, id: UploadId) -> bool {
        let Some(entry) = self.items.get_mut(&id) else {
            return false;
        };
        if entry.item.status != UploadStatus::Queued {
            return false;
        }
        let Some(batch) = self.batches.get(&entry.item.batch_id) else {
            return false;
        };

        entry.transition(UploadStatus::Uploading);
        entry.item.attempt += 1;
        entry.item.started_at = Some(Utc::now());
        let attempt = entry.item.attempt;

        let job = UploadJob {
            id,
            source: entry.item.source.clone(),
            display_name: entry.item.display_name.clone(),
            destination: entry.item.destination.clone(),
            field_name: self.config.field_name.clone(),
            chunk_size: self.config.chunk_size,
            scratch_dir: self.config.scratch_dir.clone(),
            client: self.client.clone(),
            cancellation_token: batch.cancellation_token.child_token(),
        };

        info!(
            batch_id = %entry.item.batch_id,
            upload_id = %id,
            file = %entry.item.display_name,
            attempt,
            "Upload started"
        );

        let message_tx = self.message_tx.clone();
        let report_tx = self.message_tx.clone();
        let report: JobReporter = Arc::new(move |update| {
            let _ = report_tx.send(WorkerMessage::Job(update));
        });

        entry.join_handle = Some(tokio::spawn(async move {
            let result = job.run(report).await;
            let _ = message_tx.send(WorkerMessage::Finished { id, attempt, result });
        }));

        self.dirty = true;
        self.publish(id);
        true
    }

    fn finish_job(&mut self, id: UploadId, attempt: u32, result: Result<()>) {
        let Some(entry) = self.items.get_mut(&id) else {
            return;
        };
        if entry.item.attempt != attempt || entry.item.status != UploadStatus::Uploading {
            return;
        }

        self.queue.finish();
        self.dirty = true;
        entry.join_handle = None;
        entry.item.completed_at = Some(Utc::now());

        let err = match result {
            Ok(()) => {
                entry.transition(UploadStatus::Succeeded);
                entry.item.progress_percent = 100;
                entry.item.failure = None;
                info!(batch_id = %entry.item.batch_id, upload_id = %id, attempt, "Upload succeeded");
                self.publish(id);
                return;
            }
            Err(err) => err,
        };

        let kind = err.failure_kind();
        let cancelled = self.batches
            .get(&entry.item.batch_id)
            .is_none_or(|batch| batch.cancellation_token.is_cancelled());
        let delay = if cancelled {
            None
        } else {
            self.config.retry.next_delay(kind, attempt)
        };

        entry.transition(UploadStatus::Failed);
        entry.item.failure = Some(Failure {
            kind,
            reason: err.to_string(),
            will_retry: delay.is_some(),
        });

        let Some(delay) = delay else {
            warn!(
                batch_id = %entry.item.batch_id,
                upload_id = %id,
                attempt,
                kind = ?kind,
                error = %err,
                "Upload failed"
            );
            self.publish(id);
            return;
        };

        warn!(
            batch_id = %entry.item.batch_id,
            upload_id = %id,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Upload failed, retry scheduled"
        );
        self.publish(id);

        // 重新排队，等待退避结束后再执行
        if let Some(entry) = self.items.get_mut(&id) {
            entry.transition(UploadStatus::Queued);
            entry.item.completed_at = None;
        }
        self.publish(id);

        let message_tx = self.message_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = message_tx.send(WorkerMessage::RetryDue { id, attempt });
        });
    }

    fn cancel_batch(&mut self, batch_id: BatchId) {
        let Some(batch) = self.batches.get(&batch_id) else {
            debug!(batch_id = %batch_id, "Cancel for unknown or released batch ignored");
            return;
        };

        if batch.cancellation_token.is_cancelled() {
            return;
        }

        info!(batch_id = %batch_id, "Cancelling batch");
        batch.cancellation_token.cancel();

        // 运行中的任务会自己以 Cancelled 结束，这里只处理还在排队的
        let ids = batch.items.clone();
        for id in ids {
            let queued = self.items
                .get(&id)
                .is_some_and(|entry| entry.item.status == UploadStatus::Queued);
            if !queued {
                continue;
            }

            self.queue.remove(&id);
            if let Some(entry) = self.items.get_mut(&id) {
                entry.transition(UploadStatus::Failed);
                entry.item.failure = Some(Failure::cancelled());
                entry.item.completed_at = Some(Utc::now());
            }
            self.publish(id);
        }

        self.dirty = true;
    }

    fn release_batch(&mut self, batch_id: BatchId) {
        let Some(batch) = self.batches.get(&batch_id) else {
            return;
        };

        let all_terminal = batch.items.iter().all(|id| {
            self.items
                .get(id)
                .is_none_or(|entry| entry.item.status.is_terminal())
        });
        if !all_terminal {
            return;
        }

        if let Some(batch) = self.batches.remove(&batch_id) {
            for id in &batch.items {
                self.items.remove(id);
            }
            info!(batch_id = %batch_id, items = batch.items.len(), "Batch released");
        }
        self.dirty = true;
    }

    fn publish(&mut self, id: UploadId) {
        let Some(entry) = self.items.get(&id) else {
            return;
        };

        let event = entry.item.snapshot();
        if let Some(batch) = self.batches.get_mut(&event.batch_id) {
            batch.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }

        let _ = self.event_tx.send(UploadEvent::Item(event));
    }

    /// Save tasks state
    async fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let Some(store) = &self.store else {
            return;
        };

        let mut items: Vec<UploadItem> = self.items.values().map(|entry| entry.item.clone()).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.index.cmp(&b.index)));

        if let Err(err) = store.save(&items).await {
            warn!(error = %err, "Failed to save upload state");
        }
    }

    /// Re-submits persisted batches that still have unfinished items.
    async fn restore(&mut self) -> Result<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };

        let mut batches: HashMap<BatchId, Vec<UploadItem>> = HashMap::new();
        for item in store.load().await? {
            batches.entry(item.batch_id).or_default().push(item);
        }

        for (batch_id, mut items) in batches {
            if items.iter().all(|item| item.status.is_terminal()) {
                continue;
            }

            items.sort_by_key(|item| item.index);
            let total = items.len();
            let mut pending = Vec::new();

            for item in items.iter_mut().filter(|item| !item.status.is_terminal()) {
                item.status = UploadStatus::Queued;
                item.failure = None;
                item.started_at = None;
                pending.push(item.id);
            }

            info!(batch_id = %batch_id, total, pending = pending.len(), "Restored batch");

            self.insert_batch(batch_id, items);
            // 恢复的批次没有调用方持有句柄，汇总只走广播
            drop(self.spawn_aggregator(batch_id, total));

            for id in pending {
                self.queue.push(id);
            }
            self.dirty = true;
        }

        Ok(())
    }

    async fn shutdown(&mut self) {
        info!(
            batches = self.batches.len(),
            running = self.queue.active(),
            queued = self.queue.len(),
            "Upload manager shutting down"
        );

        // 先落盘，未完成的条目下次启动时恢复
        self.dirty = true;
        self.persist().await;

        for batch in self.batches.values() {
            batch.cancellation_token.cancel();
        }
        for entry in self.items.values_mut() {
            if let Some(handle) = entry.join_handle.take() {
                let _ = handle.await;
            }
        }
    }
}
