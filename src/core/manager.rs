use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;
use super::errors::{Result, UploadError};
use super::job::build_client;
use super::scheduler::{ManagerCommand, SchedulerWorker};
use super::source::SourceRef;
use super::store::{JsonFileStore, StateStore};
use super::types::{BatchId, BatchSummary, ItemEvent, UploadConfig, UploadEvent, UploadId, UploadItem};

/// A submitted batch.
pub struct BatchHandle {
    pub batch_id: BatchId,
    /// 提交时的条目快照，按 index 排序
    pub items: Vec<UploadItem>,
    pub(crate) events: mpsc::UnboundedReceiver<ItemEvent>,
    pub(crate) summaries: mpsc::UnboundedReceiver<BatchSummary>,
}

impl BatchHandle {
    /// Next item change of this batch, starting with one QUEUED event per item.
    /// Returns `None` once the batch has been released.
    pub async fn next_event(&mut self) -> Option<ItemEvent> {
        self.events.recv().await
    }

    /// Next batch summary. Returns `None` after the final one.
    pub async fn next_summary(&mut self) -> Option<BatchSummary> {
        self.summaries.recv().await
    }

    /// Next item event or summary, item events first.
    pub async fn next(&mut self) -> Option<UploadEvent> {
        tokio::select! {
            biased;

            Some(event) = self.events.recv() => Some(UploadEvent::Item(event)),
            Some(summary) = self.summaries.recv() => Some(UploadEvent::Summary(summary)),
            else => None,
        }
    }

    /// Waits for the final summary.
    pub async fn wait(&mut self) -> Option<BatchSummary> {
        let mut last = None;
        while let Some(summary) = self.next_summary().await {
            last = Some(summary);
            if summary.all_done {
                break;
            }
        }
        last
    }
}

#[derive(Clone)]
pub struct UploadManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
}

/// 上传管理器句柄 - 包含管理器和工作线程
pub struct UploadManagerHandle {
    pub manager: UploadManager,
    pub worker_handle: JoinHandle<()>,
}

impl UploadManagerHandle {
    /// Cancels running work, persists unfinished items and joins the worker.
    pub async fn shutdown(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self.manager.command_tx.send(ManagerCommand::Shutdown { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }

        drop(self.manager);
        self.worker_handle.await
            .map_err(|err| UploadError::internal(format!("Worker panic: {}", err)))
    }
}

impl UploadManager {
    /// Starts a manager. Items are persisted to `config.state_file` when set.
    pub fn new(config: UploadConfig) -> Result<UploadManagerHandle> {
        let store = config.state_file
            .clone()
            .map(|path| Arc::new(JsonFileStore::new(path)) as Arc<dyn StateStore>);

        Self::with_store(config, store)
    }

    pub fn with_store(config: UploadConfig, store: Option<Arc<dyn StateStore>>) -> Result<UploadManagerHandle> {
        let client = build_client(&config)?;
        let (command_tx, command_rx) = mpsc::channel(100);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        let worker_handle = tokio::spawn(SchedulerWorker::run(
            config,
            client,
            store,
            command_rx,
            event_tx.clone(),
        ));

        let manager = Self {
            command_tx,
            event_tx,
        };

        Ok(UploadManagerHandle {
            manager,
            worker_handle,
        })
    }

    /// Submits one batch. Nothing is enqueued when the batch is empty or the
    /// destination is missing or malformed.
    pub async fn submit<I, S>(&self, sources: I, destination: impl AsRef<str>) -> Result<BatchHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceRef>,
    {
        let sources: Vec<SourceRef> = sources.into_iter().map(Into::into).collect();
        if sources.is_empty() {
            return Err(UploadError::EmptyBatch);
        }

        let destination = validate_destination(destination.as_ref())?;

        self.request(|reply| ManagerCommand::Submit {
            sources,
            destination,
            reply,
        })
        .await
    }

    /// Cancel a batch. Unknown and already finished batches are ignored.
    pub async fn cancel(&self, batch_id: BatchId) -> Result<()> {
        self.request(|reply| ManagerCommand::Cancel { batch_id, reply }).await
    }

    /// Lossless item events of one batch, starting with a snapshot of every item.
    pub async fn subscribe_batch(&self, batch_id: BatchId) -> Result<Option<mpsc::UnboundedReceiver<ItemEvent>>> {
        self.request(|reply| ManagerCommand::Subscribe { batch_id, reply }).await
    }

    /// Get batch items
    pub async fn get_batch(&self, batch_id: BatchId) -> Result<Option<Vec<UploadItem>>> {
        self.request(|reply| ManagerCommand::GetBatch { batch_id, reply }).await
    }

    /// Get item
    pub async fn get_item(&self, upload_id: UploadId) -> Result<Option<UploadItem>> {
        self.request(|reply| ManagerCommand::GetItem { upload_id, reply }).await
    }

    /// Batches that have not been released yet.
    pub async fn batches(&self) -> Result<Vec<BatchId>> {
        self.request(|reply| ManagerCommand::ListBatches { reply }).await
    }

    /// 订阅所有事件
    ///
    /// 注意：
    /// - 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    /// - 需要完整事件的调用方使用 `BatchHandle` 或 `subscribe_batch`
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| UploadError::ManagerShutdown)?;

        // 等待响应
        reply_rx.await.map_err(|_| UploadError::ManagerShutdown)
    }
}

/// Checks that `destination` is an absolute http(s) URL.
pub fn validate_destination(destination: &str) -> Result<String> {
    let destination = destination.trim();
    if destination.is_empty() {
        return Err(UploadError::MissingDestination);
    }

    let url = Url::parse(destination).map_err(|err| UploadError::InvalidDestination {
        url: destination.to_string(),
        message: err.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(destination.to_string()),
        scheme => Err(UploadError::InvalidDestination {
            url: destination.to_string(),
            message: format!("unsupported scheme: {}", scheme),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_destination() {
        assert!(matches!(validate_destination(""), Err(UploadError::MissingDestination)));
        assert!(matches!(validate_destination("   "), Err(UploadError::MissingDestination)));
        assert!(matches!(
            validate_destination("not a url"),
            Err(UploadError::InvalidDestination { .. })
        ));
        assert!(matches!(
            validate_destination("ftp://example.com/upload"),
            Err(UploadError::InvalidDestination { .. })
        ));
        assert_eq!(
            validate_destination(" https://example.com/upload ").unwrap(),
            "https://example.com/upload"
        );
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let handle = UploadManager::new(UploadConfig::default()).unwrap();

        let sources: Vec<SourceRef> = Vec::new();
        let result = handle.manager.submit(sources, "http://localhost/upload").await;
        assert!(matches!(result, Err(UploadError::EmptyBatch)));
        assert!(handle.manager.batches().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_destination_is_rejected() {
        let handle = UploadManager::new(UploadConfig::default()).unwrap();

        let result = handle.manager.submit(["/tmp/a.bin"], "").await;
        assert!(matches!(result, Err(UploadError::MissingDestination)));
        assert!(handle.manager.batches().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let handle = UploadManager::new(UploadConfig::default()).unwrap();
        let manager = handle.manager.clone();
        handle.shutdown().await.unwrap();

        assert!(matches!(manager.batches().await, Err(UploadError::ManagerShutdown)));
        assert!(matches!(manager.cancel(BatchId::new()).await, Err(UploadError::ManagerShutdown)));
    }
}
