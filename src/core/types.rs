use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::utils::retry::RetryPolicy;
use super::source::SourceRef;

// 用于序列化 Duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// 单个上传条目的唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 批次标识（一次 submit 调用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum UploadStatus {
    /// 等待中（在队列中）
    Queued,
    /// 上传中
    Uploading,
    /// 已完成
    Succeeded,
    /// 失败（包括取消）
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Succeeded | UploadStatus::Failed)
    }

    /// `Failed -> Queued` is only taken when the retry policy re-enqueues the item.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        matches!(
            (self, next),
            (Queued, Uploading)
                | (Queued, Failed)
                | (Uploading, Succeeded)
                | (Uploading, Failed)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Succeeded => "succeeded",
            UploadStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum FailureKind {
    SourceUnavailable,
    Transport,
    ServerRejected,
    Cancelled,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Cancelled)
    }
}

/// Why an item ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
    /// The scheduler has re-enqueued the item, so this failure is not final.
    pub will_retry: bool,
}

impl Failure {
    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            reason: "Upload was cancelled".to_string(),
            will_retry: false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

/// Canonical record of one file in a batch. Owned by the scheduler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadItem {
    pub id: UploadId,
    pub batch_id: BatchId,
    /// 在批次中的位置，仅用于显示
    pub index: usize,
    /// 批次文件总数
    pub total: usize,
    pub source: SourceRef,
    pub display_name: String,
    pub destination: String,
    pub size_bytes: Option<u64>,
    pub progress_percent: u8,
    pub status: UploadStatus,
    pub attempt: u32,
    pub failure: Option<Failure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadItem {
    pub fn snapshot(&self) -> ItemEvent {
        ItemEvent {
            batch_id: self.batch_id,
            item_id: self.id,
            index: self.index,
            total: self.total,
            display_name: self.display_name.clone(),
            size_bytes: self.size_bytes,
            status: self.status,
            progress_percent: self.progress_percent,
            attempt: self.attempt,
            failure: self.failure.clone(),
        }
    }
}

/// Per-item change published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemEvent {
    pub batch_id: BatchId,
    pub item_id: UploadId,
    pub index: usize,
    pub total: usize,
    pub display_name: String,
    /// 源打开之前未知
    pub size_bytes: Option<u64>,
    pub status: UploadStatus,
    pub progress_percent: u8,
    pub attempt: u32,
    pub failure: Option<Failure>,
}

impl ItemEvent {
    /// Terminal for good: succeeded, or failed with no retry pending.
    pub fn is_final(&self) -> bool {
        match self.status {
            UploadStatus::Succeeded => true,
            UploadStatus::Failed => !self.failure.as_ref().is_some_and(|f| f.will_retry),
            _ => false,
        }
    }
}

/// Derived "N of M" view over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    pub all_done: bool,
    pub all_succeeded: bool,
}

impl BatchSummary {
    pub fn remaining(&self) -> usize {
        self.total_count - self.completed_count - self.failed_count
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all_succeeded {
            write!(f, "All {} files uploaded successfully", self.total_count)
        } else if self.all_done {
            write!(f, "{} of {} files failed", self.failed_count, self.total_count)
        } else {
            write!(f, "Uploading files ({} of {} completed)", self.completed_count, self.total_count)
        }
    }
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 条目状态或进度变更
    Item(ItemEvent),

    /// 批次汇总变更
    Summary(BatchSummary),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 最大并发数，None 表示不限制
    pub max_concurrent: Option<usize>,

    /// 读取分块大小
    pub chunk_size: usize,

    /// multipart 字段名
    pub field_name: String,

    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,

    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub read_timeout: Duration,

    /// 重试策略
    pub retry: RetryPolicy,

    /// 任务状态文件路径
    pub state_file: Option<PathBuf>,

    /// 临时文件目录，默认系统临时目录
    pub scratch_dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            chunk_size: super::progress_stream::DEFAULT_CHUNK_SIZE,
            field_name: "file".to_string(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            state_file: None,
            scratch_dir: None,
        }
    }
}

// 静态断言确保类型是 Send的
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<UploadItem>();
        assert_send::<UploadEvent>();
        assert_send::<ItemEvent>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use UploadStatus::*;

        // valid
        assert!(Queued.can_transition_to(Uploading));
        assert!(Queued.can_transition_to(Failed));
        assert!(Uploading.can_transition_to(Succeeded));
        assert!(Uploading.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Queued));

        // invalid
        assert!(!Succeeded.can_transition_to(Queued));
        assert!(!Succeeded.can_transition_to(Uploading));
        assert!(!Failed.can_transition_to(Uploading));
        assert!(!Uploading.can_transition_to(Queued));
    }

    #[test]
    fn test_id_generation() {
        let id1 = UploadId::new();
        let id2 = UploadId::new();

        assert_ne!(id1, id2);
        assert!(!id1.to_string().is_empty());
    }

    #[test]
    fn test_summary_display() {
        let mut summary = BatchSummary {
            batch_id: BatchId::new(),
            completed_count: 1,
            failed_count: 0,
            total_count: 3,
            all_done: false,
            all_succeeded: false,
        };
        assert_eq!(summary.to_string(), "Uploading files (1 of 3 completed)");
        assert_eq!(summary.remaining(), 2);

        summary.completed_count = 3;
        summary.all_done = true;
        summary.all_succeeded = true;
        assert_eq!(summary.to_string(), "All 3 files uploaded successfully");
    }

    #[test]
    fn test_retry_pending_failure_is_not_final() {
        let mut event = ItemEvent {
            batch_id: BatchId::new(),
            item_id: UploadId::new(),
            index: 0,
            total: 1,
            display_name: "a.bin".to_string(),
            size_bytes: Some(3),
            status: UploadStatus::Failed,
            progress_percent: 0,
            attempt: 1,
            failure: Some(Failure {
                kind: FailureKind::Transport,
                reason: "refused".to_string(),
                will_retry: true,
            }),
        };
        assert!(!event.is_final());

        event.failure = Some(Failure::cancelled());
        assert!(event.is_final());
    }
}
