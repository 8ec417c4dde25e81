pub mod config;
pub mod core;
pub mod utils;

// 重新导出核心类型
pub use self::core::{
    BatchHandle,
    BatchId,
    BatchSummary,
    Failure,
    FailureKind,
    ItemEvent,
    SourceRef,
    UploadConfig,
    UploadError,
    UploadEvent,
    UploadId,
    UploadItem,
    UploadManager,
    UploadManagerHandle,
    UploadStatus,
    Result,
};

pub use self::utils::{RetryPolicy, RetryStrategy};
