mod aggregator;
mod errors;
mod job;
mod manager;
mod multipart;
mod progress_stream;
mod queue;
mod scheduler;
mod source;
mod store;
mod types;

pub use aggregator::StatusAggregator;
pub use errors::{Result, UploadError};
pub use job::{build_client, JobReporter, JobUpdate, UploadJob};
pub use manager::{validate_destination, BatchHandle, UploadManager, UploadManagerHandle};
pub use multipart::{MultipartEncoder, OCTET_STREAM};
pub use progress_stream::{ProgressCallback, TransferStream, DEFAULT_CHUNK_SIZE};
pub use source::{cleanup_scratch, OpenedSource, ScratchFile, SourceRef, SCRATCH_PREFIX};
pub use store::{JsonFileStore, StateStore};
pub use types::{
    BatchId,
    BatchSummary,
    Failure,
    FailureKind,
    ItemEvent,
    UploadConfig,
    UploadEvent,
    UploadId,
    UploadItem,
    UploadStatus,
};
