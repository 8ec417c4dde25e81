use std::path::PathBuf;
use std::sync::Arc;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use crate::utils::percent_of;
use super::errors::{Result, UploadError};
use super::multipart::{MultipartEncoder, OCTET_STREAM};
use super::progress_stream::TransferStream;
use super::source::{OpenedSource, SourceRef};
use super::types::{UploadConfig, UploadId};

/// Updates a running job reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobUpdate {
    /// Source opened and its size resolved.
    Opened { id: UploadId, size: u64 },
    /// Percentage of the file written into the request body.
    Progress { id: UploadId, percent: u8 },
}

/// Sink for [`JobUpdate`]s. Called from the job's task, so it must be cheap.
pub type JobReporter = Arc<dyn Fn(JobUpdate) + Send + Sync>;

pub fn build_client(config: &UploadConfig) -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .build()?;

    Ok(client)
}

/// One upload attempt of one file. Never retries on its own.
pub struct UploadJob {
    pub(crate) id: UploadId,
    pub(crate) source: SourceRef,
    pub(crate) display_name: String,
    pub(crate) destination: String,
    pub(crate) field_name: String,
    pub(crate) chunk_size: usize,
    pub(crate) scratch_dir: Option<PathBuf>,
    pub(crate) client: Client,
    pub(crate) cancellation_token: CancellationToken,
}

impl UploadJob {
    pub async fn run(self, report: JobReporter) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let opened = tokio::select! {
            opened = self.source.open(self.scratch_dir.as_deref()) => opened?,
            _ = self.cancellation_token.cancelled() => return Err(UploadError::Cancelled),
        };

        let OpenedSource { file, size, scratch } = opened;
        report(JobUpdate::Opened { id: self.id, size });

        let result = self.send(file, size, &report).await;

        // 所有退出路径都删除临时文件
        if let Some(scratch) = scratch {
            scratch.remove();
        }

        result
    }

    async fn send(&self, file: File, size: u64, report: &JobReporter) -> Result<()> {
        let id = self.id;

        if size == 0 {
            report(JobUpdate::Progress { id, percent: 100 });
        }

        let progress = report.clone();
        let stream = TransferStream::from_file(
            file,
            self.chunk_size,
            Box::new(move |bytes| {
                progress(JobUpdate::Progress {
                    id,
                    percent: percent_of(bytes, size),
                });
            }),
        )
        .with_cancellation(self.cancellation_token.clone());

        let encoder = MultipartEncoder::new(&self.field_name, &self.display_name, OCTET_STREAM, stream, size);

        debug!(
            upload_id = %id,
            destination = %self.destination,
            size,
            content_length = encoder.content_length(),
            boundary = encoder.boundary(),
            "Sending upload request"
        );

        let request = self.client
            .post(&self.destination)
            .header(CONTENT_TYPE, encoder.content_type())
            .header(CONTENT_LENGTH, encoder.content_length())
            .body(encoder.into_body())
            .send();

        // 取消时直接丢弃请求 future，连接随之中断
        let response = tokio::select! {
            response = request => response,
            _ = self.cancellation_token.cancelled() => return Err(UploadError::Cancelled),
        };

        let response = match response {
            Ok(response) => response,
            Err(_) if self.cancellation_token.is_cancelled() => return Err(UploadError::Cancelled),
            Err(err) => return Err(UploadError::Transport(err)),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::ServerRejected { status: status.as_u16() });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn reporter() -> (Arc<Mutex<Vec<JobUpdate>>>, JobReporter) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Arc::new(move |update: JobUpdate| sink.lock().unwrap().push(update)))
    }

    fn job(source: SourceRef, token: CancellationToken) -> UploadJob {
        UploadJob {
            id: UploadId::new(),
            display_name: source.resolve_display_name(),
            source,
            // 不会真正发出请求
            destination: "http://127.0.0.1:9/upload".to_string(),
            field_name: "file".to_string(),
            chunk_size: 8 * 1024,
            scratch_dir: None,
            client: Client::new(),
            cancellation_token: token,
        }
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_network() {
        let (seen, report) = reporter();
        let result = job(SourceRef::new("/no/such/file.bin"), CancellationToken::new())
            .run(report)
            .await;

        assert!(matches!(result, Err(UploadError::SourceUnavailable(_))));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_job_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let (seen, report) = reporter();
        let result = job(SourceRef::from(path), token).run(report).await;

        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    mod staged {
        use super::*;
        use std::path::{Path, PathBuf};
        use std::time::Duration;
        use axum::http::StatusCode;
        use axum::routing::post;
        use axum::Router;
        use crate::core::source::SCRATCH_PREFIX;

        fn make_fifo(dir: &Path) -> PathBuf {
            let path = dir.join("pipe");
            let status = std::process::Command::new("mkfifo").arg(&path).status().unwrap();
            assert!(status.success());
            path
        }

        /// 在另一个线程里写入 FIFO，写完后关闭
        fn feed(fifo: PathBuf, data: Vec<u8>) -> std::thread::JoinHandle<()> {
            std::thread::spawn(move || std::fs::write(fifo, data).unwrap())
        }

        fn scratch_files(dir: &Path) -> usize {
            std::fs::read_dir(dir)
                .unwrap()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX))
                .count()
        }

        async fn serve(status: Option<StatusCode>) -> String {
            let app = Router::new().route(
                "/upload",
                post(move || async move {
                    match status {
                        Some(status) => status,
                        // 一直挂起
                        None => std::future::pending().await,
                    }
                }),
            );

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            format!("http://{}/upload", addr)
        }

        fn staged_job(fifo: &Path, scratch: &Path, destination: String, token: CancellationToken) -> UploadJob {
            let mut job = job(SourceRef::from(fifo), token);
            job.scratch_dir = Some(scratch.to_path_buf());
            job.destination = destination;
            job
        }

        #[tokio::test]
        async fn test_scratch_removed_after_success() {
            let source_dir = tempfile::tempdir().unwrap();
            let scratch_dir = tempfile::tempdir().unwrap();
            let fifo = make_fifo(source_dir.path());
            let writer = feed(fifo.clone(), vec![1u8; 3000]);

            let url = serve(Some(StatusCode::OK)).await;
            let (seen, report) = reporter();
            let result = staged_job(&fifo, scratch_dir.path(), url, CancellationToken::new())
                .run(report)
                .await;

            writer.join().unwrap();
            assert!(result.is_ok());
            assert!(seen.lock().unwrap().iter().any(|update| matches!(update, JobUpdate::Opened { size: 3000, .. })));
            assert_eq!(scratch_files(scratch_dir.path()), 0);
        }

        #[tokio::test]
        async fn test_scratch_removed_after_transport_failure() {
            let source_dir = tempfile::tempdir().unwrap();
            let scratch_dir = tempfile::tempdir().unwrap();
            let fifo = make_fifo(source_dir.path());
            let writer = feed(fifo.clone(), vec![1u8; 100]);

            // 绑定后立即释放，端口上没有监听
            let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
            let (_, report) = reporter();
            let result = staged_job(&fifo, scratch_dir.path(), format!("http://{}/upload", addr), CancellationToken::new())
                .run(report)
                .await;

            writer.join().unwrap();
            assert!(matches!(result, Err(UploadError::Transport(_))));
            assert_eq!(scratch_files(scratch_dir.path()), 0);
        }

        #[tokio::test]
        async fn test_scratch_removed_after_server_rejection() {
            let source_dir = tempfile::tempdir().unwrap();
            let scratch_dir = tempfile::tempdir().unwrap();
            let fifo = make_fifo(source_dir.path());
            let writer = feed(fifo.clone(), vec![1u8; 100]);

            let url = serve(Some(StatusCode::INTERNAL_SERVER_ERROR)).await;
            let (_, report) = reporter();
            let result = staged_job(&fifo, scratch_dir.path(), url, CancellationToken::new())
                .run(report)
                .await;

            writer.join().unwrap();
            assert!(matches!(result, Err(UploadError::ServerRejected { status: 500 })));
            assert_eq!(scratch_files(scratch_dir.path()), 0);
        }

        #[tokio::test]
        async fn test_scratch_removed_when_cancelled_during_upload() {
            let source_dir = tempfile::tempdir().unwrap();
            let scratch_dir = tempfile::tempdir().unwrap();
            let fifo = make_fifo(source_dir.path());
            let writer = feed(fifo.clone(), vec![1u8; 100]);

            let url = serve(None).await;
            let token = CancellationToken::new();

            // 源打开后再取消，此时请求已经或即将发出
            let cancel = token.clone();
            let report: JobReporter = Arc::new(move |update: JobUpdate| {
                if matches!(update, JobUpdate::Opened { .. }) {
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        cancel.cancel();
                    });
                }
            });

            let result = tokio::time::timeout(
                Duration::from_secs(10),
                staged_job(&fifo, scratch_dir.path(), url, token).run(report),
            )
            .await
            .unwrap();

            writer.join().unwrap();
            assert!(matches!(result, Err(UploadError::Cancelled)));
            assert_eq!(scratch_files(scratch_dir.path()), 0);
        }

        #[tokio::test]
        async fn test_scratch_removed_when_cancelled_during_staging() {
            let source_dir = tempfile::tempdir().unwrap();
            let scratch_dir = tempfile::tempdir().unwrap();
            let fifo = make_fifo(source_dir.path());

            // 写入一部分后保持打开，暂存一直读不到 EOF
            let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
            let writer = {
                let fifo = fifo.clone();
                std::thread::spawn(move || {
                    use std::io::Write;
                    let mut file = std::fs::OpenOptions::new().write(true).open(fifo).unwrap();
                    file.write_all(&[1u8; 100]).unwrap();
                    let _ = release_rx.recv();
                })
            };

            let token = CancellationToken::new();
            let (seen, report) = reporter();
            let run = tokio::spawn(
                staged_job(&fifo, scratch_dir.path(), "http://127.0.0.1:9/upload".to_string(), token.clone())
                    .run(report),
            );

            let scratch = scratch_dir.path().to_path_buf();
            tokio::time::timeout(Duration::from_secs(10), async {
                while scratch_files(&scratch) == 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            token.cancel();
            let result = tokio::time::timeout(Duration::from_secs(10), run).await.unwrap().unwrap();

            release_tx.send(()).unwrap();
            writer.join().unwrap();

            assert!(matches!(result, Err(UploadError::Cancelled)));
            assert!(seen.lock().unwrap().is_empty());
            assert_eq!(scratch_files(scratch_dir.path()), 0);
        }
    }
}
