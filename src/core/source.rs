use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tracing::{debug, warn};
use url::Url;
use super::errors::{Result, UploadError};

/// Prefix of per-job scratch files, used to find leftovers from a previous run.
pub const SCRATCH_PREFIX: &str = "uplift-scratch-";

/// Opaque reference to a file's content: a plain path or a `file://` URI,
/// with an optional display name supplied by whoever picked the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceRef {
    pub location: String,
    pub display_name: Option<String>,
}

impl SourceRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    fn as_url(&self) -> Option<Url> {
        // 单字母 scheme 视为 Windows 盘符
        Url::parse(&self.location)
            .ok()
            .filter(|url| url.scheme().len() > 1)
    }

    /// Name shown to the user: explicit metadata, then the last path-like
    /// segment of the location, then `file_<unix millis>`.
    pub fn resolve_display_name(&self) -> String {
        if let Some(name) = self.display_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                return name.to_string();
            }
        }

        if let Some(segment) = self.last_segment() {
            return segment;
        }

        format!("file_{}", chrono::Utc::now().timestamp_millis())
    }

    fn last_segment(&self) -> Option<String> {
        match self.as_url() {
            Some(url) => {
                if url.scheme() == "file" {
                    if let Ok(path) = url.to_file_path() {
                        return file_name(&path);
                    }
                }
                url.path_segments()?
                    .filter(|segment| !segment.is_empty())
                    .last()
                    .map(str::to_string)
            }
            None => file_name(Path::new(&self.location)),
        }
    }

    /// Local filesystem path behind this reference.
    pub fn local_path(&self) -> Result<PathBuf> {
        match self.as_url() {
            Some(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| UploadError::source_unavailable(format!("Invalid file URI: {}", self.location))),
            Some(url) => Err(UploadError::source_unavailable(format!(
                "Unsupported source scheme '{}': {}",
                url.scheme(),
                self.location
            ))),
            None if self.location.trim().is_empty() => {
                Err(UploadError::source_unavailable("Empty source location"))
            }
            None => Ok(PathBuf::from(&self.location)),
        }
    }

    /// Opens the source for reading and resolves its size.
    ///
    /// Sources without a trustworthy length (pipes, devices) are staged into a
    /// scratch file first; the returned [`ScratchFile`] owns that copy.
    pub async fn open(&self, scratch_dir: Option<&Path>) -> Result<OpenedSource> {
        let path = self.local_path()?;
        let unavailable = |err: std::io::Error| {
            UploadError::source_unavailable(format!("{}: {}", path.display(), err))
        };

        let mut file = File::open(&path).await.map_err(unavailable)?;
        let metadata = file.metadata().await.map_err(unavailable)?;

        if metadata.is_file() {
            return Ok(OpenedSource {
                file,
                size: metadata.len(),
                scratch: None,
            });
        }

        if metadata.is_dir() {
            return Err(UploadError::source_unavailable(format!(
                "{} is a directory",
                path.display()
            )));
        }

        // 长度未知，先复制到临时文件
        let scratch = ScratchFile::create(scratch_dir)?;
        let mut writer = File::from_std(scratch.inner.reopen()?);
        let size = tokio::io::copy(&mut file, &mut writer).await.map_err(unavailable)?;
        writer.sync_all().await?;
        drop(writer);

        debug!(source = %self.location, size, scratch = %scratch.path().display(), "Staged source into scratch file");

        let file = File::from_std(scratch.inner.reopen()?);
        Ok(OpenedSource {
            file,
            size,
            scratch: Some(scratch),
        })
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

impl From<&str> for SourceRef {
    fn from(location: &str) -> Self {
        SourceRef::new(location)
    }
}

impl From<String> for SourceRef {
    fn from(location: String) -> Self {
        SourceRef::new(location)
    }
}

impl From<&Path> for SourceRef {
    fn from(path: &Path) -> Self {
        SourceRef::new(path.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for SourceRef {
    fn from(path: PathBuf) -> Self {
        SourceRef::from(path.as_path())
    }
}

pub struct OpenedSource {
    pub file: File,
    pub size: u64,
    pub scratch: Option<ScratchFile>,
}

/// Staged copy of a source, exclusively owned by one job.
#[derive(Debug)]
pub struct ScratchFile {
    inner: NamedTempFile,
}

impl ScratchFile {
    fn create(dir: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);

        let inner = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Deletes the scratch file now; failures are logged.
    pub fn remove(self) {
        let path = self.inner.path().to_path_buf();
        if let Err(err) = self.inner.close() {
            warn!(path = %path.display(), error = %err, "Failed to delete scratch file");
        }
    }
}

/// Removes scratch files left behind by a previous process. Returns how many were deleted.
pub async fn cleanup_scratch(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "Scratch directory not readable");
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_scratch = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(SCRATCH_PREFIX));

        if is_scratch && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }

    removed
}
