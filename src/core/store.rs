use std::path::PathBuf;
use async_trait::async_trait;
use super::errors::Result;
use super::types::UploadItem;

/// Durable table of upload items, used to resume work after the process dies.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replaces the stored table with `items`.
    async fn save(&self, items: &[UploadItem]) -> Result<()>;

    /// Loads the stored table. A store that was never written is empty.
    async fn load(&self) -> Result<Vec<UploadItem>>;
}

/// Stores the item table as a JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, items: &[UploadItem]) -> Result<()> {
        let data = serde_json::to_string_pretty(items)?;

        // 先写临时文件再替换，避免写一半被杀掉
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }

    async fn load(&self) -> Result<Vec<UploadItem>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}
