//! Snapshot sources.
//!
//! The exporter publishes one JSON document per refresh. `FileSource` reads
//! it from local disk (the exporter and this process share a host),
//! `HttpSource` pulls it from wherever the exporter serves it.

use super::{Snapshot, SnapshotError};
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Anything that can hand back a complete snapshot or fail.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn load(&self) -> Result<Snapshot, SnapshotError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FileSource {
    async fn load(&self) -> Result<Snapshot, SnapshotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(self.path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot = Snapshot::from_json(&bytes)?;
        debug!(
            path = %self.path.display(),
            validators = snapshot.len(),
            epoch = snapshot.current_epoch(),
            "snapshot read from file"
        );
        Ok(snapshot)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

pub struct HttpSource {
    url: String,
    http: Client,
}

impl HttpSource {
    pub fn new(url: String, timeout: Duration) -> Result<Self, SnapshotError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl SnapshotSource for HttpSource {
    async fn load(&self) -> Result<Snapshot, SnapshotError> {
        let resp = self.http.get(&self.url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SnapshotError::NotFound(self.url.clone()));
        }
        if !status.is_success() {
            return Err(SnapshotError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await?;
        let snapshot = Snapshot::from_json(&bytes)?;
        debug!(
            url = %self.url,
            validators = snapshot.len(),
            epoch = snapshot.current_epoch(),
            "snapshot fetched"
        );
        Ok(snapshot)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
