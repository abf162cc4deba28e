//! File storage backend
//!
//! Each queue is stored as `<dir>/<queue>.json`. Dumps are written to a
//! temporary sibling, synced, then renamed over the previous file, so a
//! crash mid-write never corrupts the last good snapshot.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pulsemq_types::{validate_queue_name, QueueSnapshot, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::traits::SnapshotStore;

const SNAPSHOT_EXT: &str = "json";
const TEMP_EXT: &str = "json.tmp";

/// Snapshot store writing one JSON file per queue
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a snapshot directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "Initializing file snapshot storage");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, queue_name: &str) -> Result<PathBuf> {
        validate_queue_name(queue_name)?;
        Ok(self.dir.join(format!("{queue_name}.{SNAPSHOT_EXT}")))
    }

    fn temp_path(&self, queue_name: &str) -> PathBuf {
        self.dir.join(format!("{queue_name}.{TEMP_EXT}"))
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn dump(&self, snapshot: &QueueSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.queue)?;
        let tmp = self.temp_path(&snapshot.queue);
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;

        debug!(
            queue = %snapshot.queue,
            path = %path.display(),
            bytes = bytes.len(),
            "Snapshot written"
        );
        Ok(())
    }

    async fn load(&self, queue_name: &str) -> Result<Option<QueueSnapshot>> {
        let path = self.snapshot_path(queue_name)?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)?;
        snapshot.ensure_supported()?;

        if snapshot.queue != queue_name {
            warn!(
                queue = %queue_name,
                recorded = %snapshot.queue,
                "Snapshot file records a different queue name"
            );
        }

        Ok(Some(snapshot))
    }

    async fn remove(&self, queue_name: &str) -> Result<()> {
        let path = self.snapshot_path(queue_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
