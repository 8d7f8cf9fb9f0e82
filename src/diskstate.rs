//! Persisted queue and per-file state (the DiskState seam).
//!
//! Persistence format and storage engine belong to an outer collaborator;
//! the core talks to this trait with plain serde snapshots. A JSON-file
//! implementation is provided for standalone use, and an in-memory double
//! backs the tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ArticleStatus, DeleteStatus, FileId, NzbId, NzbKind, PartialState, Priority};

/// Queue-level snapshot: order, identity, and aggregates of every entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Entries in queue order
    pub entries: Vec<NzbSnapshot>,
}

/// Persisted projection of one NZB entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NzbSnapshot {
    /// Arena id
    pub id: NzbId,
    /// NZB or URL placeholder
    pub kind: NzbKind,
    /// Collection name
    pub name: String,
    /// Source URL for placeholders
    pub url: Option<String>,
    /// Category label
    pub category: String,
    /// Destination directory
    pub dest_dir: PathBuf,
    /// Scheduling priority
    pub priority: Priority,
    /// Deletion state
    pub delete_status: DeleteStatus,
    /// Total size in bytes
    pub size: u64,
    /// Bytes not yet terminal
    pub remaining_size: u64,
    /// File ids still queued
    pub file_ids: Vec<FileId>,
}

/// Persisted projection of one file's progress
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileStateSnapshot {
    /// Arena id
    pub file_id: FileId,
    /// Current filename
    pub filename: String,
    /// Persistence stage
    pub partial_state: PartialState,
    /// Whole-file CRC when known
    pub crc: u32,
    /// Per-article terminal statuses
    pub articles: Vec<ArticleStateSnapshot>,
}

/// Persisted projection of one article
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArticleStateSnapshot {
    /// 1-based part number
    pub part_number: u32,
    /// Status at save time
    pub status: ArticleStatus,
    /// Verified CRC for finished articles
    pub crc: u32,
    /// Decoded size for finished articles
    pub size: u64,
}

/// Download-progress beacon saved once per second for active entries
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Entry the progress belongs to
    pub nzb_id: NzbId,
    /// Bytes downloaded so far (including retries)
    pub downloaded_size: u64,
    /// Bytes not yet terminal
    pub remaining_size: u64,
}

/// Persistence operations the core invokes.
#[async_trait]
pub trait DiskState: Send + Sync {
    /// Persist the queue snapshot
    async fn save_download_queue(&self, snapshot: &QueueSnapshot) -> Result<()>;

    /// Load the queue snapshot from the previous session, if any
    async fn load_download_queue(&self) -> Result<Option<QueueSnapshot>>;

    /// Persist a per-entry progress beacon
    async fn save_download_progress(&self, progress: &ProgressSnapshot) -> Result<()>;

    /// Persist a file's article statuses. `completed` marks the terminal
    /// save kept for resumed direct-write files.
    async fn save_file_state(&self, state: &FileStateSnapshot, completed: bool) -> Result<()>;

    /// Load a file's saved statuses
    async fn load_file_state(
        &self,
        file_id: FileId,
        completed: bool,
    ) -> Result<Option<FileStateSnapshot>>;

    /// Drop persisted data for a file
    async fn discard_file(
        &self,
        file_id: FileId,
        delete_data: bool,
        delete_partial: bool,
        delete_completed: bool,
    ) -> Result<()>;
}

/// JSON files under a state directory.
pub struct FileDiskState {
    dir: PathBuf,
}

impl FileDiskState {
    /// State store rooted at `dir` (created on demand)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn queue_path(&self) -> PathBuf {
        self.dir.join("queue.json")
    }

    fn progress_path(&self, nzb_id: NzbId) -> PathBuf {
        self.dir.join(format!("nzb-{nzb_id}.progress.json"))
    }

    fn file_path(&self, file_id: FileId, completed: bool) -> PathBuf {
        let suffix = if completed { "completed" } else { "state" };
        self.dir.join(format!("file-{file_id}.{suffix}.json"))
    }

    async fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(value)?;
        // write-then-rename keeps a crash from truncating live state
        let tmp = path.with_extension("json.new");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(&self, path: PathBuf) -> Result<Option<T>> {
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DiskState for FileDiskState {
    async fn save_download_queue(&self, snapshot: &QueueSnapshot) -> Result<()> {
        self.write_json(self.queue_path(), snapshot).await
    }

    async fn load_download_queue(&self) -> Result<Option<QueueSnapshot>> {
        self.read_json(self.queue_path()).await
    }

    async fn save_download_progress(&self, progress: &ProgressSnapshot) -> Result<()> {
        self.write_json(self.progress_path(progress.nzb_id), progress)
            .await
    }

    async fn save_file_state(&self, state: &FileStateSnapshot, completed: bool) -> Result<()> {
        self.write_json(self.file_path(state.file_id, completed), state)
            .await
    }

    async fn load_file_state(
        &self,
        file_id: FileId,
        completed: bool,
    ) -> Result<Option<FileStateSnapshot>> {
        self.read_json(self.file_path(file_id, completed)).await
    }

    async fn discard_file(
        &self,
        file_id: FileId,
        _delete_data: bool,
        delete_partial: bool,
        delete_completed: bool,
    ) -> Result<()> {
        if delete_partial {
            let _ = tokio::fs::remove_file(self.file_path(file_id, false)).await;
        }
        if delete_completed {
            let _ = tokio::fs::remove_file(self.file_path(file_id, true)).await;
        }
        Ok(())
    }
}

/// In-memory DiskState double for tests.
#[derive(Default)]
pub struct MemoryDiskState {
    queue: Mutex<Option<QueueSnapshot>>,
    progress: Mutex<HashMap<NzbId, ProgressSnapshot>>,
    files: Mutex<HashMap<(FileId, bool), FileStateSnapshot>>,
}

impl MemoryDiskState {
    /// Fresh empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queue saves observed (the last snapshot is kept)
    pub fn queue_saved(&self) -> bool {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

#[async_trait]
impl DiskState for MemoryDiskState {
    async fn save_download_queue(&self, snapshot: &QueueSnapshot) -> Result<()> {
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }

    async fn load_download_queue(&self) -> Result<Option<QueueSnapshot>> {
        Ok(self.queue.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save_download_progress(&self, progress: &ProgressSnapshot) -> Result<()> {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(progress.nzb_id, progress.clone());
        Ok(())
    }

    async fn save_file_state(&self, state: &FileStateSnapshot, completed: bool) -> Result<()> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((state.file_id, completed), state.clone());
        Ok(())
    }

    async fn load_file_state(
        &self,
        file_id: FileId,
        completed: bool,
    ) -> Result<Option<FileStateSnapshot>> {
        Ok(self
            .files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(file_id, completed))
            .cloned())
    }

    async fn discard_file(
        &self,
        file_id: FileId,
        _delete_data: bool,
        delete_partial: bool,
        delete_completed: bool,
    ) -> Result<()> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        if delete_partial {
            files.remove(&(file_id, false));
        }
        if delete_completed {
            files.remove(&(file_id, true));
        }
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file_state(id: i64) -> FileStateSnapshot {
        FileStateSnapshot {
            file_id: FileId::new(id),
            filename: "a.bin".to_string(),
            partial_state: PartialState::Partial,
            crc: 0xdead_beef,
            articles: vec![
                ArticleStateSnapshot {
                    part_number: 1,
                    status: ArticleStatus::Finished,
                    crc: 1,
                    size: 100,
                },
                ArticleStateSnapshot {
                    part_number: 2,
                    status: ArticleStatus::Undefined,
                    crc: 0,
                    size: 100,
                },
            ],
        }
    }

    #[tokio::test]
    async fn file_disk_state_round_trips_queue_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = FileDiskState::new(dir.path());

        assert!(state.load_download_queue().await.unwrap().is_none());

        let snapshot = QueueSnapshot {
            entries: vec![NzbSnapshot {
                id: NzbId::new(1),
                kind: NzbKind::Nzb,
                name: "job".to_string(),
                url: None,
                category: String::new(),
                dest_dir: PathBuf::from("/dest"),
                priority: Priority::Normal,
                delete_status: DeleteStatus::None,
                size: 100,
                remaining_size: 40,
                file_ids: vec![FileId::new(1)],
            }],
        };
        state.save_download_queue(&snapshot).await.unwrap();
        let loaded = state.load_download_queue().await.unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].name, "job");

        state
            .save_file_state(&sample_file_state(1), false)
            .await
            .unwrap();
        let loaded = state
            .load_file_state(FileId::new(1), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.articles.len(), 2);
        assert_eq!(loaded.articles[0].status, ArticleStatus::Finished);
    }

    #[tokio::test]
    async fn partial_and_completed_states_are_separate_slots() {
        let dir = tempfile::tempdir().unwrap();
        let state = FileDiskState::new(dir.path());

        state
            .save_file_state(&sample_file_state(7), false)
            .await
            .unwrap();
        assert!(
            state
                .load_file_state(FileId::new(7), true)
                .await
                .unwrap()
                .is_none()
        );

        state
            .save_file_state(&sample_file_state(7), true)
            .await
            .unwrap();
        state
            .discard_file(FileId::new(7), false, true, false)
            .await
            .unwrap();
        assert!(
            state
                .load_file_state(FileId::new(7), false)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            state
                .load_file_state(FileId::new(7), true)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn memory_disk_state_mirrors_the_contract() {
        let state = MemoryDiskState::new();
        assert!(!state.queue_saved());

        state
            .save_download_queue(&QueueSnapshot::default())
            .await
            .unwrap();
        assert!(state.queue_saved());

        state
            .save_file_state(&sample_file_state(3), false)
            .await
            .unwrap();
        state
            .discard_file(FileId::new(3), true, true, true)
            .await
            .unwrap();
        assert!(
            state
                .load_file_state(FileId::new(3), false)
                .await
                .unwrap()
                .is_none()
        );
    }
}
