//! Core types for usenet-engine

use serde::{Deserialize, Serialize};

/// Unique identifier for an NZB collection in the queue
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NzbId(pub i64);

impl NzbId {
    /// Create a new NzbId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for NzbId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NzbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NzbId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a file within an NZB collection
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl FileId {
    /// Create a new FileId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for FileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a configured news server (index into the server list)
pub type ServerId = usize;

/// Download priority
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
    /// Force start even while the queue is paused (2)
    Force = 2,
}

impl Priority {
    /// Convert integer priority code to Priority enum
    pub fn from_i32(priority: i32) -> Self {
        match priority {
            -1 => Priority::Low,
            0 => Priority::Normal,
            1 => Priority::High,
            2 => Priority::Force,
            _ => Priority::Normal,
        }
    }

    /// Force-priority entries are scheduled even while the queue is paused
    pub fn is_force(&self) -> bool {
        matches!(self, Priority::Force)
    }
}

/// Lifecycle status of a single article
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    /// Not attempted yet (eligible for scheduling)
    #[default]
    Undefined,
    /// A downloader currently owns this article
    Running,
    /// Downloaded and decoded successfully
    Finished,
    /// Failed on all servers at all levels
    Failed,
}

impl ArticleStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArticleStatus::Finished | ArticleStatus::Failed)
    }
}

/// Progress of per-file partial-state persistence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialState {
    /// Nothing persisted for this file
    #[default]
    None,
    /// Some articles persisted; download resumable
    Partial,
    /// All articles terminal and the output file exists
    Completed,
}

/// Why (and whether) an NZB is being removed from the queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStatus {
    /// Not being deleted
    #[default]
    None,
    /// Deleted by an edit command
    Manual,
    /// Deleted because health dropped below the critical threshold
    Health,
    /// Deleted by duplicate handling
    Dupe,
}

/// Direct-rename phase of an NZB (first-article header probing)
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DirectRenameStatus {
    /// Not started
    #[default]
    None,
    /// First articles are being fetched to read declared filenames
    Running,
    /// All filenames resolved
    Success,
    /// Phase abandoned (deletion, parking, failures)
    Failure,
}

/// Kind of queue entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NzbKind {
    /// A parsed NZB with a file list
    #[default]
    Nzb,
    /// A URL placeholder awaiting fetch of the NZB document
    Url,
}

/// Duplicate-handling mode carried on an NZB
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DupeMode {
    /// Keep the best-scored duplicate
    #[default]
    Score,
    /// Download all duplicates
    All,
    /// Download even when duplicate checks would drop it
    Force,
}

/// Outcome recorded for a finalized file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletedFileStatus {
    /// No articles completed at all
    #[default]
    None,
    /// Every article succeeded
    Success,
    /// Some articles succeeded, some failed
    Partial,
    /// Every article failed or was missed
    Failure,
}

/// Success/failure counters for one news server
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStat {
    /// Index of the server in the configured server list
    pub server_id: ServerId,
    /// Articles fetched successfully from this server
    pub success_articles: u32,
    /// Articles that failed on this server
    pub failed_articles: u32,
}

/// Direction of a [`ServerStatList::list_op`] merge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatOp {
    /// Add the other list's counters
    Add,
    /// Subtract the other list's counters (saturating)
    Subtract,
    /// Replace matching entries
    Set,
}

/// Per-server statistics carried on files and NZBs.
///
/// Kept sorted by server id; merged on article completion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatList {
    stats: Vec<ServerStat>,
}

impl ServerStatList {
    /// Record successes/failures for a server
    pub fn stat_op(&mut self, server_id: ServerId, success: u32, failed: u32, op: StatOp) {
        let pos = match self.stats.binary_search_by_key(&server_id, |s| s.server_id) {
            Ok(pos) => pos,
            Err(pos) => {
                self.stats.insert(
                    pos,
                    ServerStat {
                        server_id,
                        success_articles: 0,
                        failed_articles: 0,
                    },
                );
                pos
            }
        };
        let entry = &mut self.stats[pos];
        match op {
            StatOp::Add => {
                entry.success_articles += success;
                entry.failed_articles += failed;
            }
            StatOp::Subtract => {
                entry.success_articles = entry.success_articles.saturating_sub(success);
                entry.failed_articles = entry.failed_articles.saturating_sub(failed);
            }
            StatOp::Set => {
                entry.success_articles = success;
                entry.failed_articles = failed;
            }
        }
    }

    /// Merge another stat list into this one
    pub fn list_op(&mut self, other: &ServerStatList, op: StatOp) {
        for stat in &other.stats {
            self.stat_op(
                stat.server_id,
                stat.success_articles,
                stat.failed_articles,
                op,
            );
        }
    }

    /// Iterate over the per-server entries
    pub fn iter(&self) -> impl Iterator<Item = &ServerStat> {
        self.stats.iter()
    }

    /// Counters for one server, if any were recorded
    pub fn get(&self, server_id: ServerId) -> Option<&ServerStat> {
        self.stats.iter().find(|s| s.server_id == server_id)
    }
}

/// Event emitted by the queue (observer contract).
///
/// Dispatch is synchronous under the queue lock; a broadcast mirror exists
/// for detached subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// An NZB was handed to the queue but not inserted yet
    NzbFound {
        /// Queue entry ID
        id: NzbId,
        /// Collection name
        name: String,
    },

    /// An NZB was inserted into the queue
    NzbAdded {
        /// Queue entry ID
        id: NzbId,
        /// Collection name
        name: String,
    },

    /// The collection was renamed
    NzbNamed {
        /// Queue entry ID
        id: NzbId,
        /// New collection name
        name: String,
    },

    /// All files of the collection reached a terminal state
    NzbDownloaded {
        /// Queue entry ID
        id: NzbId,
        /// Health at completion, in permille
        health: u32,
    },

    /// The collection was removed from the queue
    NzbDeleted {
        /// Queue entry ID
        id: NzbId,
        /// Why the collection was removed
        status: DeleteStatus,
    },

    /// A file object was created in the queue
    FileFound {
        /// Owning collection
        nzb_id: NzbId,
        /// File ID
        file_id: FileId,
        /// Filename as declared by the NZB
        filename: String,
    },

    /// A file was reassembled and finalized on disk
    FileCompleted {
        /// Owning collection
        nzb_id: NzbId,
        /// File ID
        file_id: FileId,
        /// Final filename (after naming/dedup)
        filename: String,
        /// Terminal status of the file
        status: CompletedFileStatus,
    },

    /// A file was removed without completing
    FileDeleted {
        /// Owning collection
        nzb_id: NzbId,
        /// File ID
        file_id: FileId,
        /// Filename at the time of deletion
        filename: String,
    },

    /// A URL placeholder finished fetching its NZB document
    UrlCompleted {
        /// Placeholder queue entry ID
        id: NzbId,
        /// Whether the fetch succeeded
        success: bool,
    },
}
