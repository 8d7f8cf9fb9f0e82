//! Download queue entities and the queue lock.
//!
//! `NzbInfo` owns its `FileInfo`s, which own their `ArticleInfo`s. Files
//! reference their owner through an arena id (`NzbId`) resolved via the
//! queue, never through a pointer. All mutation happens under the single
//! queue mutex; queue events are dispatched synchronously while it is held.

pub mod editor;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::cache::CachedSegment;
use crate::types::{
    ArticleStatus, CompletedFileStatus, DeleteStatus, DirectRenameStatus, DupeMode, FileId,
    NzbId, NzbKind, PartialState, Priority, QueueEvent, ServerStatList,
};

/// One Usenet article of a file.
pub struct ArticleInfo {
    /// 1-based part number within the file
    pub part_number: u32,
    /// Message-ID without angle brackets
    pub message_id: String,
    /// Declared (encoded-side) size in bytes
    pub size: u64,
    /// Scheduling status
    pub status: ArticleStatus,
    /// Temp segment path once written in temp-segment mode
    pub result_filename: Option<PathBuf>,
    /// 0-based byte offset of this part within the output file
    pub segment_offset: u64,
    /// Decoded size once known (from the yEnc part range)
    pub segment_size: u64,
    /// Cached decoded body awaiting flush
    pub segment: Option<CachedSegment>,
    /// CRC32 of the decoded bytes, once verified
    pub crc: u32,
}

impl ArticleInfo {
    /// A fresh article from NZB ingestion
    pub fn new(part_number: u32, message_id: impl Into<String>, size: u64) -> Self {
        Self {
            part_number,
            message_id: message_id.into(),
            size,
            status: ArticleStatus::Undefined,
            result_filename: None,
            segment_offset: 0,
            segment_size: 0,
            segment: None,
            crc: 0,
        }
    }
}

/// One file being reassembled from articles.
pub struct FileInfo {
    /// Arena id, assigned on queue insertion
    pub id: FileId,
    /// Owning collection (arena back-reference, resolved via the queue)
    pub nzb_id: NzbId,
    /// Current filename (may change via direct rename / article headers)
    pub filename: String,
    /// Filename as originally declared by the NZB
    pub origname: String,
    /// Newsgroup the articles were posted to
    pub group: Option<String>,
    /// Sum of declared article sizes
    pub size: u64,
    /// Bytes not yet terminal
    pub remaining_size: u64,
    /// Bytes of successfully fetched articles
    pub success_size: u64,
    /// Bytes of failed articles
    pub failed_size: u64,
    /// Bytes of articles missed on every server (430 everywhere)
    pub missed_size: u64,
    /// Total article count
    pub total_articles: u32,
    /// Articles fetched successfully
    pub success_articles: u32,
    /// Articles that failed
    pub failed_articles: u32,
    /// Articles missing on all servers
    pub missed_articles: u32,
    /// Articles in a terminal state
    pub completed_articles: u32,
    /// The articles
    pub articles: Vec<ArticleInfo>,
    /// Excluded from scheduling
    pub paused: bool,
    /// Marked for removal
    pub deleted: bool,
    /// Dropped because the destination already has this filename
    pub dupe_deleted: bool,
    /// Filename settled (by NZB declaration or article header)
    pub filename_confirmed: bool,
    /// Is a .par2 volume
    pub par_file: bool,
    /// Scheduled ahead of everything regardless of NZB priority
    pub extra_priority: bool,
    /// Live downloader count referencing this file
    pub active_downloads: u32,
    /// Path of the (partial) output file
    pub output_filename: Option<PathBuf>,
    /// Output file created and sized
    pub output_initialized: bool,
    /// Direct write forced for this file (resume, known offsets)
    pub force_direct_write: bool,
    /// Persistence progress
    pub partial_state: PartialState,
    /// Progress changed since the last partial-state save
    pub partial_changed: bool,
    /// Whole-file CRC32 (combined from article CRCs)
    pub crc: u32,
    /// MD5 of the first 16 KiB of the finished file
    pub hash16k: Option<String>,
    /// Per-server fetch counters
    pub server_stats: ServerStatList,
    /// Post time of the newest article (propagation delay, retention)
    pub post_time: DateTime<Utc>,
}

impl FileInfo {
    /// A fresh file from NZB ingestion. Segment offsets are derived from
    /// the declared part order; totals from the article list.
    pub fn new(filename: impl Into<String>, articles: Vec<ArticleInfo>) -> Self {
        let filename = filename.into();
        let size: u64 = articles.iter().map(|a| a.size).sum();
        let total_articles = articles.len() as u32;
        let par_file = is_par_file(&filename);

        let mut file = Self {
            id: FileId::new(0),
            nzb_id: NzbId::new(0),
            origname: filename.clone(),
            filename,
            group: None,
            size,
            remaining_size: size,
            success_size: 0,
            failed_size: 0,
            missed_size: 0,
            total_articles,
            success_articles: 0,
            failed_articles: 0,
            missed_articles: 0,
            completed_articles: 0,
            articles,
            paused: false,
            deleted: false,
            dupe_deleted: false,
            filename_confirmed: false,
            par_file,
            extra_priority: false,
            active_downloads: 0,
            output_filename: None,
            output_initialized: false,
            force_direct_write: false,
            partial_state: PartialState::None,
            partial_changed: false,
            crc: 0,
            hash16k: None,
            server_stats: ServerStatList::default(),
            post_time: Utc::now(),
        };
        let mut offset = 0;
        for article in &mut file.articles {
            article.segment_offset = offset;
            offset += article.size;
        }
        file
    }

    /// All articles terminal
    pub fn is_completed(&self) -> bool {
        self.completed_articles == self.total_articles
    }

    /// Terminal outcome derived from the article counters
    pub fn completed_status(&self) -> CompletedFileStatus {
        if self.total_articles == self.success_articles {
            CompletedFileStatus::Success
        } else if self.total_articles == self.missed_articles + self.failed_articles {
            CompletedFileStatus::Failure
        } else if self.success_articles > 0 || self.failed_articles > 0 {
            CompletedFileStatus::Partial
        } else {
            CompletedFileStatus::None
        }
    }

    /// First article whose status is still Undefined
    pub fn next_undefined_article(&self) -> Option<usize> {
        self.articles
            .iter()
            .position(|a| a.status == ArticleStatus::Undefined)
    }

    /// Re-apply a saved partial state (session resume). Terminal article
    /// statuses from the snapshot land on matching parts; the size and
    /// article counters move accordingly so the accounting invariant
    /// holds.
    pub fn apply_saved_state(&mut self, snapshot: &crate::diskstate::FileStateSnapshot) {
        let mut restored: Vec<(usize, ArticleStatus)> = Vec::new();
        for saved in &snapshot.articles {
            if !saved.status.is_terminal() {
                continue;
            }
            let Some(index) = self
                .articles
                .iter()
                .position(|a| a.part_number == saved.part_number)
            else {
                continue;
            };
            if self.articles[index].status != ArticleStatus::Undefined {
                continue;
            }
            self.articles[index].status = saved.status;
            self.articles[index].crc = saved.crc;
            self.articles[index].segment_size = saved.size;
            restored.push((index, saved.status));
        }

        for (index, status) in restored {
            let size = self.articles[index].size;
            self.remaining_size -= size;
            self.completed_articles += 1;
            match status {
                ArticleStatus::Finished => {
                    self.success_size += size;
                    self.success_articles += 1;
                }
                ArticleStatus::Failed => {
                    self.failed_size += size;
                    self.failed_articles += 1;
                }
                _ => {}
            }
        }
        self.partial_state = snapshot.partial_state;
        self.crc = snapshot.crc;
    }
}

/// Record of a finalized file kept on the NZB.
#[derive(Clone, Debug)]
pub struct CompletedFile {
    /// Id the file had while queued
    pub id: FileId,
    /// Final filename on disk
    pub filename: String,
    /// Name the NZB declared
    pub origname: String,
    /// Terminal outcome
    pub status: CompletedFileStatus,
    /// Whole-file CRC (success only, else 0)
    pub crc: u32,
    /// MD5 of the first 16 KiB
    pub hash16k: Option<String>,
    /// Whether the file is a par2 volume
    pub par_file: bool,
    /// Par set this file belongs to, when known
    pub par_set_id: Option<String>,
}

/// One NZB collection in the queue.
pub struct NzbInfo {
    /// Arena id, assigned on queue insertion
    pub id: NzbId,
    /// NZB or URL placeholder
    pub kind: NzbKind,
    /// Collection name
    pub name: String,
    /// Source URL for placeholders
    pub url: Option<String>,
    /// Category label
    pub category: String,
    /// Destination directory for completed files
    pub dest_dir: PathBuf,
    /// Scheduling priority
    pub priority: Priority,
    /// Duplicate-detection key
    pub dupe_key: String,
    /// Duplicate score
    pub dupe_score: i32,
    /// Duplicate handling mode
    pub dupe_mode: DupeMode,
    /// Sum of file sizes
    pub size: u64,
    /// Bytes not yet terminal
    pub remaining_size: u64,
    /// Bytes belonging to paused files
    pub paused_size: u64,
    /// Bytes fetched successfully
    pub success_size: u64,
    /// Bytes failed
    pub failed_size: u64,
    /// Raw bytes transferred, including retries
    pub downloaded_size: u64,
    /// Total article count
    pub total_articles: u32,
    /// Articles fetched successfully
    pub success_articles: u32,
    /// Articles failed
    pub failed_articles: u32,
    /// The files
    pub files: Vec<FileInfo>,
    /// Finalized files
    pub completed_files: Vec<CompletedFile>,
    /// Per-server fetch counters
    pub server_stats: ServerStatList,
    /// Deletion state
    pub delete_status: DeleteStatus,
    /// Keep downloaded files while cancelling the rest
    pub parking: bool,
    /// Paused by the health check
    pub health_paused: bool,
    /// Direct-rename phase
    pub direct_rename_status: DirectRenameStatus,
    /// All files had their first article fetched (rename phase done)
    pub all_first: bool,
    /// Three or more files share a name; article naming is authoritative
    pub many_dupe_files: bool,
    /// Live downloader count across all files
    pub active_downloads: u32,
    /// Dirty flag for queue persistence
    pub changed: bool,
    /// When the NZB entered the queue
    pub added_time: DateTime<Utc>,
}

impl NzbInfo {
    /// A fresh collection from NZB ingestion
    pub fn new(name: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: NzbId::new(0),
            kind: NzbKind::Nzb,
            name: name.into(),
            url: None,
            category: String::new(),
            dest_dir: dest_dir.into(),
            priority: Priority::Normal,
            dupe_key: String::new(),
            dupe_score: 0,
            dupe_mode: DupeMode::Score,
            size: 0,
            remaining_size: 0,
            paused_size: 0,
            success_size: 0,
            failed_size: 0,
            downloaded_size: 0,
            total_articles: 0,
            success_articles: 0,
            failed_articles: 0,
            files: Vec::new(),
            completed_files: Vec::new(),
            server_stats: ServerStatList::default(),
            delete_status: DeleteStatus::None,
            parking: false,
            health_paused: false,
            direct_rename_status: DirectRenameStatus::None,
            all_first: false,
            many_dupe_files: false,
            active_downloads: 0,
            changed: false,
            added_time: Utc::now(),
        }
    }

    /// A URL placeholder entry
    pub fn new_url(name: impl Into<String>, url: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        let mut nzb = Self::new(name, dest_dir);
        nzb.kind = NzbKind::Url;
        nzb.url = Some(url.into());
        nzb
    }

    /// Attach a file and fold its totals into the aggregates
    pub fn attach_file(&mut self, mut file: FileInfo) {
        file.nzb_id = self.id;
        self.size += file.size;
        self.remaining_size += file.remaining_size;
        if file.paused {
            self.paused_size += file.remaining_size;
        }
        self.total_articles += file.total_articles;
        self.success_articles += file.success_articles;
        self.failed_articles += file.failed_articles;
        self.files.push(file);
    }

    /// Remove a deleted (not completed) file's contribution from the
    /// aggregates. Called before the file leaves the list.
    pub fn update_deleted_stats(&mut self, file: &FileInfo) {
        self.size -= file.size;
        self.remaining_size -= file.remaining_size;
        if file.paused {
            self.paused_size -= file.remaining_size;
        }
        self.total_articles -= file.total_articles;
        self.success_articles -= file.success_articles;
        self.failed_articles -= file.failed_articles;
        self.success_size -= file.success_size;
        self.failed_size -= file.failed_size + file.missed_size;
    }

    /// Health in permille: the share of articles still able to succeed.
    /// 1000 = no failures so far; falls as failures accumulate.
    pub fn calc_health(&self) -> u32 {
        if self.total_articles == 0 {
            return 1000;
        }
        1000u32.saturating_sub(
            ((self.failed_articles as u64 * 1000) / self.total_articles as u64) as u32,
        )
    }

    /// Number of files currently paused
    pub fn paused_file_count(&self) -> usize {
        self.files.iter().filter(|f| f.paused).count()
    }

    /// Whether any file carries extra priority
    pub fn has_extra_priority(&self) -> bool {
        self.files.iter().any(|f| f.extra_priority)
    }

    /// All files done (file list drained)
    pub fn is_download_completed(&self) -> bool {
        self.files.is_empty()
    }

    /// Deletion in progress
    pub fn is_deleting(&self) -> bool {
        self.delete_status != DeleteStatus::None
    }

    /// Find a file by id
    pub fn find_file(&self, id: FileId) -> Option<&FileInfo> {
        self.files.iter().find(|f| f.id == id)
    }

    /// Find a file by id, mutable
    pub fn find_file_mut(&mut self, id: FileId) -> Option<&mut FileInfo> {
        self.files.iter_mut().find(|f| f.id == id)
    }
}

fn is_par_file(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    lower.ends_with(".par2")
}

/// The ordered queue plus history, behind the single queue lock.
pub struct QueueInner {
    /// Active entries, in scheduling order
    pub queue: VecDeque<NzbInfo>,
    /// Finished/deleted entries
    pub history: Vec<NzbInfo>,
    next_nzb_id: i64,
    next_file_id: i64,
    /// Set when the queue needs a save (cleared by the coordinator)
    pub save_pending: bool,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            history: Vec::new(),
            next_nzb_id: 1,
            next_file_id: 1,
            save_pending: false,
        }
    }

    /// Assign arena ids to an NZB and its files.
    ///
    /// Pre-set nonzero ids (a restored session) are kept; the counters
    /// advance past them so fresh ids never collide.
    pub fn assign_ids(&mut self, nzb: &mut NzbInfo) {
        if nzb.id.get() == 0 {
            nzb.id = NzbId::new(self.next_nzb_id);
        }
        self.next_nzb_id = self.next_nzb_id.max(nzb.id.get() + 1);
        for file in &mut nzb.files {
            if file.id.get() == 0 {
                file.id = FileId::new(self.next_file_id);
            }
            self.next_file_id = self.next_file_id.max(file.id.get() + 1);
            file.nzb_id = nzb.id;
        }
    }

    /// Find an NZB by id
    pub fn find_nzb(&self, id: NzbId) -> Option<&NzbInfo> {
        self.queue.iter().find(|n| n.id == id)
    }

    /// Find an NZB by id, mutable
    pub fn find_nzb_mut(&mut self, id: NzbId) -> Option<&mut NzbInfo> {
        self.queue.iter_mut().find(|n| n.id == id)
    }

    /// Position of an NZB in the queue
    pub fn position(&self, id: NzbId) -> Option<usize> {
        self.queue.iter().position(|n| n.id == id)
    }

    /// Find the NZB owning a file
    pub fn find_nzb_of_file(&self, file_id: FileId) -> Option<&NzbInfo> {
        self.queue
            .iter()
            .find(|n| n.files.iter().any(|f| f.id == file_id))
    }

    /// Find the NZB owning a file, mutable
    pub fn find_nzb_of_file_mut(&mut self, file_id: FileId) -> Option<&mut NzbInfo> {
        self.queue
            .iter_mut()
            .find(|n| n.files.iter().any(|f| f.id == file_id))
    }

    /// Move an NZB from the queue into history
    pub fn move_to_history(&mut self, id: NzbId) -> bool {
        if let Some(pos) = self.position(id) {
            if let Some(nzb) = self.queue.remove(pos) {
                self.history.push(nzb);
                self.save_pending = true;
                return true;
            }
        }
        false
    }
}

/// Handler registered for synchronous queue events
pub type Listener = Box<dyn Fn(&QueueEvent) + Send + Sync>;

/// The process-global download queue: one mutex, synchronous observers,
/// and a broadcast mirror for detached subscribers.
pub struct DownloadQueue {
    inner: Mutex<QueueInner>,
    listeners: Mutex<Vec<Listener>>,
    broadcast: tokio::sync::broadcast::Sender<QueueEvent>,
}

impl DownloadQueue {
    /// An empty queue
    pub fn new() -> Self {
        let (broadcast, _) = tokio::sync::broadcast::channel(1024);
        Self {
            inner: Mutex::new(QueueInner::new()),
            listeners: Mutex::new(Vec::new()),
            broadcast,
        }
    }

    /// Take the queue lock. Mutations and event emission both require the
    /// guard; hold it for short critical sections and never across awaits.
    pub fn guard(&self) -> QueueGuard<'_> {
        QueueGuard {
            inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
            owner: self,
        }
    }

    /// Register a synchronous listener (called under the queue lock)
    pub fn attach_listener(&self, listener: Listener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Subscribe to the broadcast mirror of queue events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.broadcast.subscribe()
    }
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard over the queue; derefs to [`QueueInner`].
pub struct QueueGuard<'a> {
    inner: MutexGuard<'a, QueueInner>,
    owner: &'a DownloadQueue,
}

impl QueueGuard<'_> {
    /// Emit a queue event: synchronous listeners first (still under the
    /// lock, the observer contract), then the broadcast mirror.
    pub fn notify(&self, event: QueueEvent) {
        for listener in self
            .owner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            listener(&event);
        }
        self.owner.broadcast.send(event).ok();
    }
}

impl std::ops::Deref for QueueGuard<'_> {
    type Target = QueueInner;

    fn deref(&self) -> &QueueInner {
        &self.inner
    }
}

impl std::ops::DerefMut for QueueGuard<'_> {
    fn deref_mut(&mut self) -> &mut QueueInner {
        &mut self.inner
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn file_with_articles(name: &str, sizes: &[u64]) -> FileInfo {
        let articles = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| ArticleInfo::new(i as u32 + 1, format!("part{}@test", i + 1), size))
            .collect();
        FileInfo::new(name, articles)
    }

    #[test]
    fn file_totals_derive_from_articles() {
        let file = file_with_articles("a.bin", &[100, 200, 50]);
        assert_eq!(file.size, 350);
        assert_eq!(file.remaining_size, 350);
        assert_eq!(file.total_articles, 3);
        assert_eq!(file.articles[0].segment_offset, 0);
        assert_eq!(file.articles[1].segment_offset, 100);
        assert_eq!(file.articles[2].segment_offset, 300);
    }

    #[test]
    fn par_files_are_detected_by_extension() {
        assert!(file_with_articles("a.vol01+02.PAR2", &[1]).par_file);
        assert!(!file_with_articles("a.rar", &[1]).par_file);
    }

    #[test]
    fn attach_file_folds_totals_into_the_nzb() {
        let mut nzb = NzbInfo::new("job", "/dest");
        nzb.attach_file(file_with_articles("a.bin", &[100, 100]));
        nzb.attach_file(file_with_articles("b.bin", &[300]));

        assert_eq!(nzb.size, 500);
        assert_eq!(nzb.remaining_size, 500);
        assert_eq!(nzb.total_articles, 3);
    }

    #[test]
    fn deleted_stats_subtract_the_file_contribution() {
        let mut nzb = NzbInfo::new("job", "/dest");
        nzb.attach_file(file_with_articles("foo.bin", &[100]));
        nzb.attach_file(file_with_articles("foo.bin", &[50]));

        let dropped = nzb.files.pop().unwrap();
        nzb.update_deleted_stats(&dropped);

        assert_eq!(nzb.size, 100);
        assert_eq!(nzb.remaining_size, 100);
        assert_eq!(nzb.total_articles, 1);
    }

    #[test]
    fn health_is_1000_minus_failure_share() {
        let mut nzb = NzbInfo::new("job", "/dest");
        nzb.attach_file(file_with_articles("a.bin", &[10; 10]));
        assert_eq!(nzb.calc_health(), 1000);

        nzb.failed_articles = 7;
        assert_eq!(nzb.calc_health(), 300);

        nzb.failed_articles = 10;
        assert_eq!(nzb.calc_health(), 0);
    }

    #[test]
    fn health_of_empty_nzb_is_full() {
        assert_eq!(NzbInfo::new("job", "/dest").calc_health(), 1000);
    }

    #[test]
    fn completed_status_covers_all_outcomes() {
        let mut file = file_with_articles("a.bin", &[10, 10]);
        file.success_articles = 2;
        assert_eq!(file.completed_status(), CompletedFileStatus::Success);

        let mut file = file_with_articles("a.bin", &[10, 10]);
        file.failed_articles = 2;
        assert_eq!(file.completed_status(), CompletedFileStatus::Failure);

        let mut file = file_with_articles("a.bin", &[10, 10]);
        file.success_articles = 1;
        file.failed_articles = 1;
        assert_eq!(file.completed_status(), CompletedFileStatus::Partial);

        let file = file_with_articles("a.bin", &[10, 10]);
        assert_eq!(file.completed_status(), CompletedFileStatus::None);
    }

    #[test]
    fn arena_ids_are_assigned_on_insertion() {
        let queue = DownloadQueue::new();
        let mut guard = queue.guard();

        let mut nzb = NzbInfo::new("job", "/dest");
        nzb.attach_file(file_with_articles("a.bin", &[10]));
        nzb.attach_file(file_with_articles("b.bin", &[10]));
        guard.assign_ids(&mut nzb);

        assert_eq!(nzb.id, NzbId::new(1));
        assert_eq!(nzb.files[0].id, FileId::new(1));
        assert_eq!(nzb.files[1].id, FileId::new(2));
        assert_eq!(nzb.files[0].nzb_id, nzb.id, "back-reference through the arena id");

        let mut second = NzbInfo::new("job2", "/dest");
        guard.assign_ids(&mut second);
        assert_eq!(second.id, NzbId::new(2));
    }

    #[test]
    fn find_nzb_of_file_resolves_the_back_reference() {
        let queue = DownloadQueue::new();
        let mut guard = queue.guard();

        let mut nzb = NzbInfo::new("job", "/dest");
        nzb.attach_file(file_with_articles("a.bin", &[10]));
        guard.assign_ids(&mut nzb);
        let file_id = nzb.files[0].id;
        let nzb_id = nzb.id;
        guard.queue.push_back(nzb);

        assert_eq!(guard.find_nzb_of_file(file_id).unwrap().id, nzb_id);
        assert!(guard.find_nzb_of_file(FileId::new(99)).is_none());
    }

    #[test]
    fn listeners_fire_synchronously_under_the_lock() {
        let queue = DownloadQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        queue.attach_listener(Box::new(move |event| {
            if matches!(event, QueueEvent::NzbAdded { .. }) {
                fired2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let guard = queue.guard();
        guard.notify(QueueEvent::NzbAdded {
            id: NzbId::new(1),
            name: "job".to_string(),
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1, "dispatch must not defer");
    }

    #[test]
    fn saved_state_restores_terminal_articles_and_counters() {
        use crate::diskstate::{ArticleStateSnapshot, FileStateSnapshot};

        let mut file = file_with_articles("a.bin", &[100, 100, 100]);
        file.id = FileId::new(5);

        let snapshot = FileStateSnapshot {
            file_id: FileId::new(5),
            filename: "a.bin".to_string(),
            partial_state: PartialState::Partial,
            crc: 0,
            articles: vec![
                ArticleStateSnapshot {
                    part_number: 1,
                    status: ArticleStatus::Finished,
                    crc: 0xabcd,
                    size: 98,
                },
                ArticleStateSnapshot {
                    part_number: 2,
                    status: ArticleStatus::Failed,
                    crc: 0,
                    size: 0,
                },
                ArticleStateSnapshot {
                    part_number: 3,
                    status: ArticleStatus::Undefined,
                    crc: 0,
                    size: 0,
                },
            ],
        };
        file.apply_saved_state(&snapshot);

        assert_eq!(file.articles[0].status, ArticleStatus::Finished);
        assert_eq!(file.articles[0].crc, 0xabcd);
        assert_eq!(file.articles[1].status, ArticleStatus::Failed);
        assert_eq!(file.articles[2].status, ArticleStatus::Undefined);
        assert_eq!(file.completed_articles, 2);
        assert_eq!(file.remaining_size, 100);
        assert_eq!(file.partial_state, PartialState::Partial);
        assert_eq!(
            file.success_size + file.failed_size + file.missed_size + file.remaining_size,
            file.size,
            "accounting invariant survives the restore"
        );
    }

    #[test]
    fn preset_ids_survive_assignment_and_advance_the_counters() {
        let queue = DownloadQueue::new();
        let mut guard = queue.guard();

        let mut restored = NzbInfo::new("resumed", "/dest");
        restored.id = NzbId::new(7);
        let mut file = file_with_articles("a.bin", &[10]);
        file.id = FileId::new(12);
        restored.attach_file(file);
        guard.assign_ids(&mut restored);

        assert_eq!(restored.id, NzbId::new(7));
        assert_eq!(restored.files[0].id, FileId::new(12));

        let mut fresh = NzbInfo::new("fresh", "/dest");
        fresh.attach_file(file_with_articles("b.bin", &[10]));
        guard.assign_ids(&mut fresh);
        assert_eq!(fresh.id, NzbId::new(8), "counter advanced past the restored id");
        assert_eq!(fresh.files[0].id, FileId::new(13));
    }

    #[test]
    fn move_to_history_removes_from_queue() {
        let queue = DownloadQueue::new();
        let mut guard = queue.guard();

        let mut nzb = NzbInfo::new("job", "/dest");
        guard.assign_ids(&mut nzb);
        let id = nzb.id;
        guard.queue.push_back(nzb);

        assert!(guard.move_to_history(id));
        assert!(guard.find_nzb(id).is_none());
        assert_eq!(guard.history.len(), 1);
        assert!(guard.save_pending);
    }
}
