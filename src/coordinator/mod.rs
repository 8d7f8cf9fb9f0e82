//! The central scheduler.
//!
//! One coordinator task owns article selection: it borrows a level-0
//! connection from the pool, picks the next eligible article under the
//! queue lock, and spawns an [`ArticleDownloader`] per in-flight article.
//! Downloader tasks report back through [`QueueCoordinator::article_completed`],
//! which updates statistics, detects file completion, enforces health
//! thresholds, and finalizes files. A separate flush task drains the
//! article cache; per-second housekeeping closes idle connections, resets
//! hanging downloaders, and persists partial state.

pub mod article_task;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::context::CoreContext;
use crate::diskstate::{ArticleStateSnapshot, FileStateSnapshot, NzbSnapshot, ProgressSnapshot, QueueSnapshot};
use crate::error::Result;
use crate::queue::editor::{EditCommand, EditOutcome, QueueEditor};
use crate::queue::{CompletedFile, NzbInfo, QueueGuard};
use crate::types::{
    ArticleStatus, CompletedFileStatus, DeleteStatus, DirectRenameStatus, DupeMode, FileId,
    NzbId, NzbKind, PartialState, QueueEvent, StatOp,
};
use crate::url_fetch::{FetchedNzb, UrlDownloader};
use crate::writer::{CompletionPlan, PartRecord};

use article_task::{
    ArticleDownloader, ArticleJob, DownloadOutcome, DownloaderControl, FailKind, SegmentStorage,
};

/// How often the cache flusher looks for work
const FLUSH_POLL: Duration = Duration::from_millis(200);

/// Registry entry for one live downloader task
struct ActiveDownload {
    file_id: FileId,
    control: Arc<DownloaderControl>,
}

/// The scheduler. Owns the main loop; shared by `Arc`.
pub struct QueueCoordinator {
    ctx: CoreContext,
    shutdown: CancellationToken,
    wakeup: Arc<tokio::sync::Notify>,
    active: Mutex<HashMap<u64, ActiveDownload>>,
    next_task_id: AtomicU64,
    pause_download: AtomicBool,
}

impl QueueCoordinator {
    /// Wire the coordinator into the component graph.
    pub fn new(ctx: CoreContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            shutdown: CancellationToken::new(),
            wakeup: Arc::new(tokio::sync::Notify::new()),
            active: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(1),
            pause_download: AtomicBool::new(false),
        })
    }

    /// Shared context (queue, cache, pool, writer, disk state)
    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    /// Start the scheduler and the cache flusher.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let flusher = Arc::clone(self);
        tokio::spawn(async move { flusher.flush_loop().await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.main_loop().await })
    }

    /// Nudge the scheduler after queue changes, pauses, or new NZBs.
    pub fn wake_up(&self) {
        self.wakeup.notify_one();
    }

    /// Pause or resume scheduling. In-flight articles always finish;
    /// force-priority entries keep scheduling through a pause.
    pub fn set_paused(&self, paused: bool) {
        self.pause_download.store(paused, Ordering::Release);
        self.wake_up();
    }

    /// Whether scheduling is paused
    pub fn is_paused(&self) -> bool {
        self.pause_download.load(Ordering::Acquire)
    }

    /// Number of live article downloaders
    pub fn active_downloads(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn main_loop(self: Arc<Self>) {
        tracing::debug!("entering coordinator loop");
        let mut standby_wait = Duration::from_millis(100);
        let mut housekeep = tokio::time::interval(Duration::from_secs(1));
        housekeep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.shutdown.is_cancelled() {
            if self.schedule_next() {
                standby_wait = Duration::from_millis(100);
                continue;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {
                    standby_wait = Duration::from_millis(100);
                }
                _ = housekeep.tick() => {
                    self.housekeep().await;
                }
                _ = tokio::time::sleep(standby_wait) => {
                    // standby backoff, capped at 2s
                    standby_wait = (standby_wait * 2).min(Duration::from_secs(2));
                }
            }
        }

        self.wait_jobs().await;
        self.save_all_partial_state().await;
        self.save_queue_if_changed().await;
        tracing::debug!("exiting coordinator loop");
    }

    /// Try to start one article download. Returns true when one started.
    fn schedule_next(self: &Arc<Self>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if self.active_downloads() >= self.ctx.pool.downloads_limit() {
            return false;
        }
        let Some(connection) = self.ctx.pool.get_connection(0, None, None, false, None, &[])
        else {
            return false;
        };

        let job = {
            let mut guard = self.ctx.queue.guard();
            self.get_next_article(&mut guard)
        };

        match job {
            Some(job) => {
                self.start_article_download(job, connection);
                true
            }
            None => {
                self.ctx.pool.free_connection(connection, true);
                false
            }
        }
    }

    /// Select the next article and stamp it Running.
    ///
    /// Walks NZBs by `(extra-priority, priority)`, skipping paused and
    /// deleted entries and files inside the propagation window. Files
    /// found to have no schedulable article are remembered and skipped on
    /// the rescan. In the direct-rename phase, first articles of
    /// unconfirmed files take precedence.
    fn get_next_article(&self, guard: &mut QueueGuard<'_>) -> Option<ArticleJob> {
        let paused_all = self.is_paused();
        let propagation = self.ctx.config.download.propagation_delay;
        let now = Utc::now();
        let mut checked: Vec<FileId> = Vec::new();

        loop {
            let mut best: Option<(NzbId, FileId, bool, crate::types::Priority)> = None;

            for nzb in guard.queue.iter() {
                if nzb.is_deleting() || nzb.kind == NzbKind::Url {
                    continue;
                }
                if nzb.files.len() == nzb.paused_file_count() {
                    continue;
                }
                if paused_all && !nzb.priority.is_force() {
                    continue;
                }
                for file in &nzb.files {
                    if file.paused || file.deleted || checked.contains(&file.id) {
                        continue;
                    }
                    if !propagation.is_zero()
                        && file.post_time + chrono::Duration::from_std(propagation).unwrap_or_default()
                            >= now
                    {
                        continue;
                    }
                    let candidate = (file.extra_priority, nzb.priority);
                    let better = match &best {
                        None => true,
                        Some((_, _, best_extra, best_priority)) => {
                            candidate > (*best_extra, *best_priority)
                        }
                    };
                    if better {
                        best = Some((nzb.id, file.id, file.extra_priority, nzb.priority));
                    }
                }
            }

            let (nzb_id, file_id, _, _) = best?;

            if self.ctx.config.download.direct_rename {
                let in_rename = guard
                    .find_nzb(nzb_id)
                    .map(|n| {
                        n.direct_rename_status <= DirectRenameStatus::Running && !n.all_first
                    })
                    .unwrap_or(false);
                if in_rename {
                    if let Some(job) = self.next_first_article(guard, nzb_id) {
                        return Some(job);
                    }
                }
            }

            let has_article = guard
                .find_nzb(nzb_id)
                .and_then(|n| n.find_file(file_id))
                .and_then(|f| f.next_undefined_article());

            match has_article {
                Some(index) => return Some(self.make_job(guard, nzb_id, file_id, index)),
                None => {
                    // nothing left in this file; rescan without it
                    checked.push(file_id);
                }
            }
        }
    }

    /// Direct-rename preference: the first article of each file whose name
    /// is not confirmed yet.
    fn next_first_article(&self, guard: &mut QueueGuard<'_>, nzb_id: NzbId) -> Option<ArticleJob> {
        let pick = guard.find_nzb(nzb_id).and_then(|nzb| {
            nzb.files
                .iter()
                .find(|f| {
                    !f.filename_confirmed
                        && !f.deleted
                        && f.articles
                            .first()
                            .map(|a| a.status == ArticleStatus::Undefined)
                            .unwrap_or(false)
                })
                .map(|f| f.id)
        });

        match pick {
            Some(file_id) => {
                if let Some(nzb) = guard.find_nzb_mut(nzb_id) {
                    nzb.direct_rename_status = DirectRenameStatus::Running;
                }
                Some(self.make_job(guard, nzb_id, file_id, 0))
            }
            None => {
                if let Some(nzb) = guard.find_nzb_mut(nzb_id) {
                    nzb.all_first = true;
                }
                None
            }
        }
    }

    fn make_job(
        &self,
        guard: &mut QueueGuard<'_>,
        nzb_id: NzbId,
        file_id: FileId,
        article_index: usize,
    ) -> ArticleJob {
        let config = &self.ctx.config;
        let nzb = guard
            .find_nzb_mut(nzb_id)
            .unwrap_or_else(|| unreachable!("selected nzb vanished under the lock"));
        nzb.active_downloads += 1;
        let nzb_name = nzb.name.clone();
        let file = nzb
            .find_file_mut(file_id)
            .unwrap_or_else(|| unreachable!("selected file vanished under the lock"));
        file.active_downloads += 1;
        let total = file.articles.len();
        let article = &mut file.articles[article_index];
        article.status = ArticleStatus::Running;

        let age_days = (Utc::now() - file.post_time).num_days().max(0) as u32;
        ArticleJob {
            nzb_id,
            file_id,
            part_number: article.part_number,
            message_id: article.message_id.clone(),
            group: file.group.clone(),
            declared_size: article.size,
            file_size: file.size,
            direct: config.download.direct_write || file.force_direct_write,
            age_days: Some(age_days),
            info_name: format!(
                "{}/{} [{}/{}]",
                nzb_name, file.filename, article.part_number, total
            ),
        }
    }

    fn start_article_download(self: &Arc<Self>, job: ArticleJob, connection: crate::nntp::Connection) {
        let control = Arc::new(DownloaderControl::new());
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                task_id,
                ActiveDownload {
                    file_id: job.file_id,
                    control: Arc::clone(&control),
                },
            );

        tracing::debug!(article = %job.info_name, "starting article download");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut downloader = ArticleDownloader::new(
                job.clone(),
                Arc::clone(&this.ctx.config),
                Arc::clone(&this.ctx.pool),
                Arc::clone(&this.ctx.cache),
                Arc::clone(&this.ctx.writer),
                control,
            );
            let outcome = downloader.run(connection).await;
            this.article_completed(task_id, job, &downloader, outcome).await;
            this.wakeup.notify_one();
        });
    }

    /// Process a downloader's terminal outcome: statistics, filename
    /// confirmation, duplicate handling, health check, and completion
    /// detection. Called on the downloader's task.
    pub(crate) async fn article_completed(
        self: &Arc<Self>,
        task_id: u64,
        job: ArticleJob,
        downloader: &ArticleDownloader,
        outcome: DownloadOutcome,
    ) {
        let mut finalize_completed = false;
        let mut finalize_deleted = false;
        let mut health_outcome: Option<EditOutcome> = None;
        let mut orphaned_storage: Option<SegmentStorage> = None;

        {
            let mut guard = self.ctx.queue.guard();
            let Some(nzb) = guard.find_nzb_of_file_mut(job.file_id) else {
                // file finalized while we were finishing; drop the payload
                if let DownloadOutcome::Finished(finished) = outcome {
                    orphaned_storage = Some(finished.storage);
                }
                drop(guard);
                self.unregister_task(task_id);
                self.discard_orphan(job.file_id, orphaned_storage);
                return;
            };

            let mut retry = false;
            let mut file_completed = false;
            let mut article_filename: Option<String> = None;

            match outcome {
                DownloadOutcome::Finished(finished) => {
                    article_filename = finished.article_filename.clone();
                    let file = nzb
                        .find_file_mut(job.file_id)
                        .unwrap_or_else(|| unreachable!("owner resolved above"));
                    let article = &mut file.articles[(job.part_number - 1) as usize];
                    article.status = ArticleStatus::Finished;
                    article.crc = finished.crc;
                    article.segment_size = finished.decoded_size;
                    article.segment_offset = finished.offset;
                    match finished.storage {
                        SegmentStorage::Cached(segment) => article.segment = Some(segment),
                        SegmentStorage::TempFile(path) => article.result_filename = Some(path),
                        SegmentStorage::Direct => {
                            file.output_initialized = true;
                        }
                    }
                    file.success_size += job.declared_size;
                    file.success_articles += 1;
                    nzb.success_size += job.declared_size;
                    nzb.success_articles += 1;
                }
                DownloadOutcome::Failed(kind) => {
                    let file = nzb
                        .find_file_mut(job.file_id)
                        .unwrap_or_else(|| unreachable!("owner resolved above"));
                    let article = &mut file.articles[(job.part_number - 1) as usize];
                    article.status = ArticleStatus::Failed;
                    match kind {
                        FailKind::NotFound => {
                            file.missed_size += job.declared_size;
                            file.missed_articles += 1;
                        }
                        _ => {
                            file.failed_size += job.declared_size;
                            file.failed_articles += 1;
                        }
                    }
                    nzb.failed_size += job.declared_size;
                    nzb.failed_articles += 1;
                    tracing::warn!(article = %job.info_name, ?kind, "article failed");
                }
                DownloadOutcome::Retry => {
                    let file = nzb
                        .find_file_mut(job.file_id)
                        .unwrap_or_else(|| unreachable!("owner resolved above"));
                    let article = &mut file.articles[(job.part_number - 1) as usize];
                    article.status = ArticleStatus::Undefined;
                    retry = true;
                    if job.part_number == 1 {
                        nzb.all_first = false;
                    }
                }
            }

            if !retry {
                let file = nzb
                    .find_file_mut(job.file_id)
                    .unwrap_or_else(|| unreachable!("owner resolved above"));
                file.remaining_size -= job.declared_size;
                file.completed_articles += 1;
                file.partial_changed = true;
                file.server_stats.list_op(&downloader.server_stats, StatOp::Add);
                file_completed = file.is_completed();
                let file_paused = file.paused;
                nzb.remaining_size -= job.declared_size;
                if file_paused {
                    nzb.paused_size -= job.declared_size;
                }
                nzb.server_stats.list_op(&downloader.server_stats, StatOp::Add);
            }
            nzb.downloaded_size += downloader.downloaded_bytes;
            nzb.changed = true;
            let nzb_id = nzb.id;

            if let Some(name) = article_filename {
                if self.confirm_filename(&mut guard, nzb_id, job.file_id, &name) {
                    // duplicate in the destination: the file is dead
                    file_completed = false;
                }
            }

            health_outcome = self.check_health(&mut guard, nzb_id);

            // parking: the last active downloader closes out the file
            if let Some(nzb) = guard.find_nzb_of_file_mut(job.file_id) {
                let parking = nzb.parking;
                let file = nzb
                    .find_file_mut(job.file_id)
                    .unwrap_or_else(|| unreachable!("owner resolved above"));
                if parking && file.active_downloads == 1 && !file.dupe_deleted {
                    file_completed = true;
                }

                file.active_downloads -= 1;
                let deleted = file.deleted;
                let no_more_actives = file.active_downloads == 0;
                nzb.active_downloads -= 1;

                if file_completed && (!deleted || parking) {
                    finalize_completed = true;
                } else if deleted && no_more_actives {
                    finalize_deleted = true;
                }
            }

            guard.save_pending = true;
        }

        self.unregister_task(task_id);

        if let Some(outcome) = health_outcome {
            self.process_edit_outcome(outcome).await;
        }
        if finalize_completed {
            self.finalize_completed_file(job.file_id).await;
        } else if finalize_deleted {
            self.delete_file_info(job.file_id, false).await;
        }
    }

    fn unregister_task(&self, task_id: u64) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    fn discard_orphan(&self, file_id: FileId, storage: Option<SegmentStorage>) {
        match storage {
            Some(SegmentStorage::Cached(segment)) => {
                self.ctx.cache.unregister(file_id, segment.charged());
                self.ctx.cache.free(segment);
            }
            Some(SegmentStorage::TempFile(path)) => {
                let _ = std::fs::remove_file(path);
            }
            _ => {}
        }
    }

    /// Settle the file's final name from an article header, per the
    /// FileNaming mode, then drop the file when the destination already
    /// holds a file of that name. Returns true when the file was dropped.
    fn confirm_filename(
        &self,
        guard: &mut QueueGuard<'_>,
        nzb_id: NzbId,
        file_id: FileId,
        article_name: &str,
    ) -> bool {
        use crate::config::FileNaming;

        let config = &self.ctx.config.download;
        let Some(nzb) = guard.find_nzb_mut(nzb_id) else {
            return false;
        };
        let many_dupes = nzb.many_dupe_files;
        let dupe_mode = nzb.dupe_mode;
        let dest_dir = nzb.dest_dir.clone();
        let Some(file) = nzb.find_file_mut(file_id) else {
            return false;
        };
        if file.filename_confirmed {
            return false;
        }

        let use_article_name = match config.file_naming {
            FileNaming::Nzb => false,
            FileNaming::Article => true,
            FileNaming::Auto => !crate::deobfuscation::is_obfuscated(article_name) && !many_dupes,
        };
        if use_article_name {
            file.filename = crate::utils::make_valid_filename(article_name);
        }
        file.filename_confirmed = true;

        let duplicate = config.dupe_check
            && dupe_mode != DupeMode::Force
            && !many_dupes
            && dest_dir.join(&file.filename).exists();
        if duplicate {
            tracing::warn!(
                filename = %file.filename,
                "file already exists in destination, cancelling download"
            );
            file.dupe_deleted = true;
            file.deleted = true;
            if file.active_downloads > 1 {
                self.stop_file_downloads(file_id);
            }
        }
        duplicate
    }

    /// Escalate when health drops below the critical threshold.
    fn check_health(&self, guard: &mut QueueGuard<'_>, nzb_id: NzbId) -> Option<EditOutcome> {
        use crate::config::{HealthCheck, ParScan};

        let config = &self.ctx.config.download;
        if config.health_check == HealthCheck::None {
            return None;
        }
        let nzb = guard.find_nzb(nzb_id)?;
        if nzb.health_paused
            || nzb.delete_status == DeleteStatus::Health
            || nzb.calc_health() >= config.critical_health
        {
            return None;
        }
        if config.par_scan == ParScan::Dupe
            && config.health_check == HealthCheck::Park
            && nzb.total_articles > 0
            && nzb.success_articles * 100 / nzb.total_articles > 10
        {
            return None;
        }

        let health = nzb.calc_health();
        let name = nzb.name.clone();
        match config.health_check {
            HealthCheck::Pause => {
                tracing::warn!(
                    nzb = %name,
                    health,
                    critical = config.critical_health,
                    "pausing due to critical health"
                );
                if let Some(nzb) = guard.find_nzb_mut(nzb_id) {
                    nzb.health_paused = true;
                }
                QueueEditor::edit_entry(guard, EditCommand::GroupPause(nzb_id)).ok()
            }
            HealthCheck::Delete | HealthCheck::Park => {
                let park = config.health_check == HealthCheck::Park;
                tracing::warn!(
                    nzb = %name,
                    health,
                    critical = config.critical_health,
                    park,
                    "cancelling download due to critical health"
                );
                if let Some(nzb) = guard.find_nzb_mut(nzb_id) {
                    nzb.delete_status = DeleteStatus::Health;
                }
                let command = if park {
                    EditCommand::GroupParkDelete(nzb_id)
                } else {
                    EditCommand::GroupDelete(nzb_id)
                };
                QueueEditor::edit_entry(guard, command).ok()
            }
            HealthCheck::None => None,
        }
    }

    /// Apply an edit batch and perform the follow-up work it demands.
    pub async fn edit(self: &Arc<Self>, commands: Vec<EditCommand>) -> Result<()> {
        let outcome = {
            let mut guard = self.ctx.queue.guard();
            QueueEditor::edit_list(&mut guard, commands)?
        };
        self.process_edit_outcome(outcome).await;
        self.wake_up();
        Ok(())
    }

    async fn process_edit_outcome(self: &Arc<Self>, outcome: EditOutcome) {
        for file_id in outcome.cancel_files {
            self.stop_file_downloads(file_id);
        }
        for file_id in outcome.finalize_files {
            self.delete_file_info(file_id, false).await;
        }
        if let Some(relocation) = outcome.relocate {
            let writer = Arc::clone(&self.ctx.writer);
            let filenames = relocation.filenames.clone();
            let old_dir = relocation.old_dest_dir.clone();
            let new_dir = relocation.new_dest_dir.clone();
            let moved = tokio::task::spawn_blocking(move || {
                writer.move_completed_files(&filenames, &old_dir, &new_dir)
            })
            .await;

            let failed = !matches!(moved, Ok(Ok(())));
            if failed {
                tracing::error!(
                    nzb_id = %relocation.nzb_id,
                    "failed to relocate completed files, rolling back category change"
                );
                let mut guard = self.ctx.queue.guard();
                QueueEditor::rollback_category(&mut guard, &relocation);
            }
        }
    }

    /// Cancel every live downloader referencing a file.
    pub(crate) fn stop_file_downloads(&self, file_id: FileId) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for download in active.values() {
            if download.file_id == file_id {
                download.control.stop();
            }
        }
    }

    /// Finalize a fully-downloaded file: flush its cached segments, stitch
    /// the parts together, then remove it from the queue.
    async fn finalize_completed_file(self: &Arc<Self>, file_id: FileId) {
        self.flush_file(file_id).await;

        let plan = {
            let guard = self.ctx.queue.guard();
            let Some(nzb) = guard.find_nzb_of_file(file_id) else {
                return;
            };
            let Some(file) = nzb.find_file(file_id) else {
                return;
            };
            CompletionPlan {
                file_id,
                filename: file.filename.clone(),
                dest_dir: nzb.dest_dir.clone(),
                direct: self.ctx.config.download.direct_write || file.force_direct_write,
                parts: file
                    .articles
                    .iter()
                    .filter(|a| a.status == ArticleStatus::Finished)
                    .map(|a| PartRecord {
                        part_number: a.part_number,
                        size: a.segment_size,
                        crc: a.crc,
                        path: a.result_filename.clone(),
                    })
                    .collect(),
            }
        };

        let writer = Arc::clone(&self.ctx.writer);
        let plan_for_io = plan.clone();
        let result =
            tokio::task::spawn_blocking(move || writer.complete_file_parts(&plan_for_io)).await;

        match result {
            Ok(Ok(output)) => {
                {
                    let mut guard = self.ctx.queue.guard();
                    if let Some(nzb) = guard.find_nzb_of_file_mut(file_id) {
                        if let Some(file) = nzb.find_file_mut(file_id) {
                            file.output_filename = Some(output.path.clone());
                            file.crc = output.crc;
                            file.hash16k = Some(output.hash16k.clone());
                            file.partial_state = PartialState::Completed;
                            file.partial_changed = false;
                        }
                    }
                }
                self.delete_file_info(file_id, true).await;
            }
            Ok(Err(err)) => {
                tracing::error!(file_id = %file_id, error = %err, "file finalization failed");
                self.delete_file_info(file_id, false).await;
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "finalization task panicked");
                self.delete_file_info(file_id, false).await;
            }
        }
    }

    /// Remove a file from its collection once nothing references it.
    ///
    /// Waits out a cache flush holding the file, updates aggregates,
    /// records the completed-file entry, emits the file event, and, when
    /// the collection drains, moves the NZB to history with its terminal
    /// event.
    pub(crate) async fn delete_file_info(self: &Arc<Self>, file_id: FileId, completed: bool) {
        while self.ctx.cache.file_busy(file_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut temp_parts: Vec<u32> = Vec::new();
        let mut freed_segments = Vec::new();
        let mut discard_temp = false;
        let mut file_snapshot: Option<FileStateSnapshot> = None;

        {
            let mut guard = self.ctx.queue.guard();
            let Some(nzb) = guard.find_nzb_of_file_mut(file_id) else {
                return;
            };
            let nzb_id = nzb.id;
            let parking = nzb.parking;
            let Some(pos) = nzb.files.iter().position(|f| f.id == file_id) else {
                return;
            };
            let mut file = nzb.files.remove(pos);
            let was_deleted = file.deleted;
            file.deleted = true;

            if !completed && !nzb.is_deleting() {
                nzb.update_deleted_stats(&file);
            }

            let status = file.completed_status();

            for article in &mut file.articles {
                if let Some(segment) = article.segment.take() {
                    freed_segments.push(segment);
                }
                if article.result_filename.is_some() {
                    temp_parts.push(article.part_number);
                }
            }

            if !completed {
                discard_temp = true;
            }

            if completed || parking {
                nzb.completed_files.push(CompletedFile {
                    id: file.id,
                    filename: file
                        .output_filename
                        .as_deref()
                        .map(crate::utils::base_file_name)
                        .filter(|n| !n.is_empty())
                        .unwrap_or(&file.filename)
                        .to_string(),
                    origname: file.origname.clone(),
                    status,
                    crc: if status == CompletedFileStatus::Success {
                        file.crc
                    } else {
                        0
                    },
                    hash16k: file.hash16k.clone(),
                    par_file: file.par_file,
                    par_set_id: None,
                });
            }

            if status == CompletedFileStatus::Partial && (completed || parking) {
                file_snapshot = Some(snapshot_file(&file));
            }

            nzb.changed = true;

            let event = if completed && !was_deleted {
                QueueEvent::FileCompleted {
                    nzb_id,
                    file_id,
                    filename: file.filename.clone(),
                    status,
                }
            } else {
                QueueEvent::FileDeleted {
                    nzb_id,
                    file_id,
                    filename: file.filename.clone(),
                }
            };
            guard.notify(event);

            // collection drained: terminal event and history move
            let drained = guard
                .find_nzb(nzb_id)
                .map(|n| n.files.is_empty())
                .unwrap_or(false);
            if drained {
                let (delete_status, health, name) = guard
                    .find_nzb(nzb_id)
                    .map(|n| (n.delete_status, n.calc_health(), n.name.clone()))
                    .unwrap_or((DeleteStatus::None, 1000, String::new()));
                if delete_status != DeleteStatus::None {
                    tracing::info!(nzb = %name, ?delete_status, "collection deleted");
                    guard.notify(QueueEvent::NzbDeleted {
                        id: nzb_id,
                        status: delete_status,
                    });
                } else {
                    tracing::info!(nzb = %name, health, "collection downloaded");
                    guard.notify(QueueEvent::NzbDownloaded {
                        id: nzb_id,
                        health,
                    });
                }
                guard.move_to_history(nzb_id);
            }

            guard.save_pending = true;
        }

        for segment in freed_segments {
            self.ctx.cache.unregister(file_id, segment.charged());
            self.ctx.cache.free(segment);
        }
        if discard_temp {
            let writer = Arc::clone(&self.ctx.writer);
            let parts = temp_parts.clone();
            let _ = tokio::task::spawn_blocking(move || writer.discard_file(file_id, &parts)).await;
        }
        if let Some(snapshot) = file_snapshot {
            let _ = self.ctx.disk_state.save_file_state(&snapshot, true).await;
        }
        let _ = self
            .ctx
            .disk_state
            .discard_file(file_id, completed, true, false)
            .await;
        self.ctx.pool.clear_blocks(file_id);
    }

    /// Flush a file's cached segments to disk (temp or direct mode).
    async fn flush_file(self: &Arc<Self>, file_id: FileId) {
        let _flush_guard = self.ctx.cache.guard_flush(file_id).await;

        let (work, direct, file_size) = {
            let mut guard = self.ctx.queue.guard();
            let Some(nzb) = guard.find_nzb_of_file_mut(file_id) else {
                return;
            };
            let Some(file) = nzb.find_file_mut(file_id) else {
                return;
            };
            let direct = self.ctx.config.download.direct_write || file.force_direct_write;
            let file_size = file.size;
            let work: Vec<(u32, u64, crate::cache::CachedSegment)> = file
                .articles
                .iter_mut()
                .filter_map(|a| {
                    a.segment
                        .take()
                        .map(|segment| (a.part_number, a.segment_offset, segment))
                })
                .collect();
            (work, direct, file_size)
        };

        if work.is_empty() {
            return;
        }
        tracing::debug!(file_id = %file_id, segments = work.len(), "flushing cached segments");

        for (part_number, offset, segment) in work {
            let writer = Arc::clone(&self.ctx.writer);
            let charged = segment.charged();
            let written = tokio::task::spawn_blocking(move || {
                let result = if direct {
                    writer
                        .write_direct(file_id, file_size, offset, segment.data())
                        .map(|_| None)
                } else {
                    writer
                        .write_temp_segment(file_id, part_number, segment.data())
                        .map(Some)
                };
                (result, segment)
            })
            .await;

            match written {
                Ok((Ok(path), segment)) => {
                    self.ctx.cache.unregister(file_id, charged);
                    self.ctx.cache.free(segment);
                    if let Some(path) = path {
                        let mut guard = self.ctx.queue.guard();
                        if let Some(nzb) = guard.find_nzb_of_file_mut(file_id) {
                            if let Some(file) = nzb.find_file_mut(file_id) {
                                if let Some(article) = file
                                    .articles
                                    .iter_mut()
                                    .find(|a| a.part_number == part_number)
                                {
                                    article.result_filename = Some(path);
                                }
                            }
                        }
                    }
                }
                Ok((Err(err), segment)) => {
                    // disk failure is fatal for the file
                    tracing::error!(file_id = %file_id, error = %err, "cache flush failed");
                    self.ctx.cache.unregister(file_id, charged);
                    self.ctx.cache.free(segment);
                    let mut guard = self.ctx.queue.guard();
                    if let Some(nzb) = guard.find_nzb_of_file_mut(file_id) {
                        if let Some(file) = nzb.find_file_mut(file_id) {
                            file.deleted = true;
                        }
                    }
                    drop(guard);
                    self.stop_file_downloads(file_id);
                    return;
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "flush task panicked");
                    return;
                }
            }
        }
    }

    /// Cache flusher: drains the largest-footprint file once usage passes
    /// the watermark.
    async fn flush_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(FLUSH_POLL) => {}
            }
            if let Some(file_id) = self.ctx.cache.flush_candidate(false) {
                self.flush_file(file_id).await;
            }
        }
        // drain what's left so shutdown doesn't strand cached segments
        let mut last_allocated = u64::MAX;
        while let Some(file_id) = self.ctx.cache.flush_candidate(true) {
            self.flush_file(file_id).await;
            let allocated = self.ctx.cache.allocated();
            if allocated >= last_allocated {
                break;
            }
            last_allocated = allocated;
        }
    }

    /// Once-per-second housekeeping.
    async fn housekeep(self: &Arc<Self>) {
        self.ctx.pool.close_unused_connections();
        self.reset_hanging_downloads();
        self.save_all_partial_state().await;
        self.save_queue_if_changed().await;
    }

    /// Cancel downloaders that made no progress past the article timeout.
    fn reset_hanging_downloads(&self) {
        let timeout = self.ctx.config.retry.article_timeout.as_secs();
        if timeout == 0 {
            return;
        }
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for download in active.values() {
            if download.control.idle_secs() > timeout + 1 {
                tracing::error!(
                    file_id = %download.file_id,
                    "cancelling hanging download"
                );
                download.control.stop();
            }
        }
    }

    /// Persist partial state of files whose progress changed.
    async fn save_all_partial_state(&self) {
        if !self.ctx.config.download.continue_partial {
            return;
        }
        let (snapshots, progress) = {
            let mut guard = self.ctx.queue.guard();
            let mut snapshots = Vec::new();
            let mut progress = Vec::new();
            for nzb in guard.queue.iter_mut() {
                if nzb.active_downloads > 0 {
                    progress.push(ProgressSnapshot {
                        nzb_id: nzb.id,
                        downloaded_size: nzb.downloaded_size,
                        remaining_size: nzb.remaining_size,
                    });
                }
                for file in &mut nzb.files {
                    if file.partial_changed {
                        file.partial_changed = false;
                        file.partial_state = PartialState::Partial;
                        snapshots.push(snapshot_file(file));
                    }
                }
            }
            (snapshots, progress)
        };

        let saves = snapshots
            .iter()
            .map(|snapshot| self.ctx.disk_state.save_file_state(snapshot, false));
        for result in futures::future::join_all(saves).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to save file state");
            }
        }
        let beacons = progress
            .iter()
            .map(|beacon| self.ctx.disk_state.save_download_progress(beacon));
        for result in futures::future::join_all(beacons).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to save progress");
            }
        }
    }

    /// Persist the queue when dirty.
    async fn save_queue_if_changed(&self) {
        let snapshot = {
            let mut guard = self.ctx.queue.guard();
            if !guard.save_pending {
                return;
            }
            guard.save_pending = false;
            snapshot_queue(&guard)
        };
        if let Err(e) = self.ctx.disk_state.save_download_queue(&snapshot).await {
            tracing::warn!(error = %e, "failed to save queue");
        }
    }

    async fn wait_jobs(&self) {
        tracing::debug!("waiting for article downloads to terminate");
        loop {
            if self.active_downloads() == 0 {
                break;
            }
            self.reset_hanging_downloads();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Graceful shutdown: cancel every downloader, fail pending cache
    /// allocations, wait for tasks to drain, and persist state.
    pub async fn stop(self: &Arc<Self>) {
        tracing::info!("stopping coordinator");
        self.shutdown.cancel();
        {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            for download in active.values() {
                download.control.stop();
            }
        }
        self.ctx.cache.stop();
        self.wait_jobs().await;
        self.save_all_partial_state().await;
        self.save_queue_if_changed().await;
    }

    /// Insert a constructed NZB into the queue.
    ///
    /// Fires `NzbFound`, deduplicates same-named files (exactly-two rule),
    /// inserts (optionally replacing a URL placeholder or at the front),
    /// fires `FileFound` per file and `NzbAdded`. Returns `None` when a
    /// listener claimed the entry away (duplicate policy).
    pub fn add_nzb_to_queue(
        &self,
        mut nzb: NzbInfo,
        replacing: Option<NzbId>,
        add_first: bool,
    ) -> Option<NzbId> {
        let mut guard = self.ctx.queue.guard();
        guard.assign_ids(&mut nzb);

        if let Some(url_id) = replacing {
            // the placeholder's identity carries over
            nzb.id = url_id;
            for file in &mut nzb.files {
                file.nzb_id = url_id;
            }
        }

        guard.notify(QueueEvent::NzbFound {
            id: nzb.id,
            name: nzb.name.clone(),
        });

        if nzb.delete_status == DeleteStatus::None
            && self.ctx.config.download.dupe_check
            && nzb.dupe_mode != DupeMode::Force
        {
            check_dupe_file_infos(&mut nzb);
        }
        drop_empty_files(&mut nzb);

        let id = nzb.id;
        let name = nzb.name.clone();
        let deleted_on_arrival = nzb.delete_status != DeleteStatus::None;

        let insert_at = match replacing.and_then(|url_id| guard.position(url_id)) {
            Some(pos) => {
                let _ = guard.queue.remove(pos);
                pos
            }
            None if add_first => 0,
            None => guard.queue.len(),
        };

        let file_events: Vec<QueueEvent> = nzb
            .files
            .iter()
            .map(|f| QueueEvent::FileFound {
                nzb_id: id,
                file_id: f.id,
                filename: f.filename.clone(),
            })
            .collect();

        let insert_at = insert_at.min(guard.queue.len());
        guard.queue.insert(insert_at, nzb);

        if !deleted_on_arrival {
            tracing::info!(nzb = %name, "collection added to queue");
            for event in file_events {
                guard.notify(event);
            }
        }
        guard.notify(QueueEvent::NzbAdded {
            id,
            name: name.clone(),
        });

        if deleted_on_arrival {
            // listeners saw the entry; unless one moved it to history,
            // it leaves the queue again
            if let Some(pos) = guard.position(id) {
                let _ = guard.queue.remove(pos);
            }
            let in_history = guard.history.iter().any(|n| n.id == id);
            guard.save_pending = true;
            return in_history.then_some(id);
        }

        guard.save_pending = true;
        self.wake_up();
        Some(id)
    }

    /// Re-apply saved per-file progress to an NZB about to re-enter the
    /// queue (session resume with `continue_partial`). Files must carry
    /// the ids they were persisted under.
    pub async fn restore_partial_state(&self, nzb: &mut NzbInfo) {
        if !self.ctx.config.download.continue_partial {
            return;
        }
        for file in &mut nzb.files {
            if file.id.get() == 0 {
                continue;
            }
            let snapshot = match self.ctx.disk_state.load_file_state(file.id, false).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(file_id = %file.id, error = %e, "failed to load file state");
                    continue;
                }
            };

            let success_before = file.success_articles;
            let failed_before = file.failed_articles;
            let remaining_before = file.remaining_size;
            file.apply_saved_state(&snapshot);

            nzb.success_articles += file.success_articles - success_before;
            nzb.failed_articles += file.failed_articles - failed_before;
            let restored_bytes = remaining_before - file.remaining_size;
            nzb.remaining_size -= restored_bytes;
            nzb.success_size += file.success_size;
            nzb.failed_size += file.failed_size;

            // temp segments from the previous session become part records
            for article in &mut file.articles {
                if article.status == ArticleStatus::Finished && article.result_filename.is_none() {
                    let path = self.ctx.writer.segment_path(file.id, article.part_number);
                    if path.exists() {
                        article.result_filename = Some(path);
                    }
                }
            }

            tracing::info!(
                file = %file.filename,
                restored = file.completed_articles,
                total = file.total_articles,
                "resumed partial download"
            );
        }
    }

    /// Fetch the NZB document behind a URL placeholder and emit
    /// `UrlCompleted`. The caller's ingestion replaces the placeholder
    /// with the parsed collection via [`Self::add_nzb_to_queue`].
    pub fn spawn_url_fetch(
        self: &Arc<Self>,
        nzb_id: NzbId,
    ) -> tokio::task::JoinHandle<Option<FetchedNzb>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let url = {
                let guard = this.ctx.queue.guard();
                guard.find_nzb(nzb_id).and_then(|n| n.url.clone())
            };
            let Some(url) = url else {
                return None;
            };

            let downloader = match UrlDownloader::new(&this.ctx.config) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build url downloader");
                    return None;
                }
            };
            let result = downloader.fetch(&url).await;
            let success = result.is_ok();

            {
                let guard = this.ctx.queue.guard();
                guard.notify(QueueEvent::UrlCompleted {
                    id: nzb_id,
                    success,
                });
            }

            match result {
                Ok(fetched) => Some(fetched),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "url fetch failed");
                    None
                }
            }
        })
    }
}

/// Drop files that declare no articles; nothing can ever complete them.
fn drop_empty_files(nzb: &mut NzbInfo) {
    let empties: Vec<FileId> = nzb
        .files
        .iter()
        .filter(|f| f.articles.is_empty())
        .map(|f| f.id)
        .collect();
    for id in empties {
        if let Some(pos) = nzb.files.iter().position(|f| f.id == id) {
            let file = nzb.files.remove(pos);
            tracing::warn!(filename = %file.filename, "dropping file with no articles");
            nzb.update_deleted_stats(&file);
        }
    }
}

/// Within one collection, when exactly two files share a filename the
/// smaller (or later, on a size tie) is dropped with a warning and its
/// stats subtracted. Three or more same-named files are all kept: that
/// naming may be intentional and correct names must come from article
/// bodies.
fn check_dupe_file_infos(nzb: &mut NzbInfo) {
    let mut drop_ids: Vec<FileId> = Vec::new();

    for (index1, file1) in nzb.files.iter().enumerate() {
        for (index2, file2) in nzb.files.iter().enumerate() {
            if index1 == index2 || file1.filename != file2.filename {
                continue;
            }
            let loses = file1.size < file2.size
                || (file1.size == file2.size && index2 < index1);
            if !loses {
                continue;
            }
            let count = nzb
                .files
                .iter()
                .filter(|f| f.filename == file2.filename)
                .count();
            if count == 2 {
                tracing::warn!(
                    filename = %file1.filename,
                    "file appears twice in collection, keeping only the biggest"
                );
                drop_ids.push(file1.id);
            } else if count > 2 {
                // intentional duplicates; article naming disambiguates
            }
            break;
        }
    }

    if nzb.files.iter().enumerate().any(|(i, f)| {
        nzb.files
            .iter()
            .enumerate()
            .filter(|(j, other)| *j != i && other.filename == f.filename)
            .count()
            >= 2
    }) {
        nzb.many_dupe_files = true;
    }

    for id in drop_ids {
        if let Some(pos) = nzb.files.iter().position(|f| f.id == id) {
            let file = nzb.files.remove(pos);
            nzb.update_deleted_stats(&file);
        }
    }
}

fn snapshot_file(file: &crate::queue::FileInfo) -> FileStateSnapshot {
    FileStateSnapshot {
        file_id: file.id,
        filename: file.filename.clone(),
        partial_state: file.partial_state,
        crc: file.crc,
        articles: file
            .articles
            .iter()
            .map(|a| ArticleStateSnapshot {
                part_number: a.part_number,
                status: a.status,
                crc: a.crc,
                size: a.segment_size,
            })
            .collect(),
    }
}

fn snapshot_queue(guard: &QueueGuard<'_>) -> QueueSnapshot {
    QueueSnapshot {
        entries: guard
            .queue
            .iter()
            .map(|nzb| NzbSnapshot {
                id: nzb.id,
                kind: nzb.kind,
                name: nzb.name.clone(),
                url: nzb.url.clone(),
                category: nzb.category.clone(),
                dest_dir: nzb.dest_dir.clone(),
                priority: nzb.priority,
                delete_status: nzb.delete_status,
                size: nzb.size,
                remaining_size: nzb.remaining_size,
                file_ids: nzb.files.iter().map(|f| f.id).collect(),
            })
            .collect(),
    }
}
