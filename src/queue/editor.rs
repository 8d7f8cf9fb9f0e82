//! Queue edit operations.
//!
//! The closed command set mutating the live queue. Every edit runs under
//! the queue lock; commands only flip in-memory state and report what the
//! engine must do outside the lock (cancel downloaders, finalize files,
//! relocate completed files). Batch edits defer the queue save until the
//! whole batch applied.

use std::path::PathBuf;

use crate::error::{QueueError, Result};
use crate::types::{
    DeleteStatus, DirectRenameStatus, DupeMode, FileId, NzbId, NzbKind, Priority, QueueEvent,
};

use super::{FileInfo, NzbInfo, QueueGuard};

/// The closed set of queue edit commands.
#[derive(Clone, Debug)]
pub enum EditCommand {
    /// Exclude a file from scheduling
    FilePause(FileId),
    /// Re-include a file in scheduling
    FileResume(FileId),
    /// Remove a file from its collection
    FileDelete(FileId),
    /// Move a file within its collection by a signed offset
    FileMoveOffset(FileId, i32),
    /// Move a file to the front of its collection
    FileMoveTop(FileId),
    /// Move a file to the back of its collection
    FileMoveBottom(FileId),
    /// Pause every par2 file of a collection
    FilePauseAllPars(NzbId),
    /// Pause all par2 files except the smallest one
    FilePauseExtraPars(NzbId),
    /// Pause every file of a collection
    GroupPause(NzbId),
    /// Resume every file of a collection (clears a health pause)
    GroupResume(NzbId),
    /// Delete a collection and its files
    GroupDelete(NzbId),
    /// Delete a collection but keep already-downloaded files
    GroupParkDelete(NzbId),
    /// Move a collection within the queue by a signed offset
    GroupMoveOffset(NzbId, i32),
    /// Move a collection to the front of the queue
    GroupMoveTop(NzbId),
    /// Move a collection to the back of the queue
    GroupMoveBottom(NzbId),
    /// Change category (and destination directory)
    GroupSetCategory(NzbId, String),
    /// Rename the collection
    GroupSetName(NzbId, String),
    /// Change scheduling priority
    GroupSetPriority(NzbId, Priority),
    /// Change the duplicate key
    GroupSetDupeKey(NzbId, String),
    /// Change the duplicate score
    GroupSetDupeScore(NzbId, i32),
    /// Change the duplicate mode
    GroupSetDupeMode(NzbId, DupeMode),
    /// Merge the source collection into the target
    GroupMerge {
        /// Collection receiving the files
        target: NzbId,
        /// Collection being dissolved
        source: NzbId,
    },
    /// Move selected files into a fresh collection
    GroupSplit {
        /// Collection losing the files
        source: NzbId,
        /// Files to reparent
        file_ids: Vec<FileId>,
        /// Name of the new collection
        name: String,
    },
    /// Order files: regular files first, then par2 volumes
    GroupSortFiles(NzbId),
}

/// Work the engine must perform outside the queue lock after an edit.
#[derive(Debug, Default)]
pub struct EditOutcome {
    /// Files whose active downloaders must be cancelled
    pub cancel_files: Vec<FileId>,
    /// Deleted files with no active downloader, ready for finalization
    pub finalize_files: Vec<FileId>,
    /// Completed files to relocate: (nzb, old destination). On failure the
    /// caller re-applies `rollback`.
    pub relocate: Option<Relocation>,
}

/// Pending relocation of completed files after a category change
#[derive(Debug)]
pub struct Relocation {
    /// The edited collection
    pub nzb_id: NzbId,
    /// Directory the files currently live in
    pub old_dest_dir: PathBuf,
    /// Directory they should move to
    pub new_dest_dir: PathBuf,
    /// Filenames of already-completed files
    pub filenames: Vec<String>,
    /// Previous category, for in-memory rollback
    pub old_category: String,
}

impl EditOutcome {
    fn merge(&mut self, other: EditOutcome) {
        self.cancel_files.extend(other.cancel_files);
        self.finalize_files.extend(other.finalize_files);
        if self.relocate.is_none() {
            self.relocate = other.relocate;
        }
    }
}

/// Applies [`EditCommand`]s to a locked queue.
pub struct QueueEditor;

impl QueueEditor {
    /// Apply one command; marks the queue save-pending.
    pub fn edit_entry(guard: &mut QueueGuard<'_>, command: EditCommand) -> Result<EditOutcome> {
        let outcome = Self::apply(guard, command)?;
        guard.save_pending = true;
        Ok(outcome)
    }

    /// Apply a batch; the save is deferred until the whole batch applied.
    /// Fails fast on the first refused command.
    pub fn edit_list(
        guard: &mut QueueGuard<'_>,
        commands: Vec<EditCommand>,
    ) -> Result<EditOutcome> {
        let mut outcome = EditOutcome::default();
        for command in commands {
            outcome.merge(Self::apply(guard, command)?);
        }
        guard.save_pending = true;
        Ok(outcome)
    }

    fn apply(guard: &mut QueueGuard<'_>, command: EditCommand) -> Result<EditOutcome> {
        match command {
            EditCommand::FilePause(id) => Self::set_file_paused(guard, id, true),
            EditCommand::FileResume(id) => Self::set_file_paused(guard, id, false),
            EditCommand::FileDelete(id) => Self::delete_files(guard, vec![id]),
            EditCommand::FileMoveOffset(id, offset) => Self::move_file(guard, id, Move::Offset(offset)),
            EditCommand::FileMoveTop(id) => Self::move_file(guard, id, Move::Top),
            EditCommand::FileMoveBottom(id) => Self::move_file(guard, id, Move::Bottom),
            EditCommand::FilePauseAllPars(id) => Self::pause_pars(guard, id, false),
            EditCommand::FilePauseExtraPars(id) => Self::pause_pars(guard, id, true),
            EditCommand::GroupPause(id) => Self::set_group_paused(guard, id, true),
            EditCommand::GroupResume(id) => Self::set_group_paused(guard, id, false),
            EditCommand::GroupDelete(id) => Self::delete_group(guard, id, false),
            EditCommand::GroupParkDelete(id) => Self::delete_group(guard, id, true),
            EditCommand::GroupMoveOffset(id, offset) => Self::move_group(guard, id, Move::Offset(offset)),
            EditCommand::GroupMoveTop(id) => Self::move_group(guard, id, Move::Top),
            EditCommand::GroupMoveBottom(id) => Self::move_group(guard, id, Move::Bottom),
            EditCommand::GroupSetCategory(id, category) => Self::set_category(guard, id, category),
            EditCommand::GroupSetName(id, name) => Self::set_name(guard, id, name),
            EditCommand::GroupSetPriority(id, priority) => {
                Self::with_nzb(guard, id, |nzb| nzb.priority = priority)
            }
            EditCommand::GroupSetDupeKey(id, key) => {
                Self::with_nzb(guard, id, |nzb| nzb.dupe_key = key)
            }
            EditCommand::GroupSetDupeScore(id, score) => {
                Self::with_nzb(guard, id, |nzb| nzb.dupe_score = score)
            }
            EditCommand::GroupSetDupeMode(id, mode) => {
                Self::with_nzb(guard, id, |nzb| nzb.dupe_mode = mode)
            }
            EditCommand::GroupMerge { target, source } => Self::merge(guard, target, source),
            EditCommand::GroupSplit {
                source,
                file_ids,
                name,
            } => Self::split(guard, source, file_ids, name),
            EditCommand::GroupSortFiles(id) => Self::sort_files(guard, id),
        }
    }

    fn with_nzb(
        guard: &mut QueueGuard<'_>,
        id: NzbId,
        apply: impl FnOnce(&mut NzbInfo),
    ) -> Result<EditOutcome> {
        let nzb = guard
            .find_nzb_mut(id)
            .ok_or(QueueError::NzbNotFound { id })?;
        apply(nzb);
        nzb.changed = true;
        Ok(EditOutcome::default())
    }

    fn set_file_paused(guard: &mut QueueGuard<'_>, id: FileId, paused: bool) -> Result<EditOutcome> {
        let nzb = guard
            .find_nzb_of_file_mut(id)
            .ok_or(QueueError::FileNotFound { id })?;
        let remaining = {
            let file = nzb.find_file_mut(id).ok_or(QueueError::FileNotFound { id })?;
            if file.paused == paused {
                return Ok(EditOutcome::default());
            }
            file.paused = paused;
            file.remaining_size
        };
        if paused {
            nzb.paused_size += remaining;
        } else {
            nzb.paused_size = nzb.paused_size.saturating_sub(remaining);
        }
        nzb.changed = true;
        Ok(EditOutcome::default())
    }

    fn set_group_paused(guard: &mut QueueGuard<'_>, id: NzbId, paused: bool) -> Result<EditOutcome> {
        let nzb = guard
            .find_nzb_mut(id)
            .ok_or(QueueError::NzbNotFound { id })?;
        let mut paused_size = 0;
        for file in &mut nzb.files {
            file.paused = paused;
            if paused {
                paused_size += file.remaining_size;
            }
        }
        nzb.paused_size = paused_size;
        if !paused {
            nzb.health_paused = false;
        }
        nzb.changed = true;
        Ok(EditOutcome::default())
    }

    fn delete_files(guard: &mut QueueGuard<'_>, ids: Vec<FileId>) -> Result<EditOutcome> {
        let mut outcome = EditOutcome::default();
        for id in ids {
            let nzb = guard
                .find_nzb_of_file_mut(id)
                .ok_or(QueueError::FileNotFound { id })?;
            let file = nzb.find_file_mut(id).ok_or(QueueError::FileNotFound { id })?;
            if file.deleted {
                continue;
            }
            file.deleted = true;
            if file.active_downloads > 0 {
                outcome.cancel_files.push(id);
            } else {
                outcome.finalize_files.push(id);
            }
            nzb.changed = true;
        }
        Ok(outcome)
    }

    fn delete_group(guard: &mut QueueGuard<'_>, id: NzbId, park: bool) -> Result<EditOutcome> {
        let nzb = guard
            .find_nzb_mut(id)
            .ok_or(QueueError::NzbNotFound { id })?;
        if nzb.delete_status == DeleteStatus::None {
            nzb.delete_status = DeleteStatus::Manual;
        }
        nzb.parking = park;
        if nzb.direct_rename_status == DirectRenameStatus::Running {
            // a parked or deleted group never re-enters the rename phase
            nzb.direct_rename_status = DirectRenameStatus::Failure;
        }

        let mut outcome = EditOutcome::default();
        for file in &mut nzb.files {
            if file.deleted {
                continue;
            }
            file.deleted = true;
            if file.active_downloads > 0 {
                outcome.cancel_files.push(file.id);
            } else {
                outcome.finalize_files.push(file.id);
            }
        }
        nzb.changed = true;

        // a fileless entry (url placeholder, drained collection) has no
        // completion path to drain it; retire it here
        if nzb.files.is_empty() {
            let status = nzb.delete_status;
            guard.move_to_history(id);
            guard.notify(QueueEvent::NzbDeleted { id, status });
        }
        Ok(outcome)
    }

    fn pause_pars(guard: &mut QueueGuard<'_>, id: NzbId, keep_smallest: bool) -> Result<EditOutcome> {
        let nzb = guard
            .find_nzb_mut(id)
            .ok_or(QueueError::NzbNotFound { id })?;

        let keep: Option<FileId> = if keep_smallest {
            nzb.files
                .iter()
                .filter(|f| f.par_file && !f.deleted)
                .min_by_key(|f| f.size)
                .map(|f| f.id)
        } else {
            None
        };

        let mut delta = 0i64;
        for file in &mut nzb.files {
            if !file.par_file || file.deleted || Some(file.id) == keep {
                continue;
            }
            if !file.paused {
                file.paused = true;
                delta += file.remaining_size as i64;
            }
        }
        nzb.paused_size = (nzb.paused_size as i64 + delta).max(0) as u64;
        nzb.changed = true;
        Ok(EditOutcome::default())
    }

    fn move_file(guard: &mut QueueGuard<'_>, id: FileId, mv: Move) -> Result<EditOutcome> {
        let nzb = guard
            .find_nzb_of_file_mut(id)
            .ok_or(QueueError::FileNotFound { id })?;
        let pos = nzb
            .files
            .iter()
            .position(|f| f.id == id)
            .ok_or(QueueError::FileNotFound { id })?;
        let target = mv.target(pos, nzb.files.len());
        let file = nzb.files.remove(pos);
        nzb.files.insert(target.min(nzb.files.len()), file);
        nzb.changed = true;
        Ok(EditOutcome::default())
    }

    fn move_group(guard: &mut QueueGuard<'_>, id: NzbId, mv: Move) -> Result<EditOutcome> {
        let pos = guard.position(id).ok_or(QueueError::NzbNotFound { id })?;
        let target = mv.target(pos, guard.queue.len());
        if let Some(nzb) = guard.queue.remove(pos) {
            let target = target.min(guard.queue.len());
            guard.queue.insert(target, nzb);
        }
        Ok(EditOutcome::default())
    }

    fn set_category(guard: &mut QueueGuard<'_>, id: NzbId, category: String) -> Result<EditOutcome> {
        let nzb = guard
            .find_nzb_mut(id)
            .ok_or(QueueError::NzbNotFound { id })?;
        if nzb.category == category {
            return Ok(EditOutcome::default());
        }

        let old_category = std::mem::replace(&mut nzb.category, category);
        let old_dest_dir = nzb.dest_dir.clone();
        let base = strip_category(&old_dest_dir, &old_category);
        let new_dest_dir = if nzb.category.is_empty() {
            base
        } else {
            base.join(&nzb.category)
        };
        nzb.dest_dir = new_dest_dir.clone();
        nzb.changed = true;

        let filenames: Vec<String> = nzb
            .completed_files
            .iter()
            .map(|f| f.filename.clone())
            .collect();

        Ok(EditOutcome {
            relocate: (!filenames.is_empty()).then_some(Relocation {
                nzb_id: id,
                old_dest_dir,
                new_dest_dir,
                filenames,
                old_category,
            }),
            ..Default::default()
        })
    }

    /// Undo a category change after a failed relocation.
    pub fn rollback_category(guard: &mut QueueGuard<'_>, relocation: &Relocation) {
        if let Some(nzb) = guard.find_nzb_mut(relocation.nzb_id) {
            nzb.category = relocation.old_category.clone();
            nzb.dest_dir = relocation.old_dest_dir.clone();
            nzb.changed = true;
        }
    }

    fn set_name(guard: &mut QueueGuard<'_>, id: NzbId, name: String) -> Result<EditOutcome> {
        let name = crate::utils::make_valid_filename(&name);
        let nzb = guard
            .find_nzb_mut(id)
            .ok_or(QueueError::NzbNotFound { id })?;
        nzb.name = name.clone();
        nzb.changed = true;
        guard.notify(QueueEvent::NzbNamed { id, name });
        Ok(EditOutcome::default())
    }

    fn merge(guard: &mut QueueGuard<'_>, target: NzbId, source: NzbId) -> Result<EditOutcome> {
        if target == source {
            return Err(QueueError::MergeRefused {
                id: target,
                reason: "cannot merge a group into itself".to_string(),
            }
            .into());
        }
        for id in [target, source] {
            let nzb = guard.find_nzb(id).ok_or(QueueError::NzbNotFound { id })?;
            if nzb.kind == NzbKind::Url {
                return Err(QueueError::MergeRefused {
                    id,
                    reason: "url placeholder".to_string(),
                }
                .into());
            }
            if nzb.is_deleting() {
                return Err(QueueError::MergeRefused {
                    id,
                    reason: "being deleted".to_string(),
                }
                .into());
            }
        }

        let source_pos = guard
            .position(source)
            .ok_or(QueueError::NzbNotFound { id: source })?;
        let mut source_nzb = guard
            .queue
            .remove(source_pos)
            .ok_or(QueueError::NzbNotFound { id: source })?;

        let target_nzb = guard
            .find_nzb_mut(target)
            .ok_or(QueueError::NzbNotFound { id: target })?;
        let target_id = target_nzb.id;

        target_nzb.size += source_nzb.size;
        target_nzb.remaining_size += source_nzb.remaining_size;
        target_nzb.paused_size += source_nzb.paused_size;
        target_nzb.success_size += source_nzb.success_size;
        target_nzb.failed_size += source_nzb.failed_size;
        target_nzb.downloaded_size += source_nzb.downloaded_size;
        target_nzb.total_articles += source_nzb.total_articles;
        target_nzb.success_articles += source_nzb.success_articles;
        target_nzb.failed_articles += source_nzb.failed_articles;
        target_nzb
            .server_stats
            .list_op(&source_nzb.server_stats, crate::types::StatOp::Add);

        for mut file in source_nzb.files.drain(..) {
            file.nzb_id = target_id;
            target_nzb.files.push(file);
        }
        target_nzb
            .completed_files
            .append(&mut source_nzb.completed_files);
        target_nzb.changed = true;

        Ok(EditOutcome::default())
    }

    fn split(
        guard: &mut QueueGuard<'_>,
        source: NzbId,
        file_ids: Vec<FileId>,
        name: String,
    ) -> Result<EditOutcome> {
        if file_ids.is_empty() {
            return Err(QueueError::SplitRefused {
                id: source,
                reason: "no files selected".to_string(),
            }
            .into());
        }

        let source_pos = guard
            .position(source)
            .ok_or(QueueError::NzbNotFound { id: source })?;

        let (category, dest_dir, priority, moved) = {
            let source_nzb = guard
                .find_nzb_mut(source)
                .ok_or(QueueError::NzbNotFound { id: source })?;
            if source_nzb.kind == NzbKind::Url {
                return Err(QueueError::SplitRefused {
                    id: source,
                    reason: "url placeholder".to_string(),
                }
                .into());
            }
            for &id in &file_ids {
                if source_nzb.find_file(id).is_none() {
                    return Err(QueueError::SplitRefused {
                        id: source,
                        reason: format!("file {id} not in group"),
                    }
                    .into());
                }
            }

            let mut moved: Vec<FileInfo> = Vec::with_capacity(file_ids.len());
            let mut kept: Vec<FileInfo> = Vec::new();
            for file in source_nzb.files.drain(..) {
                if file_ids.contains(&file.id) {
                    moved.push(file);
                } else {
                    kept.push(file);
                }
            }
            source_nzb.files = kept;
            for file in &moved {
                source_nzb.size -= file.size;
                source_nzb.remaining_size -= file.remaining_size;
                if file.paused {
                    source_nzb.paused_size -= file.remaining_size;
                }
                source_nzb.success_size -= file.success_size;
                source_nzb.failed_size -= file.failed_size + file.missed_size;
                source_nzb.total_articles -= file.total_articles;
                source_nzb.success_articles -= file.success_articles;
                source_nzb.failed_articles -= file.failed_articles;
            }
            source_nzb.changed = true;
            (
                source_nzb.category.clone(),
                source_nzb.dest_dir.clone(),
                source_nzb.priority,
                moved,
            )
        };

        let mut new_nzb = NzbInfo::new(name, dest_dir);
        new_nzb.category = category;
        new_nzb.priority = priority;
        guard.assign_ids(&mut new_nzb);
        let new_id = new_nzb.id;
        for mut file in moved {
            guard.notify(QueueEvent::FileDeleted {
                nzb_id: source,
                file_id: file.id,
                filename: file.filename.clone(),
            });
            file.nzb_id = new_id;
            new_nzb.size += file.size;
            new_nzb.remaining_size += file.remaining_size;
            if file.paused {
                new_nzb.paused_size += file.remaining_size;
            }
            new_nzb.success_size += file.success_size;
            new_nzb.failed_size += file.failed_size + file.missed_size;
            new_nzb.total_articles += file.total_articles;
            new_nzb.success_articles += file.success_articles;
            new_nzb.failed_articles += file.failed_articles;
            new_nzb.files.push(file);
        }
        let name = new_nzb.name.clone();
        guard.queue.insert(source_pos + 1, new_nzb);
        guard.notify(QueueEvent::NzbAdded { id: new_id, name });

        Ok(EditOutcome::default())
    }

    fn sort_files(guard: &mut QueueGuard<'_>, id: NzbId) -> Result<EditOutcome> {
        let nzb = guard
            .find_nzb_mut(id)
            .ok_or(QueueError::NzbNotFound { id })?;
        nzb.files.sort_by(|a, b| {
            (a.par_file, a.filename.to_ascii_lowercase())
                .cmp(&(b.par_file, b.filename.to_ascii_lowercase()))
        });
        nzb.changed = true;
        Ok(EditOutcome::default())
    }
}

enum Move {
    Offset(i32),
    Top,
    Bottom,
}

impl Move {
    fn target(&self, pos: usize, len: usize) -> usize {
        match self {
            Move::Top => 0,
            Move::Bottom => len.saturating_sub(1),
            Move::Offset(offset) => {
                let target = pos as i64 + *offset as i64;
                target.clamp(0, len.saturating_sub(1) as i64) as usize
            }
        }
    }
}

fn strip_category(dest_dir: &std::path::Path, category: &str) -> PathBuf {
    if !category.is_empty() && dest_dir.ends_with(category) {
        dest_dir
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| dest_dir.to_path_buf())
    } else {
        dest_dir.to_path_buf()
    }
}
