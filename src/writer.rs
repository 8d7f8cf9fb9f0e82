//! Persistence of decoded article segments and file reassembly.
//!
//! Two modes per file:
//! - **temp segments**: each article lands in `inter_dir` as its own
//!   segment file; completion concatenates them in part order.
//! - **direct write**: the output file is pre-allocated sparse in
//!   `inter_dir` and segments are written at their yEnc offset with
//!   positional writes.
//!
//! Completion stitches per-article CRCs into the whole-file CRC with
//! [`crc32_combine`] instead of re-reading the file, computes the
//! first-16KiB hash, and renames the result into the destination
//! directory.
//!
//! All functions here do blocking disk I/O; callers run them inside
//! `tokio::task::spawn_blocking`.

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::FileId;
use crate::yenc::crc32_combine;

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix
/// `pwrite`. Positional writes take `&self`, so segments of the same file
/// can be written from different tasks without a lock.
#[cfg(unix)]
fn write_all_at(file: &fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Cross-platform positional file write.
#[cfg(windows)]
fn write_all_at(file: &fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        written += n;
    }
    Ok(())
}

/// One persisted part of a file, carried into completion
#[derive(Clone, Debug)]
pub struct PartRecord {
    /// 1-based part number
    pub part_number: u32,
    /// Decoded size
    pub size: u64,
    /// CRC32 of the decoded bytes
    pub crc: u32,
    /// Segment file path (temp mode only)
    pub path: Option<PathBuf>,
}

/// Everything completion needs, gathered under the queue lock
#[derive(Clone, Debug)]
pub struct CompletionPlan {
    /// File being finalized
    pub file_id: FileId,
    /// Final filename
    pub filename: String,
    /// Destination directory
    pub dest_dir: PathBuf,
    /// Whether the file was written directly at offsets
    pub direct: bool,
    /// Successfully decoded parts, any order
    pub parts: Vec<PartRecord>,
}

/// Result of finalizing a file
#[derive(Clone, Debug)]
pub struct CompletedOutput {
    /// Final path of the reassembled file
    pub path: PathBuf,
    /// Whole-file CRC combined from part CRCs
    pub crc: u32,
    /// MD5 of the first 16 KiB
    pub hash16k: String,
}

/// Writes decoded segments and finalizes reassembled files.
pub struct ArticleWriter {
    config: Arc<Config>,
}

impl ArticleWriter {
    /// A writer bound to the engine configuration
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Path of a temp segment file
    pub fn segment_path(&self, file_id: FileId, part_number: u32) -> PathBuf {
        self.config
            .download
            .inter_dir
            .join(format!("{file_id}.{part_number}.seg"))
    }

    /// Path of the in-progress output file (direct-write mode)
    pub fn output_path(&self, file_id: FileId) -> PathBuf {
        self.config
            .download
            .inter_dir
            .join(format!("{file_id}.out"))
    }

    fn disk_err(path: &Path, source: std::io::Error) -> Error {
        Error::DiskIo {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Persist one decoded segment as its own temp file.
    pub fn write_temp_segment(
        &self,
        file_id: FileId,
        part_number: u32,
        data: &[u8],
    ) -> Result<PathBuf> {
        let path = self.segment_path(file_id, part_number);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::disk_err(parent, e))?;
        }
        fs::write(&path, data).map_err(|e| Self::disk_err(&path, e))?;
        Ok(path)
    }

    /// Persist one decoded segment at its offset in the output file.
    ///
    /// The file is created and pre-allocated (sparse where the filesystem
    /// supports it) on the first write.
    pub fn write_direct(
        &self,
        file_id: FileId,
        file_size: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<PathBuf> {
        let path = self.output_path(file_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::disk_err(parent, e))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Self::disk_err(&path, e))?;

        let current = file.metadata().map_err(|e| Self::disk_err(&path, e))?.len();
        if current < file_size {
            file.set_len(file_size).map_err(|e| Self::disk_err(&path, e))?;
        }

        write_all_at(&file, data, offset).map_err(|e| Self::disk_err(&path, e))?;
        Ok(path)
    }

    /// Concatenate (or adopt) the persisted parts into the final file.
    ///
    /// Temp mode concatenates in part order through a buffered writer of
    /// the configured size; direct mode renames the pre-assembled output.
    /// Either way the whole-file CRC is combined from part CRCs and the
    /// first-16KiB hash is computed. A broken final file is removed before
    /// the error propagates.
    pub fn complete_file_parts(&self, plan: &CompletionPlan) -> Result<CompletedOutput> {
        fs::create_dir_all(&plan.dest_dir)
            .map_err(|e| Self::disk_err(&plan.dest_dir, e))?;
        let final_path = crate::utils::unique_path(&plan.dest_dir.join(&plan.filename));

        let mut parts = plan.parts.clone();
        parts.sort_by_key(|p| p.part_number);

        let crc = parts
            .iter()
            .skip(1)
            .fold(parts.first().map(|p| p.crc).unwrap_or(0), |acc, part| {
                crc32_combine(acc, part.crc, part.size)
            });

        let result = if plan.direct {
            self.finish_direct(plan, &final_path)
        } else {
            self.concatenate(&parts, &final_path)
        };

        if let Err(err) = result {
            let _ = fs::remove_file(&final_path);
            return Err(err);
        }

        let hash16k = hash16k_of(&final_path)?;

        // temp inputs are only removed once the final file is in place
        for part in &parts {
            if let Some(path) = &part.path {
                let _ = fs::remove_file(path);
            }
        }

        tracing::info!(
            file = %plan.filename,
            path = %final_path.display(),
            crc = format_args!("{crc:08x}"),
            "file completed"
        );

        Ok(CompletedOutput {
            path: final_path,
            crc,
            hash16k,
        })
    }

    fn finish_direct(&self, plan: &CompletionPlan, final_path: &Path) -> Result<()> {
        let out = self.output_path(plan.file_id);
        match fs::rename(&out, final_path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // cross-device move: copy then remove
                fs::copy(&out, final_path).map_err(|e| Self::disk_err(final_path, e))?;
                fs::remove_file(&out).map_err(|e| Self::disk_err(&out, e))?;
                Ok(())
            }
        }
    }

    fn concatenate(&self, parts: &[PartRecord], final_path: &Path) -> Result<()> {
        let tmp_path = final_path.with_extension("tmp");
        {
            let out = fs::File::create(&tmp_path).map_err(|e| Self::disk_err(&tmp_path, e))?;
            let mut writer = BufWriter::with_capacity(self.config.download.write_buffer, out);

            for part in parts {
                let Some(path) = &part.path else {
                    continue;
                };
                let mut segment = fs::File::open(path).map_err(|e| Self::disk_err(path, e))?;
                std::io::copy(&mut segment, &mut writer)
                    .map_err(|e| Self::disk_err(path, e))?;
            }
            writer.flush().map_err(|e| Self::disk_err(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, final_path).map_err(|e| Self::disk_err(final_path, e))?;
        Ok(())
    }

    /// Remove a file's temp segments and partial output (delete paths)
    pub fn discard_file(&self, file_id: FileId, part_numbers: &[u32]) {
        for &part in part_numbers {
            let _ = fs::remove_file(self.segment_path(file_id, part));
        }
        let _ = fs::remove_file(self.output_path(file_id));
    }

    /// Relocate already-completed files after a category or name change
    /// moved the destination directory.
    pub fn move_completed_files(
        &self,
        filenames: &[String],
        old_dest_dir: &Path,
        new_dest_dir: &Path,
    ) -> Result<()> {
        fs::create_dir_all(new_dest_dir).map_err(|e| Self::disk_err(new_dest_dir, e))?;
        for filename in filenames {
            let old = old_dest_dir.join(filename);
            if !old.exists() {
                continue;
            }
            let new = new_dest_dir.join(filename);
            if let Err(e) = fs::rename(&old, &new) {
                fs::copy(&old, &new).map_err(|_| Self::disk_err(&new, e))?;
                fs::remove_file(&old).ok();
            }
        }
        Ok(())
    }
}

/// MD5 over the first 16 KiB of a file, hex-encoded
fn hash16k_of(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| Error::DiskIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut buf = vec![0u8; 16 * 1024];
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => {
                return Err(Error::DiskIo {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }
    Ok(format!("{:x}", md5::compute(&buf[..read])))
}
