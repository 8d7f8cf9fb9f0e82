//! Per-article download task.
//!
//! One task per in-flight article, driving the NNTP state machine
//! `Authenticate? → Group → RequestBody → Stream` with a retry ladder:
//! transient failures retry the same server up to `article_retries`;
//! server-logical failures (auth rejected, group missing, 430) skip to the
//! next server; an exhausted level blocks `(file, level)` briefly and
//! escalates to the next tier; optional servers are consulted last.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{ArticleCache, CachedSegment};
use crate::config::Config;
use crate::error::{ConnectionError, DecodeError};
use crate::nntp::connection::{CancelHandle, Connection};
use crate::nntp::{ServerPool, pool::connect_backoff};
use crate::types::{FileId, NzbId, ServerId, ServerStatList, StatOp};
use crate::writer::ArticleWriter;
use crate::yenc::{ArticleDecoder, LineOutcome};

/// Everything a downloader needs to fetch one article, captured under the
/// queue lock when the task is spawned.
#[derive(Clone, Debug)]
pub struct ArticleJob {
    /// Owning collection
    pub nzb_id: NzbId,
    /// Owning file
    pub file_id: FileId,
    /// 1-based part number
    pub part_number: u32,
    /// Message-ID without brackets
    pub message_id: String,
    /// Newsgroup for servers that require GROUP
    pub group: Option<String>,
    /// Size declared by the NZB (cache charge estimate)
    pub declared_size: u64,
    /// Declared size of the whole file (direct-write pre-allocation)
    pub file_size: u64,
    /// Write decoded bytes at their offset instead of a temp segment
    pub direct: bool,
    /// Article age for retention filtering
    pub age_days: Option<u32>,
    /// Display name for logs: "collection/file [part/total]"
    pub info_name: String,
}

/// Where the decoded article body ended up
pub enum SegmentStorage {
    /// Retained in the article cache, awaiting flush
    Cached(CachedSegment),
    /// Written to a temp segment file
    TempFile(PathBuf),
    /// Written into the output file at its offset
    Direct,
}

/// A successfully downloaded and decoded article
pub struct FinishedArticle {
    /// Verified CRC32 of the decoded bytes
    pub crc: u32,
    /// Decoded size
    pub decoded_size: u64,
    /// 0-based offset within the file, from the yEnc part header
    pub offset: u64,
    /// Filename declared in the article's =ybegin header
    pub article_filename: Option<String>,
    /// Where the bytes are
    pub storage: SegmentStorage,
}

/// Why an article permanently failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailKind {
    /// 430 on every server at every level
    NotFound,
    /// yEnc decode or CRC failure
    Corrupt(DecodeError),
    /// Transport failures exhausted every retry and level
    Transport,
}

/// Terminal outcome of a downloader
pub enum DownloadOutcome {
    /// Article decoded and persisted/cached
    Finished(Box<FinishedArticle>),
    /// Article permanently failed
    Failed(FailKind),
    /// Article should be rescheduled (cancellation, shutdown)
    Retry,
}

/// Cross-task control surface for one running downloader.
pub struct DownloaderControl {
    stopped: AtomicBool,
    conn_cancel: Mutex<Option<CancelHandle>>,
    /// Epoch seconds of the last observed progress
    pub last_update: AtomicU64,
}

impl DownloaderControl {
    pub(crate) fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            conn_cancel: Mutex::new(None),
            last_update: AtomicU64::new(now_secs()),
        }
    }

    /// Request the downloader to stop; cancels the in-flight read.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self
            .conn_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            handle.cancel();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn track(&self, conn: &Connection) {
        *self.conn_cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn.cancel_handle());
    }

    fn touch(&self) {
        self.last_update.store(now_secs(), Ordering::Release);
    }

    /// Seconds since the downloader last made progress
    pub fn idle_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_update.load(Ordering::Acquire))
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Downloads exactly one article over connections from the pool.
pub struct ArticleDownloader {
    job: ArticleJob,
    config: Arc<Config>,
    pool: Arc<ServerPool>,
    cache: Arc<ArticleCache>,
    writer: Arc<ArticleWriter>,
    control: Arc<DownloaderControl>,
    /// Per-server success/failure counters accumulated over attempts
    pub server_stats: ServerStatList,
    /// Raw bytes read off sockets, including failed attempts
    pub downloaded_bytes: u64,
}

enum AttemptError {
    /// Retry the same server after a reconnect
    Transient(ConnectionError),
    /// Skip to the next server
    ServerFailed,
    /// 430 from this server
    NotFound,
    /// Decode failure, article is dead
    Corrupt(DecodeError),
    /// Stop requested
    Cancelled,
}

impl ArticleDownloader {
    pub(crate) fn new(
        job: ArticleJob,
        config: Arc<Config>,
        pool: Arc<ServerPool>,
        cache: Arc<ArticleCache>,
        writer: Arc<ArticleWriter>,
        control: Arc<DownloaderControl>,
    ) -> Self {
        Self {
            job,
            config,
            pool,
            cache,
            writer,
            control,
            server_stats: ServerStatList::default(),
            downloaded_bytes: 0,
        }
    }

    /// Run the state machine to a terminal outcome. The initial connection
    /// comes from the coordinator's level-0 acquisition.
    pub async fn run(&mut self, initial: Connection) -> DownloadOutcome {
        let mut level = 0u32;
        let mut include_optional = false;
        let mut failed_servers: Vec<ServerId> = Vec::new();
        let mut retries = 0u32;
        let mut saw_not_found = false;
        let mut conn = Some(initial);
        // the server a transient retry should land back on
        let mut preferred: Option<ServerId> = None;

        loop {
            if self.control.is_stopped() {
                self.release(conn.take(), false);
                return DownloadOutcome::Retry;
            }

            let mut connection = match conn.take() {
                Some(c) => c,
                None => {
                    match self.next_connection(level, include_optional, preferred, &failed_servers)
                    {
                        Some(c) => c,
                        None if self.pool.has_candidates(
                            level,
                            Some(self.job.file_id),
                            self.job.age_days,
                            include_optional,
                            &failed_servers,
                        ) =>
                        {
                            // eligible servers exist but all slots are
                            // busy; wait for one to free up
                            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                            continue;
                        }
                        None => {
                            // level exhausted: block it briefly for this
                            // file and escalate
                            self.pool.block_server(
                                self.job.file_id,
                                level,
                                self.config.retry.article_interval,
                            );
                            if level < self.pool.max_level() {
                                level += 1;
                                failed_servers.clear();
                                retries = 0;
                                continue;
                            }
                            if !include_optional {
                                // last resort: optional servers, from the top
                                include_optional = true;
                                level = 0;
                                failed_servers.clear();
                                retries = 0;
                                continue;
                            }
                            return DownloadOutcome::Failed(if saw_not_found {
                                FailKind::NotFound
                            } else {
                                FailKind::Transport
                            });
                        }
                    }
                }
            };

            self.control.track(&connection);
            let server_id = connection.server_id();
            preferred = None;

            match self.attempt(&mut connection).await {
                Ok(finished) => {
                    self.server_stats.stat_op(server_id, 1, 0, StatOp::Add);
                    self.release(Some(connection), true);
                    return DownloadOutcome::Finished(Box::new(finished));
                }
                Err(AttemptError::Cancelled) => {
                    self.release(Some(connection), false);
                    return DownloadOutcome::Retry;
                }
                Err(AttemptError::Corrupt(err)) => {
                    tracing::warn!(
                        article = %self.job.info_name,
                        error = %err,
                        "article body corrupt"
                    );
                    self.server_stats.stat_op(server_id, 0, 1, StatOp::Add);
                    self.release(Some(connection), true);
                    return DownloadOutcome::Failed(FailKind::Corrupt(err));
                }
                Err(AttemptError::NotFound) => {
                    tracing::debug!(
                        article = %self.job.info_name,
                        server = server_id,
                        "no such article"
                    );
                    saw_not_found = true;
                    self.server_stats.stat_op(server_id, 0, 1, StatOp::Add);
                    failed_servers.push(server_id);
                    self.release(Some(connection), true);
                }
                Err(AttemptError::ServerFailed) => {
                    self.server_stats.stat_op(server_id, 0, 1, StatOp::Add);
                    failed_servers.push(server_id);
                    self.release(Some(connection), false);
                }
                Err(AttemptError::Transient(err)) => {
                    retries += 1;
                    self.release(Some(connection), false);
                    if retries > self.config.retry.article_retries {
                        // this server is done; let the ladder move on
                        failed_servers.push(server_id);
                        retries = 0;
                        continue;
                    }
                    tracing::debug!(
                        article = %self.job.info_name,
                        server = server_id,
                        error = %err,
                        retry = retries,
                        "transient failure, retrying"
                    );
                    preferred = Some(server_id);
                    tokio::time::sleep(self.config.retry.article_interval).await;
                }
            }
        }
    }

    fn next_connection(
        &self,
        level: u32,
        include_optional: bool,
        preferred: Option<ServerId>,
        failed: &[ServerId],
    ) -> Option<Connection> {
        self.pool.get_connection(
            level,
            Some(self.job.file_id),
            self.job.age_days,
            include_optional,
            preferred,
            failed,
        )
    }

    fn release(&self, conn: Option<Connection>, keep_alive: bool) {
        if let Some(conn) = conn {
            self.pool.free_connection(conn, keep_alive);
        }
    }

    /// One full protocol attempt on one connection.
    async fn attempt(
        &mut self,
        conn: &mut Connection,
    ) -> Result<FinishedArticle, AttemptError> {
        use crate::nntp::ConnectionState;

        if conn.state() != ConnectionState::Connected {
            if let Err(err) = conn.connect().await {
                self.pool
                    .note_connect_failure(conn.server_id(), connect_backoff(&err));
                return Err(self.classify(err));
            }
        }

        if let Err(err) = conn.authenticate().await {
            return Err(match err {
                ConnectionError::AuthRejected { code } => {
                    tracing::warn!(
                        server = conn.server_id(),
                        code,
                        "authentication rejected"
                    );
                    AttemptError::ServerFailed
                }
                other => self.classify(other),
            });
        }

        let join_group = self
            .pool
            .server_config(conn.server_id())
            .map(|s| s.join_group)
            .unwrap_or(false);
        if join_group {
            if let Some(group) = self.job.group.clone() {
                if let Err(err) = conn.join_group(&group).await {
                    return Err(match err {
                        ConnectionError::GroupFailed { .. } => AttemptError::ServerFailed,
                        other => self.classify(other),
                    });
                }
            }
        }

        let response = conn
            .request_body(&self.job.message_id)
            .await
            .map_err(|e| self.classify(e))?;
        self.control.touch();

        if response.is_no_such_article() {
            return Err(AttemptError::NotFound);
        }
        if response.wants_reconnect() {
            conn.disconnect().await;
            return Err(AttemptError::Transient(ConnectionError::Protocol(format!(
                "server requested reconnect ({})",
                response.code
            ))));
        }
        if !response.is_body_follows() {
            tracing::warn!(
                article = %self.job.info_name,
                code = response.code,
                "unexpected BODY response"
            );
            return Err(AttemptError::ServerFailed);
        }

        self.stream_body(conn).await
    }

    /// Stream body lines through the decoder into a cache segment (or a
    /// plain buffer when the cache is disabled), then persist if needed.
    async fn stream_body(
        &mut self,
        conn: &mut Connection,
    ) -> Result<FinishedArticle, AttemptError> {
        let mut decoder = ArticleDecoder::new();
        let mut buffer = match self.cache.alloc(self.job.declared_size).await {
            Some(segment) => Buffer::Cached(segment),
            None => Buffer::Plain(Vec::with_capacity(self.job.declared_size as usize)),
        };

        loop {
            let line = match conn.read_body_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    self.free_buffer(buffer);
                    return Err(self.classify(err));
                }
            };
            self.downloaded_bytes += line.len() as u64 + 2;
            self.control.touch();

            let line = line.to_vec();
            match decoder.feed_line(&line, buffer.as_vec_mut()) {
                Ok(LineOutcome::Continue) => {}
                Ok(LineOutcome::End) => {
                    // drain the remaining lines up to the lone dot so the
                    // connection stays usable
                    loop {
                        match conn.read_body_line().await {
                            Ok(Some(_)) => {}
                            Ok(None) => break,
                            Err(err) => {
                                self.free_buffer(buffer);
                                return Err(self.classify(err));
                            }
                        }
                    }
                    break;
                }
                Err(err) => {
                    // body is broken regardless of what else arrives
                    self.free_buffer(buffer);
                    self.drain_body(conn).await;
                    return Err(AttemptError::Corrupt(err));
                }
            }
        }

        let meta = match decoder.finish() {
            Ok(meta) => meta,
            Err(err) => {
                self.free_buffer(buffer);
                return Err(AttemptError::Corrupt(err));
            }
        };

        let storage = match buffer {
            Buffer::Cached(mut segment) => {
                self.cache.realloc(&mut segment, meta.size);
                self.cache.register(self.job.file_id, meta.size);
                SegmentStorage::Cached(segment)
            }
            Buffer::Plain(data) => {
                // write-through when the cache is disabled
                let writer = Arc::clone(&self.writer);
                let job = self.job.clone();
                let offset = meta.offset;
                let result = tokio::task::spawn_blocking(move || {
                    if job.direct {
                        writer
                            .write_direct(job.file_id, job.file_size, offset, &data)
                            .map(|_| SegmentStorage::Direct)
                    } else {
                        writer
                            .write_temp_segment(job.file_id, job.part_number, &data)
                            .map(SegmentStorage::TempFile)
                    }
                })
                .await;
                match result {
                    Ok(Ok(storage)) => storage,
                    Ok(Err(err)) => {
                        tracing::error!(
                            article = %self.job.info_name,
                            error = %err,
                            "disk write failed"
                        );
                        return Err(AttemptError::Corrupt(DecodeError::MalformedLine(
                            "disk write failed".to_string(),
                        )));
                    }
                    Err(join_err) => {
                        tracing::error!(error = %join_err, "writer task panicked");
                        return Err(AttemptError::ServerFailed);
                    }
                }
            }
        };

        Ok(FinishedArticle {
            crc: meta.crc,
            decoded_size: meta.size,
            offset: meta.offset,
            article_filename: (!meta.filename.is_empty()).then_some(meta.filename),
            storage,
        })
    }

    async fn drain_body(&mut self, conn: &mut Connection) {
        while let Ok(Some(_)) = conn.read_body_line().await {}
    }

    fn free_buffer(&self, buffer: Buffer) {
        if let Buffer::Cached(segment) = buffer {
            self.cache.free(segment);
        }
    }

    fn classify(&self, err: ConnectionError) -> AttemptError {
        match err {
            ConnectionError::Cancelled => AttemptError::Cancelled,
            err if err.is_transient() => AttemptError::Transient(err),
            _ => AttemptError::ServerFailed,
        }
    }
}

enum Buffer {
    Cached(CachedSegment),
    Plain(Vec<u8>),
}

impl Buffer {
    fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        match self {
            Buffer::Cached(segment) => segment.data_mut(),
            Buffer::Plain(data) => data,
        }
    }
}
