//! Explicit wiring of the core's shared components.
//!
//! No ambient globals: every component receives the context it needs at
//! construction time, and teardown happens in reverse order inside
//! [`crate::coordinator::QueueCoordinator::stop`].

use std::sync::Arc;

use crate::cache::ArticleCache;
use crate::config::Config;
use crate::diskstate::DiskState;
use crate::error::Result;
use crate::nntp::ServerPool;
use crate::queue::DownloadQueue;
use crate::writer::ArticleWriter;

/// Shared state handed to the coordinator and its helpers.
#[derive(Clone)]
pub struct CoreContext {
    /// Engine configuration
    pub config: Arc<Config>,
    /// The process-global download queue
    pub queue: Arc<DownloadQueue>,
    /// Tiered server pool
    pub pool: Arc<ServerPool>,
    /// Bounded segment cache
    pub cache: Arc<ArticleCache>,
    /// Segment persistence and file reassembly
    pub writer: Arc<ArticleWriter>,
    /// Persisted-state collaborator
    pub disk_state: Arc<dyn DiskState>,
}

impl CoreContext {
    /// Build the component graph from a validated configuration.
    pub fn new(config: Config, disk_state: Arc<dyn DiskState>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let pool = Arc::new(ServerPool::new(
            &config.servers,
            config.retry.article_timeout,
        ));
        let cache = Arc::new(ArticleCache::new(config.download.article_cache));
        let writer = Arc::new(ArticleWriter::new(Arc::clone(&config)));

        Ok(Self {
            config,
            queue: Arc::new(DownloadQueue::new()),
            pool,
            cache,
            writer,
            disk_state,
        })
    }
}
