//! # usenet-engine
//!
//! The core of a Usenet binary download engine: a concurrent NNTP client
//! pool that fetches the articles described by NZB collections, decodes
//! the yEnc bodies, reassembles multi-part files, and hands completed
//! files to post-processors.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - no CLI or UI, purely a crate for embedding
//! - **Explicit wiring** - no ambient globals; components receive a
//!   [`CoreContext`] at construction
//! - **Event-driven** - consumers observe typed queue events, no polling
//! - **One queue lock** - cross-entity statistics move atomically
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use usenet_engine::{
//!     Config, CoreContext, FileDiskState, QueueCoordinator, ServerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.servers.push(ServerConfig {
//!         name: "primary".into(),
//!         host: "news.example.com".into(),
//!         port: 563,
//!         tls: true,
//!         cipher: String::new(),
//!         username: Some("user".into()),
//!         password: Some("pass".into()),
//!         group: None,
//!         join_group: false,
//!         level: 0,
//!         connections: 10,
//!         retention_days: 0,
//!         active: true,
//!         optional: false,
//!         ip_version: Default::default(),
//!     });
//!
//!     let disk_state = Arc::new(FileDiskState::new("./state"));
//!     let ctx = CoreContext::new(config, disk_state)?;
//!     let coordinator = QueueCoordinator::new(ctx);
//!
//!     // observe queue events
//!     let mut events = coordinator.context().queue.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {:?}", event);
//!         }
//!     });
//!
//!     coordinator.start();
//!     // ... ingest NZBs via coordinator.add_nzb_to_queue(...)
//!
//!     coordinator.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Bounded segment cache
pub mod cache;
/// Configuration types
pub mod config;
/// Explicit component wiring
pub mod context;
/// The scheduler and per-article downloaders
pub mod coordinator;
/// Obfuscated filename detection
pub mod deobfuscation;
/// Persisted state seam
pub mod diskstate;
/// Error types
pub mod error;
/// NNTP connection and tiered server pool
pub mod nntp;
/// Queue entities and edit operations
pub mod queue;
/// Retry helpers
pub mod retry;
/// URL placeholder downloads
pub mod url_fetch;
/// Path and filename helpers
pub mod utils;
/// Segment persistence and file reassembly
pub mod writer;
/// Streaming yEnc codec
pub mod yenc;

/// Core types and events
pub mod types;

// Re-export commonly used types
pub use cache::ArticleCache;
pub use config::{Config, FileNaming, HealthCheck, ServerConfig};
pub use context::CoreContext;
pub use coordinator::QueueCoordinator;
pub use diskstate::{DiskState, FileDiskState, MemoryDiskState};
pub use error::{ConnectionError, DecodeError, Error, QueueError, Result};
pub use nntp::{Connection, ServerPool};
pub use queue::editor::{EditCommand, QueueEditor};
pub use queue::{ArticleInfo, DownloadQueue, FileInfo, NzbInfo};
pub use types::{
    ArticleStatus, CompletedFileStatus, DeleteStatus, FileId, NzbId, Priority, QueueEvent,
};
pub use writer::ArticleWriter;

/// Run the coordinator until a termination signal, then shut down
/// gracefully.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(coordinator: std::sync::Arc<QueueCoordinator>) {
    coordinator.start();
    wait_for_signal().await;
    coordinator.stop().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // signal registration may fail in restricted environments
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
}
