//! Tiered news-server pool.
//!
//! Servers are grouped by level (0 = primary, 1..N = backup tiers). The
//! pool hands out [`Connection`]s respecting per-server connection limits,
//! retention, short connect-failure backoffs, and per-(file, level) blocks
//! recorded by downloaders that exhausted a tier for a file.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::types::{FileId, ServerId};

use super::connection::Connection;

/// Idle connections older than this are closed by the sweeper
const IDLE_KEEPALIVE: Duration = Duration::from_secs(60);

struct ServerSlot {
    id: ServerId,
    config: ServerConfig,
    idle: Mutex<Vec<(Connection, Instant)>>,
    in_use: AtomicUsize,
    backoff_until: Mutex<Option<Instant>>,
}

impl ServerSlot {
    fn in_backoff(&self, now: Instant) -> bool {
        match *self.backoff_until.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(until) => until > now,
            None => false,
        }
    }

    fn has_idle(&self) -> bool {
        !self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

/// Registry of news servers with per-server connection accounting.
pub struct ServerPool {
    slots: Vec<ServerSlot>,
    max_level: u32,
    read_timeout: Duration,
    blocks: Mutex<HashMap<(FileId, u32), Instant>>,
    rr: AtomicUsize,
}

impl ServerPool {
    /// Build the pool from the configured server list. Server ids are the
    /// indexes into that list.
    pub fn new(servers: &[ServerConfig], read_timeout: Duration) -> Self {
        let slots: Vec<ServerSlot> = servers
            .iter()
            .enumerate()
            .map(|(id, config)| ServerSlot {
                id,
                config: config.clone(),
                idle: Mutex::new(Vec::new()),
                in_use: AtomicUsize::new(0),
                backoff_until: Mutex::new(None),
            })
            .collect();
        let max_level = slots
            .iter()
            .filter(|s| s.config.active)
            .map(|s| s.config.level)
            .max()
            .unwrap_or(0);
        Self {
            slots,
            max_level,
            read_timeout,
            blocks: Mutex::new(HashMap::new()),
            rr: AtomicUsize::new(0),
        }
    }

    /// Highest level among active servers
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Config of a server by id
    pub fn server_config(&self, id: ServerId) -> Option<&ServerConfig> {
        self.slots.get(id).map(|s| &s.config)
    }

    /// Ids of active servers at a level (optional servers excluded unless
    /// `include_optional`)
    pub fn servers_at_level(&self, level: u32, include_optional: bool) -> Vec<ServerId> {
        self.slots
            .iter()
            .filter(|s| {
                s.config.active
                    && s.config.level == level
                    && (include_optional || !s.config.optional)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Upper bound for simultaneous article downloads: the connection sum
    /// across active level-0/level-1 servers.
    pub fn downloads_limit(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.config.active && s.config.level <= 1)
            .map(|s| s.config.connections)
            .sum()
    }

    /// Whether the level has any server that could ever serve this
    /// request (ignoring how busy it currently is). When this is false
    /// the caller raises the level instead of waiting.
    pub fn has_candidates(
        &self,
        level: u32,
        file: Option<FileId>,
        article_age_days: Option<u32>,
        include_optional: bool,
        excluded: &[ServerId],
    ) -> bool {
        let now = Instant::now();
        if self.is_blocked(file, level, now) {
            return false;
        }
        self.slots.iter().any(|s| {
            s.config.active
                && s.config.level == level
                && (include_optional || !s.config.optional)
                && !excluded.contains(&s.id)
                && retention_allows(&s.config, article_age_days)
        })
    }

    fn is_blocked(&self, file: Option<FileId>, level: u32, now: Instant) -> bool {
        let Some(file) = file else { return false };
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        matches!(blocks.get(&(file, level)), Some(&until) if until > now)
    }

    /// Reserve a connection for a server at `level`.
    ///
    /// A `preferred` server is picked when it is among the eligible
    /// candidates (a downloader retrying wants the same server again).
    ///
    /// Returns `None` when the level has no eligible candidate: every
    /// server is saturated, backing off, in `excluded` (already failed for
    /// this article), beyond retention, or the (file, level) pair is
    /// blocked. Callers then raise the level.
    ///
    /// The returned connection may be unconnected; the downloader performs
    /// the actual connect so connect latency is paid off the scheduler.
    pub fn get_connection(
        &self,
        level: u32,
        file: Option<FileId>,
        article_age_days: Option<u32>,
        include_optional: bool,
        preferred: Option<ServerId>,
        excluded: &[ServerId],
    ) -> Option<Connection> {
        let now = Instant::now();

        if self.is_blocked(file, level, now) {
            return None;
        }

        let candidates: Vec<&ServerSlot> = self
            .slots
            .iter()
            .filter(|s| {
                s.config.active
                    && s.config.level == level
                    && (include_optional || !s.config.optional)
                    && !excluded.contains(&s.id)
                    && !s.in_backoff(now)
                    && s.in_use.load(Ordering::Acquire) < s.config.connections
                    && retention_allows(&s.config, article_age_days)
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        // a requested server wins outright; otherwise prefer a warm idle
        // connection and break ties round-robin
        let len = candidates.len();
        let start = self.rr.fetch_add(1, Ordering::Relaxed) % len;
        let mut pick = candidates[start];
        if let Some(wanted) =
            preferred.and_then(|id| candidates.iter().find(|s| s.id == id).copied())
        {
            pick = wanted;
        } else {
            for i in 0..len {
                let candidate = candidates[(start + i) % len];
                if candidate.has_idle() {
                    pick = candidate;
                    break;
                }
            }
        }

        pick.in_use.fetch_add(1, Ordering::AcqRel);
        let reused = pick
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .map(|(conn, _)| conn);

        Some(reused.unwrap_or_else(|| {
            Connection::new(pick.id, pick.config.clone(), self.read_timeout)
        }))
    }

    /// Return a connection to its server slot.
    ///
    /// `keep_alive` keeps an established connection in the idle pool;
    /// otherwise (or when not connected) the socket is dropped.
    pub fn free_connection(&self, conn: Connection, keep_alive: bool) {
        let Some(slot) = self.slots.get(conn.server_id()) else {
            return;
        };
        slot.in_use.fetch_sub(1, Ordering::AcqRel);

        if keep_alive && conn.state() == super::ConnectionState::Connected {
            slot.idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((conn, Instant::now()));
        }
        // otherwise conn drops here and the socket closes
    }

    /// Block `(file, level)` for `duration`: no connections at this level
    /// will be handed out for the file until the block expires.
    pub fn block_server(&self, file: FileId, level: u32, duration: Duration) {
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((file, level), Instant::now() + duration);
    }

    /// Drop every block recorded for a file (file finished or deleted)
    pub fn clear_blocks(&self, file: FileId) {
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(blocked_file, _), _| *blocked_file != file);
    }

    /// Record a connect failure; the server sits out for `backoff`.
    pub fn note_connect_failure(&self, server_id: ServerId, backoff: Duration) {
        if let Some(slot) = self.slots.get(server_id) {
            *slot.backoff_until.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(Instant::now() + backoff);
            tracing::warn!(
                server = %slot.config.display_name(),
                backoff_secs = backoff.as_secs(),
                "connect failure, backing off"
            );
        }
    }

    /// Close idle connections that sat unused past the keep-alive window,
    /// and drop expired blocks. Called once per second by the coordinator.
    pub fn close_unused_connections(&self) {
        let now = Instant::now();
        for slot in &self.slots {
            slot.idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(_, last_used)| now.duration_since(*last_used) < IDLE_KEEPALIVE);
        }
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, until| *until > now);
    }

    /// Number of connections currently checked out, across all servers
    pub fn connections_in_use(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.in_use.load(Ordering::Acquire))
            .sum()
    }
}

fn retention_allows(config: &ServerConfig, article_age_days: Option<u32>) -> bool {
    match (config.retention_days, article_age_days) {
        (0, _) | (_, None) => true,
        (retention, Some(age)) => age <= retention,
    }
}

/// Backoff applied after a failed connect, scaled by failure kind
pub fn connect_backoff(err: &ConnectionError) -> Duration {
    match err {
        ConnectionError::DnsFailure { .. } | ConnectionError::TlsHandshake(_) => {
            Duration::from_secs(30)
        }
        _ => Duration::from_secs(5),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpVersion;

    fn server(level: u32, connections: usize) -> ServerConfig {
        ServerConfig {
            name: String::new(),
            host: "news.example.com".to_string(),
            port: 119,
            tls: false,
            cipher: String::new(),
            username: None,
            password: None,
            group: None,
            join_group: false,
            level,
            connections,
            retention_days: 0,
            active: true,
            optional: false,
            ip_version: IpVersion::Auto,
        }
    }

    fn pool(servers: Vec<ServerConfig>) -> ServerPool {
        ServerPool::new(&servers, Duration::from_secs(5))
    }

    #[test]
    fn respects_per_server_connection_limit() {
        let pool = pool(vec![server(0, 2)]);

        let c1 = pool.get_connection(0, None, None, false, None, &[]).unwrap();
        let _c2 = pool.get_connection(0, None, None, false, None, &[]).unwrap();
        assert!(
            pool.get_connection(0, None, None, false, None, &[]).is_none(),
            "third connection must be refused at limit 2"
        );

        pool.free_connection(c1, false);
        assert!(pool.get_connection(0, None, None, false, None, &[]).is_some());
    }

    #[test]
    fn level_isolation() {
        let pool = pool(vec![server(0, 1), server(1, 1)]);

        assert_eq!(pool.max_level(), 1);
        let c = pool.get_connection(1, None, None, false, None, &[]).unwrap();
        assert_eq!(c.server_id(), 1, "level 1 must map to the backup server");
    }

    #[test]
    fn blocked_file_level_is_refused_until_expiry() {
        let pool = pool(vec![server(0, 4)]);
        let file = FileId::new(7);

        pool.block_server(file, 0, Duration::from_secs(60));
        assert!(pool.get_connection(0, Some(file), None, false, None, &[]).is_none());

        // other files are unaffected
        assert!(
            pool.get_connection(0, Some(FileId::new(8)), None, false, None, &[])
                .is_some()
        );

        pool.clear_blocks(file);
        assert!(pool.get_connection(0, Some(file), None, false, None, &[]).is_some());
    }

    #[test]
    fn retention_filters_old_articles() {
        let mut short_retention = server(0, 4);
        short_retention.retention_days = 100;
        let pool = pool(vec![short_retention]);

        assert!(pool.get_connection(0, None, Some(200), false, None, &[]).is_none());
        assert!(pool.get_connection(0, None, Some(50), false, None, &[]).is_some());
        assert!(pool.get_connection(0, None, None, false, None, &[]).is_some());
    }

    #[test]
    fn optional_servers_need_opt_in() {
        let mut optional = server(0, 4);
        optional.optional = true;
        let pool = pool(vec![optional]);

        assert!(pool.get_connection(0, None, None, false, None, &[]).is_none());
        assert!(pool.get_connection(0, None, None, true, None, &[]).is_some());
    }

    #[test]
    fn inactive_servers_are_invisible() {
        let mut inactive = server(0, 4);
        inactive.active = false;
        let pool = pool(vec![inactive]);

        assert!(pool.get_connection(0, None, None, false, None, &[]).is_none());
        assert_eq!(pool.downloads_limit(), 0);
    }

    #[test]
    fn connect_failure_backoff_sits_the_server_out() {
        let pool = pool(vec![server(0, 4)]);

        pool.note_connect_failure(0, Duration::from_secs(60));
        assert!(pool.get_connection(0, None, None, false, None, &[]).is_none());
    }

    #[test]
    fn round_robin_spreads_across_equal_servers() {
        let pool = pool(vec![server(0, 4), server(0, 4)]);

        let mut seen = std::collections::HashSet::new();
        let mut held = Vec::new();
        for _ in 0..2 {
            let c = pool.get_connection(0, None, None, false, None, &[]).unwrap();
            seen.insert(c.server_id());
            held.push(c);
        }
        assert_eq!(seen.len(), 2, "both servers should receive load");
    }

    #[test]
    fn free_with_keep_alive_only_pools_connected_sockets() {
        let pool = pool(vec![server(0, 4)]);

        // never connected: keep_alive must not park it in the idle pool
        let c = pool.get_connection(0, None, None, false, None, &[]).unwrap();
        pool.free_connection(c, true);
        assert_eq!(pool.connections_in_use(), 0);
    }

    #[test]
    fn downloads_limit_sums_primary_and_first_backup_tier() {
        let pool = pool(vec![server(0, 10), server(1, 5), server(2, 50)]);
        assert_eq!(pool.downloads_limit(), 15);
    }

    #[test]
    fn preferred_server_wins_when_eligible() {
        let pool = pool(vec![server(0, 4), server(0, 4), server(0, 4)]);

        for _ in 0..6 {
            let c = pool
                .get_connection(0, None, None, false, Some(1), &[])
                .unwrap();
            assert_eq!(c.server_id(), 1, "preference overrides round-robin");
            pool.free_connection(c, false);
        }

        // an excluded preferred server falls back to the rotation
        let c = pool
            .get_connection(0, None, None, false, Some(1), &[1])
            .unwrap();
        assert_ne!(c.server_id(), 1);
    }

    #[test]
    fn has_candidates_distinguishes_busy_from_absent() {
        let pool = pool(vec![server(0, 1)]);

        let held = pool.get_connection(0, None, None, false, None, &[]).unwrap();
        // saturated but the server still exists: callers wait, not escalate
        assert!(pool.get_connection(0, None, None, false, None, &[]).is_none());
        assert!(pool.has_candidates(0, None, None, false, &[]));

        // excluded (already failed for this article): truly no candidate
        assert!(!pool.has_candidates(0, None, None, false, &[0]));
        // no server at the level at all
        assert!(!pool.has_candidates(1, None, None, false, &[]));

        pool.free_connection(held, false);
    }
}
