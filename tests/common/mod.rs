//! Shared test support: an in-process NNTP server and engine harness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use usenet_engine::config::IpVersion;
use usenet_engine::queue::{ArticleInfo, FileInfo, NzbInfo};
use usenet_engine::{
    Config, CoreContext, MemoryDiskState, QueueCoordinator, ServerConfig,
};

/// A minimal in-process news server speaking the client subset: greeting,
/// AUTHINFO USER/PASS, GROUP, BODY, QUIT. Articles it does not carry get
/// a 430.
pub struct MockNntpServer {
    pub port: u16,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Clone, Default)]
pub struct MockArticles {
    /// message-id (no brackets) -> framed yEnc body
    bodies: HashMap<String, Vec<u8>>,
    /// artificial delay before each BODY response
    body_delay: Duration,
}

impl MockArticles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one yEnc-framed article body
    pub fn add(&mut self, message_id: &str, body: Vec<u8>) -> &mut Self {
        self.bodies.insert(message_id.to_string(), body);
        self
    }

    /// Encode `data` as part `part` of `name` at `offset` and store it
    pub fn add_payload(
        &mut self,
        message_id: &str,
        name: &str,
        file_size: u64,
        part: u32,
        offset: u64,
        data: &[u8],
    ) -> &mut Self {
        self.add(
            message_id,
            usenet_engine::yenc::encoder::encode_article(name, file_size, part, offset, data),
        )
    }

    /// Delay each BODY response (pause/backpressure tests)
    pub fn with_body_delay(&mut self, delay: Duration) -> &mut Self {
        self.body_delay = delay;
        self
    }
}

impl MockNntpServer {
    pub async fn start(articles: MockArticles) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let articles = Arc::new(articles);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let articles = Arc::clone(&articles);
                tokio::spawn(async move {
                    let _ = serve_connection(socket, articles).await;
                });
            }
        });

        Self { port, handle }
    }

    pub fn server_config(&self, level: u32, connections: usize) -> ServerConfig {
        ServerConfig {
            name: format!("mock:{}", self.port),
            host: "127.0.0.1".to_string(),
            port: self.port,
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
            ip_version: IpVersion::V4,
        }
    }
}

impl Drop for MockNntpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(
    socket: tokio::net::TcpStream,
    articles: Arc<MockArticles>,
) -> std::io::Result<()> {
    let (read_half, mut writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(b"200 mock news server ready\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();

        if command.starts_with("AUTHINFO USER") {
            writer.write_all(b"381 password required\r\n").await?;
        } else if command.starts_with("AUTHINFO PASS") {
            writer.write_all(b"281 authentication accepted\r\n").await?;
        } else if command.starts_with("GROUP") {
            writer.write_all(b"211 1 1 1 group selected\r\n").await?;
        } else if let Some(rest) = command.strip_prefix("BODY ") {
            let message_id = rest.trim().trim_matches(['<', '>']);
            if !articles.body_delay.is_zero() {
                tokio::time::sleep(articles.body_delay).await;
            }
            match articles.bodies.get(message_id) {
                Some(body) => {
                    writer
                        .write_all(format!("222 0 <{message_id}>\r\n").as_bytes())
                        .await?;
                    writer.write_all(body).await?;
                    writer.write_all(b".\r\n").await?;
                }
                None => {
                    writer.write_all(b"430 no such article\r\n").await?;
                }
            }
        } else if command.starts_with("QUIT") {
            writer.write_all(b"205 bye\r\n").await?;
            return Ok(());
        } else {
            writer.write_all(b"500 what?\r\n").await?;
        }
        writer.flush().await?;
    }
}

/// A running engine over temp directories and a memory disk state.
pub struct Harness {
    pub coordinator: Arc<QueueCoordinator>,
    pub dest: tempfile::TempDir,
    _inter: tempfile::TempDir,
}

impl Harness {
    pub async fn start(servers: Vec<ServerConfig>, mutate: impl FnOnce(&mut Config)) -> Self {
        let inter = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.servers = servers;
        config.download.inter_dir = inter.path().to_path_buf();
        config.download.dest_dir = dest.path().to_path_buf();
        config.download.direct_write = false;
        config.download.article_cache = 0;
        config.retry.article_interval = Duration::from_millis(20);
        config.retry.article_timeout = Duration::from_secs(10);
        config.retry.jitter = false;
        mutate(&mut config);

        let ctx = CoreContext::new(config, Arc::new(MemoryDiskState::new())).unwrap();
        let coordinator = QueueCoordinator::new(ctx);
        coordinator.start();

        Self {
            coordinator,
            dest,
            _inter: inter,
        }
    }

    /// Build and enqueue an NZB of one file with the given articles:
    /// `(message_id, declared_size)` per part, in order.
    pub fn add_single_file_nzb(
        &self,
        job_name: &str,
        filename: &str,
        articles: &[(&str, u64)],
    ) -> usenet_engine::NzbId {
        let article_infos: Vec<ArticleInfo> = articles
            .iter()
            .enumerate()
            .map(|(i, (id, size))| ArticleInfo::new(i as u32 + 1, id.to_string(), *size))
            .collect();
        let mut file = FileInfo::new(filename, article_infos);
        file.post_time = chrono::Utc::now() - chrono::Duration::days(1);

        let mut nzb = NzbInfo::new(job_name, self.dest.path());
        nzb.attach_file(file);
        self.coordinator
            .add_nzb_to_queue(nzb, None, false)
            .expect("nzb accepted")
    }

    /// Poll until `predicate` holds (against the queue) or panic after
    /// `timeout`.
    pub async fn wait_until(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&Arc<QueueCoordinator>) -> bool,
    ) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.coordinator) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// True once the NZB left the queue for history.
    pub fn in_history(&self, id: usenet_engine::NzbId) -> bool {
        let guard = self.coordinator.context().queue.guard();
        guard.history.iter().any(|n| n.id == id)
    }
}
