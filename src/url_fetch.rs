//! URL placeholder downloads.
//!
//! A queue entry of kind `Url` holds a position while its NZB document is
//! fetched over HTTP(S). The fetch retries `url_retries` times spaced
//! `url_interval` apart, each attempt bounded by `url_timeout`. The result
//! is handed back to ingestion, which replaces the placeholder.

use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::retry::with_retries;

/// Outcome of a completed URL fetch
#[derive(Clone, Debug)]
pub struct FetchedNzb {
    /// The raw NZB document
    pub body: Vec<u8>,
    /// Filename suggested by the server (Content-Disposition or URL path)
    pub filename: Option<String>,
}

/// Fetches NZB documents for URL placeholders.
pub struct UrlDownloader {
    client: reqwest::Client,
    retries: u32,
    interval: Duration,
    jitter: bool,
}

impl UrlDownloader {
    /// Build from the engine configuration
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.retry.url_timeout)
            .build()
            .map_err(Error::UrlFetch)?;
        Ok(Self {
            client,
            retries: config.retry.url_retries,
            interval: config.retry.url_interval,
            jitter: config.retry.jitter,
        })
    }

    /// Fetch the document at `url`, retrying transient failures.
    pub async fn fetch(&self, url: &str) -> Result<FetchedNzb> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Other(format!("invalid url {url}: {e}")))?;

        let body = with_retries(self.retries, self.interval, self.jitter, || async {
            let response = self
                .client
                .get(parsed.clone())
                .send()
                .await
                .map_err(Error::UrlFetch)?;
            let response = response.error_for_status().map_err(Error::UrlFetch)?;
            let filename = disposition_filename(response.headers());
            let bytes = response.bytes().await.map_err(Error::UrlFetch)?;
            Ok::<_, Error>((bytes.to_vec(), filename))
        })
        .await?;

        let (bytes, header_name) = body;
        let filename = header_name.or_else(|| path_filename(&parsed));

        tracing::info!(
            url = %parsed,
            bytes = bytes.len(),
            filename = filename.as_deref().unwrap_or("<unnamed>"),
            "url fetch completed"
        );

        Ok(FetchedNzb {
            body: bytes,
            filename,
        })
    }
}

fn disposition_filename(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let value = headers
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    let marker = "filename=";
    let idx = value.find(marker)?;
    let name = value[idx + marker.len()..]
        .trim()
        .trim_matches('"')
        .split(';')
        .next()?
        .trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn path_filename(url: &url::Url) -> Option<String> {
    let name = url.path_segments()?.next_back()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
