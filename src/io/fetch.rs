//! Fetch boundary: URL in, raw bytes out.
//!
//! The pipeline only ever talks to the [`Fetch`] trait, so tests can
//! substitute an in-memory source. The production implementation speaks
//! HTTP(S) through reqwest and `file://` for local archives.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP client error: {0}")]
    Client(reqwest::Error),

    #[error("transport error fetching {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("IO error fetching {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported URL scheme in '{0}'")]
    Scheme(String),

    #[error("all sources exhausted: [{}]", .attempts.join(", "))]
    Exhausted { attempts: Vec<String> },
}

#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetch the full content behind `url`.
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Production fetcher: `http`/`https` via reqwest, `file` for local
/// archives (useful for air-gapped descriptor sets and tests).
pub struct UrlFetcher {
    client: reqwest::Client,
}

impl UrlFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for UrlFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path).await.map(Bytes::from).map_err(|e| {
                FetchError::Io {
                    url: url.to_string(),
                    source: e,
                }
            });
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(FetchError::Scheme(url.to_string()));
        }

        let wrap = |source: reqwest::Error| FetchError::Http {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await
            .map_err(wrap)?
            .error_for_status()
            .map_err(wrap)?;
        response.bytes().await.map_err(wrap)
    }
}

/// How mirror candidates are tried.
///
/// Sequential is the default: deterministic and bandwidth-friendly.
/// Racing trades both for latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MirrorPolicy {
    #[default]
    Sequential,
    Race,
}

/// Try `candidates` until one succeeds.
///
/// Exhausting every candidate returns [`FetchError::Exhausted`] carrying
/// one line per failed attempt.
pub async fn fetch_first(
    fetcher: &dyn Fetch,
    candidates: &[&str],
    policy: MirrorPolicy,
) -> Result<Bytes, FetchError> {
    let mut attempts = Vec::new();

    match policy {
        MirrorPolicy::Sequential => {
            for url in candidates {
                match fetcher.fetch(url).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(e) => {
                        tracing::warn!(url, error = %e, "fetch candidate failed");
                        attempts.push(format!("{url}: {e}"));
                    }
                }
            }
        }
        MirrorPolicy::Race => {
            let mut in_flight: FuturesUnordered<_> = candidates
                .iter()
                .map(|url| async move { fetcher.fetch(url).await.map_err(|e| format!("{url}: {e}")) })
                .collect();
            while let Some(result) = in_flight.next().await {
                match result {
                    Ok(bytes) => return Ok(bytes),
                    Err(e) => {
                        tracing::warn!(error = %e, "fetch candidate failed");
                        attempts.push(e);
                    }
                }
            }
        }
    }

    Err(FetchError::Exhausted { attempts })
}
