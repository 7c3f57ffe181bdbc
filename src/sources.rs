//! Candidate sources
//!
//! Sources only produce [`RawCandidate`] records; validation of those
//! records happens at the coordinator boundary. Supported inputs:
//! - Local list files (one `host:port` or `scheme://host:port` per line)
//! - Plain-text lists downloaded over HTTP, with an `IPv4:port` scan as a
//!   fallback for lists wrapped in other text

use crate::proxy::models::{ProxyType, RawCandidate};
use crate::proxy::parser::CandidateParser;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for list downloads in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent for list downloads
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Anything that yields raw proxy candidates
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Name recorded as the `source` of every candidate
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<RawCandidate>>;
}

/// Outcome of fetching one source
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source: String,
    pub candidates: Vec<RawCandidate>,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn success(source: String, candidates: Vec<RawCandidate>) -> Self {
        Self {
            source,
            candidates,
            error: None,
        }
    }

    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            candidates: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Fetch every source in turn, reporting failures instead of stopping
pub async fn fetch_all(sources: &[Box<dyn CandidateSource>]) -> Vec<FetchResult> {
    let mut results = Vec::with_capacity(sources.len());
    for source in sources {
        let result = match source.fetch().await {
            Ok(candidates) => {
                tracing::info!(source = source.name(), count = candidates.len(), "Fetched candidates");
                FetchResult::success(source.name().to_string(), candidates)
            }
            Err(e) => {
                tracing::warn!(source = source.name(), error = %e, "Failed to fetch candidates");
                FetchResult::failure(source.name().to_string(), format!("{:#}", e))
            }
        };
        results.push(result);
    }
    results
}

/// Stamp source name and fallback protocol on parsed candidates
fn label(candidates: Vec<RawCandidate>, name: &str, protocol: Option<ProxyType>) -> Vec<RawCandidate> {
    candidates
        .into_iter()
        .map(|mut candidate| {
            if candidate.protocol.is_none() {
                candidate.protocol = protocol.map(|p| p.to_string());
            }
            candidate.with_source(name)
        })
        .collect()
}

/// Proxy list stored in a local file
#[derive(Debug, Clone)]
pub struct FileSource {
    name: String,
    path: PathBuf,
    protocol: Option<ProxyType>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            path,
            protocol: None,
        }
    }

    /// Protocol assumed for entries that do not carry a scheme
    pub fn with_protocol(mut self, protocol: ProxyType) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

#[async_trait]
impl CandidateSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<RawCandidate>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read proxy list {}", self.path.display()))?;
        Ok(label(
            CandidateParser::parse_string(&content),
            &self.name,
            self.protocol,
        ))
    }
}

/// Plain-text proxy list served over HTTP
#[derive(Debug, Clone)]
pub struct UrlListSource {
    name: String,
    url: String,
    protocol: Option<ProxyType>,
    client: Client,
}

impl UrlListSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;

        Ok(Self {
            name: url.clone(),
            url,
            protocol: None,
            client,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Protocol assumed for entries that do not carry a scheme
    pub fn with_protocol(mut self, protocol: ProxyType) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

#[async_trait]
impl CandidateSource for UrlListSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<RawCandidate>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", self.url))?
            .error_for_status()?;
        let content = response.text().await?;
        Ok(label(
            CandidateParser::parse_string(&content),
            &self.name,
            self.protocol,
        ))
    }
}
