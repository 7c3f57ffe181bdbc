//! Bulk pre-screen for freshly discovered candidates
//!
//! A single cheap request through each candidate weeds out dead endpoints
//! before they reach the full validation protocol. There is no retry here;
//! a candidate that fails once is dropped.

use crate::config::ScreenConfig;
use crate::error::ProbeError;
use crate::proxy::models::{Proxy, ProxyType};
use crate::proxy::probe::{ProbeRequest, ProxyProbe};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

/// Anonymity assigned to survivors whose source did not report one
pub const UNKNOWN_ANONYMITY: &str = "unknown";

/// Coarse liveness filter applied to a chunk of candidates
#[async_trait]
pub trait PreScreen: Send + Sync {
    /// Probe every candidate of the chunk concurrently and return the
    /// survivors, annotated with protocol, latency and anonymity
    async fn screen(&self, chunk: Vec<Proxy>) -> Vec<Proxy>;
}

/// Pre-screen issuing one request per candidate through a [`ProxyProbe`]
pub struct BulkChecker {
    config: ScreenConfig,
    probe: Arc<dyn ProxyProbe>,
}

impl BulkChecker {
    pub fn new(config: ScreenConfig, probe: Arc<dyn ProxyProbe>) -> Self {
        Self { config, probe }
    }

    pub fn config(&self) -> &ScreenConfig {
        &self.config
    }

    /// Check a single candidate.
    ///
    /// Without a declared protocol each of [`ProxyType::DETECTION_ORDER`] is
    /// tried in turn; the first that works is recorded on the result.
    pub async fn check_proxy(&self, proxy: &Proxy) -> Result<Proxy, ProbeError> {
        let request = ProbeRequest::new(&self.config.test_url, self.config.timeout);

        let candidates: Vec<ProxyType> = match proxy.protocol {
            Some(protocol) => vec![protocol],
            None => ProxyType::DETECTION_ORDER.to_vec(),
        };

        let mut last_error = ProbeError::Request("no protocol attempted".to_string());
        for protocol in candidates {
            match self.probe.fetch_via(proxy, protocol, &request).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    let mut checked = proxy.clone();
                    checked.protocol = Some(protocol);
                    checked.latency_ms = Some(response.latency_ms());
                    if checked.anonymity.is_none() {
                        checked.anonymity = Some(UNKNOWN_ANONYMITY.to_string());
                    }
                    return Ok(checked);
                }
                Ok(response) => last_error = ProbeError::Status(response.status),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    /// Check candidates concurrently, keeping input order among survivors
    pub async fn check_proxies(&self, proxies: Vec<Proxy>) -> Vec<Proxy> {
        let checks = proxies.iter().map(|proxy| self.check_proxy(proxy));
        let outcomes = join_all(checks).await;

        proxies
            .iter()
            .zip(outcomes)
            .filter_map(|(proxy, outcome)| match outcome {
                Ok(checked) => {
                    tracing::debug!(proxy = %checked, latency_ms = ?checked.latency_ms, "Proxy passed pre-screen");
                    Some(checked)
                }
                Err(e) => {
                    tracing::debug!(proxy = %proxy, error = %e, "Proxy failed pre-screen");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl PreScreen for BulkChecker {
    async fn screen(&self, chunk: Vec<Proxy>) -> Vec<Proxy> {
        let total = chunk.len();
        let survivors = self.check_proxies(chunk).await;
        tracing::debug!(total, passed = survivors.len(), "Finished pre-screen chunk");
        survivors
    }
}
