//! Multi-stage validation of a single proxy
//!
//! Stages run in order: connectivity, speed, anonymity, geolocation. A
//! connectivity failure short-circuits the rest without touching the
//! network again. Stage failures are recorded in the result, never raised.

use crate::config::ValidatorConfig;
use crate::error::ProbeError;
use crate::proxy::models::Proxy;
use crate::proxy::probe::{ProbeRequest, ProbeResponse, ProxyProbe};
use crate::validation::models::{TestResult, ValidationResult};
use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timeout for the one-off real IP detection
const REAL_IP_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can validate a proxy; the scheduler's only dependency
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, proxy: &Proxy, retry_count: u32) -> ValidationResult;
}

/// Validator running the live network tests
pub struct ProxyValidator {
    config: ValidatorConfig,
    probe: Arc<dyn ProxyProbe>,
    real_ip: Option<String>,
}

impl ProxyValidator {
    pub fn new(config: ValidatorConfig, probe: Arc<dyn ProxyProbe>) -> Self {
        Self {
            config,
            probe,
            real_ip: None,
        }
    }

    /// Use a known egress IP instead of detecting it
    pub fn with_real_ip(mut self, ip: impl Into<String>) -> Self {
        self.real_ip = Some(ip.into());
        self
    }

    pub fn real_ip(&self) -> Option<&str> {
        self.real_ip.as_deref()
    }

    /// Detect this machine's own egress IP with a direct request.
    ///
    /// On failure the anonymity stage is skipped (and passes) for the
    /// lifetime of the validator.
    pub async fn initialize(&mut self) {
        let request = ProbeRequest::new(&self.config.anonymity_check_url, REAL_IP_TIMEOUT).with_body();
        let detected = match self.probe.fetch_direct(&request).await {
            Ok(response) => response.body.as_deref().and_then(extract_ip),
            Err(e) => {
                tracing::debug!(error = %e, "Real IP request failed");
                None
            }
        };

        match detected {
            Some(ip) => {
                tracing::info!(real_ip = %ip, "Validator initialized");
                self.real_ip = Some(ip);
            }
            None => {
                tracing::warn!("Failed to detect real IP. Anonymity tests will be skipped.");
            }
        }
    }

    /// Validate a single proxy through all tests
    pub async fn validate_proxy(&self, proxy: &Proxy, retry_count: u32) -> ValidationResult {
        let start = Instant::now();
        tracing::debug!(proxy = %proxy, retry_count, "Validating proxy");

        let mut result = ValidationResult::pending(proxy.clone(), retry_count);

        result.tests.connectivity = self.test_connectivity(proxy).await;
        if !result.tests.connectivity.passed {
            result.tests.speed = TestResult::not_attempted();
            result.tests.anonymity = TestResult::not_attempted();
            result.tests.geolocation = TestResult::not_attempted();
            return result;
        }

        result.tests.speed = self.test_speed(proxy).await;
        result.tests.anonymity = self.test_anonymity(proxy).await;
        result.tests.geolocation = verify_geolocation(proxy);
        result.passed = result.compute_passed();

        tracing::debug!(
            proxy = %proxy,
            passed = result.passed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Validation complete"
        );
        result
    }

    fn request(&self, url: &str) -> ProbeRequest {
        ProbeRequest::new(url, self.config.timeout)
    }

    /// Any HTTP response counts; only transport failures fail the stage
    async fn test_connectivity(&self, proxy: &Proxy) -> TestResult {
        let request = self.request(&self.config.connectivity_url).without_redirects();
        match self.probe.fetch(proxy, &request).await {
            Ok(response) => TestResult::passed()
                .with_latency(response.latency_ms())
                .with_detail("status", response.status),
            Err(e) => TestResult::failed(e.to_string()),
        }
    }

    async fn test_speed(&self, proxy: &Proxy) -> TestResult {
        let request = self.request(&self.config.speed_test_url);
        let threshold_ms = self.config.speed_threshold.as_millis() as u64;

        match self.probe.fetch(proxy, &request).await.and_then(require_success) {
            Ok(response) => {
                let latency = response.latency_ms();
                TestResult {
                    passed: latency < threshold_ms,
                    ..TestResult::passed()
                }
                .with_latency(latency)
                .with_detail("threshold", threshold_ms)
            }
            Err(e) => TestResult::failed(e.to_string()),
        }
    }

    /// Passes when the IP seen by the remote service is not ours
    async fn test_anonymity(&self, proxy: &Proxy) -> TestResult {
        let Some(real_ip) = self.real_ip.as_deref() else {
            return TestResult::passed()
                .with_detail("skipped", true)
                .with_detail("reason", "Real IP not detected");
        };

        let request = self.request(&self.config.anonymity_check_url).with_body();
        let response = match self.probe.fetch(proxy, &request).await.and_then(require_success) {
            Ok(response) => response,
            Err(e) => return TestResult::failed(e.to_string()),
        };

        let Some(proxy_ip) = response.body.as_deref().and_then(extract_ip) else {
            return TestResult::failed(
                ProbeError::Body("no IP address in response".to_string()).to_string(),
            );
        };

        let leaked = proxy_ip == real_ip;
        TestResult {
            passed: !leaked,
            ..TestResult::passed()
        }
        .with_latency(response.latency_ms())
        .with_detail("proxyIp", proxy_ip)
        .with_detail("realIp", real_ip)
        .with_detail("leaked", leaked)
    }
}

#[async_trait]
impl Validator for ProxyValidator {
    async fn validate(&self, proxy: &Proxy, retry_count: u32) -> ValidationResult {
        self.validate_proxy(proxy, retry_count).await
    }
}

/// Trusts the location attached during enrichment; it is not re-verified
/// against the proxy's observed egress location.
fn verify_geolocation(proxy: &Proxy) -> TestResult {
    match (&proxy.country, &proxy.country_code) {
        (Some(country), Some(code)) => TestResult::passed()
            .with_detail("country", country.as_str())
            .with_detail("countryCode", code.as_str())
            .with_detail("verified", false),
        _ => TestResult::failed("No geolocation data available"),
    }
}

fn require_success(response: ProbeResponse) -> Result<ProbeResponse, ProbeError> {
    if (200..300).contains(&response.status) {
        Ok(response)
    } else {
        Err(ProbeError::Status(response.status))
    }
}

/// Pull the reflected address out of an IP echo response.
///
/// Understands `{"ip": ...}`, httpbin's `{"origin": ...}` and bare text.
pub fn extract_ip(body: &str) -> Option<String> {
    let candidate = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => ["ip", "origin", "address"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string()),
        Ok(Value::String(s)) => Some(s),
        _ => Some(body.trim().to_string()),
    }?;

    candidate.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}
