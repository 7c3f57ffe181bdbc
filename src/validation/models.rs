//! Validation data models

use crate::proxy::models::Proxy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of one validation stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub details: Map<String, Value>,
}

impl TestResult {
    pub fn passed() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }

    /// Stage that ran and did not pass, or was never attempted
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Stage skipped because an earlier gating stage failed
    pub fn not_attempted() -> Self {
        Self::failed("not attempted").with_detail("skipped", true)
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Results of every stage for one attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResults {
    pub connectivity: TestResult,
    pub anonymity: TestResult,
    pub speed: TestResult,
    pub geolocation: TestResult,
}

/// Complete validation result for a proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub proxy: Proxy,
    pub passed: bool,
    pub tests: StageResults,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

impl ValidationResult {
    /// Result with every stage unset, before any test ran
    pub fn pending(proxy: Proxy, retry_count: u32) -> Self {
        Self {
            proxy,
            passed: false,
            tests: StageResults::default(),
            timestamp: Utc::now(),
            retry_count,
        }
    }

    /// Overall verdict: connectivity, speed and anonymity all passed.
    /// Geolocation is informational only.
    pub fn compute_passed(&self) -> bool {
        self.tests.connectivity.passed && self.tests.speed.passed && self.tests.anonymity.passed
    }
}

/// A unit of work for the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationTask {
    pub id: String,
    pub proxy: Proxy,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl ValidationTask {
    pub fn new(proxy: Proxy) -> Self {
        Self {
            id: format!("{}-{}", proxy.full(), uuid::Uuid::new_v4()),
            proxy,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Aggregate scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    /// Tasks ever enqueued
    pub total: u64,
    pub passed: u64,
    /// Tasks that exhausted their attempts
    pub failed: u64,
    /// Tasks waiting in the queue, retries included
    pub pending: u64,
    /// Tasks currently being validated
    pub active: u64,
    /// Queued tasks dropped by shutdown before they started
    pub discarded: u64,
    /// Mean speed-stage latency over stored results that have one
    pub average_latency_ms: f64,
    /// `passed / total * 100`
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_passed_ignores_geolocation() {
        let mut result = ValidationResult::pending(Proxy::new("1.1.1.1", 80), 0);
        result.tests.connectivity = TestResult::passed();
        result.tests.speed = TestResult::passed().with_latency(120);
        result.tests.anonymity = TestResult::passed();
        result.tests.geolocation = TestResult::failed("No geolocation data available");
        assert!(result.compute_passed());

        result.tests.anonymity = TestResult::failed("leak");
        assert!(!result.compute_passed());
    }

    #[test]
    fn test_not_attempted_marks_skip() {
        let result = TestResult::not_attempted();
        assert!(!result.passed);
        assert_eq!(result.details.get("skipped"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = ValidationTask::new(Proxy::new("1.1.1.1", 80));
        let b = ValidationTask::new(Proxy::new("1.1.1.1", 80));
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("1.1.1.1:80-"));
        assert_eq!(a.retry_count, 0);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ValidationResult::pending(Proxy::new("1.1.1.1", 80), 2);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["retryCount"], 2);
        assert_eq!(value["proxy"]["full"], "1.1.1.1:80");
        assert_eq!(value["tests"]["connectivity"]["passed"], false);
    }
}
