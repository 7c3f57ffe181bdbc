//! Proxy data models

use crate::error::CandidateError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proxy type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    pub const ALL: [ProxyType; 4] = [
        ProxyType::Http,
        ProxyType::Https,
        ProxyType::Socks4,
        ProxyType::Socks5,
    ];

    /// Protocols tried, in order, when a source did not say which one it lists
    pub const DETECTION_ORDER: [ProxyType; 3] =
        [ProxyType::Http, ProxyType::Socks5, ProxyType::Socks4];
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => write!(f, "http"),
            ProxyType::Https => write!(f, "https"),
            ProxyType::Socks4 => write!(f, "socks4"),
            ProxyType::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for ProxyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(ProxyType::Http),
            "https" => Ok(ProxyType::Https),
            "socks4" | "socks4a" => Ok(ProxyType::Socks4),
            "socks5" | "socks5h" | "socks" => Ok(ProxyType::Socks5),
            other => Err(format!(
                "Invalid proxy type: {}. Use: http, https, socks4, socks5",
                other
            )),
        }
    }
}

/// Loosely-typed record as emitted by a candidate source.
///
/// This is the only shape accepted at the ingest boundary; convert it
/// with [`Proxy::try_from`] before handing it to the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub host: String,
    pub port: String,
    pub protocol: Option<String>,
    pub country: Option<String>,
    pub anonymity: Option<String>,
    pub source: Option<String>,
}

impl RawCandidate {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A proxy candidate. Its identity is [`Proxy::full`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ProxyRecord", try_from = "ProxyRecord")]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub protocol: Option<ProxyType>,
    pub anonymity: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub latency_ms: Option<u64>,
    pub source: Option<String>,
}

impl Proxy {
    /// Create a new proxy with no metadata
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: None,
            anonymity: None,
            country: None,
            country_code: None,
            region: None,
            city: None,
            isp: None,
            latency_ms: None,
            source: None,
        }
    }

    pub fn with_protocol(mut self, protocol: ProxyType) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Canonical `host:port` key used for deduplication
    pub fn full(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL understood by reqwest.
    ///
    /// Unknown protocols default to plain HTTP. Listed "https" proxies are
    /// HTTP proxies that support CONNECT, so they share the `http` scheme.
    /// SOCKS5 uses `socks5h` so target hostnames resolve on the proxy side.
    pub fn url(&self) -> String {
        self.url_as(self.protocol.unwrap_or_default())
    }

    /// Proxy URL for an explicit protocol, used while detecting the type
    pub fn url_as(&self, protocol: ProxyType) -> String {
        let scheme = match protocol {
            ProxyType::Http | ProxyType::Https => "http",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks5 => "socks5h",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Whether enrichment populated both country fields
    pub fn has_location(&self) -> bool {
        self.country.is_some() && self.country_code.is_some()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl TryFrom<RawCandidate> for Proxy {
    type Error = CandidateError;

    fn try_from(raw: RawCandidate) -> Result<Self, Self::Error> {
        let host = raw.host.trim();
        if host.is_empty() {
            return Err(CandidateError::MissingHost);
        }
        if host.contains(':') || host.chars().any(char::is_whitespace) {
            return Err(CandidateError::InvalidHost(host.to_string()));
        }
        let port = parse_port(&raw.port)?;

        let mut proxy = Proxy::new(host, port);
        proxy.protocol = raw.protocol.as_deref().and_then(|p| p.parse().ok());
        proxy.anonymity = non_empty(raw.anonymity);
        proxy.country = non_empty(raw.country);
        proxy.source = non_empty(raw.source);
        Ok(proxy)
    }
}

fn parse_port(value: &str) -> Result<u16, CandidateError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(CandidateError::InvalidPort(value.to_string())),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// On-disk shape of a [`Proxy`]: camelCase with the derived `full` key
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProxyRecord {
    host: String,
    #[serde(deserialize_with = "port_from_any")]
    port: String,
    #[serde(default)]
    full: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    anonymity: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default, alias = "latency")]
    latency_ms: Option<u64>,
    #[serde(default)]
    source: Option<String>,
}

impl From<Proxy> for ProxyRecord {
    fn from(proxy: Proxy) -> Self {
        Self {
            full: Some(proxy.full()),
            host: proxy.host,
            port: proxy.port.to_string(),
            protocol: proxy.protocol.map(|p| p.to_string()),
            anonymity: proxy.anonymity,
            country: proxy.country,
            country_code: proxy.country_code,
            region: proxy.region,
            city: proxy.city,
            isp: proxy.isp,
            latency_ms: proxy.latency_ms,
            source: proxy.source,
        }
    }
}

impl TryFrom<ProxyRecord> for Proxy {
    type Error = CandidateError;

    fn try_from(record: ProxyRecord) -> Result<Self, Self::Error> {
        let raw = RawCandidate {
            host: record.host,
            port: record.port,
            protocol: record.protocol,
            country: record.country,
            anonymity: record.anonymity,
            source: record.source,
        };
        let mut proxy = Proxy::try_from(raw)?;
        proxy.country_code = record.country_code;
        proxy.region = record.region;
        proxy.city = record.city;
        proxy.isp = record.isp;
        proxy.latency_ms = record.latency_ms;
        Ok(proxy)
    }
}

fn port_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(text) => text,
        Port::Number(number) => number.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_creation() {
        let proxy = Proxy::new("127.0.0.1", 8080);
        assert_eq!(proxy.host, "127.0.0.1");
        assert_eq!(proxy.port, 8080);
        assert!(proxy.protocol.is_none());
        assert_eq!(proxy.full(), "127.0.0.1:8080");
    }

    #[test]
    fn test_proxy_url() {
        let proxy = Proxy::new("127.0.0.1", 8080);
        assert_eq!(proxy.url(), "http://127.0.0.1:8080");

        let proxy = Proxy::new("192.168.1.1", 1080).with_protocol(ProxyType::Socks5);
        assert_eq!(proxy.url(), "socks5h://192.168.1.1:1080");

        let proxy = Proxy::new("192.168.1.1", 443).with_protocol(ProxyType::Https);
        assert_eq!(proxy.url(), "http://192.168.1.1:443");
        assert_eq!(proxy.url_as(ProxyType::Socks4), "socks4://192.168.1.1:443");
    }

    #[test]
    fn test_proxy_type_from_str() {
        assert_eq!("HTTP".parse::<ProxyType>().unwrap(), ProxyType::Http);
        assert_eq!("socks5".parse::<ProxyType>().unwrap(), ProxyType::Socks5);
        assert!("unknown".parse::<ProxyType>().is_err());
    }

    #[test]
    fn test_candidate_conversion() {
        let raw = RawCandidate::new(" 10.0.0.1 ", "3128")
            .with_protocol("SOCKS4")
            .with_source("file");
        let proxy = Proxy::try_from(raw).unwrap();
        assert_eq!(proxy.full(), "10.0.0.1:3128");
        assert_eq!(proxy.protocol, Some(ProxyType::Socks4));
        assert_eq!(proxy.source.as_deref(), Some("file"));

        let raw = RawCandidate::new("10.0.0.1", "80").with_protocol("unknown");
        assert!(Proxy::try_from(raw).unwrap().protocol.is_none());
    }

    #[test]
    fn test_candidate_rejects_malformed() {
        assert_eq!(
            Proxy::try_from(RawCandidate::new("", "80")),
            Err(CandidateError::MissingHost)
        );
        assert!(matches!(
            Proxy::try_from(RawCandidate::new("10.0.0.1", "0")),
            Err(CandidateError::InvalidPort(_))
        ));
        assert!(matches!(
            Proxy::try_from(RawCandidate::new("10.0.0.1", "70000")),
            Err(CandidateError::InvalidPort(_))
        ));
        assert!(matches!(
            Proxy::try_from(RawCandidate::new("bad host", "80")),
            Err(CandidateError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_record_serialization() {
        let mut proxy = Proxy::new("1.2.3.4", 80).with_protocol(ProxyType::Http);
        proxy.country_code = Some("US".to_string());
        proxy.latency_ms = Some(120);

        let value = serde_json::to_value(&proxy).unwrap();
        assert_eq!(value["full"], "1.2.3.4:80");
        assert_eq!(value["port"], "80");
        assert_eq!(value["countryCode"], "US");
        assert_eq!(value["latencyMs"], 120);
        assert_eq!(value["protocol"], "http");
    }

    #[test]
    fn test_record_accepts_numeric_port() {
        let json = r#"{"host":"5.6.7.8","port":3128,"full":"5.6.7.8:3128","protocol":null,"country":"DE"}"#;
        let proxy: Proxy = serde_json::from_str(json).unwrap();
        assert_eq!(proxy.port, 3128);
        assert_eq!(proxy.country.as_deref(), Some("DE"));
        assert!(proxy.protocol.is_none());
    }
}
