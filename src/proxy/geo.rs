//! Geolocation lookup for candidate hosts
//!
//! Resolvers never fail the candidate: every error path logs and returns
//! `None`, and the caller keeps whatever location the source supplied.

use crate::proxy::models::Proxy;
use crate::storage::PersistenceStore;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use maxminddb::{geoip2, Reader};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default ip-api.com endpoint
pub const DEFAULT_IP_API_URL: &str = "http://ip-api.com";

/// Hard timeout for a single remote lookup
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix of persisted lookup cache entries
const CACHE_KEY_PREFIX: &str = "GEO-";

/// Fields requested from ip-api.com
const IP_API_FIELDS: &str = "status,message,country,countryCode,regionName,city,isp,query";

/// Geographic location information for a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    /// Country name in English
    pub country: Option<String>,
    /// ISO 3166-1 alpha-2 country code (e.g., "US", "CN")
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    /// Address the lookup resolved
    pub query: Option<String>,
}

impl GeoLocation {
    /// Create a new GeoLocation with country information
    pub fn with_country(country: Option<String>, country_code: Option<String>) -> Self {
        Self {
            country,
            country_code,
            ..Default::default()
        }
    }

    /// Check if the location has any meaningful data
    pub fn is_empty(&self) -> bool {
        self.country.is_none()
            && self.country_code.is_none()
            && self.region.is_none()
            && self.city.is_none()
    }

    /// Copy the location onto a proxy record
    pub fn apply_to(&self, proxy: &mut Proxy) {
        proxy.country = self.country.clone();
        proxy.country_code = self.country_code.clone();
        proxy.region = self.region.clone();
        proxy.city = self.city.clone();
        proxy.isp = self.isp.clone();
    }
}

impl std::fmt::Display for GeoLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = [self.city.clone(), self.region.clone(), self.country.clone()]
            .into_iter()
            .flatten()
            .collect();

        if parts.is_empty() {
            write!(f, "Unknown Location")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Host to location resolution
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Resolve a host. `None` means unknown, for whatever reason.
    async fn resolve(&self, host: &str) -> Option<GeoLocation>;
}

/// Resolve and apply a location, leaving source-provided fields untouched
/// when the lookup yields nothing
pub async fn enrich(resolver: &dyn GeoResolver, mut proxy: Proxy) -> Proxy {
    if let Some(location) = resolver.resolve(&proxy.host).await {
        location.apply_to(&mut proxy);
    }
    proxy
}

/// Response body of ip-api.com
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    message: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    region_name: Option<String>,
    city: Option<String>,
    isp: Option<String>,
    query: Option<String>,
}

/// Resolver backed by the free ip-api.com JSON endpoint
#[derive(Debug, Clone)]
pub struct IpApiResolver {
    client: Client,
    base_url: String,
}

impl IpApiResolver {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_IP_API_URL, DEFAULT_LOOKUP_TIMEOUT)
    }

    /// Create a resolver against a custom endpoint (used by tests and mirrors)
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn lookup(&self, host: &str) -> std::result::Result<IpApiResponse, reqwest::Error> {
        let url = format!("{}/json/{}", self.base_url, host);
        self.client
            .get(url)
            .query(&[("fields", IP_API_FIELDS)])
            .send()
            .await?
            .error_for_status()?
            .json::<IpApiResponse>()
            .await
    }
}

#[async_trait]
impl GeoResolver for IpApiResolver {
    async fn resolve(&self, host: &str) -> Option<GeoLocation> {
        tracing::debug!(host, "Fetching location");

        match self.lookup(host).await {
            Ok(data) if data.status == "success" => Some(GeoLocation {
                country: data.country,
                country_code: data.country_code,
                region: data.region_name,
                city: data.city,
                isp: data.isp,
                query: data.query,
            }),
            Ok(data) => {
                tracing::debug!(host, message = ?data.message, "Location lookup unsuccessful");
                None
            }
            Err(e) if e.is_timeout() => {
                tracing::debug!(host, "Location lookup timed out");
                None
            }
            Err(e) => {
                tracing::warn!(host, error = %e, "Failed to fetch location");
                None
            }
        }
    }
}

/// Resolver backed by a local MaxMind City database
pub struct MmdbResolver {
    reader: Arc<Reader<Vec<u8>>>,
}

impl MmdbResolver {
    /// Create a new resolver from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the geolocation for an IpAddr
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<GeoLocation> {
        let lookup_result = self.reader.lookup(ip)?;

        let city: Option<geoip2::City> = lookup_result.decode()?;

        let Some(city) = city else {
            return Ok(GeoLocation::default());
        };

        // City databases carry no ISP data.
        Ok(GeoLocation {
            country: city.country.names.english.map(String::from),
            country_code: city.country.iso_code.map(String::from),
            region: None,
            city: city.city.names.english.map(String::from),
            isp: None,
            query: Some(ip.to_string()),
        })
    }
}

impl Clone for MmdbResolver {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

#[async_trait]
impl GeoResolver for MmdbResolver {
    async fn resolve(&self, host: &str) -> Option<GeoLocation> {
        let ip: IpAddr = host.parse().ok()?;
        match self.lookup_ip(ip) {
            Ok(location) if !location.is_empty() => Some(location),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(host, error = %e, "MMDB lookup failed");
                None
            }
        }
    }
}

/// Cache-first wrapper: memory, then the persistent store, then the inner resolver
pub struct CachedResolver<R> {
    inner: R,
    store: Arc<dyn PersistenceStore>,
    memory: DashMap<String, GeoLocation>,
}

impl<R: GeoResolver> CachedResolver<R> {
    pub fn new(inner: R, store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            inner,
            store,
            memory: DashMap::new(),
        }
    }

    fn cache_key(host: &str) -> String {
        format!("{}{}", CACHE_KEY_PREFIX, host)
    }

    async fn load_persisted(&self, key: &str) -> Option<GeoLocation> {
        match self.store.get_snapshot(key).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read location cache");
                None
            }
        }
    }
}

#[async_trait]
impl<R: GeoResolver> GeoResolver for CachedResolver<R> {
    async fn resolve(&self, host: &str) -> Option<GeoLocation> {
        if let Some(hit) = self.memory.get(host) {
            return Some(hit.clone());
        }

        let key = Self::cache_key(host);
        if let Some(location) = self.load_persisted(&key).await {
            self.memory.insert(host.to_string(), location.clone());
            return Some(location);
        }

        let location = self.inner.resolve(host).await?;
        self.memory.insert(host.to_string(), location.clone());
        match serde_json::to_value(&location) {
            Ok(value) => {
                if let Err(e) = self.store.set_snapshot(&key, value).await {
                    tracing::warn!(key, error = %e, "Failed to persist location cache");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "Failed to encode location"),
        }
        Some(location)
    }
}

/// Resolver that knows nothing; used when enrichment is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

#[async_trait]
impl GeoResolver for NoopResolver {
    async fn resolve(&self, _host: &str) -> Option<GeoLocation> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        answer: Option<GeoLocation>,
    }

    #[async_trait]
    impl GeoResolver for CountingResolver {
        async fn resolve(&self, _host: &str) -> Option<GeoLocation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn us() -> GeoLocation {
        GeoLocation::with_country(Some("United States".to_string()), Some("US".to_string()))
    }

    #[test]
    fn test_geo_location_default() {
        let loc = GeoLocation::default();
        assert!(loc.is_empty());
        assert_eq!(format!("{}", loc), "Unknown Location");
    }

    #[test]
    fn test_geo_location_display() {
        let loc = GeoLocation {
            country: Some("United States".to_string()),
            country_code: Some("US".to_string()),
            region: Some("New York".to_string()),
            city: Some("Brooklyn".to_string()),
            isp: None,
            query: None,
        };
        assert_eq!(format!("{}", loc), "Brooklyn, New York, United States");
    }

    #[test]
    fn test_apply_to_proxy() {
        let mut proxy = Proxy::new("1.1.1.1", 80);
        us().apply_to(&mut proxy);
        assert!(proxy.has_location());
        assert_eq!(proxy.country_code.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn test_enrich_keeps_source_country_on_miss() {
        let mut proxy = Proxy::new("1.1.1.1", 80);
        proxy.country = Some("Germany".to_string());
        let proxy = enrich(&NoopResolver, proxy).await;
        assert_eq!(proxy.country.as_deref(), Some("Germany"));
        assert!(proxy.country_code.is_none());
    }

    #[tokio::test]
    async fn test_cached_resolver_hits_inner_once() {
        let store = Arc::new(MemoryStore::default());
        let inner = CountingResolver {
            calls: AtomicUsize::new(0),
            answer: Some(us()),
        };
        let resolver = CachedResolver::new(inner, store.clone());

        assert_eq!(resolver.resolve("8.8.8.8").await, Some(us()));
        assert_eq!(resolver.resolve("8.8.8.8").await, Some(us()));
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 1);
        assert!(store.get_snapshot("GEO-8.8.8.8").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cached_resolver_reads_persisted_entry() {
        let store = Arc::new(MemoryStore::default());
        store
            .set_snapshot("GEO-9.9.9.9", serde_json::to_value(us()).unwrap())
            .await
            .unwrap();
        let inner = CountingResolver {
            calls: AtomicUsize::new(0),
            answer: None,
        };
        let resolver = CachedResolver::new(inner, store);

        assert_eq!(resolver.resolve("9.9.9.9").await, Some(us()));
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_resolver_does_not_cache_failures() {
        let store = Arc::new(MemoryStore::default());
        let inner = CountingResolver {
            calls: AtomicUsize::new(0),
            answer: None,
        };
        let resolver = CachedResolver::new(inner, store);

        assert!(resolver.resolve("7.7.7.7").await.is_none());
        assert!(resolver.resolve("7.7.7.7").await.is_none());
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 2);
    }
}
