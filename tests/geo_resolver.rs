use proxy_pipeline::proxy::geo::{CachedResolver, GeoResolver, IpApiResolver};
use proxy_pipeline::storage::{FileStore, PersistenceStore, Session};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn resolver(server: &MockServer) -> IpApiResolver {
    IpApiResolver::with_base_url(&server.uri(), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_ip_api_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json/8.8.8.8"))
        .and(query_param(
            "fields",
            "status,message,country,countryCode,regionName,city,isp,query",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "country": "United States",
            "countryCode": "US",
            "regionName": "California",
            "city": "Mountain View",
            "isp": "Google LLC",
            "query": "8.8.8.8"
        })))
        .mount(&server)
        .await;

    let location = resolver(&server).await.resolve("8.8.8.8").await.unwrap();
    assert_eq!(location.country.as_deref(), Some("United States"));
    assert_eq!(location.country_code.as_deref(), Some("US"));
    assert_eq!(location.region.as_deref(), Some("California"));
    assert_eq!(location.city.as_deref(), Some("Mountain View"));
    assert_eq!(location.isp.as_deref(), Some("Google LLC"));
}

#[tokio::test]
async fn test_ip_api_failure_status_is_unknown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json/10.0.0.1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "fail",
            "message": "private range",
            "query": "10.0.0.1"
        })))
        .mount(&server)
        .await;

    assert!(resolver(&server).await.resolve("10.0.0.1").await.is_none());
}

#[tokio::test]
async fn test_ip_api_server_error_is_unknown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert!(resolver(&server).await.resolve("1.1.1.1").await.is_none());
}

#[tokio::test]
async fn test_ip_api_timeout_is_unknown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "success", "country": "Nowhere"}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let resolver = IpApiResolver::with_base_url(&server.uri(), Duration::from_millis(200)).unwrap();
    assert!(resolver.resolve("1.1.1.1").await.is_none());
}

#[tokio::test]
async fn test_cached_lookups_survive_restart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json/1.1.1.1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "country": "Australia",
            "countryCode": "AU",
            "query": "1.1.1.1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();

    let store: Arc<dyn PersistenceStore> =
        Arc::new(FileStore::open(dir.path(), Session::new()).await.unwrap());
    let first = CachedResolver::new(resolver(&server).await, store.clone());
    assert_eq!(
        first.resolve("1.1.1.1").await.unwrap().country_code.as_deref(),
        Some("AU")
    );
    // Memory hit, no second request.
    assert!(first.resolve("1.1.1.1").await.is_some());

    let store: Arc<dyn PersistenceStore> =
        Arc::new(FileStore::open(dir.path(), Session::new()).await.unwrap());
    let second = CachedResolver::new(resolver(&server).await, store);
    assert_eq!(
        second.resolve("1.1.1.1").await.unwrap().country.as_deref(),
        Some("Australia")
    );
}
