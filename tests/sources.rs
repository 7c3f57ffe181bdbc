use proxy_pipeline::proxy::ProxyType;
use proxy_pipeline::sources::{fetch_all, CandidateSource, UrlListSource};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_plain_text_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/http.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "# fresh list\n192.168.1.1:8080\nsocks4://10.0.0.1:1080\n\n10.0.0.2:3128\n",
        ))
        .mount(&server)
        .await;

    let source = UrlListSource::new(format!("{}/http.txt", server.uri()))
        .unwrap()
        .with_name("mock-list")
        .with_protocol(ProxyType::Http);
    let candidates = source.fetch().await.unwrap();

    assert_eq!(candidates.len(), 3);
    assert_eq!(candidates[0].host, "192.168.1.1");
    assert_eq!(candidates[0].port, "8080");
    assert_eq!(candidates[0].protocol.as_deref(), Some("http"));
    assert_eq!(candidates[1].protocol.as_deref(), Some("socks4"));
    assert!(candidates.iter().all(|c| c.source.as_deref() == Some("mock-list")));
}

#[tokio::test]
async fn test_embedded_list_falls_back_to_scan() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><body><pre>Fresh: 10.0.0.1:3128, 10.0.0.2:8080 and 999.1.1.1:80</pre></body></html>",
        ))
        .mount(&server)
        .await;

    let candidates = UrlListSource::new(server.uri()).unwrap().fetch().await.unwrap();
    let keys: Vec<String> = candidates
        .iter()
        .map(|c| format!("{}:{}", c.host, c.port))
        .collect();
    assert_eq!(keys, vec!["10.0.0.1:3128", "10.0.0.2:8080"]);
    assert!(candidates.iter().all(|c| c.protocol.is_none()));
}

#[tokio::test]
async fn test_http_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let sources: Vec<Box<dyn CandidateSource>> = vec![
        Box::new(UrlListSource::new(format!("{}/missing.txt", server.uri())).unwrap()),
    ];
    let results = fetch_all(&sources).await;

    assert_eq!(results.len(), 1);
    assert!(!results[0].is_success());
    assert!(results[0].candidates.is_empty());
}
