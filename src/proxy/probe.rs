//! HTTP probing through candidate proxies
//!
//! Every network call made by the pre-screen and the validation protocol
//! goes through [`ProxyProbe`]. Errors are returned as values; nothing
//! here panics or propagates past the caller's stage.

use crate::error::ProbeError;
use crate::proxy::models::{Proxy, ProxyType};
use async_trait::async_trait;
use reqwest::{redirect, Client, Proxy as ReqwestProxy};
use std::time::{Duration, Instant};

/// Maximum redirects followed when a request allows them
const MAX_REDIRECTS: usize = 5;

/// A single probe request
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: String,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub read_body: bool,
}

impl ProbeRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            follow_redirects: true,
            read_body: false,
        }
    }

    pub fn without_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    pub fn with_body(mut self) -> Self {
        self.read_body = true;
        self
    }
}

/// Response summary returned by a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: Option<String>,
    pub elapsed: Duration,
}

impl ProbeResponse {
    pub fn latency_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

/// Network access used by the validation stages
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    /// Issue a request routed through `proxy` using the given protocol
    async fn fetch_via(
        &self,
        proxy: &Proxy,
        protocol: ProxyType,
        request: &ProbeRequest,
    ) -> Result<ProbeResponse, ProbeError>;

    /// Issue a request without any proxy
    async fn fetch_direct(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeError>;

    /// Issue a request through `proxy` using its declared protocol
    async fn fetch(
        &self,
        proxy: &Proxy,
        request: &ProbeRequest,
    ) -> Result<ProbeResponse, ProbeError> {
        self.fetch_via(proxy, proxy.protocol.unwrap_or_default(), request)
            .await
    }
}

/// [`ProxyProbe`] backed by reqwest
///
/// A fresh client is built for each proxied request because reqwest binds
/// the proxy to the client. Any status code counts as a response; only
/// transport failures are errors.
#[derive(Debug, Clone, Default)]
pub struct ReqwestProbe {
    user_agent: Option<String>,
}

impl ReqwestProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    /// Create a reqwest client, optionally routed through a proxy
    fn create_client(
        &self,
        proxy_url: Option<&str>,
        request: &ProbeRequest,
    ) -> Result<Client, ProbeError> {
        let policy = if request.follow_redirects {
            redirect::Policy::limited(MAX_REDIRECTS)
        } else {
            redirect::Policy::none()
        };

        let mut builder = Client::builder()
            .timeout(request.timeout)
            .connect_timeout(request.timeout)
            .redirect(policy);

        if let Some(url) = proxy_url {
            let proxy = ReqwestProxy::all(url)
                .map_err(|e| ProbeError::InvalidProxy(e.to_string()))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        if let Some(ref agent) = self.user_agent {
            builder = builder.user_agent(agent);
        }

        builder
            .build()
            .map_err(|e| ProbeError::InvalidProxy(e.to_string()))
    }

    async fn execute(
        &self,
        proxy_url: Option<&str>,
        request: &ProbeRequest,
    ) -> Result<ProbeResponse, ProbeError> {
        let client = self.create_client(proxy_url, request)?;
        let start = Instant::now();

        // The outer timeout also bounds body reads and stalled handshakes.
        let exchange = async {
            let response = client.get(&request.url).send().await?;
            let status = response.status().as_u16();
            let body = if request.read_body {
                Some(response.text().await?)
            } else {
                None
            };
            Ok::<_, reqwest::Error>((status, body))
        };

        match tokio::time::timeout(request.timeout, exchange).await {
            Ok(Ok((status, body))) => Ok(ProbeResponse {
                status,
                body,
                elapsed: start.elapsed(),
            }),
            Ok(Err(e)) => Err(ProbeError::from(e)),
            Err(_) => Err(ProbeError::Timeout),
        }
    }
}

#[async_trait]
impl ProxyProbe for ReqwestProbe {
    async fn fetch_via(
        &self,
        proxy: &Proxy,
        protocol: ProxyType,
        request: &ProbeRequest,
    ) -> Result<ProbeResponse, ProbeError> {
        let proxy_url = proxy.url_as(protocol);
        self.execute(Some(&proxy_url), request).await
    }

    async fn fetch_direct(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        self.execute(None, request).await
    }
}
