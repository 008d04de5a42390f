// The fetch seam: the orchestrator talks to the network through this trait
// so scheduling behavior can be exercised without sockets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;

use crate::error::{CrawlError, Result};

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
    /// Parsed Retry-After hint, seconds, when the server sent one.
    pub retry_after: Option<f64>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url` through the given egress identity. `None` means the
    /// host's own address; the orchestrator only passes that when the pool
    /// has nothing at all to offer.
    async fn fetch(&self, url: &str, proxy: Option<&str>) -> Result<FetchedPage>;
}

/// reqwest-backed fetcher keeping one client per egress identity, so each
/// proxy gets its own connection pool and cookie jar.
pub struct ProxiedFetcher {
    user_agent: String,
    timeout: Duration,
    clients: Mutex<HashMap<String, Client>>,
}

impl ProxiedFetcher {
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.into(),
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client> {
        let key = proxy.unwrap_or("").to_string();
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .connect_timeout(self.timeout / 2)
            .redirect(reqwest::redirect::Policy::limited(5))
            .cookie_store(true);
        if let Some(address) = proxy {
            let proxy = reqwest::Proxy::all(address)
                .map_err(|_| CrawlError::InvalidProxy(address.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ProxiedFetcher {
    fn default() -> Self {
        Self::new(
            "Mozilla/5.0 (compatible; maphound/0.2)",
            Duration::from_secs(10),
        )
    }
}

#[async_trait]
impl Fetcher for ProxiedFetcher {
    async fn fetch(&self, url: &str, proxy: Option<&str>) -> Result<FetchedPage> {
        let client = self.client_for(proxy)?;
        tracing::debug!(url, proxy = proxy.unwrap_or("direct"), "fetching");

        let response = client.get(url).send().await?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let body = response.text().await?;

        Ok(FetchedPage {
            status,
            body,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><body>hello</body></html>"),
            )
            .mount(&server)
            .await;

        let fetcher = ProxiedFetcher::default();
        let page = fetcher
            .fetch(&format!("{}/page", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(page.status, 200);
        assert!(page.body.contains("hello"));
        assert!(page.retry_after.is_none());
    }

    #[tokio::test]
    async fn retry_after_hint_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "42")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let fetcher = ProxiedFetcher::default();
        let page = fetcher
            .fetch(&format!("{}/limited", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(page.status, 429);
        assert_eq!(page.retry_after, Some(42.0));
    }

    #[tokio::test]
    async fn connection_refused_is_an_error() {
        let fetcher = ProxiedFetcher::new("test", Duration::from_millis(500));
        let result = fetcher.fetch("http://127.0.0.1:1/none", None).await;
        assert!(result.is_err());
    }

    #[test]
    fn invalid_proxy_address_is_rejected() {
        let fetcher = ProxiedFetcher::default();
        let result = fetcher.client_for(Some("::not a proxy::"));
        assert!(matches!(result, Err(CrawlError::InvalidProxy(_))));
    }
}
