// Proxy identity pool: tiered refills from an external supplier, permanent
// quarantine after repeated failure, and priority selection that favors
// identities with a proven track record.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CrawlError, Result};
use crate::quota::QuotaGuard;

/// Minimum spacing between supplier API calls, the supplier is itself
/// rate limited to 60 requests/minute.
const SUPPLIER_CALL_INTERVAL: Duration = Duration::from_millis(1100);

/// Supplier-side cap on one listing request.
const SUPPLIER_MAX_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyTier {
    High,
    Medium,
    Low,
}

impl ProxyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyTier::High => "high",
            ProxyTier::Medium => "medium",
            ProxyTier::Low => "low",
        }
    }
}

/// One entry of the supplier's proxy listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl ProxyEndpoint {
    /// Render as a proxy URL. SOCKS endpoints are rejected, the rendering
    /// stack only supports HTTP(S) egress.
    pub fn as_url(&self) -> Option<String> {
        let protocol = self.protocol.to_lowercase();
        if protocol != "http" && protocol != "https" {
            return None;
        }
        if self.ip.is_empty() || self.port == 0 {
            return None;
        }
        Some(format!("{}://{}:{}", protocol, self.ip, self.port))
    }
}

/// One network egress identity and its track record for this run.
#[derive(Debug, Clone)]
pub struct ProxyIdentity {
    pub address: String,
    pub tier: ProxyTier,
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// The external proxy supplier. Failures from this interface must never
/// crash the crawl; the pool treats an error like an empty listing.
#[async_trait]
pub trait ProxySupplier: Send + Sync {
    async fn fetch_tier(&self, tier: ProxyTier, limit: usize) -> Result<Vec<ProxyEndpoint>>;
}

#[derive(Debug, Deserialize)]
struct ProxyListResponse {
    success: bool,
    #[serde(default)]
    proxies: Vec<ProxyEndpoint>,
}

/// Supplier client for the HTTP proxy API
/// (`GET {base}/api/v1/proxies/{tier}?limit=N` with an `X-API-Key` header).
pub struct ApiProxySupplier {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    last_call: Mutex<Option<std::time::Instant>>,
}

impl ApiProxySupplier {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to create supplier HTTP client");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            last_call: Mutex::new(None),
        }
    }

    async fn throttle(&self) {
        let wait = {
            let mut last = self.last_call.lock().unwrap();
            let wait = match *last {
                Some(at) => SUPPLIER_CALL_INTERVAL.saturating_sub(at.elapsed()),
                None => Duration::ZERO,
            };
            *last = Some(std::time::Instant::now() + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl ProxySupplier for ApiProxySupplier {
    async fn fetch_tier(&self, tier: ProxyTier, limit: usize) -> Result<Vec<ProxyEndpoint>> {
        self.throttle().await;

        let endpoint = format!("{}/api/v1/proxies/{}", self.base_url, tier.as_str());
        let response = self
            .client
            .get(&endpoint)
            .query(&[("limit", limit.min(SUPPLIER_MAX_LIMIT))])
            .header("X-API-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?;

        let listing: ProxyListResponse = response.json().await?;
        if !listing.success {
            return Err(CrawlError::Supplier(format!(
                "supplier returned an unsuccessful {} tier listing",
                tier.as_str()
            )));
        }
        tracing::debug!(tier = tier.as_str(), count = listing.proxies.len(), "supplier listing fetched");
        Ok(listing.proxies)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Consecutive failures before an identity is quarantined for good.
    pub ban_threshold: u32,
    /// Active-pool floor; dropping below it triggers an immediate refill.
    pub min_pool_size: usize,
    /// Wall-clock interval for the periodic full refill, countering
    /// supplier-side expiry of identities.
    pub refresh_interval_secs: u64,
    /// Tiers requested from the supplier, in priority order.
    pub tiers: Vec<ProxyTier>,
    pub fetch_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ban_threshold: 3,
            min_pool_size: 5,
            refresh_interval_secs: 1800,
            tiers: vec![ProxyTier::High, ProxyTier::Medium, ProxyTier::Low],
            fetch_limit: SUPPLIER_MAX_LIMIT,
        }
    }
}

pub struct ProxyPool {
    supplier: Box<dyn ProxySupplier>,
    config: PoolConfig,
    pool: HashMap<String, ProxyIdentity>,
    known_good: HashSet<String>,
    quarantined: HashSet<String>,
    last_refresh: Option<DateTime<Utc>>,
}

impl ProxyPool {
    pub fn new(supplier: Box<dyn ProxySupplier>, config: PoolConfig) -> Self {
        Self {
            supplier,
            config,
            pool: HashMap::new(),
            known_good: HashSet::new(),
            quarantined: HashSet::new(),
            last_refresh: None,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn is_quarantined(&self, address: &str) -> bool {
        self.quarantined.contains(address)
    }

    /// Pull fresh identities from the supplier into the pool. Quarantined
    /// identities never come back; existing entries keep their track record.
    /// Supplier failures leave the pool unchanged.
    pub async fn refill(&mut self, now: DateTime<Utc>) -> usize {
        self.last_refresh = Some(now);
        let mut added = 0;

        for tier in self.config.tiers.clone() {
            let listing = match self.supplier.fetch_tier(tier, self.config.fetch_limit).await {
                Ok(listing) => listing,
                Err(e) => {
                    tracing::warn!(tier = tier.as_str(), error = %e, "proxy supplier fetch failed");
                    continue;
                }
            };
            for endpoint in listing {
                let Some(address) = endpoint.as_url() else {
                    continue;
                };
                if self.quarantined.contains(&address) || self.pool.contains_key(&address) {
                    continue;
                }
                self.pool.insert(
                    address.clone(),
                    ProxyIdentity {
                        address,
                        tier,
                        consecutive_failures: 0,
                        last_used_at: None,
                    },
                );
                added += 1;
            }
        }

        if added == 0 {
            tracing::warn!(
                active = self.pool.len(),
                "supplier produced no new identities, continuing with the existing pool"
            );
        } else {
            tracing::info!(
                added,
                active = self.pool.len(),
                quarantined = self.quarantined.len(),
                "proxy pool refilled"
            );
        }
        added
    }

    /// Pick an identity for the next fetch.
    ///
    /// Priority: known-good identities inside their per-IP rate window,
    /// then the general pool under the same filter. When usable candidates
    /// get scarce (under a quarter of the pool) a refill is attempted; as a
    /// last resort the rate-window filter is relaxed rather than stalling
    /// the crawl. Quarantined identities are never returned.
    pub async fn select(
        &mut self,
        excluding: &HashSet<String>,
        quota: &QuotaGuard,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let refresh_due = match self.last_refresh {
            Some(at) => {
                (now - at).num_seconds() >= self.config.refresh_interval_secs as i64
            }
            None => true,
        };
        if refresh_due {
            self.refill(now).await;
        }

        let usable = |pool: &HashMap<String, ProxyIdentity>, address: &str| {
            !excluding.contains(address)
                && pool.contains_key(address)
                && proxy_ip(address)
                    .map(|ip| quota.ip_window_ok(&ip, now))
                    .unwrap_or(true)
        };

        let good: Vec<String> = self
            .known_good
            .iter()
            .filter(|a| usable(&self.pool, a.as_str()))
            .cloned()
            .collect();
        if let Some(address) = pick(&good) {
            return Some(self.touch(address, now));
        }

        let mut candidates: Vec<String> = self
            .pool
            .keys()
            .filter(|a| usable(&self.pool, a.as_str()))
            .cloned()
            .collect();

        if candidates.len() < (self.pool.len() / 4).max(self.config.min_pool_size) {
            tracing::info!(
                candidates = candidates.len(),
                pool = self.pool.len(),
                "usable identities scarce, refilling pool"
            );
            self.refill(now).await;
            candidates = self
                .pool
                .keys()
                .filter(|a| usable(&self.pool, a.as_str()))
                .cloned()
                .collect();
        }

        if let Some(address) = pick(&candidates) {
            return Some(self.touch(address, now));
        }

        // Last resort: ignore the rate window, then the exclusion set,
        // before giving up entirely.
        tracing::warn!("all identities excluded or rate limited, relaxing the window filter");
        let relaxed: Vec<String> = self
            .pool
            .keys()
            .filter(|a| !excluding.contains(*a))
            .cloned()
            .collect();
        if let Some(address) = pick(&relaxed) {
            return Some(self.touch(address, now));
        }
        let any: Vec<String> = self.pool.keys().cloned().collect();
        pick(&any).map(|a| self.touch(a, now))
    }

    /// A page came back through this identity: promote it and wipe its
    /// failure streak.
    pub fn mark_success(&mut self, address: &str) {
        if let Some(identity) = self.pool.get_mut(address) {
            identity.consecutive_failures = 0;
        }
        if self.known_good.insert(address.to_string()) {
            tracing::debug!(
                proxy = address,
                known_good = self.known_good.len(),
                "identity promoted to known-good"
            );
        }
    }

    /// A fetch through this identity failed. At the ban threshold the
    /// identity is quarantined for good, and the pool is refilled right away
    /// if that pushed it under the floor.
    pub async fn mark_failure(&mut self, address: &str, now: DateTime<Utc>) {
        let Some(identity) = self.pool.get_mut(address) else {
            return;
        };
        identity.consecutive_failures += 1;
        if identity.consecutive_failures < self.config.ban_threshold {
            return;
        }

        tracing::info!(
            proxy = address,
            failures = identity.consecutive_failures,
            "identity quarantined"
        );
        self.pool.remove(address);
        self.known_good.remove(address);
        self.quarantined.insert(address.to_string());

        if self.pool.len() < self.config.min_pool_size {
            tracing::info!(
                active = self.pool.len(),
                floor = self.config.min_pool_size,
                "pool under floor after quarantine, refilling"
            );
            self.refill(now).await;
        }
    }
}

fn pick(candidates: &[String]) -> Option<String> {
    if candidates.is_empty() {
        None
    } else {
        Some(candidates[fastrand::usize(..candidates.len())].clone())
    }
}

impl ProxyPool {
    fn touch(&mut self, address: String, now: DateTime<Utc>) -> String {
        if let Some(identity) = self.pool.get_mut(&address) {
            identity.last_used_at = Some(now);
        }
        address
    }
}

/// Extract the host part of a `protocol://ip:port` proxy address.
pub fn proxy_ip(address: &str) -> Option<String> {
    let parsed = url::Url::parse(address).ok()?;
    parsed.host_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSupplier {
        endpoints: Vec<ProxyEndpoint>,
        calls: Arc<AtomicUsize>,
    }

    impl StaticSupplier {
        fn new(count: usize) -> Self {
            Self::with_counter(count, Arc::new(AtomicUsize::new(0)))
        }

        fn with_counter(count: usize, calls: Arc<AtomicUsize>) -> Self {
            let endpoints = (0..count)
                .map(|i| ProxyEndpoint {
                    ip: format!("10.0.0.{}", i + 1),
                    port: 8080,
                    protocol: "http".to_string(),
                })
                .collect();
            Self { endpoints, calls }
        }
    }

    #[async_trait]
    impl ProxySupplier for StaticSupplier {
        async fn fetch_tier(&self, tier: ProxyTier, _limit: usize) -> Result<Vec<ProxyEndpoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if tier == ProxyTier::High {
                Ok(self.endpoints.clone())
            } else {
                Ok(Vec::new())
            }
        }
    }

    struct FailingSupplier;

    #[async_trait]
    impl ProxySupplier for FailingSupplier {
        async fn fetch_tier(&self, _tier: ProxyTier, _limit: usize) -> Result<Vec<ProxyEndpoint>> {
            Err(CrawlError::Supplier("unreachable".to_string()))
        }
    }

    fn loose_quota() -> QuotaGuard {
        QuotaGuard::new().with_per_ip_limit(10_000)
    }

    #[tokio::test]
    async fn refill_populates_the_pool_and_filters_socks() {
        let mut supplier = StaticSupplier::new(3);
        supplier.endpoints.push(ProxyEndpoint {
            ip: "10.0.9.9".to_string(),
            port: 1080,
            protocol: "socks5".to_string(),
        });
        let mut pool = ProxyPool::new(Box::new(supplier), PoolConfig::default());
        let added = pool.refill(Utc::now()).await;
        assert_eq!(added, 3);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn supplier_failure_leaves_the_pool_unchanged() {
        let mut pool = ProxyPool::new(Box::new(FailingSupplier), PoolConfig::default());
        let added = pool.refill(Utc::now()).await;
        assert_eq!(added, 0);
        assert!(pool.is_empty());

        // and selection degrades to None instead of crashing
        let quota = loose_quota();
        let picked = pool.select(&HashSet::new(), &quota, Utc::now()).await;
        assert!(picked.is_none());
    }

    #[tokio::test]
    async fn select_never_returns_a_quarantined_identity() {
        let mut pool = ProxyPool::new(Box::new(StaticSupplier::new(2)), PoolConfig::default());
        let now = Utc::now();
        pool.refill(now).await;

        let victim = "http://10.0.0.1:8080";
        for _ in 0..3 {
            pool.mark_failure(victim, now).await;
        }
        assert!(pool.is_quarantined(victim));

        let quota = loose_quota();
        for _ in 0..50 {
            let picked = pool.select(&HashSet::new(), &quota, now).await;
            assert_ne!(picked.as_deref(), Some(victim));
        }
    }

    #[tokio::test]
    async fn quarantine_below_the_floor_triggers_an_immediate_refill() {
        let calls = Arc::new(AtomicUsize::new(0));
        let supplier = StaticSupplier::with_counter(3, calls.clone());
        let config = PoolConfig {
            min_pool_size: 3,
            ..Default::default()
        };
        let mut pool = ProxyPool::new(Box::new(supplier), config);
        let now = Utc::now();
        pool.refill(now).await;

        let before = calls.load(Ordering::SeqCst);
        for _ in 0..3 {
            pool.mark_failure("http://10.0.0.2:8080", now).await;
        }
        let after = calls.load(Ordering::SeqCst);
        assert!(
            after > before,
            "refill should have been triggered by the quarantine ({before} -> {after})"
        );
        // the quarantined identity stays out even after the refill
        assert!(!pool.pool.contains_key("http://10.0.0.2:8080"));
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let mut pool = ProxyPool::new(Box::new(StaticSupplier::new(2)), PoolConfig::default());
        let now = Utc::now();
        pool.refill(now).await;

        let address = "http://10.0.0.1:8080";
        pool.mark_failure(address, now).await;
        pool.mark_failure(address, now).await;
        pool.mark_success(address);
        pool.mark_failure(address, now).await;
        pool.mark_failure(address, now).await;
        assert!(!pool.is_quarantined(address));
        pool.mark_failure(address, now).await;
        assert!(pool.is_quarantined(address));
    }

    #[tokio::test]
    async fn known_good_identities_are_preferred() {
        let mut pool = ProxyPool::new(Box::new(StaticSupplier::new(5)), PoolConfig::default());
        let now = Utc::now();
        pool.refill(now).await;

        let favorite = "http://10.0.0.3:8080";
        pool.mark_success(favorite);

        let quota = loose_quota();
        for _ in 0..10 {
            let picked = pool.select(&HashSet::new(), &quota, now).await;
            assert_eq!(picked.as_deref(), Some(favorite));
        }
    }

    #[tokio::test]
    async fn exclusion_set_is_respected_until_nothing_else_is_left() {
        let mut pool = ProxyPool::new(Box::new(StaticSupplier::new(2)), PoolConfig::default());
        let now = Utc::now();
        pool.refill(now).await;

        let quota = loose_quota();
        let mut excluding = HashSet::new();
        excluding.insert("http://10.0.0.1:8080".to_string());
        for _ in 0..10 {
            let picked = pool.select(&excluding, &quota, now).await;
            assert_eq!(picked.as_deref(), Some("http://10.0.0.2:8080"));
        }

        // excluding everything still yields an identity (last resort)
        excluding.insert("http://10.0.0.2:8080".to_string());
        let picked = pool.select(&excluding, &quota, now).await;
        assert!(picked.is_some());
    }

    #[test]
    fn proxy_ip_parses_addresses() {
        assert_eq!(proxy_ip("http://1.2.3.4:8080").as_deref(), Some("1.2.3.4"));
        assert_eq!(proxy_ip("https://5.6.7.8:443").as_deref(), Some("5.6.7.8"));
        assert_eq!(proxy_ip("not a proxy"), None);
    }

    mod supplier_api {
        use super::*;
        use wiremock::matchers::{header, method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn listing_is_fetched_with_key_and_limit() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/proxies/high"))
                .and(header("X-API-Key", "sekrit"))
                .and(query_param("limit", "500"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "success": true,
                    "proxies": [
                        {"ip": "1.2.3.4", "port": 8080, "protocol": "http"},
                        {"ip": "5.6.7.8", "port": 3128, "protocol": "https"},
                        {"ip": "9.9.9.9", "port": 1080, "protocol": "socks5"}
                    ]
                })))
                .mount(&server)
                .await;

            let supplier = ApiProxySupplier::new(server.uri(), "sekrit");
            let listing = supplier.fetch_tier(ProxyTier::High, 500).await.unwrap();
            assert_eq!(listing.len(), 3);
            // SOCKS entries are filtered at URL-rendering time, not here
            assert!(listing[2].as_url().is_none());
            assert_eq!(
                listing[0].as_url().as_deref(),
                Some("http://1.2.3.4:8080")
            );
        }

        #[tokio::test]
        async fn unsuccessful_listing_is_an_error() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/proxies/medium"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(serde_json::json!({"success": false})),
                )
                .mount(&server)
                .await;

            let supplier = ApiProxySupplier::new(server.uri(), "sekrit");
            let result = supplier.fetch_tier(ProxyTier::Medium, 10).await;
            assert!(matches!(result, Err(CrawlError::Supplier(_))));
        }

        #[tokio::test]
        async fn http_failure_is_an_error_not_a_panic() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v1/proxies/low"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;

            let supplier = ApiProxySupplier::new(server.uri(), "sekrit");
            assert!(supplier.fetch_tier(ProxyTier::Low, 10).await.is_err());
        }
    }
}
