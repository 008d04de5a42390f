// The crawl orchestrator: a single driver loop that pulls probes from an
// explicit work queue, gates every dispatch through the quota guard, rotates
// egress identities, classifies outcomes, refines dense cells, and
// checkpoints completions. All shared state is owned here and touched only
// between awaits, so no component needs its own synchronization.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::task::JoinHandle;

use maphound_core::{CrawlSummary, VenueRecord};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::Result;
use crate::extract::ListingExtractor;
use crate::fetch::{FetchedPage, Fetcher};
use crate::grid::{BoundingBox, GridPlanner, Probe};
use crate::outcome::{HostileKind, Outcome, classify};
use crate::proxy::{ProxyPool, proxy_ip};
use crate::quota::{Gate, QuotaGuard};

/// Callback for human-readable progress lines.
pub type ProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Callback invoked once per newly seen venue record.
pub type ResultCallback = Arc<dyn Fn(VenueRecord) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub platform: String,
    pub bounding_box: BoundingBox,
    /// Lattice dimension; the main sweep covers grid_size^2 probes.
    pub grid_size: usize,
    pub zoom: u8,
    /// Search URL template with `{lat}`, `{lng}` and `{zoom}` placeholders.
    pub search_url: String,
    /// Overlapping fetch ceiling. Deliberately low: the workload is
    /// anti-bot-bound, and one source fanning out raises ban risk.
    pub concurrency: usize,
    pub checkpoint_path: PathBuf,
    /// Load the existing checkpoint instead of starting fresh.
    pub resume: bool,
    /// Identity-rotation ceiling per probe before it is abandoned.
    pub max_retries: u32,
    /// Extra probes of a zero-result cell before trusting the emptiness.
    pub max_empty_retries: u32,
    /// Run-wide consecutive failures that trip the circuit breaker.
    pub consecutive_failure_limit: u32,
    pub failure_cooldown: Duration,
    /// Upper bound on the random extra delay added to each dispatch.
    pub max_jitter: Duration,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            platform: "google_maps".to_string(),
            bounding_box: BoundingBox::default(),
            grid_size: 15,
            zoom: 15,
            search_url: "https://www.google.com/maps/search/restaurants/@{lat},{lng},{zoom}z?hl=en"
                .to_string(),
            concurrency: 2,
            checkpoint_path: PathBuf::from("maphound-checkpoint.json"),
            resume: false,
            max_retries: 100,
            max_empty_retries: 2,
            consecutive_failure_limit: 3,
            failure_cooldown: Duration::from_secs(60),
            max_jitter: Duration::from_secs(2),
        }
    }
}

/// Per-probe attempt bookkeeping carried across retries.
#[derive(Debug, Clone, Default)]
struct Attempt {
    retries: u32,
    empty_retries: u32,
    failed_proxies: HashSet<String>,
    verification: bool,
}

impl Attempt {
    fn verification() -> Self {
        Self {
            verification: true,
            ..Default::default()
        }
    }
}

/// What comes back from one in-flight fetch.
struct Flight {
    probe: Probe,
    attempt: Attempt,
    proxy: Option<String>,
    response: Result<FetchedPage>,
}

/// Parent/child pending counters. A probe is complete only when its own
/// fetch is resolved and every recursively spawned child has reached a
/// terminal state; completion then cascades up the parent links.
#[derive(Debug, Default)]
pub(crate) struct CompletionTracker {
    pending: HashMap<String, usize>,
    resolved: HashSet<String>,
    parent_of: HashMap<String, String>,
}

impl CompletionTracker {
    pub(crate) fn register_children(&mut self, parent: &Probe, children: &[Probe]) {
        *self.pending.entry(parent.key()).or_insert(0) += children.len();
        for child in children {
            self.parent_of.insert(child.key(), parent.key());
        }
    }

    /// Mark a probe's own work finished (completed or abandoned). Returns
    /// every key that became fully complete as a result, in bottom-up order.
    pub(crate) fn resolve(&mut self, key: &str) -> Vec<String> {
        self.resolved.insert(key.to_string());
        let mut done = Vec::new();
        self.cascade(key, &mut done);
        done
    }

    fn cascade(&mut self, key: &str, done: &mut Vec<String>) {
        if !self.resolved.contains(key) {
            return;
        }
        if self.pending.get(key).copied().unwrap_or(0) > 0 {
            return;
        }
        done.push(key.to_string());
        self.resolved.remove(key);
        self.pending.remove(key);

        if let Some(parent) = self.parent_of.remove(key) {
            if let Some(outstanding) = self.pending.get_mut(&parent) {
                *outstanding = outstanding.saturating_sub(1);
            }
            self.cascade(&parent, done);
        }
    }
}

pub struct Crawler {
    options: CrawlOptions,
    planner: GridPlanner,
    quota: QuotaGuard,
    pool: ProxyPool,
    store: CheckpointStore,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn ListingExtractor>,
    progress_callback: Option<ProgressCallback>,
    result_callback: Option<ResultCallback>,
}

impl Crawler {
    pub fn new(
        options: CrawlOptions,
        pool: ProxyPool,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn ListingExtractor>,
    ) -> Self {
        let store = CheckpointStore::new(options.checkpoint_path.clone());
        Self {
            planner: GridPlanner::default(),
            quota: QuotaGuard::new(),
            pool,
            store,
            fetcher,
            extractor,
            progress_callback: None,
            result_callback: None,
            options,
        }
    }

    pub fn with_planner(mut self, planner: GridPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_quota(mut self, quota: QuotaGuard) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn with_result_callback(mut self, callback: ResultCallback) -> Self {
        self.result_callback = Some(callback);
        self
    }

    fn search_url(&self, probe: &Probe) -> String {
        self.options
            .search_url
            .replace("{lat}", &format!("{:.6}", probe.latitude))
            .replace("{lng}", &format!("{:.6}", probe.longitude))
            .replace("{zoom}", &probe.zoom.to_string())
    }

    /// Drive the whole sweep: main pass, recursive refinement, and the final
    /// verification pass. Returns the run summary; individual probe failures
    /// never surface as errors.
    pub async fn run(&mut self) -> Result<CrawlSummary> {
        let started = std::time::Instant::now();
        let platform = self.options.platform.clone();
        let concurrency = self.options.concurrency.clamp(1, 3);

        let mut checkpoint = if self.options.resume {
            self.store.load()
        } else {
            Checkpoint::new()
        };

        let base_grid = self.planner.generate_grid(
            &self.options.bounding_box,
            self.options.grid_size,
            self.options.zoom,
        );
        let mut summary = CrawlSummary::new(platform.clone());
        summary.probes_planned = base_grid.len();
        summary.started_at = Some(Utc::now());

        self.pool.refill(Utc::now()).await;

        let mut queue: VecDeque<(Probe, Attempt)> = VecDeque::new();
        for probe in &base_grid {
            if checkpoint.completed_probes.contains(&probe.key()) {
                summary.probes_skipped += 1;
                continue;
            }
            queue.push_back((probe.clone(), Attempt::default()));
        }
        if summary.probes_skipped > 0 {
            tracing::info!(
                skipped = summary.probes_skipped,
                "previously completed probes skipped"
            );
        }

        let mut tracker = CompletionTracker::default();
        let mut in_flight: FuturesUnordered<JoinHandle<Flight>> = FuturesUnordered::new();
        let mut consecutive_failures = 0u32;
        let mut cooldown_until: Option<tokio::time::Instant> = None;
        let mut verifying = false;
        let mut aborting = false;

        loop {
            // Fill free fetch slots. Every wait the quota computes is slept
            // inside the spawned future, so other probes keep moving.
            while !aborting && in_flight.len() < concurrency {
                if let Some(until) = cooldown_until {
                    if tokio::time::Instant::now() < until {
                        break;
                    }
                    cooldown_until = None;
                }
                let Some((probe, attempt)) = queue.pop_front() else {
                    break;
                };

                let now = Utc::now();
                let proxy = self
                    .pool
                    .select(&attempt.failed_proxies, &self.quota, now)
                    .await;
                if proxy.is_none() {
                    tracing::warn!(probe = %probe.key(), "no egress identity available, fetching directly");
                }
                let ip = proxy.as_deref().and_then(proxy_ip);

                match self.quota.gate(&platform, ip.as_deref(), now) {
                    Gate::AbortPlatform { reason } => {
                        tracing::error!(platform = %platform, reason = %reason, "platform crawl aborted");
                        summary.aborted = Some(reason);
                        aborting = true;
                        queue.clear();
                    }
                    Gate::Proceed { wait } => {
                        self.quota.record_dispatch(&platform, ip.as_deref(), now);
                        let url = self.search_url(&probe);
                        let fetcher = self.fetcher.clone();
                        let delay = wait + jitter_within(self.options.max_jitter);
                        let handle = tokio::spawn(async move {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            let response = fetcher.fetch(&url, proxy.as_deref()).await;
                            Flight {
                                probe,
                                attempt,
                                proxy,
                                response,
                            }
                        });
                        in_flight.push(handle);
                    }
                }
            }

            if in_flight.is_empty() {
                if aborting {
                    break;
                }
                if queue.is_empty() {
                    if verifying {
                        break;
                    }
                    // Exactly one re-scan of the original lattice, with
                    // subdivision off and checkpoint skipping bypassed, to
                    // catch cells whose first pass was silently suppressed.
                    verifying = true;
                    summary.verification_pass_run = true;
                    tracing::info!(
                        probes = base_grid.len(),
                        venues = summary.unique_venues,
                        "main sweep drained, starting verification pass"
                    );
                    for probe in &base_grid {
                        queue.push_back((probe.clone(), Attempt::verification()));
                    }
                    continue;
                }
                // Work remains but nothing is in flight: the breaker is open.
                if let Some(until) = cooldown_until.take() {
                    tokio::time::sleep_until(until).await;
                }
                continue;
            }

            let Some(joined) = in_flight.next().await else {
                continue;
            };
            let Flight {
                probe,
                mut attempt,
                proxy,
                response,
            } = joined?;
            let key = probe.key();

            let outcome = match response {
                Ok(page) => {
                    self.quota
                        .note_response(&platform, page.status, page.retry_after, Utc::now());
                    classify(&page, self.extractor.as_ref(), &probe)
                }
                Err(e) => Outcome::Transport(e.to_string()),
            };

            match outcome {
                Outcome::Success { records, raw_cards } => {
                    consecutive_failures = 0;
                    if let Some(address) = &proxy {
                        self.pool.mark_success(address);
                    }

                    let mut fresh = 0usize;
                    for record in records {
                        if !checkpoint.seen_result_ids.insert(record.external_id.clone()) {
                            summary.duplicates_elided += 1;
                            continue;
                        }
                        summary.unique_venues += 1;
                        fresh += 1;
                        if let Some(callback) = &self.result_callback {
                            callback(record);
                        }
                    }
                    tracing::info!(
                        probe = %key,
                        raw_cards,
                        fresh,
                        total = summary.unique_venues,
                        "probe returned results"
                    );

                    if self
                        .planner
                        .should_subdivide(raw_cards, probe.zoom, attempt.verification)
                    {
                        let children = self.planner.subdivide(&probe);
                        tracing::info!(
                            probe = %key,
                            raw_cards,
                            threshold = self.planner.card_threshold,
                            zoom = probe.zoom,
                            children = children.len(),
                            "dense cell, refining"
                        );
                        summary.subdivisions_spawned += children.len();
                        tracker.register_children(&probe, &children);
                        for child in children {
                            summary.max_subdivision_depth =
                                summary.max_subdivision_depth.max(child.depth);
                            queue.push_back((child, Attempt::default()));
                        }
                    }
                    if !attempt.verification {
                        let completed = tracker.resolve(&key);
                        self.persist(&mut checkpoint, &completed, None, &mut summary)?;
                    }
                }
                Outcome::Empty => {
                    consecutive_failures = 0;
                    if let Some(address) = &proxy {
                        self.pool.mark_success(address);
                    }
                    if attempt.empty_retries < self.options.max_empty_retries {
                        attempt.empty_retries += 1;
                        if let Some(address) = proxy {
                            attempt.failed_proxies.insert(address);
                        }
                        tracing::warn!(
                            probe = %key,
                            attempt = attempt.empty_retries,
                            max = self.options.max_empty_retries,
                            "zero results, re-probing through a different identity"
                        );
                        queue.push_back((probe, attempt));
                    } else {
                        tracing::info!(probe = %key, "cell accepted as genuinely empty");
                        summary.empty_cells += 1;
                        if !attempt.verification {
                            let completed = tracker.resolve(&key);
                            self.persist(&mut checkpoint, &completed, None, &mut summary)?;
                        }
                    }
                }
                Outcome::Hostile(kind) => {
                    consecutive_failures += 1;
                    match kind {
                        HostileKind::Captcha => summary.captcha_hits += 1,
                        HostileKind::Status(_) => summary.ban_hits += 1,
                    }
                    if let Some(address) = &proxy {
                        self.pool.mark_failure(address, Utc::now()).await;
                        attempt.failed_proxies.insert(address.clone());
                    }
                    attempt.retries += 1;
                    if attempt.retries >= self.options.max_retries {
                        self.abandon(&key, &attempt, &mut tracker, &mut checkpoint, &mut summary)?;
                    } else {
                        match kind {
                            HostileKind::Captcha => {
                                tracing::warn!(
                                    probe = %key,
                                    retry = attempt.retries,
                                    "CAPTCHA page served, deferring probe to the back of the queue"
                                );
                                queue.push_back((probe, attempt));
                            }
                            HostileKind::Status(status) => {
                                tracing::warn!(
                                    probe = %key,
                                    status,
                                    retry = attempt.retries,
                                    "hostile response, rotating identity"
                                );
                                queue.push_front((probe, attempt));
                            }
                        }
                    }
                }
                Outcome::Transport(reason) => {
                    consecutive_failures += 1;
                    summary.transport_failures += 1;
                    self.quota.note_transport_failure(&platform, Utc::now());
                    if let Some(address) = &proxy {
                        self.pool.mark_failure(address, Utc::now()).await;
                        attempt.failed_proxies.insert(address.clone());
                    }
                    attempt.retries += 1;
                    if attempt.retries >= self.options.max_retries {
                        self.abandon(&key, &attempt, &mut tracker, &mut checkpoint, &mut summary)?;
                    } else {
                        tracing::warn!(
                            probe = %key,
                            retry = attempt.retries,
                            max = self.options.max_retries,
                            reason = %reason,
                            "transport failure, rotating identity"
                        );
                        queue.push_front((probe, attempt));
                    }
                }
            }

            if consecutive_failures >= self.options.consecutive_failure_limit {
                tracing::warn!(
                    failures = consecutive_failures,
                    cooldown_secs = self.options.failure_cooldown.as_secs(),
                    "consecutive failures tripped the circuit breaker, cooling down"
                );
                cooldown_until =
                    Some(tokio::time::Instant::now() + self.options.failure_cooldown);
                consecutive_failures = 0;
            }

            if let Some(callback) = &self.progress_callback {
                callback(format!(
                    "{} probes completed, {} venues found",
                    summary.probes_completed, summary.unique_venues
                ));
            }
        }

        self.store.save(&checkpoint)?;
        summary.finished_at = Some(Utc::now());
        summary.duration_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            completed = summary.probes_completed,
            venues = summary.unique_venues,
            abandoned = summary.probes_abandoned,
            aborted = summary.aborted.is_some(),
            "crawl finished"
        );
        Ok(summary)
    }

    /// Past the retry ceiling: terminal, lossy but bounded. The probe's
    /// parents are unblocked as if it completed, but the probe itself never
    /// enters the completed set, so a later run retries it.
    fn abandon(
        &self,
        key: &str,
        attempt: &Attempt,
        tracker: &mut CompletionTracker,
        checkpoint: &mut Checkpoint,
        summary: &mut CrawlSummary,
    ) -> Result<()> {
        tracing::error!(probe = key, "retry ceiling reached, abandoning probe");
        summary.probes_abandoned += 1;
        if attempt.verification {
            return Ok(());
        }
        let completed = tracker.resolve(key);
        self.persist(checkpoint, &completed, Some(key), summary)
    }

    fn persist(
        &self,
        checkpoint: &mut Checkpoint,
        completed: &[String],
        abandoned: Option<&str>,
        summary: &mut CrawlSummary,
    ) -> Result<()> {
        for key in completed {
            if Some(key.as_str()) == abandoned {
                continue;
            }
            if checkpoint.completed_probes.insert(key.clone()) {
                summary.probes_completed += 1;
                tracing::debug!(probe = %key, "checkpointed");
            }
        }
        self.store.save(checkpoint)
    }
}

fn jitter_within(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(fastrand::u64(0..=max_ms))
    }
}
