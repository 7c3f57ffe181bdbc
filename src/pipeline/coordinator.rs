//! Ingest coordinator
//!
//! Owns the dedup set and the pending queue. Every batch goes through:
//!
//! ```text
//!   dedup ─▶ pre-screen (chunks of N, concurrent) ─▶ geo enrichment
//!         ─▶ validation pool + pending queue + live results file ─▶ sync
//! ```
//!
//! The dedup set is cleared in full once it reaches capacity. Candidates
//! seen before the reset can be admitted and validated again; memory stays
//! bounded without any eviction bookkeeping.

use crate::config::PipelineConfig;
use crate::pipeline::events::{EventReceiver, EventSender, PipelineEvent};
use crate::pipeline::summary::render_summary;
use crate::proxy::checker::PreScreen;
use crate::proxy::geo::{self, GeoResolver};
use crate::proxy::models::{Proxy, RawCandidate};
use crate::proxy::parser::CandidateParser;
use crate::storage::{PersistenceStore, StorageResult, RESULTS_NAME};
use crate::validation::models::ValidationStats;
use crate::validation::scheduler::ValidationScheduler;
use chrono::Utc;
use dashmap::DashSet;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot key of the coordinator state
pub const STATE_KEY: &str = "PROXY-STORE-STATE";

/// Name of the session summary export
const SUMMARY_NAME: &str = "summary";

#[derive(Serialize)]
struct StoreState<'a> {
    queue: &'a [Proxy],
    tracked: BTreeMap<&'a str, u8>,
}

/// Snapshot as read back; tracked values are ignored
#[derive(Deserialize)]
struct RestoredState {
    #[serde(default)]
    queue: Vec<serde_json::Value>,
    #[serde(default)]
    tracked: HashMap<String, IgnoredAny>,
}

/// Deduplicates, screens, enriches and persists incoming candidates
pub struct IngestCoordinator {
    session_id: String,
    run_tests: bool,
    max_tracked: usize,
    chunk_size: usize,
    geo_timeout: Duration,
    tracked: DashSet<String>,
    queue: Mutex<Vec<Proxy>>,
    /// Serializes drain-and-snapshot cycles
    sync_lock: tokio::sync::Mutex<()>,
    store: Arc<dyn PersistenceStore>,
    geo: Arc<dyn GeoResolver>,
    screen: Option<Arc<dyn PreScreen>>,
    scheduler: Option<Arc<ValidationScheduler>>,
    events: EventSender,
}

impl IngestCoordinator {
    pub fn new(
        config: &PipelineConfig,
        session_id: impl Into<String>,
        store: Arc<dyn PersistenceStore>,
        geo: Arc<dyn GeoResolver>,
        events: EventSender,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            run_tests: config.run_tests,
            max_tracked: config.max_tracked.max(1),
            chunk_size: config.screen.chunk_size.max(1),
            geo_timeout: config.geo.timeout,
            tracked: DashSet::new(),
            queue: Mutex::new(Vec::new()),
            sync_lock: tokio::sync::Mutex::new(()),
            store,
            geo,
            screen: None,
            scheduler: None,
            events,
        }
    }

    /// Pre-screen used when live testing is enabled
    pub fn with_screen(mut self, screen: Arc<dyn PreScreen>) -> Self {
        self.screen = Some(screen);
        self
    }

    /// Pool receiving every enriched candidate
    pub fn with_scheduler(mut self, scheduler: Arc<ValidationScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_tracked(&self, full: &str) -> bool {
        self.tracked.contains(full)
    }

    /// Enriched candidates not yet written to the dataset
    pub fn pending_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Statistics of the validation pool, if one is attached
    pub fn validation_stats(&self) -> Option<ValidationStats> {
        self.scheduler.as_ref().map(|scheduler| scheduler.get_stats())
    }

    /// Restore the pending queue and dedup set from the last snapshot.
    ///
    /// A missing or unreadable snapshot leaves the state empty.
    pub async fn initialize(&self) {
        let value = match self.store.get_snapshot(STATE_KEY).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::debug!("No previous pipeline state found");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read pipeline state, starting empty");
                return;
            }
        };

        let restored: RestoredState = match serde_json::from_value(value) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "Pipeline state is malformed, starting empty");
                return;
            }
        };

        for key in restored.tracked.into_keys() {
            self.tracked.insert(key);
        }

        let queue: Vec<Proxy> = restored
            .queue
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry) {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable queued proxy");
                    None
                }
            })
            .collect();
        self.queue.lock().extend(queue);

        tracing::info!(
            tracked = self.tracked.len(),
            pending = self.pending_len(),
            "Restored tracked proxies from cache"
        );
    }

    /// Ingest loosely-typed records, dropping malformed ones
    pub async fn add_raw(&self, batch: Vec<RawCandidate>) {
        let proxies = batch
            .into_iter()
            .filter_map(|raw| {
                let host = raw.host.clone();
                match Proxy::try_from(raw) {
                    Ok(proxy) => Some(proxy),
                    Err(e) => {
                        tracing::debug!(host = %host, error = %e, "Dropping malformed candidate");
                        None
                    }
                }
            })
            .collect();
        self.add(proxies).await;
    }

    /// Ingest a batch of candidates
    pub async fn add(&self, batch: Vec<Proxy>) {
        if self.tracked.len() >= self.max_tracked {
            tracing::debug!(
                limit = self.max_tracked,
                "Tracked proxies limit reached, clearing deduplication set"
            );
            self.tracked.clear();
        }

        // DashSet::insert is an atomic check-and-add per key.
        let unique: Vec<Proxy> = batch
            .into_iter()
            .filter(|proxy| self.tracked.insert(proxy.full()))
            .collect();

        if unique.is_empty() {
            return;
        }

        let survivors = match (&self.screen, self.run_tests) {
            (Some(screen), true) => self.pre_screen(screen.as_ref(), unique).await,
            _ => unique,
        };

        if !survivors.is_empty() {
            let enriched = self.enrich(survivors).await;
            self.publish(enriched).await;
        }

        self.sync().await;
    }

    async fn pre_screen(&self, screen: &dyn PreScreen, proxies: Vec<Proxy>) -> Vec<Proxy> {
        let total = proxies.len();
        let chunks = proxies.chunks(self.chunk_size).map(<[Proxy]>::to_vec);
        let screened = join_all(chunks.map(|chunk| screen.screen(chunk))).await;
        let survivors: Vec<Proxy> = screened.into_iter().flatten().collect();

        tracing::debug!(total, passed = survivors.len(), "Pre-screen finished");
        survivors
    }

    async fn enrich(&self, proxies: Vec<Proxy>) -> Vec<Proxy> {
        let lookups = proxies.into_iter().map(|proxy| async move {
            let fallback = proxy.clone();
            match tokio::time::timeout(self.geo_timeout, geo::enrich(self.geo.as_ref(), proxy)).await
            {
                Ok(enriched) => enriched,
                Err(_) => {
                    tracing::debug!(proxy = %fallback, "Geo lookup timed out");
                    fallback
                }
            }
        });
        join_all(lookups).await
    }

    async fn publish(&self, enriched: Vec<Proxy>) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.enqueue(enriched.clone());
        }

        for proxy in &enriched {
            let _ = self.events.send(PipelineEvent::Discovered(proxy.clone()));
        }

        let queue_len = {
            let mut queue = self.queue.lock();
            queue.extend(enriched.iter().cloned());
            queue.len()
        };
        let _ = self.events.send(PipelineEvent::Update { queue_len });

        let mut text = CandidateParser::render(&enriched);
        text.push('\n');
        if let Err(e) = self.store.append_text_file(RESULTS_NAME, &text).await {
            tracing::warn!(error = %e, "Failed to append live results");
        }
    }

    /// Drain the pending queue into the dataset and write the snapshot.
    ///
    /// A failed append puts the batch back in front of the queue so the
    /// next call retries it.
    pub async fn sync(&self) {
        let _guard = self.sync_lock.lock().await;

        let batch = std::mem::take(&mut *self.queue.lock());
        if !batch.is_empty() {
            match self.store.append_dataset(&batch).await {
                Ok(()) => tracing::debug!(count = batch.len(), "Saved batch of proxies"),
                Err(e) => {
                    tracing::warn!(count = batch.len(), error = %e, "Failed to save batch, will retry");
                    let mut queue = self.queue.lock();
                    let newer = std::mem::replace(&mut *queue, batch);
                    queue.extend(newer);
                }
            }
        }

        let snapshot = self.snapshot();
        match snapshot {
            Ok(value) => {
                if let Err(e) = self.store.set_snapshot(STATE_KEY, value).await {
                    tracing::warn!(error = %e, "Failed to write pipeline state");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize pipeline state"),
        }
    }

    fn snapshot(&self) -> serde_json::Result<serde_json::Value> {
        let queue = self.queue.lock().clone();
        let keys: Vec<String> = self.tracked.iter().map(|key| key.key().clone()).collect();
        let state = StoreState {
            queue: &queue,
            tracked: keys.iter().map(|key| (key.as_str(), 1)).collect(),
        };
        serde_json::to_value(state)
    }

    /// Final sync, stop validation and export the session.
    ///
    /// Returns the number of records in the final export.
    pub async fn shutdown(&self) -> StorageResult<usize> {
        tracing::info!(session = %self.session_id, "Shutting down ingest coordinator");
        self.sync().await;

        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }

        let items = self.store.get_dataset().await?;
        self.store
            .write_text_file(RESULTS_NAME, &CandidateParser::render(&items), "txt")
            .await?;
        let summary = render_summary(&self.session_id, &items, Utc::now());
        self.store.write_text_file(SUMMARY_NAME, &summary, "md").await?;

        tracing::info!(
            count = items.len(),
            session = %self.session_id,
            "Final export complete"
        );
        Ok(items.len())
    }
}
