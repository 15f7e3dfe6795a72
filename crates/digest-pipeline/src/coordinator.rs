//! End-to-end batch run: fetch, cluster, generate, persist.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use digest_cluster::{cluster, ClusteringConfig};
use digest_store::DigestStore;
use digest_types::BatchReport;
use tracing::Instrument;

use crate::orchestrator::GenerationOrchestrator;
use crate::BatchError;

/// Source of "now" for windowing and version minting.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock_or_recover(&self.now) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock_or_recover(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock_or_recover(&self.now)
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Trailing window of items considered by a run.
    pub window: Duration,
    pub clustering: ClusteringConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::hours(24),
            clustering: ClusteringConfig::default(),
        }
    }
}

/// Runs one digest batch per `run_batch` call.
pub struct BatchDigestCoordinator {
    store: Arc<dyn DigestStore>,
    orchestrator: GenerationOrchestrator,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    last_version: AtomicI64,
}

impl BatchDigestCoordinator {
    pub fn new(
        store: Arc<dyn DigestStore>,
        orchestrator: GenerationOrchestrator,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            clock: Arc::new(SystemClock),
            config,
            last_version: AtomicI64::new(i64::MIN),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Millisecond version, strictly greater than any earlier version from this coordinator.
    fn mint_version(&self, now: DateTime<Utc>) -> i64 {
        let now_ms = now.timestamp_millis();
        let next = |last: i64| now_ms.max(last.saturating_add(1));
        match self
            .last_version
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
        {
            Ok(previous) | Err(previous) => next(previous),
        }
    }

    /// Runs one batch and reports what it produced.
    ///
    /// Fetch and clustering failures abort the run. Group, section and entry
    /// failures are counted in the report instead.
    pub async fn run_batch(&self) -> Result<BatchReport, BatchError> {
        let now = self.clock.now();
        let version = self.mint_version(now);
        let run_id = format!("batch-{version}");
        let span = tracing::info_span!("digest_batch", %run_id, version);
        self.run_versioned_batch(now, version).instrument(span).await
    }

    async fn run_versioned_batch(
        &self,
        now: DateTime<Utc>,
        version: i64,
    ) -> Result<BatchReport, BatchError> {
        let window_start = now - self.config.window;
        let items = self
            .store
            .fetch_items(window_start, now)
            .await
            .map_err(BatchError::Fetch)?;
        if items.is_empty() {
            tracing::info!(%window_start, window_end = %now, "no items in window");
            return Ok(BatchReport::empty(version));
        }

        let items_fetched = items.len();
        tracing::info!(items_fetched, "clustering batch items");
        let clustering = self.config.clustering.clone();
        let grouped = tokio::task::spawn_blocking(move || cluster(items, &clustering)).await??;

        let generation = self
            .orchestrator
            .generate_for_batch(&grouped, version)
            .await;

        let mut entries_created = 0;
        let mut entries_persist_failed = 0;
        for entry in generation.entries {
            let title = entry.section.title.clone();
            let group_label = entry.group_label.clone();
            match self.store.insert_digest_entry(entry).await {
                Ok(entry_id) => {
                    entries_created += 1;
                    tracing::debug!(%entry_id, %group_label, "persisted digest entry");
                }
                Err(error) => {
                    entries_persist_failed += 1;
                    tracing::warn!(
                        %group_label,
                        %title,
                        error = %error,
                        "failed to persist digest entry"
                    );
                }
            }
        }

        let report = BatchReport {
            version,
            items_fetched,
            items_dropped: items_fetched - grouped.len(),
            items_unassigned: generation.items_unassigned,
            groups_total: generation.groups_total,
            groups_failed: generation.groups_failed,
            entries_created,
            entries_dropped: generation.entries_dropped,
            entries_persist_failed,
        };
        tracing::info!(?report, "batch complete");
        Ok(report)
    }
}
