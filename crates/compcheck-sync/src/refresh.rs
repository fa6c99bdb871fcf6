//! Batch refresh of stored comps for every inventory vehicle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use compcheck_core::{CompRecord, InventoryVehicle, DEFAULT_RADIUS};
use compcheck_storage::{random_jitter, BackoffPolicy, CompStore, InventorySource};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::Aggregator;
use crate::config::DEFAULT_REFRESH_ZIPCODE;

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub workers: usize,
    /// Linear schedule applied when a vehicle's fetch hits a bot challenge.
    pub backoff: BackoffPolicy,
    pub vehicle_delay: Duration,
    pub vehicle_jitter: Duration,
    pub fallback_zipcode: String,
    pub radius: u32,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            backoff: BackoffPolicy::linear(3, Duration::from_secs(5)),
            vehicle_delay: Duration::from_secs(2),
            vehicle_jitter: Duration::from_secs(3),
            fallback_zipcode: DEFAULT_REFRESH_ZIPCODE.to_string(),
            radius: DEFAULT_RADIUS,
        }
    }
}

/// Per-vehicle progress. `Blocked` loops back to `Fetching` until the
/// attempt ceiling, then becomes `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleState {
    Pending,
    Fetching { attempt: usize },
    Blocked { attempt: usize },
    Success { comps: usize },
    Failed { attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VehicleOutcome {
    Updated { records: usize },
    /// Fetch succeeded with no comps; stored rows are left alone.
    Unchanged,
    Failed { attempts: usize },
    StoreFailed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub vehicles_total: usize,
    pub vehicles_seen: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub store_failures: usize,
    pub records_written: usize,
    pub stopped_early: bool,
}

impl RefreshSummary {
    fn record(&mut self, outcome: &VehicleOutcome) {
        self.vehicles_seen += 1;
        match outcome {
            VehicleOutcome::Updated { records } => {
                self.updated += 1;
                self.records_written += records;
            }
            VehicleOutcome::Unchanged => self.unchanged += 1,
            VehicleOutcome::Failed { .. } => self.failed += 1,
            VehicleOutcome::StoreFailed { .. } => self.store_failures += 1,
        }
    }

    fn merge(&mut self, other: RefreshSummary) {
        self.vehicles_seen += other.vehicles_seen;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.store_failures += other.store_failures;
        self.records_written += other.records_written;
    }
}

/// Cheap to clone; every collaborator sits behind an `Arc`.
#[derive(Clone)]
pub struct RefreshJob {
    aggregator: Arc<Aggregator>,
    inventory: Arc<dyn InventorySource>,
    store: Arc<dyn CompStore>,
    options: Arc<RefreshOptions>,
}

type Queue = Arc<Mutex<VecDeque<InventoryVehicle>>>;

impl RefreshJob {
    pub fn new(
        aggregator: Arc<Aggregator>,
        inventory: Arc<dyn InventorySource>,
        store: Arc<dyn CompStore>,
        options: RefreshOptions,
    ) -> Self {
        Self {
            aggregator,
            inventory,
            store,
            options: Arc::new(options),
        }
    }

    /// Refreshes every inventory vehicle. Setting `stop` to `true` halts
    /// dequeuing; vehicles already in flight run to completion.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> Result<RefreshSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let vehicles = self
            .inventory
            .list_vehicles()
            .await
            .context("loading inventory vehicles")?;
        let vehicles_total = vehicles.len();
        info!(%run_id, vehicles = vehicles_total, workers = self.options.workers, "refresh started");

        let queue: Queue = Arc::new(Mutex::new(vehicles.into()));
        let mut handles = Vec::new();
        for worker_id in 0..self.options.workers.max(1) {
            let job = self.clone();
            let queue = queue.clone();
            let stop = stop.clone();
            let span = info_span!("refresh_worker", %run_id, worker_id);
            handles.push(tokio::spawn(
                async move { job.worker(queue, stop).await }.instrument(span),
            ));
        }

        let mut summary = RefreshSummary {
            run_id,
            started_at,
            vehicles_total,
            ..RefreshSummary::default()
        };
        for handle in handles {
            match handle.await {
                Ok(tally) => summary.merge(tally),
                Err(err) => error!(error = %err, "refresh worker panicked"),
            }
        }
        summary.finished_at = Utc::now();
        summary.stopped_early = summary.vehicles_seen < vehicles_total;

        info!(
            %run_id,
            total = summary.vehicles_total,
            seen = summary.vehicles_seen,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            store_failures = summary.store_failures,
            records = summary.records_written,
            stopped_early = summary.stopped_early,
            "refresh finished"
        );
        Ok(summary)
    }

    async fn worker(&self, queue: Queue, mut stop: watch::Receiver<bool>) -> RefreshSummary {
        let mut tally = RefreshSummary::default();
        loop {
            if *stop.borrow() {
                info!("stop requested; worker exiting");
                break;
            }
            let next = queue.lock().await.pop_front();
            let Some(vehicle) = next else {
                break;
            };

            let span = info_span!("vehicle", inventory_id = vehicle.id);
            let outcome = self.refresh_vehicle(&vehicle).instrument(span).await;
            tally.record(&outcome);

            if queue.lock().await.is_empty() {
                break;
            }
            let pause = self.options.vehicle_delay + random_jitter(self.options.vehicle_jitter);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        // Sender gone; nobody can ask us to stop any more.
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        }
        tally
    }

    pub async fn refresh_vehicle(&self, vehicle: &InventoryVehicle) -> VehicleOutcome {
        let spec = vehicle.spec(&self.options.fallback_zipcode, self.options.radius);
        let backoff = self.options.backoff;
        let max_attempts = backoff.max_attempts();

        let mut state = VehicleState::Pending;
        let mut report = None;
        loop {
            state = match state {
                VehicleState::Pending => VehicleState::Fetching { attempt: 1 },
                VehicleState::Blocked { attempt } if attempt >= max_attempts => {
                    VehicleState::Failed { attempts: attempt }
                }
                VehicleState::Blocked { attempt } => {
                    let delay = backoff.jittered_delay(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "blocked; backing off");
                    tokio::time::sleep(delay).await;
                    VehicleState::Fetching { attempt: attempt + 1 }
                }
                VehicleState::Fetching { attempt } => {
                    let aggregation = self.aggregator.aggregate(&spec).await;
                    if aggregation.blocked() {
                        VehicleState::Blocked { attempt }
                    } else {
                        let comps = aggregation.report.comps.len();
                        report = Some(aggregation.report);
                        VehicleState::Success { comps }
                    }
                }
                VehicleState::Failed { attempts } => {
                    warn!(attempts, vehicle = %spec.label(), "giving up; stored comps left as-is");
                    return VehicleOutcome::Failed { attempts };
                }
                VehicleState::Success { .. } => break,
            };
        }

        let Some(report) = report else {
            return VehicleOutcome::Unchanged;
        };
        if report.is_empty() {
            info!(vehicle = %spec.label(), "no comps found; nothing to update");
            return VehicleOutcome::Unchanged;
        }

        let created_at = Utc::now();
        let records: Vec<CompRecord> = report
            .comps
            .iter()
            .filter_map(|listing| CompRecord::from_listing(vehicle.id, listing, created_at))
            .collect();
        match self.store.replace_comps(vehicle.id, &records).await {
            Ok(written) => {
                info!(
                    vehicle = %spec.label(),
                    records = written,
                    market_avg = report.market_avg,
                    "comps replaced"
                );
                VehicleOutcome::Updated { records: written }
            }
            Err(err) => {
                error!(vehicle = %spec.label(), error = %err, "storing comps failed");
                VehicleOutcome::StoreFailed {
                    error: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateOptions;
    use crate::testing::{
        raw, record, test_context, vehicle, CannedAdapter, FailingStore, StopAfterFirst,
    };
    use compcheck_adapters::SourceAdapter;
    use compcheck_storage::{MemoryCompStore, MemoryInventory};

    fn options() -> RefreshOptions {
        RefreshOptions {
            workers: 1,
            backoff: BackoffPolicy::linear(3, Duration::ZERO),
            vehicle_delay: Duration::ZERO,
            vehicle_jitter: Duration::ZERO,
            ..RefreshOptions::default()
        }
    }

    fn job(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        vehicles: Vec<InventoryVehicle>,
        store: Arc<dyn CompStore>,
        options: RefreshOptions,
    ) -> RefreshJob {
        let aggregator = Aggregator::new(adapters, test_context(), AggregateOptions::default());
        RefreshJob::new(
            Arc::new(aggregator),
            Arc::new(MemoryInventory::new(vehicles)),
            store,
            options,
        )
    }

    /// Receiver whose sender is already gone: never signals stop.
    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn success_replaces_stored_comps() {
        let store = Arc::new(MemoryCompStore::new());
        store.seed(1, vec![record(1, 99_999)]).await;
        let adapter = CannedAdapter::listings(
            "cars-com",
            vec![
                raw("cars-com", "2019 Ford F-150 XL", "$20,000"),
                raw("cars-com", "2019 Ford F-150 XLT", "$22,000"),
            ],
        );

        let summary = job(vec![adapter], vec![vehicle(1)], store.clone(), options())
            .run(running())
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.records_written, 2);
        let prices: Vec<i64> = store.comps_for(1).await.unwrap().iter().map(|r| r.price).collect();
        assert_eq!(prices, vec![20_000, 22_000]);
    }

    #[tokio::test]
    async fn persistent_block_fails_without_touching_store() {
        let store = Arc::new(MemoryCompStore::new());
        store.seed(1, vec![record(1, 18_000)]).await;
        let (adapter, calls) = CannedAdapter::counting_challenge("cars-com");

        let summary = job(vec![adapter], vec![vehicle(1)], store.clone(), options())
            .run(running())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(store.comps_for(1).await.unwrap()[0].price, 18_000);
    }

    #[tokio::test]
    async fn block_then_success_retries_and_replaces() {
        let store = Arc::new(MemoryCompStore::new());
        store.seed(1, vec![record(1, 18_000)]).await;
        let (adapter, calls) = CannedAdapter::challenge_then_listings(
            "cars-com",
            vec![
                raw("cars-com", "2019 Ford F-150 XL", "$20,000"),
                raw("cars-com", "2019 Ford F-150 XLT", "$22,000"),
            ],
        );

        let summary = job(vec![adapter], vec![vehicle(1)], store.clone(), options())
            .run(running())
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let prices: Vec<i64> = store.comps_for(1).await.unwrap().iter().map(|r| r.price).collect();
        assert_eq!(prices, vec![20_000, 22_000]);
    }

    #[tokio::test]
    async fn empty_result_leaves_prior_comps() {
        let store = Arc::new(MemoryCompStore::new());
        store.seed(1, vec![record(1, 18_000)]).await;

        let summary = job(
            vec![CannedAdapter::fetch_error("cars-com")],
            vec![vehicle(1)],
            store.clone(),
            options(),
        )
        .run(running())
        .await
        .unwrap();

        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.records_written, 0);
        assert_eq!(store.comps_for(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_on_one_vehicle_does_not_stop_the_batch() {
        let inner = Arc::new(MemoryCompStore::new());
        let store = Arc::new(FailingStore::new(1, inner.clone()));
        let adapter = CannedAdapter::listings(
            "cars-com",
            vec![raw("cars-com", "2019 Ford F-150 XL", "$20,000")],
        );

        let summary = job(
            vec![adapter],
            vec![vehicle(1), vehicle(2), vehicle(3)],
            store,
            RefreshOptions {
                workers: 2,
                ..options()
            },
        )
        .run(running())
        .await
        .unwrap();

        assert_eq!(summary.vehicles_seen, 3);
        assert_eq!(summary.store_failures, 1);
        assert_eq!(summary.updated, 2);
        assert!(inner.comps_for(1).await.unwrap().is_empty());
        assert_eq!(inner.comps_for(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_signal_halts_dequeuing() {
        let (tx, rx) = watch::channel(false);
        let adapter = StopAfterFirst::new(tx, raw("cars-com", "2019 Ford F-150 XL", "$20,000"));
        let store = Arc::new(MemoryCompStore::new());

        let summary = job(
            vec![adapter],
            vec![vehicle(1), vehicle(2), vehicle(3)],
            store.clone(),
            options(),
        )
        .run(rx)
        .await
        .unwrap();

        assert_eq!(summary.vehicles_seen, 1);
        assert!(summary.stopped_early);
        assert_eq!(store.comps_for(1).await.unwrap().len(), 1);
        assert!(store.comps_for(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_before_start_processes_nothing() {
        let (_tx, rx) = watch::channel(true);
        let summary = job(
            vec![CannedAdapter::fetch_error("cars-com")],
            vec![vehicle(1)],
            Arc::new(MemoryCompStore::new()),
            options(),
        )
        .run(rx)
        .await
        .unwrap();
        assert_eq!(summary.vehicles_seen, 0);
        assert!(summary.stopped_early);
    }
}
