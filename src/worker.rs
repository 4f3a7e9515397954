//! Ingestion worker: the scheduler and orchestrator.
//!
//! One cycle runs five strictly ordered phases: plan, fetch, upsert,
//! refresh baseline, emit notifications. A phase that fails aborts the
//! cycle but never the daemon; the next cycle starts on schedule.
//! Cancellation is honoured between phases and between batches, and every
//! in-flight batch is bounded by an outer timeout so a stuck provider
//! cannot block shutdown.

use crate::baseline::BaselineAggregator;
use crate::models::{month_of, Config};
use crate::notify::NotificationEmitter;
use crate::providers::http::{max_total_backoff, MAX_RETRIES};
use crate::providers::{DepartureWindow, PriceProvider, RouteQuery};
use crate::store::PriceStore;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Months, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Counters for one Plan..Emit pass, logged at cycle end.
#[derive(Debug, Default, Clone)]
pub struct CycleSummary {
    pub planned_queries: usize,
    pub batches: usize,
    pub observations: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub transient_errors: usize,
    pub permanent_errors: usize,
    pub baseline_rows: Option<usize>,
    pub events: usize,
    pub cancelled: bool,
}

pub struct IngestionWorker {
    config: Config,
    provider: Arc<dyn PriceProvider>,
    store: Arc<PriceStore>,
    aggregator: BaselineAggregator,
    emitter: NotificationEmitter,
}

impl IngestionWorker {
    pub fn new(config: Config, provider: Arc<dyn PriceProvider>, store: Arc<PriceStore>) -> Self {
        Self {
            aggregator: BaselineAggregator::new(store.clone()),
            emitter: NotificationEmitter::new(store.clone()),
            config,
            provider,
            store,
        }
    }

    /// Daemon loop: run cycles until cancelled. One-shot mode returns
    /// after the first cycle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            match self.run_cycle(&shutdown).await {
                Ok(summary) => info!(?summary, "cycle complete"),
                Err(err) => error!("cycle failed: {err:#}"),
            }

            if self.config.one_shot {
                info!("one-shot mode: exiting after a single cycle");
                return Ok(());
            }
            if *shutdown.borrow() {
                break;
            }
            info!(
                "sleeping {}h until the next cycle",
                self.config.refresh_interval.as_secs() / 3600
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.refresh_interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("worker stopped");
        Ok(())
    }

    /// One full refresh cycle.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();

        // Phase 1: plan.
        let queries = self.plan(Utc::now().date_naive());
        summary.planned_queries = queries.len() * self.config.cabins.len();
        info!(
            route_queries = queries.len(),
            cabins = self.config.cabins.len(),
            "planned refresh cycle"
        );

        // Phase 2: fetch.
        let deadline = batch_deadline(self.config.provider_timeout);
        let mut observations = Vec::new();
        'fetch: for &cabin in &self.config.cabins {
            for batch in queries.chunks(self.config.provider_batch_size) {
                if *shutdown.borrow() {
                    warn!("cancellation requested; not scheduling further batches");
                    summary.cancelled = true;
                    break 'fetch;
                }
                summary.batches += 1;
                match tokio::time::timeout(deadline, self.provider.fetch(batch, cabin)).await {
                    Ok(outcome) => {
                        summary.transient_errors += outcome.transient_errors();
                        summary.permanent_errors += outcome.permanent_errors();
                        observations.extend(outcome.observations);
                    }
                    Err(_) => {
                        warn!(
                            batch = summary.batches,
                            "batch exceeded its {}s deadline",
                            deadline.as_secs()
                        );
                        summary.transient_errors += 1;
                    }
                }
            }
        }
        summary.observations = observations.len();
        if summary.cancelled {
            return Ok(summary);
        }

        // Phase 3: upsert.
        let stats = self
            .store
            .upsert_observations(&observations)
            .context("upsert phase failed")?;
        summary.inserted = stats.inserted;
        summary.replaced = stats.replaced;
        info!(
            inserted = stats.inserted,
            replaced = stats.replaced,
            total = stats.total(),
            "observations persisted"
        );
        if *shutdown.borrow() {
            summary.cancelled = true;
            return Ok(summary);
        }

        // Phase 4: refresh baseline, blocking fallback on failure.
        let refreshed_at = Utc::now();
        match self.aggregator.refresh_concurrent(refreshed_at) {
            Ok(rows) => summary.baseline_rows = Some(rows),
            Err(err) => {
                warn!("concurrent baseline refresh failed, trying blocking variant: {err:#}");
                match self.aggregator.refresh_blocking(refreshed_at) {
                    Ok(rows) => summary.baseline_rows = Some(rows),
                    Err(err) => {
                        error!(
                            "baseline refresh failed in both modes; cycle degraded, skipping notifications: {err:#}"
                        );
                        return Ok(summary);
                    }
                }
            }
        }
        if *shutdown.borrow() {
            summary.cancelled = true;
            return Ok(summary);
        }

        // Phase 5: emit notifications.
        let events = self
            .emitter
            .emit_price_drops(Utc::now())
            .context("notification phase failed")?;
        summary.events = events.len();

        Ok(summary)
    }

    /// Cartesian product of origins and destinations (self-pairs excluded)
    /// across the configured monthly windows.
    pub fn plan(&self, today: NaiveDate) -> Vec<RouteQuery> {
        let windows = monthly_windows(today, self.config.months_ahead);
        let mut queries = Vec::new();
        for origin in &self.config.origins {
            for destination in &self.config.destinations {
                if origin == destination {
                    continue;
                }
                for &window in &windows {
                    queries.push(RouteQuery {
                        origin: origin.clone(),
                        destination: destination.clone(),
                        window,
                    });
                }
            }
        }
        queries
    }
}

/// Monthly departure spans for the next `months` months. The current
/// month's span starts today, so past departures are never requested.
pub fn monthly_windows(today: NaiveDate, months: u32) -> Vec<DepartureWindow> {
    let first = month_of(today);
    let mut windows = Vec::with_capacity(months as usize);
    for offset in 0..months {
        let Some(month_start) = first.checked_add_months(Months::new(offset)) else {
            continue;
        };
        let Some(next_month) = month_start.checked_add_months(Months::new(1)) else {
            continue;
        };
        let start = if offset == 0 { today } else { month_start };
        let end = next_month - ChronoDuration::days(1);
        if let Ok(window) = DepartureWindow::new(start, end) {
            windows.push(window);
        }
    }
    windows
}

/// Worst-case wall time for one fully retried batch, plus slack. Enforced
/// independently of cancellation so a hung provider cannot wedge shutdown.
fn batch_deadline(request_timeout: Duration) -> Duration {
    request_timeout * (1 + MAX_RETRIES) + max_total_backoff() + Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cabin, ProviderMode};
    use crate::providers::SampleProvider;

    fn test_config() -> Config {
        Config {
            price_source: "sample".into(),
            provider_api_key: None,
            provider_endpoint: None,
            provider_mode: ProviderMode::Bulk,
            provider_batch_size: 50,
            provider_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(6 * 3600),
            months_ahead: 2,
            origins: vec!["JFK".into(), "MIA".into()],
            destinations: vec!["MIA".into(), "LAX".into()],
            cabins: vec![Cabin::Economy],
            one_shot: true,
            database_path: ":memory:".into(),
        }
    }

    fn worker() -> IngestionWorker {
        IngestionWorker::new(
            test_config(),
            Arc::new(SampleProvider::new()),
            Arc::new(PriceStore::open_in_memory().unwrap()),
        )
    }

    #[test]
    fn plan_excludes_self_pairs() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 5).unwrap();
        let queries = worker().plan(today);
        // 3 route pairs (JFK-MIA, JFK-LAX, MIA-LAX) across 2 monthly windows.
        assert_eq!(queries.len(), 6);
        assert!(queries.iter().all(|q| q.origin != q.destination));
    }

    #[test]
    fn windows_clamp_the_current_month_to_today() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 5).unwrap();
        let windows = monthly_windows(today, 3);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start, today);
        assert_eq!(windows[0].end, NaiveDate::from_ymd_opt(2026, 8, 31).unwrap());
        assert_eq!(windows[1].start, NaiveDate::from_ymd_opt(2026, 9, 1).unwrap());
        assert_eq!(windows[1].end, NaiveDate::from_ymd_opt(2026, 9, 30).unwrap());
        assert_eq!(windows[2].end, NaiveDate::from_ymd_opt(2026, 10, 31).unwrap());
    }

    #[tokio::test]
    async fn pre_cancelled_cycle_schedules_no_batches() {
        let (_tx, rx) = watch::channel(true);
        let summary = worker().run_cycle(&rx).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.batches, 0);
        assert_eq!(summary.observations, 0);
    }

    #[tokio::test]
    async fn cycle_runs_end_to_end_with_the_sample_provider() {
        let (_tx, rx) = watch::channel(false);
        let summary = worker().run_cycle(&rx).await.unwrap();
        assert!(!summary.cancelled);
        assert!(summary.observations > 0);
        assert_eq!(summary.inserted, summary.observations);
        assert!(summary.baseline_rows.unwrap() > 0);
        assert_eq!(summary.transient_errors + summary.permanent_errors, 0);
    }
}
