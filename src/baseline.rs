//! Rolling percentile baselines per (route, cabin, departure month).
//!
//! Recomputes P25/P50/P75 of observed prices over the trailing 30-day
//! window. Two refresh primitives: the concurrent variant materialises
//! into a staging table and swaps it in atomically so readers never see a
//! half-built aggregate; the blocking variant rewrites in place. The
//! worker prefers concurrent and falls back to blocking.

use crate::models::RouteBaseline;
use crate::store::PriceStore;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

pub const BASELINE_WINDOW_DAYS: i64 = 30;
/// Rows with fewer samples than this are "insufficient data" to consumers.
pub const MIN_BASELINE_SAMPLES: i64 = 10;

pub struct BaselineAggregator {
    store: Arc<PriceStore>,
}

impl BaselineAggregator {
    pub fn new(store: Arc<PriceStore>) -> Self {
        Self { store }
    }

    /// Recompute without blocking readers of the prior aggregate.
    pub fn refresh_concurrent(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.compute_rows(now)?;
        self.store.swap_baselines_staged(&rows)?;
        info!(rows = rows.len(), "baseline refresh (concurrent) complete");
        Ok(rows.len())
    }

    /// Recompute in place. Fallback when the concurrent variant fails.
    pub fn refresh_blocking(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.compute_rows(now)?;
        self.store.replace_baselines(&rows)?;
        info!(rows = rows.len(), "baseline refresh (blocking) complete");
        Ok(rows.len())
    }

    fn compute_rows(&self, now: DateTime<Utc>) -> Result<Vec<RouteBaseline>> {
        let since = now - ChronoDuration::days(BASELINE_WINDOW_DAYS);
        let keys = self.store.route_month_keys(since)?;

        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let mut prices = self.store.range_query(&key, since, now)?;
            if prices.is_empty() {
                continue;
            }
            prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let row = RouteBaseline {
                origin: key.origin,
                destination: key.destination,
                cabin: key.cabin,
                depart_month: key.depart_month,
                p25_30d: percentile(&prices, 25.0),
                p50_30d: percentile(&prices, 50.0),
                p75_30d: percentile(&prices, 75.0),
                n_samples: prices.len() as i64,
                last_updated: now,
            };
            debug!(
                origin = %row.origin,
                destination = %row.destination,
                cabin = %row.cabin,
                month = %row.depart_month,
                p25 = row.p25_30d,
                p50 = row.p50_30d,
                p75 = row.p75_30d,
                n = row.n_samples,
                "baseline group"
            );
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Continuous percentile by linear interpolation on an ascending-sorted set.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
            }
        }
    }
}
