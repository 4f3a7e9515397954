//! Deterministic synthetic fare provider.
//!
//! Keyless development and test source. Prices derive from a stable hash of
//! the route key and departure date, so repeated cycles see the same fare
//! surface and assertions on stored data are reproducible.

use super::{FetchOutcome, PriceProvider, RouteQuery};
use crate::models::{Cabin, PriceObservation};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

const SOURCE: &str = "sample";
/// One quote every few days keeps per-month sample counts above the
/// baseline's minimum after a single cycle.
const QUOTE_STEP_DAYS: i64 = 3;

#[derive(Debug, Default)]
pub struct SampleProvider;

impl SampleProvider {
    pub fn new() -> Self {
        Self
    }
}

fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

fn cabin_multiplier(cabin: Cabin) -> f64 {
    match cabin {
        Cabin::Economy => 1.0,
        Cabin::Premium => 1.6,
        Cabin::Business => 2.8,
        Cabin::First => 4.0,
    }
}

/// Synthetic fare for one route, cabin, and departure date.
pub fn fare_for(origin: &str, destination: &str, cabin: Cabin, date: NaiveDate) -> f64 {
    let base = 120.0 + (stable_hash(&[origin, destination]) % 360) as f64;
    let date_str = date.to_string();
    let wiggle = 0.85 + (stable_hash(&[origin, destination, &date_str]) % 30) as f64 / 100.0;
    let fare = base * cabin_multiplier(cabin) * wiggle;
    (fare * 100.0).round() / 100.0
}

#[async_trait]
impl PriceProvider for SampleProvider {
    fn identity(&self) -> &'static str {
        SOURCE
    }

    async fn fetch(&self, queries: &[RouteQuery], cabin: Cabin) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        let now = Utc::now();
        let today = now.date_naive();

        for query in queries {
            let mut date = query.window.start.max(today);
            while date <= query.window.end {
                let price = fare_for(&query.origin, &query.destination, cabin, date);
                if let Ok(obs) = PriceObservation::new(
                    &query.origin,
                    &query.destination,
                    cabin,
                    date,
                    price,
                    SOURCE,
                    now,
                ) {
                    outcome.observations.push(obs);
                }
                date += ChronoDuration::days(QUOTE_STEP_DAYS);
            }
        }

        debug!(
            "sample: generated {} observations for {} queries",
            outcome.observations.len(),
            queries.len()
        );
        outcome
    }
}
