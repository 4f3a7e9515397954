//! Price-drop detection and notification emission.
//!
//! Runs once per cycle, strictly after the baseline refresh: joins the
//! current low fare against each fresh baseline and appends one
//! `price_drop` event per qualifying key. A rolling 24-hour dedup window
//! keeps a route that stays cheap across cycles from firing repeatedly.

use crate::baseline::MIN_BASELINE_SAMPLES;
use crate::models::{EventType, NotificationEvent};
use crate::store::PriceStore;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// A low must have been seen this recently to fire.
const LOW_FRESHNESS_HOURS: i64 = 1;
/// Baselines older than this are stale; nothing fires against them.
const BASELINE_FRESHNESS_HOURS: i64 = 12;
/// At most one price_drop per key inside this window.
const DEDUP_WINDOW_HOURS: i64 = 24;

pub struct NotificationEmitter {
    store: Arc<PriceStore>,
}

impl NotificationEmitter {
    pub fn new(store: Arc<PriceStore>) -> Self {
        Self { store }
    }

    /// Detect current lows under the p25 baseline and record one event
    /// each. Returns the newly inserted events.
    pub fn emit_price_drops(&self, now: DateTime<Utc>) -> Result<Vec<NotificationEvent>> {
        let baseline_cutoff = now - ChronoDuration::hours(BASELINE_FRESHNESS_HOURS);
        let low_cutoff = now - ChronoDuration::hours(LOW_FRESHNESS_HOURS);
        let dedup_cutoff = now - ChronoDuration::hours(DEDUP_WINDOW_HOURS);

        let mut events = Vec::new();
        for baseline in self.store.fresh_baselines(baseline_cutoff)? {
            if baseline.n_samples < MIN_BASELINE_SAMPLES {
                continue;
            }
            let key = baseline.key();
            let Some(low) = self.store.current_low(&key, now)? else {
                continue;
            };
            if low.price >= baseline.p25_30d || low.last_seen < low_cutoff {
                continue;
            }
            if self.store.has_recent_drop_event(&key, dedup_cutoff)? {
                debug!(
                    origin = %key.origin,
                    destination = %key.destination,
                    month = %key.depart_month,
                    "price drop suppressed by dedup window"
                );
                continue;
            }

            let delta_pct =
                ((low.price - baseline.p50_30d) / baseline.p50_30d * 1000.0).round() / 10.0;
            let event = NotificationEvent {
                id: None,
                origin: key.origin,
                destination: key.destination,
                cabin: key.cabin,
                depart_month: key.depart_month,
                event_type: EventType::PriceDrop,
                delta_pct,
                price: low.price,
                baseline_p50: baseline.p50_30d,
                created_at: now,
            };
            events.push(self.store.insert_notification(&event)?);
        }

        if !events.is_empty() {
            info!("🔔 {} new price-drop events", events.len());
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cabin, PriceObservation, RouteBaseline};
    use chrono::{NaiveDate, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap()
    }

    fn month() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 9, 1).unwrap()
    }

    fn seed_baseline(store: &PriceStore, updated: DateTime<Utc>, n_samples: i64) {
        store
            .replace_baselines(&[RouteBaseline {
                origin: "JFK".into(),
                destination: "MIA".into(),
                cabin: Cabin::Economy,
                depart_month: month(),
                p25_30d: 135.0,
                p50_30d: 150.0,
                p75_30d: 175.0,
                n_samples,
                last_updated: updated,
            }])
            .unwrap();
    }

    fn seed_low(store: &PriceStore, price: f64, observed_at: DateTime<Utc>) {
        let obs = PriceObservation::new(
            "JFK",
            "MIA",
            Cabin::Economy,
            month() + ChronoDuration::days(13),
            price,
            "sample",
            observed_at,
        )
        .unwrap();
        store.upsert_observations(&[obs]).unwrap();
    }

    #[test]
    fn fires_once_then_dedups() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, now() - ChronoDuration::hours(1), 40);
        seed_low(&store, 120.0, now() - ChronoDuration::minutes(10));

        let emitter = NotificationEmitter::new(store.clone());
        let first = emitter.emit_price_drops(now()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].price, 120.0);
        assert_eq!(first[0].delta_pct, -20.0);
        assert_eq!(first[0].baseline_p50, 150.0);

        // One refresh cycle later the low is re-observed and the baseline is
        // fresh again, but the 24h window suppresses a second event.
        seed_low(&store, 120.0, now() + ChronoDuration::hours(6) - ChronoDuration::minutes(10));
        seed_baseline(&store, now() + ChronoDuration::hours(6), 40);
        let second = emitter.emit_price_drops(now() + ChronoDuration::hours(6)).unwrap();
        assert!(second.is_empty());

        // Past the dedup window the key may fire again.
        seed_low(&store, 118.0, now() + ChronoDuration::hours(25));
        seed_baseline(&store, now() + ChronoDuration::hours(25), 40);
        let third = emitter.emit_price_drops(now() + ChronoDuration::hours(25)).unwrap();
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn stale_baseline_fires_nothing() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, now() - ChronoDuration::hours(13), 40);
        seed_low(&store, 120.0, now() - ChronoDuration::minutes(10));

        let emitter = NotificationEmitter::new(store);
        assert!(emitter.emit_price_drops(now()).unwrap().is_empty());
    }

    #[test]
    fn stale_low_fires_nothing() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, now() - ChronoDuration::hours(1), 40);
        seed_low(&store, 120.0, now() - ChronoDuration::hours(2));

        let emitter = NotificationEmitter::new(store);
        assert!(emitter.emit_price_drops(now()).unwrap().is_empty());
    }

    #[test]
    fn price_at_or_above_p25_fires_nothing() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, now() - ChronoDuration::hours(1), 40);
        seed_low(&store, 135.0, now() - ChronoDuration::minutes(10));

        let emitter = NotificationEmitter::new(store);
        assert!(emitter.emit_price_drops(now()).unwrap().is_empty());
    }

    #[test]
    fn thin_baseline_fires_nothing() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, now() - ChronoDuration::hours(1), 8);
        seed_low(&store, 120.0, now() - ChronoDuration::minutes(10));

        let emitter = NotificationEmitter::new(store);
        assert!(emitter.emit_price_drops(now()).unwrap().is_empty());
    }
}
