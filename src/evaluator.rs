//! Synchronous deal evaluation.
//!
//! Joins the current low fare, the 30-day percentile baseline, and the
//! lead-time curve into a ranked BUY/TRACK/WAIT recommendation with a
//! confidence score and a human-readable rationale. Pure with respect to
//! its inputs and the store: identical arguments against an unchanged
//! store produce identical records.

use crate::baseline::MIN_BASELINE_SAMPLES;
use crate::models::{normalize_airport_code, Cabin, LeadTimePoint, RouteBaseline, RouteKey};
use crate::store::PriceStore;
use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Buy,
    Track,
    Wait,
}

/// Contiguous range of lead days whose median fare is within 5% of the
/// curve's minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweetSpot {
    pub start_days: i64,
    pub end_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselineSnapshot {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub n_samples: i64,
    pub last_updated: DateTime<Utc>,
}

/// The full evaluation record. When `has_data` is false only `reason` is
/// populated alongside the echoed, normalised inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DealEvaluation {
    pub origin: String,
    pub destination: String,
    pub cabin: Cabin,
    pub depart_month: NaiveDate,
    pub has_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweet_spot: Option<SweetSpot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl DealEvaluation {
    fn no_data(key: &RouteKey, reason: String) -> Self {
        Self {
            origin: key.origin.clone(),
            destination: key.destination.clone(),
            cabin: key.cabin,
            depart_month: key.depart_month,
            has_data: false,
            reason: Some(reason),
            current_price: None,
            baseline: None,
            delta_pct: None,
            deal_score: None,
            sweet_spot: None,
            recommendation: None,
            confidence: None,
            rationale: None,
            last_seen: None,
        }
    }
}

pub struct DealEvaluator {
    store: Arc<PriceStore>,
}

impl DealEvaluator {
    pub fn new(store: Arc<PriceStore>) -> Self {
        Self { store }
    }

    /// Evaluate "how is this route priced right now, and what should I do?"
    /// for the next future occurrence of `month`.
    pub fn evaluate(
        &self,
        origin: &str,
        destination: &str,
        month: u32,
        cabin: Cabin,
        now: DateTime<Utc>,
    ) -> Result<DealEvaluation> {
        if !(1..=12).contains(&month) {
            bail!("month {month} out of range 1..=12");
        }
        let key = RouteKey {
            origin: normalize_airport_code(origin)?,
            destination: normalize_airport_code(destination)?,
            cabin,
            depart_month: resolve_month(now.date_naive(), month),
        };

        let Some(baseline) = self.store.baseline(&key)? else {
            return Ok(DealEvaluation::no_data(
                &key,
                format!(
                    "no price baseline for {}-{} {} in {}",
                    key.origin,
                    key.destination,
                    key.cabin,
                    key.depart_month.format("%B %Y")
                ),
            ));
        };
        if baseline.n_samples < MIN_BASELINE_SAMPLES {
            return Ok(DealEvaluation::no_data(
                &key,
                format!(
                    "only {} samples in the last 30 days (need {MIN_BASELINE_SAMPLES})",
                    baseline.n_samples
                ),
            ));
        }
        let Some(low) = self.store.current_low(&key, now)? else {
            return Ok(DealEvaluation::no_data(
                &key,
                format!(
                    "no recent price observations for {}-{} {} in {}",
                    key.origin,
                    key.destination,
                    key.cabin,
                    key.depart_month.format("%B %Y")
                ),
            ));
        };

        let delta_pct = round1((low.price - baseline.p50_30d) / baseline.p50_30d * 100.0);
        let deal_score = score_for(low.price, &baseline);
        let sweet_spot = sweet_spot(&self.store.lead_time_curve(&key)?);
        let (recommendation, confidence, rationale) =
            recommend(low.price, &baseline, delta_pct, sweet_spot);

        Ok(DealEvaluation {
            origin: key.origin,
            destination: key.destination,
            cabin: key.cabin,
            depart_month: key.depart_month,
            has_data: true,
            reason: None,
            current_price: Some(low.price),
            baseline: Some(BaselineSnapshot {
                p25: baseline.p25_30d,
                p50: baseline.p50_30d,
                p75: baseline.p75_30d,
                n_samples: baseline.n_samples,
                last_updated: baseline.last_updated,
            }),
            delta_pct: Some(delta_pct),
            deal_score: Some(deal_score),
            sweet_spot,
            recommendation: Some(recommendation),
            confidence: Some(confidence),
            rationale: Some(rationale),
            last_seen: Some(low.last_seen),
        })
    }
}

/// Resolve a bare month number to the next future calendar month with that
/// number. The current month counts as future; rollover to next year only
/// when the requested month has already passed.
pub fn resolve_month(today: NaiveDate, month: u32) -> NaiveDate {
    let year = if month >= today.month() {
        today.year()
    } else {
        today.year() + 1
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("month 1..=12 on the first is valid")
}

fn score_for(current: f64, baseline: &RouteBaseline) -> u8 {
    if current <= baseline.p25_30d {
        90
    } else if current <= baseline.p50_30d {
        70
    } else if current <= baseline.p75_30d {
        45
    } else {
        20
    }
}

/// Band the lead-time curve: the contiguous run of lead days around the
/// cheapest median whose q50 stays within 5% of that minimum.
pub fn sweet_spot(points: &[LeadTimePoint]) -> Option<SweetSpot> {
    if points.is_empty() {
        return None;
    }
    let mut sorted: Vec<&LeadTimePoint> = points.iter().collect();
    sorted.sort_by_key(|p| p.lead_days);

    let (min_idx, min_q50) = sorted
        .iter()
        .enumerate()
        .min_by(|a, b| {
            a.1.q50
                .partial_cmp(&b.1.q50)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, p)| (i, p.q50))?;
    let threshold = min_q50 * 1.05;

    let mut lo = min_idx;
    while lo > 0 && sorted[lo - 1].q50 <= threshold {
        lo -= 1;
    }
    let mut hi = min_idx;
    while hi + 1 < sorted.len() && sorted[hi + 1].q50 <= threshold {
        hi += 1;
    }

    Some(SweetSpot {
        start_days: sorted[lo].lead_days,
        end_days: sorted[hi].lead_days,
    })
}

/// First matching clause wins; the order is the contract.
fn recommend(
    current: f64,
    baseline: &RouteBaseline,
    delta_pct: f64,
    sweet_spot: Option<SweetSpot>,
) -> (Recommendation, u8, String) {
    if current <= baseline.p25_30d {
        return (
            Recommendation::Buy,
            85,
            format!(
                "Price is in the bottom quartile of the last 30 days, {:.1}% below the median",
                delta_pct.abs()
            ),
        );
    }
    if let Some(spot) = sweet_spot {
        if current <= baseline.p50_30d {
            return (
                Recommendation::Buy,
                80,
                format!(
                    "Below-median price inside the historical booking sweet spot ({}-{} days out)",
                    spot.start_days, spot.end_days
                ),
            );
        }
    }
    if current <= baseline.p50_30d {
        return (
            Recommendation::Track,
            70,
            format!(
                "Price is {:.1}% below the 30-day median but may improve",
                delta_pct.abs()
            ),
        );
    }
    if current <= baseline.p75_30d {
        return (
            Recommendation::Track,
            65,
            format!(
                "Price is {:.1}% above the 30-day median but still in the typical range",
                delta_pct.abs()
            ),
        );
    }
    (
        Recommendation::Wait,
        70,
        format!(
            "Price is in the top quartile of the last 30 days, {:.1}% above the median",
            delta_pct.abs()
        ),
    )
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceObservation;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap()
    }

    fn march() -> NaiveDate {
        // Month 3 requested in August 2026 resolves to March 2027.
        NaiveDate::from_ymd_opt(2027, 3, 1).unwrap()
    }

    fn seed_baseline(store: &PriceStore, month: NaiveDate, p25: f64, p50: f64, p75: f64, n: i64) {
        store
            .replace_baselines(&[RouteBaseline {
                origin: "JFK".into(),
                destination: "MIA".into(),
                cabin: Cabin::Economy,
                depart_month: month,
                p25_30d: p25,
                p50_30d: p50,
                p75_30d: p75,
                n_samples: n,
                last_updated: now() - ChronoDuration::hours(1),
            }])
            .unwrap();
    }

    fn seed_low(store: &PriceStore, month: NaiveDate, price: f64) {
        let obs = PriceObservation::new(
            "JFK",
            "MIA",
            Cabin::Economy,
            month + ChronoDuration::days(13),
            price,
            "sample",
            now() - ChronoDuration::minutes(20),
        )
        .unwrap();
        store.upsert_observations(&[obs]).unwrap();
    }

    fn evaluator(store: &Arc<PriceStore>) -> DealEvaluator {
        DealEvaluator::new(store.clone())
    }

    #[test]
    fn month_resolution_rolls_over_the_year() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 5).unwrap();
        assert_eq!(resolve_month(today, 8), NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        assert_eq!(resolve_month(today, 12), NaiveDate::from_ymd_opt(2026, 12, 1).unwrap());
        assert_eq!(resolve_month(today, 3), NaiveDate::from_ymd_opt(2027, 3, 1).unwrap());
    }

    #[test]
    fn deep_discount_is_a_buy() {
        // S1: current well below p25.
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 40);
        seed_low(&store, march(), 120.0);

        let eval = evaluator(&store)
            .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
            .unwrap();
        assert!(eval.has_data);
        assert_eq!(eval.current_price, Some(120.0));
        assert_eq!(eval.delta_pct, Some(-20.0));
        assert_eq!(eval.deal_score, Some(90));
        assert_eq!(eval.recommendation, Some(Recommendation::Buy));
        assert_eq!(eval.confidence, Some(85));
    }

    #[test]
    fn median_price_tracks() {
        // S2: current equal to the median.
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 40);
        seed_low(&store, march(), 150.0);

        let eval = evaluator(&store)
            .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
            .unwrap();
        assert_eq!(eval.delta_pct, Some(0.0));
        assert_eq!(eval.deal_score, Some(70));
        assert_eq!(eval.recommendation, Some(Recommendation::Track));
        assert_eq!(eval.confidence, Some(70));
    }

    #[test]
    fn top_quartile_waits() {
        // S3: current above p75.
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 40);
        seed_low(&store, march(), 200.0);

        let eval = evaluator(&store)
            .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
            .unwrap();
        assert_eq!(eval.delta_pct, Some(33.3));
        assert_eq!(eval.deal_score, Some(20));
        assert_eq!(eval.recommendation, Some(Recommendation::Wait));
        assert_eq!(eval.confidence, Some(70));
    }

    #[test]
    fn thin_baseline_returns_no_data() {
        // S4: eight samples is below the floor.
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 8);
        seed_low(&store, march(), 120.0);

        let eval = evaluator(&store)
            .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
            .unwrap();
        assert!(!eval.has_data);
        assert!(eval.reason.as_deref().unwrap().contains('8'));
        assert!(eval.recommendation.is_none());
    }

    #[test]
    fn ten_samples_is_enough_nine_is_not() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_low(&store, march(), 120.0);

        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 9);
        let thin = evaluator(&store)
            .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
            .unwrap();
        assert!(!thin.has_data);

        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 10);
        let enough = evaluator(&store)
            .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
            .unwrap();
        assert!(enough.has_data);
        assert!(enough.recommendation.is_some());
    }

    #[test]
    fn sweet_spot_buy_cites_the_window() {
        // S5: below-median price inside the booking window.
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        let june = NaiveDate::from_ymd_opt(2027, 6, 1).unwrap();
        store
            .replace_baselines(&[RouteBaseline {
                origin: "JFK".into(),
                destination: "LAX".into(),
                cabin: Cabin::Economy,
                depart_month: june,
                p25_30d: 290.0,
                p50_30d: 315.0,
                p75_30d: 360.0,
                n_samples: 30,
                last_updated: now() - ChronoDuration::hours(1),
            }])
            .unwrap();
        let key = RouteKey {
            origin: "JFK".into(),
            destination: "LAX".into(),
            cabin: Cabin::Economy,
            depart_month: june,
        };
        store
            .replace_lead_time_curve(
                &key,
                &[
                    LeadTimePoint { lead_days: 60, q25: 380.0, q50: 400.0, q75: 430.0 },
                    LeadTimePoint { lead_days: 45, q25: 285.0, q50: 305.0, q75: 330.0 },
                    LeadTimePoint { lead_days: 30, q25: 288.0, q50: 310.0, q75: 335.0 },
                    LeadTimePoint { lead_days: 14, q25: 350.0, q50: 380.0, q75: 410.0 },
                ],
            )
            .unwrap();
        let obs = PriceObservation::new(
            "JFK",
            "LAX",
            Cabin::Economy,
            june + ChronoDuration::days(10),
            310.0,
            "sample",
            now() - ChronoDuration::minutes(5),
        )
        .unwrap();
        store.upsert_observations(&[obs]).unwrap();

        let eval = evaluator(&store)
            .evaluate("jfk", "lax", 6, Cabin::Economy, now())
            .unwrap();
        assert_eq!(
            eval.sweet_spot,
            Some(SweetSpot { start_days: 30, end_days: 45 })
        );
        assert_eq!(eval.recommendation, Some(Recommendation::Buy));
        assert_eq!(eval.confidence, Some(80));
        let rationale = eval.rationale.unwrap();
        assert!(rationale.contains("30-45 days out"), "rationale was: {rationale}");
    }

    #[test]
    fn price_exactly_at_p25_is_still_a_buy() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 40);
        seed_low(&store, march(), 135.0);

        let eval = evaluator(&store)
            .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
            .unwrap();
        assert_eq!(eval.deal_score, Some(90));
        assert_eq!(eval.recommendation, Some(Recommendation::Buy));
        assert_eq!(eval.confidence, Some(85));
    }

    #[test]
    fn sweet_spot_does_not_rescue_an_above_median_price() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 40);
        let key = RouteKey {
            origin: "JFK".into(),
            destination: "MIA".into(),
            cabin: Cabin::Economy,
            depart_month: march(),
        };
        store
            .replace_lead_time_curve(
                &key,
                &[
                    LeadTimePoint { lead_days: 40, q25: 130.0, q50: 140.0, q75: 155.0 },
                    LeadTimePoint { lead_days: 25, q25: 132.0, q50: 144.0, q75: 160.0 },
                ],
            )
            .unwrap();
        seed_low(&store, march(), 160.0);

        let eval = evaluator(&store)
            .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
            .unwrap();
        assert!(eval.sweet_spot.is_some());
        assert_eq!(eval.recommendation, Some(Recommendation::Track));
        assert_eq!(eval.confidence, Some(65));
        assert_eq!(eval.deal_score, Some(45));
    }

    #[test]
    fn missing_route_returns_reason_not_error() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        let eval = evaluator(&store)
            .evaluate("JFK", "SFO", 3, Cabin::Economy, now())
            .unwrap();
        assert!(!eval.has_data);
        assert!(eval.reason.as_deref().unwrap().contains("JFK-SFO"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 40);
        seed_low(&store, march(), 142.0);

        let eval = evaluator(&store);
        let first = eval.evaluate("JFK", "MIA", 3, Cabin::Economy, now()).unwrap();
        let second = eval.evaluate("JFK", "MIA", 3, Cabin::Economy, now()).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn score_bands_align_with_recommendations() {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        seed_baseline(&store, march(), 135.0, 150.0, 175.0, 40);

        // seed_low reuses one natural key, so each probe price replaces the
        // previous row and current_low follows it exactly.
        for price in [120.0, 135.0, 148.0, 150.0, 160.0, 175.0, 230.0] {
            seed_low(&store, march(), price);
            let eval = evaluator(&store)
                .evaluate("JFK", "MIA", 3, Cabin::Economy, now())
                .unwrap();
            let score = eval.deal_score.unwrap();
            assert!([20, 45, 70, 90].contains(&score));
            if eval.recommendation == Some(Recommendation::Buy) {
                assert!(eval.current_price.unwrap() <= 150.0);
            }
        }
    }
}
