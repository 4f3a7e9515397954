//! Domain types for the pricing-intelligence core.
//!
//! Everything that crosses a module boundary lives here: observations,
//! baselines, lead-time curve points, notification events, and the
//! environment-driven configuration.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Fare class tracked per route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cabin {
    Economy,
    Premium,
    Business,
    First,
}

impl Cabin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cabin::Economy => "economy",
            Cabin::Premium => "premium",
            Cabin::Business => "business",
            Cabin::First => "first",
        }
    }
}

impl fmt::Display for Cabin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cabin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "economy" => Ok(Cabin::Economy),
            "premium" => Ok(Cabin::Premium),
            "business" => Ok(Cabin::Business),
            "first" => Ok(Cabin::First),
            other => bail!("unknown cabin '{other}'"),
        }
    }
}

/// One observed fare: immutable once written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub origin: String,
    pub destination: String,
    pub cabin: Cabin,
    pub depart_date: NaiveDate,
    pub price: f64,
    pub source: String,
    pub observed_at: DateTime<Utc>,
}

impl PriceObservation {
    /// Build a validated observation. Codes are normalised to uppercase.
    pub fn new(
        origin: &str,
        destination: &str,
        cabin: Cabin,
        depart_date: NaiveDate,
        price: f64,
        source: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Self> {
        let origin = normalize_airport_code(origin)?;
        let destination = normalize_airport_code(destination)?;
        if origin == destination {
            bail!("origin and destination are both {origin}");
        }
        if !(price > 0.0) {
            bail!("non-positive price {price} for {origin}-{destination}");
        }
        if source.trim().is_empty() {
            bail!("empty source for {origin}-{destination}");
        }
        if depart_date < observed_at.date_naive() {
            bail!(
                "departure {depart_date} is in the past for {origin}-{destination}"
            );
        }
        Ok(Self {
            origin,
            destination,
            cabin,
            depart_date,
            price,
            source: source.trim().to_string(),
            observed_at,
        })
    }

    /// First day of the departure month; the baseline grouping key.
    pub fn depart_month(&self) -> NaiveDate {
        month_of(self.depart_date)
    }
}

/// Validate and uppercase a 3-letter IATA airport code.
pub fn normalize_airport_code(code: &str) -> Result<String> {
    let code = code.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        bail!("invalid airport code '{code}'");
    }
    Ok(code)
}

/// First day of the calendar month containing `date`.
pub fn month_of(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month is valid")
}

/// Identifies one baseline group: route, cabin, and departure month.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub origin: String,
    pub destination: String,
    pub cabin: Cabin,
    pub depart_month: NaiveDate,
}

/// Trailing-30-day percentile aggregate for one route-month-cabin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteBaseline {
    pub origin: String,
    pub destination: String,
    pub cabin: Cabin,
    pub depart_month: NaiveDate,
    pub p25_30d: f64,
    pub p50_30d: f64,
    pub p75_30d: f64,
    pub n_samples: i64,
    pub last_updated: DateTime<Utc>,
}

impl RouteBaseline {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            origin: self.origin.clone(),
            destination: self.destination.clone(),
            cabin: self.cabin,
            depart_month: self.depart_month,
        }
    }
}

/// One point of the externally maintained lead-time curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeadTimePoint {
    pub lead_days: i64,
    pub q25: f64,
    pub q50: f64,
    pub q75: f64,
}

/// Notification kinds. Only price drops today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PriceDrop,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PriceDrop => "price_drop",
        }
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "price_drop" => Ok(EventType::PriceDrop),
            other => bail!("unknown event type '{other}'"),
        }
    }
}

/// Append-only record of a detected deal event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub id: Option<i64>,
    pub origin: String,
    pub destination: String,
    pub cabin: Cabin,
    pub depart_month: NaiveDate,
    pub event_type: EventType,
    pub delta_pct: f64,
    pub price: f64,
    pub baseline_p50: f64,
    pub created_at: DateTime<Utc>,
}

/// Adapter submission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    Bulk,
    Single,
}

impl FromStr for ProviderMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bulk" => Ok(ProviderMode::Bulk),
            "single" => Ok(ProviderMode::Single),
            other => bail!("unknown PROVIDER_MODE '{other}' (expected bulk or single)"),
        }
    }
}

/// Application configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub price_source: String,
    pub provider_api_key: Option<String>,
    pub provider_endpoint: Option<String>,
    pub provider_mode: ProviderMode,
    pub provider_batch_size: usize,
    pub provider_timeout: Duration,
    pub refresh_interval: Duration,
    pub months_ahead: u32,
    pub origins: Vec<String>,
    pub destinations: Vec<String>,
    pub cabins: Vec<Cabin>,
    pub one_shot: bool,
    pub database_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let price_source = std::env::var("PRICE_SOURCE")
            .unwrap_or_else(|_| "sample".to_string())
            .trim()
            .to_ascii_lowercase();

        let provider_api_key = std::env::var("PROVIDER_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let provider_endpoint = std::env::var("PROVIDER_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let provider_mode = std::env::var("PROVIDER_MODE")
            .unwrap_or_else(|_| "bulk".to_string())
            .parse::<ProviderMode>()?;

        let provider_batch_size = std::env::var("PROVIDER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(100);

        let provider_timeout_seconds = std::env::var("PROVIDER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|&v| v > 0.0)
            .unwrap_or(60.0);

        let refresh_interval_hours = std::env::var("REFRESH_INTERVAL_HOURS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(6);

        let months_ahead = std::env::var("MONTHS_AHEAD")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(6);

        let origins = parse_code_list(
            &std::env::var("ORIGINS").unwrap_or_else(|_| "JFK,EWR,LGA".to_string()),
        )
        .context("invalid ORIGINS")?;

        let destinations = parse_code_list(
            &std::env::var("DESTINATIONS")
                .unwrap_or_else(|_| "MIA,LAX,SFO,SJU,LAS,MCO".to_string()),
        )
        .context("invalid DESTINATIONS")?;

        let cabins = std::env::var("CABINS")
            .unwrap_or_else(|_| "economy".to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Cabin::from_str)
            .collect::<Result<Vec<_>>>()
            .context("invalid CABINS")?;
        if cabins.is_empty() {
            bail!("CABINS resolved to an empty list");
        }

        let one_shot = std::env::var("ONE_SHOT")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./serpradio.db".to_string());

        Ok(Self {
            price_source,
            provider_api_key,
            provider_endpoint,
            provider_mode,
            provider_batch_size,
            provider_timeout: Duration::from_secs_f64(provider_timeout_seconds),
            refresh_interval: Duration::from_secs(refresh_interval_hours * 3600),
            months_ahead,
            origins,
            destinations,
            cabins,
            one_shot,
            database_path,
        })
    }
}

fn parse_code_list(raw: &str) -> Result<Vec<String>> {
    let mut codes = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let code = normalize_airport_code(part)?;
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    if codes.is_empty() {
        bail!("airport code list '{raw}' resolved to nothing");
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn cabin_round_trip() {
        for name in ["economy", "premium", "business", "first"] {
            let cabin: Cabin = name.parse().unwrap();
            assert_eq!(cabin.as_str(), name);
        }
        assert!("coach".parse::<Cabin>().is_err());
    }

    #[test]
    fn observation_rejects_self_pair() {
        let err = PriceObservation::new(
            "jfk",
            "JFK",
            Cabin::Economy,
            NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            100.0,
            "test",
            wed(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn observation_rejects_past_departure() {
        let err = PriceObservation::new(
            "JFK",
            "MIA",
            Cabin::Economy,
            NaiveDate::from_ymd_opt(2026, 8, 4).unwrap(),
            100.0,
            "test",
            wed(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn observation_normalizes_codes() {
        let obs = PriceObservation::new(
            " jfk ",
            "mia",
            Cabin::Economy,
            NaiveDate::from_ymd_opt(2026, 9, 14).unwrap(),
            221.5,
            "parallel",
            wed(),
        )
        .unwrap();
        assert_eq!(obs.origin, "JFK");
        assert_eq!(obs.destination, "MIA");
        assert_eq!(obs.depart_month(), NaiveDate::from_ymd_opt(2026, 9, 1).unwrap());
    }

    #[test]
    fn code_list_dedupes_and_validates() {
        let codes = parse_code_list("jfk, mia,JFK").unwrap();
        assert_eq!(codes, vec!["JFK".to_string(), "MIA".to_string()]);
        assert!(parse_code_list("NEWYORK").is_err());
        assert!(parse_code_list(" , ").is_err());
    }
}
