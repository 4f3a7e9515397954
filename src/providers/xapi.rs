//! "xapi" fare provider.
//!
//! Compatibility fallback. The upstream API only answers one route query at
//! a time, so requests run sequentially behind a small rate limiter;
//! `PROVIDER_MODE=bulk` degrades to single mode with a warning.

use super::http::{build_client, send_with_retry};
use super::{FetchError, FetchOutcome, PriceProvider, RouteQuery};
use crate::models::{Cabin, PriceObservation, ProviderMode};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DEFAULT_ENDPOINT: &str = "https://xapi.flightdata.io";
const SOURCE: &str = "xapi";
const RATE_LIMIT_DELAY_MS: u64 = 250;

pub struct XapiProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    last_request: Mutex<Option<Instant>>,
}

#[derive(Debug, Deserialize)]
struct PricesResponse {
    data: PricesData,
}

#[derive(Debug, Deserialize)]
struct PricesData {
    fares: Vec<XapiFare>,
}

#[derive(Debug, Deserialize)]
struct XapiFare {
    from: String,
    to: String,
    cabin: String,
    date: NaiveDate,
    fare_usd: f64,
}

impl XapiProvider {
    pub fn new(
        api_key: String,
        endpoint: Option<String>,
        mode: ProviderMode,
        timeout: Duration,
    ) -> Result<Self> {
        if mode == ProviderMode::Bulk {
            warn!("xapi does not support bulk submission; falling back to single mode");
        }
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            last_request: Mutex::new(None),
        })
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = *last {
            let min_delay = Duration::from_millis(RATE_LIMIT_DELAY_MS);
            let elapsed = last_time.elapsed();
            if elapsed < min_delay {
                let wait = min_delay - elapsed;
                debug!("rate limiting: waiting {}ms", wait.as_millis());
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl PriceProvider for XapiProvider {
    fn identity(&self) -> &'static str {
        SOURCE
    }

    async fn fetch(&self, queries: &[RouteQuery], cabin: Cabin) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        let url = format!("{}/v2/prices", self.endpoint);

        for query in queries {
            self.pace().await;

            let params = [
                ("from", query.origin.clone()),
                ("to", query.destination.clone()),
                ("cabin", cabin.as_str().to_string()),
                ("date_from", query.window.start.to_string()),
                ("date_to", query.window.end.to_string()),
            ];
            let sent = send_with_retry(
                || {
                    self.client
                        .get(&url)
                        .header("x-api-key", &self.api_key)
                        .query(&params)
                },
                "xapi.prices",
            )
            .await;

            match sent {
                Ok(response) => match response.json::<PricesResponse>().await {
                    Ok(parsed) => convert_fares(parsed.data.fares, cabin, &mut outcome),
                    Err(err) => outcome.errors.push(FetchError::Permanent(format!(
                        "xapi.prices: malformed response: {err}"
                    ))),
                },
                Err(err) => outcome.errors.push(err),
            }
        }

        info!(
            "📊 xapi: {} fares across {} queries ({} errors)",
            outcome.observations.len(),
            queries.len(),
            outcome.errors.len()
        );
        outcome
    }
}

fn convert_fares(fares: Vec<XapiFare>, requested: Cabin, outcome: &mut FetchOutcome) {
    let now = Utc::now();
    for fare in fares {
        let cabin = Cabin::from_str(&fare.cabin).unwrap_or(requested);
        match PriceObservation::new(
            &fare.from,
            &fare.to,
            cabin,
            fare.date,
            fare.fare_usd,
            SOURCE,
            now,
        ) {
            Ok(obs) => outcome.observations.push(obs),
            Err(err) => {
                warn!(from = %fare.from, to = %fare.to, "skipping fare: {err}");
                outcome
                    .errors
                    .push(FetchError::Permanent(format!("xapi: bad row: {err}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_schema_parses() {
        let raw = r#"{
            "data": {
                "fares": [
                    {"from": "EWR", "to": "SJU", "cabin": "economy",
                     "date": "2099-06-02", "fare_usd": 214.0}
                ]
            }
        }"#;
        let parsed: PricesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.fares.len(), 1);
        assert_eq!(parsed.data.fares[0].fare_usd, 214.0);
    }

    #[test]
    fn unknown_cabin_falls_back_to_requested() {
        let fares = vec![XapiFare {
            from: "EWR".into(),
            to: "SJU".into(),
            cabin: "mystery".into(),
            date: NaiveDate::from_ymd_opt(2099, 6, 2).unwrap(),
            fare_usd: 214.0,
        }];
        let mut outcome = FetchOutcome::default();
        convert_fares(fares, Cabin::Premium, &mut outcome);
        assert_eq!(outcome.observations.len(), 1);
        assert_eq!(outcome.observations[0].cabin, Cabin::Premium);
    }
}
