//! "parallel" fare provider.
//!
//! The primary source. Supports both submission modes: bulk posts a whole
//! batch of route queries in one JSON body, single fans out one GET per
//! (origin, destination, window) triple with bounded concurrency.

use super::http::send_with_retry;
use super::{FetchError, FetchOutcome, PriceProvider, RouteQuery};
use crate::models::{Cabin, PriceObservation, ProviderMode};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const DEFAULT_ENDPOINT: &str = "https://api.parallelfares.com";
const SOURCE: &str = "parallel";

pub struct ParallelProvider {
    client: Client,
    endpoint: String,
    mode: ProviderMode,
    batch_size: usize,
}

#[derive(Debug, Serialize)]
struct SearchRequest {
    queries: Vec<SearchQuery>,
}

#[derive(Debug, Serialize)]
struct SearchQuery {
    origin: String,
    destination: String,
    cabin: String,
    date_from: NaiveDate,
    date_to: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<FareRow>,
}

#[derive(Debug, Deserialize)]
struct FareRow {
    origin: String,
    destination: String,
    cabin: String,
    depart_date: NaiveDate,
    price: f64,
}

impl ParallelProvider {
    pub fn new(
        api_key: String,
        endpoint: Option<String>,
        mode: ProviderMode,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let auth = format!("Bearer {api_key}");
        headers.insert(
            header::AUTHORIZATION,
            auth.parse().context("invalid API key format")?,
        );

        let client = Client::builder()
            .timeout(timeout)
            .user_agent("SERPRadio/1.0 (pricing core)")
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            mode,
            batch_size: batch_size.max(1),
        })
    }

    async fn fetch_bulk(&self, queries: &[RouteQuery], cabin: Cabin) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        let url = format!("{}/v1/flights/search", self.endpoint);

        for chunk in queries.chunks(self.batch_size) {
            let body = SearchRequest {
                queries: chunk
                    .iter()
                    .map(|q| SearchQuery {
                        origin: q.origin.clone(),
                        destination: q.destination.clone(),
                        cabin: cabin.as_str().to_string(),
                        date_from: q.window.start,
                        date_to: q.window.end,
                    })
                    .collect(),
            };

            match send_with_retry(|| self.client.post(&url).json(&body), "parallel.search").await {
                Ok(response) => match response.json::<SearchResponse>().await {
                    Ok(parsed) => {
                        info!(
                            "📊 parallel: {} fares for {} queries",
                            parsed.results.len(),
                            chunk.len()
                        );
                        convert_rows(parsed.results, &mut outcome);
                    }
                    Err(err) => outcome.errors.push(FetchError::Permanent(format!(
                        "parallel.search: malformed response: {err}"
                    ))),
                },
                Err(err) => outcome.errors.push(err),
            }
        }
        outcome
    }

    async fn fetch_single(&self, queries: &[RouteQuery], cabin: Cabin) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        let url = format!("{}/v1/flights/quote", self.endpoint);

        let mut tasks: JoinSet<Result<SearchResponse, FetchError>> = JoinSet::new();
        for query in queries.iter().cloned() {
            let client = self.client.clone();
            let url = url.clone();
            let params = vec![
                ("origin".to_string(), query.origin.clone()),
                ("destination".to_string(), query.destination.clone()),
                ("cabin".to_string(), cabin.as_str().to_string()),
                ("date_from".to_string(), query.window.start.to_string()),
                ("date_to".to_string(), query.window.end.to_string()),
            ];
            tasks.spawn(async move {
                let response =
                    send_with_retry(|| client.get(&url).query(&params), "parallel.quote").await?;
                response.json::<SearchResponse>().await.map_err(|err| {
                    FetchError::Permanent(format!("parallel.quote: malformed response: {err}"))
                })
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(parsed)) => convert_rows(parsed.results, &mut outcome),
                Ok(Err(err)) => outcome.errors.push(err),
                Err(err) => outcome
                    .errors
                    .push(FetchError::Transient(format!("parallel.quote: {err}"))),
            }
        }
        outcome
    }
}

#[async_trait]
impl PriceProvider for ParallelProvider {
    fn identity(&self) -> &'static str {
        SOURCE
    }

    async fn fetch(&self, queries: &[RouteQuery], cabin: Cabin) -> FetchOutcome {
        match self.mode {
            ProviderMode::Bulk => self.fetch_bulk(queries, cabin).await,
            ProviderMode::Single => self.fetch_single(queries, cabin).await,
        }
    }
}

/// Translate provider rows into validated observations. Rows that fail
/// validation are dropped and tallied as permanent errors.
fn convert_rows(rows: Vec<FareRow>, outcome: &mut FetchOutcome) {
    let now = Utc::now();
    for row in rows {
        let cabin = match Cabin::from_str(&row.cabin) {
            Ok(cabin) => cabin,
            Err(err) => {
                warn!(origin = %row.origin, destination = %row.destination, "skipping fare: {err}");
                outcome
                    .errors
                    .push(FetchError::Permanent(format!("parallel: bad row: {err}")));
                continue;
            }
        };
        match PriceObservation::new(
            &row.origin,
            &row.destination,
            cabin,
            row.depart_date,
            row.price,
            SOURCE,
            now,
        ) {
            Ok(obs) => outcome.observations.push(obs),
            Err(err) => {
                warn!(origin = %row.origin, destination = %row.destination, "skipping fare: {err}");
                outcome
                    .errors
                    .push(FetchError::Permanent(format!("parallel: bad row: {err}")));
            }
        }
    }
}
