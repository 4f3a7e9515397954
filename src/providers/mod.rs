//! Flight-price provider adapters.
//!
//! Every provider sits behind the [`PriceProvider`] capability trait;
//! selection happens once at startup via [`build`], keyed by the
//! `PRICE_SOURCE` configuration value. Providers return partial results
//! plus a non-fatal error summary so the worker can decide whether to
//! continue a cycle.

pub mod http;
pub mod parallel;
pub mod sample;
pub mod xapi;

pub use parallel::ParallelProvider;
pub use sample::SampleProvider;
pub use xapi::XapiProvider;

use crate::models::{Cabin, Config, PriceObservation};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Inclusive span of candidate departure dates, typically one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartureWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DepartureWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            bail!("departure window starts {start} after it ends {end}");
        }
        Ok(Self { start, end })
    }
}

/// One (origin, destination, window) triple submitted to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteQuery {
    pub origin: String,
    pub destination: String,
    pub window: DepartureWindow,
}

/// Upstream failure, split by how the adapter handled it.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Retried with backoff before being reported: network errors,
    /// timeouts, 5xx, and 429.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Reported immediately without retry: other 4xx and schema mismatches.
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Observations gathered so far plus the errors hit along the way.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub observations: Vec<PriceObservation>,
    pub errors: Vec<FetchError>,
}

impl FetchOutcome {
    pub fn transient_errors(&self) -> usize {
        self.errors.iter().filter(|e| e.is_transient()).count()
    }

    pub fn permanent_errors(&self) -> usize {
        self.errors.len() - self.transient_errors()
    }
}

/// Capability boundary for fare sources.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Short identity recorded as the `source` of every observation.
    fn identity(&self) -> &'static str;

    /// Fetch fares for a batch of route queries in one cabin.
    async fn fetch(&self, queries: &[RouteQuery], cabin: Cabin) -> FetchOutcome;
}

/// Build the configured provider. Unknown sources and missing credentials
/// are startup-fatal.
pub fn build(config: &Config) -> Result<Arc<dyn PriceProvider>> {
    match config.price_source.as_str() {
        "parallel" => {
            let api_key = config
                .provider_api_key
                .clone()
                .context("PROVIDER_API_KEY is required when PRICE_SOURCE=parallel")?;
            Ok(Arc::new(ParallelProvider::new(
                api_key,
                config.provider_endpoint.clone(),
                config.provider_mode,
                config.provider_batch_size,
                config.provider_timeout,
            )?))
        }
        "xapi" => {
            let api_key = config
                .provider_api_key
                .clone()
                .context("PROVIDER_API_KEY is required when PRICE_SOURCE=xapi")?;
            Ok(Arc::new(XapiProvider::new(
                api_key,
                config.provider_endpoint.clone(),
                config.provider_mode,
                config.provider_timeout,
            )?))
        }
        "sample" => Ok(Arc::new(SampleProvider::new())),
        other => bail!("unknown PRICE_SOURCE '{other}' (expected parallel, xapi, or sample)"),
    }
}
