//! SERPRadio pricing-intelligence core.
//!
//! Ingests flight-price observations from third-party pricing APIs,
//! maintains rolling percentile baselines per route, and answers
//! "is this a good deal right now, and when should I book?" with an
//! explainable BUY/TRACK/WAIT recommendation.

pub mod baseline;
pub mod evaluator;
pub mod models;
pub mod notify;
pub mod providers;
pub mod store;
pub mod worker;

pub use baseline::BaselineAggregator;
pub use evaluator::DealEvaluator;
pub use models::Config;
pub use notify::NotificationEmitter;
pub use store::PriceStore;
pub use worker::IngestionWorker;
