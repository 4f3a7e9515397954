//! Deal evaluation probe.
//!
//! Queries the evaluator against an existing database and prints the full
//! JSON record. Handy for checking what the HTTP surface would serve
//! without standing anything up.
//!
//! Usage:
//!   deal_probe --database ./serpradio.db JFK MIA 3 --cabin economy

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use serpradio_backend::models::Cabin;
use serpradio_backend::{DealEvaluator, PriceStore};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "deal_probe")]
#[command(about = "Evaluate one route-month against the price store")]
struct Args {
    /// Path to the SQLite database
    #[arg(long, env = "DATABASE_PATH", default_value = "./serpradio.db")]
    database: String,

    /// Origin airport code
    origin: String,

    /// Destination airport code
    destination: String,

    /// Departure month number (1-12), resolved to the next future occurrence
    month: u32,

    /// Cabin: economy, premium, business, or first
    #[arg(long, default_value = "economy")]
    cabin: Cabin,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let store = Arc::new(PriceStore::open(&args.database)?);
    let evaluator = DealEvaluator::new(store);
    let record = evaluator.evaluate(
        &args.origin,
        &args.destination,
        args.month,
        args.cabin,
        Utc::now(),
    )?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
