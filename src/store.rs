//! SQLite-backed observation store.
//!
//! All SQL for the pricing core lives here; the worker, aggregator,
//! evaluator, and emitter call these primitives and never touch the
//! connection directly.
//!
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching
//! - Batch upserts inside IMMEDIATE transactions

use crate::models::{
    Cabin, EventType, LeadTimePoint, NotificationEvent, PriceObservation, RouteBaseline, RouteKey,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Months, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Observations older than this never count as "current".
pub const CURRENT_LOW_WINDOW_HOURS: i64 = 24;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS price_observations (
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    cabin TEXT NOT NULL,
    depart_date TEXT NOT NULL,
    price REAL NOT NULL,
    source TEXT NOT NULL,
    observed_at INTEGER NOT NULL,
    PRIMARY KEY (origin, destination, cabin, depart_date, source, observed_at)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_observations_route_time
    ON price_observations(origin, destination, cabin, observed_at DESC);

CREATE TABLE IF NOT EXISTS route_baselines (
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    cabin TEXT NOT NULL,
    depart_month TEXT NOT NULL,
    p25_30d REAL NOT NULL,
    p50_30d REAL NOT NULL,
    p75_30d REAL NOT NULL,
    n_samples INTEGER NOT NULL,
    last_updated INTEGER NOT NULL,
    PRIMARY KEY (origin, destination, cabin, depart_month)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS lead_time_curves (
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    cabin TEXT NOT NULL,
    depart_month TEXT NOT NULL,
    lead_days INTEGER NOT NULL,
    q25 REAL NOT NULL,
    q50 REAL NOT NULL,
    q75 REAL NOT NULL,
    PRIMARY KEY (origin, destination, cabin, depart_month, lead_days)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS notification_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    cabin TEXT NOT NULL,
    depart_month TEXT NOT NULL,
    event_type TEXT NOT NULL,
    delta_pct REAL NOT NULL,
    price REAL NOT NULL,
    baseline_p50 REAL NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_key_time
    ON notification_events(origin, destination, cabin, depart_month, created_at DESC);
"#;

const BASELINE_COLUMNS: &str =
    "origin, destination, cabin, depart_month, p25_30d, p50_30d, p75_30d, n_samples, last_updated";

/// Result of one batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub replaced: usize,
}

impl UpsertStats {
    pub fn total(&self) -> usize {
        self.inserted + self.replaced
    }
}

/// Lowest recent fare for a route-month-cabin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentLow {
    pub price: f64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PriceStore {
    conn: Arc<Mutex<Connection>>,
}

impl PriceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "price store ready");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert a batch of observations atomically. Re-running the same batch
    /// replaces rows in place and never duplicates.
    pub fn upsert_observations(&self, observations: &[PriceObservation]) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();
        if observations.is_empty() {
            return Ok(stats);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut exists = tx.prepare_cached(
                "SELECT 1 FROM price_observations
                 WHERE origin = ?1 AND destination = ?2 AND cabin = ?3
                   AND depart_date = ?4 AND source = ?5 AND observed_at = ?6",
            )?;
            let mut upsert = tx.prepare_cached(
                "INSERT INTO price_observations
                     (origin, destination, cabin, depart_date, price, source, observed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(origin, destination, cabin, depart_date, source, observed_at)
                 DO UPDATE SET price = excluded.price",
            )?;

            for obs in observations {
                let depart_date = obs.depart_date.to_string();
                let observed_at = obs.observed_at.timestamp();
                if exists.exists(params![
                    obs.origin,
                    obs.destination,
                    obs.cabin.as_str(),
                    depart_date,
                    obs.source,
                    observed_at
                ])? {
                    stats.replaced += 1;
                } else {
                    stats.inserted += 1;
                }
                upsert.execute(params![
                    obs.origin,
                    obs.destination,
                    obs.cabin.as_str(),
                    depart_date,
                    obs.price,
                    obs.source,
                    observed_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(stats)
    }

    pub fn observation_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM price_observations", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Distinct (route, cabin, depart_month) groups with observations since
    /// the cutoff. Drives the aggregator's refresh.
    pub fn route_month_keys(&self, since: DateTime<Utc>) -> Result<Vec<RouteKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT origin, destination, cabin, substr(depart_date, 1, 7)
             FROM price_observations
             WHERE observed_at >= ?1
             ORDER BY origin, destination, cabin, 4",
        )?;
        let rows = stmt.query_map([since.timestamp()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut keys = Vec::new();
        for row in rows {
            let (origin, destination, cabin, ym) = row?;
            keys.push(RouteKey {
                origin,
                destination,
                cabin: Cabin::from_str(&cabin)?,
                depart_month: parse_month(&ym)?,
            });
        }
        Ok(keys)
    }

    /// Prices for one baseline group observed inside [from, to).
    pub fn range_query(
        &self,
        key: &RouteKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<f64>> {
        let (month_start, month_end) = month_bounds(key.depart_month)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT price FROM price_observations
             WHERE origin = ?1 AND destination = ?2 AND cabin = ?3
               AND depart_date >= ?4 AND depart_date < ?5
               AND observed_at >= ?6 AND observed_at < ?7",
        )?;
        let rows = stmt.query_map(
            params![
                key.origin,
                key.destination,
                key.cabin.as_str(),
                month_start,
                month_end,
                from.timestamp(),
                to.timestamp()
            ],
            |row| row.get::<_, f64>(0),
        )?;
        let mut prices = Vec::new();
        for row in rows {
            prices.push(row?);
        }
        Ok(prices)
    }

    /// Minimum recent price for a route-month-cabin, with the instant that
    /// low was last observed. "Recent" is the trailing 24 h window.
    pub fn current_low(&self, key: &RouteKey, now: DateTime<Utc>) -> Result<Option<CurrentLow>> {
        let (month_start, month_end) = month_bounds(key.depart_month)?;
        let cutoff = now - ChronoDuration::hours(CURRENT_LOW_WINDOW_HOURS);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT price, observed_at FROM price_observations
             WHERE origin = ?1 AND destination = ?2 AND cabin = ?3
               AND depart_date >= ?4 AND depart_date < ?5
               AND observed_at >= ?6
             ORDER BY price ASC, observed_at DESC
             LIMIT 1",
        )?;
        let row = stmt
            .query_row(
                params![
                    key.origin,
                    key.destination,
                    key.cabin.as_str(),
                    month_start,
                    month_end,
                    cutoff.timestamp()
                ],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        match row {
            Some((price, seen)) => Ok(Some(CurrentLow {
                price,
                last_seen: ts_to_datetime(seen)?,
            })),
            None => Ok(None),
        }
    }

    pub fn baseline(&self, key: &RouteKey) -> Result<Option<RouteBaseline>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {BASELINE_COLUMNS} FROM route_baselines
             WHERE origin = ?1 AND destination = ?2 AND cabin = ?3 AND depart_month = ?4"
        ))?;
        let row = stmt
            .query_row(
                params![
                    key.origin,
                    key.destination,
                    key.cabin.as_str(),
                    key.depart_month.to_string()
                ],
                baseline_row_tuple,
            )
            .optional()?;
        row.map(parse_baseline_row).transpose()
    }

    /// Baselines refreshed at or after the cutoff; the emitter's join input.
    pub fn fresh_baselines(&self, since: DateTime<Utc>) -> Result<Vec<RouteBaseline>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {BASELINE_COLUMNS} FROM route_baselines
             WHERE last_updated >= ?1
             ORDER BY origin, destination, cabin, depart_month"
        ))?;
        let rows = stmt.query_map([since.timestamp()], baseline_row_tuple)?;
        let mut baselines = Vec::new();
        for row in rows {
            baselines.push(parse_baseline_row(row?)?);
        }
        Ok(baselines)
    }

    /// Blocking rewrite of the whole aggregate in one transaction.
    pub fn replace_baselines(&self, rows: &[RouteBaseline]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM route_baselines", [])?;
        {
            let mut insert = tx.prepare_cached(&format!(
                "INSERT INTO route_baselines ({BASELINE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ))?;
            for row in rows {
                insert_baseline(&mut insert, row)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Concurrent rewrite: materialise into a staging table, then swap it in
    /// with one brief transaction. Readers see the prior aggregate until the
    /// swap commits.
    pub fn swap_baselines_staged(&self, rows: &[RouteBaseline]) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.execute_batch(
            "DROP TABLE IF EXISTS route_baselines_staged;
             CREATE TABLE route_baselines_staged (
                 origin TEXT NOT NULL,
                 destination TEXT NOT NULL,
                 cabin TEXT NOT NULL,
                 depart_month TEXT NOT NULL,
                 p25_30d REAL NOT NULL,
                 p50_30d REAL NOT NULL,
                 p75_30d REAL NOT NULL,
                 n_samples INTEGER NOT NULL,
                 last_updated INTEGER NOT NULL,
                 PRIMARY KEY (origin, destination, cabin, depart_month)
             ) WITHOUT ROWID;",
        )?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut insert = tx.prepare_cached(&format!(
                "INSERT INTO route_baselines_staged ({BASELINE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ))?;
            for row in rows {
                insert_baseline(&mut insert, row)?;
            }
        }
        tx.commit()?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "DROP TABLE route_baselines;
             ALTER TABLE route_baselines_staged RENAME TO route_baselines;",
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Seed or replace the lead-time curve for one key. Operator/test hook;
    /// the ingestion cycle never writes this table.
    pub fn replace_lead_time_curve(
        &self,
        key: &RouteKey,
        points: &[LeadTimePoint],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM lead_time_curves
             WHERE origin = ?1 AND destination = ?2 AND cabin = ?3 AND depart_month = ?4",
            params![
                key.origin,
                key.destination,
                key.cabin.as_str(),
                key.depart_month.to_string()
            ],
        )?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO lead_time_curves
                     (origin, destination, cabin, depart_month, lead_days, q25, q50, q75)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for point in points {
                insert.execute(params![
                    key.origin,
                    key.destination,
                    key.cabin.as_str(),
                    key.depart_month.to_string(),
                    point.lead_days,
                    point.q25,
                    point.q50,
                    point.q75
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Lead-time points for one key, ascending by lead_days.
    pub fn lead_time_curve(&self, key: &RouteKey) -> Result<Vec<LeadTimePoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT lead_days, q25, q50, q75 FROM lead_time_curves
             WHERE origin = ?1 AND destination = ?2 AND cabin = ?3 AND depart_month = ?4
             ORDER BY lead_days ASC",
        )?;
        let rows = stmt.query_map(
            params![
                key.origin,
                key.destination,
                key.cabin.as_str(),
                key.depart_month.to_string()
            ],
            |row| {
                Ok(LeadTimePoint {
                    lead_days: row.get(0)?,
                    q25: row.get(1)?,
                    q50: row.get(2)?,
                    q75: row.get(3)?,
                })
            },
        )?;
        let mut points = Vec::new();
        for row in rows {
            points.push(row?);
        }
        Ok(points)
    }

    /// Append one notification event; returns it with the assigned id.
    pub fn insert_notification(&self, event: &NotificationEvent) -> Result<NotificationEvent> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO notification_events
                 (origin, destination, cabin, depart_month, event_type,
                  delta_pct, price, baseline_p50, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.origin,
                event.destination,
                event.cabin.as_str(),
                event.depart_month.to_string(),
                event.event_type.as_str(),
                event.delta_pct,
                event.price,
                event.baseline_p50,
                event.created_at.timestamp()
            ],
        )?;
        let mut stored = event.clone();
        stored.id = Some(conn.last_insert_rowid());
        Ok(stored)
    }

    /// True when a price_drop event for the key exists at or after the cutoff.
    pub fn has_recent_drop_event(&self, key: &RouteKey, since: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM notification_events
             WHERE origin = ?1 AND destination = ?2 AND cabin = ?3 AND depart_month = ?4
               AND event_type = ?5 AND created_at >= ?6
             LIMIT 1",
        )?;
        let found = stmt.exists(params![
            key.origin,
            key.destination,
            key.cabin.as_str(),
            key.depart_month.to_string(),
            EventType::PriceDrop.as_str(),
            since.timestamp()
        ])?;
        Ok(found)
    }

    /// Newest events first. The polling hook for downstream consumers.
    pub fn recent_notifications(&self, limit: usize) -> Result<Vec<NotificationEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, origin, destination, cabin, depart_month, event_type,
                    delta_pct, price, baseline_p50, created_at
             FROM notification_events
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, f64>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, origin, destination, cabin, month, event_type, delta_pct, price, p50, created) =
                row?;
            events.push(NotificationEvent {
                id: Some(id),
                origin,
                destination,
                cabin: Cabin::from_str(&cabin)?,
                depart_month: NaiveDate::parse_from_str(&month, "%Y-%m-%d")
                    .context("bad depart_month in notification_events")?,
                event_type: EventType::from_str(&event_type)?,
                delta_pct,
                price,
                baseline_p50: p50,
                created_at: ts_to_datetime(created)?,
            });
        }
        Ok(events)
    }
}

type BaselineRowTuple = (String, String, String, String, f64, f64, f64, i64, i64);

fn baseline_row_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<BaselineRowTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn parse_baseline_row(raw: BaselineRowTuple) -> Result<RouteBaseline> {
    let (origin, destination, cabin, month, p25, p50, p75, n_samples, updated) = raw;
    Ok(RouteBaseline {
        origin,
        destination,
        cabin: Cabin::from_str(&cabin)?,
        depart_month: NaiveDate::parse_from_str(&month, "%Y-%m-%d")
            .context("bad depart_month in route_baselines")?,
        p25_30d: p25,
        p50_30d: p50,
        p75_30d: p75,
        n_samples,
        last_updated: ts_to_datetime(updated)?,
    })
}

fn insert_baseline(
    stmt: &mut rusqlite::CachedStatement<'_>,
    row: &RouteBaseline,
) -> Result<()> {
    stmt.execute(params![
        row.origin,
        row.destination,
        row.cabin.as_str(),
        row.depart_month.to_string(),
        row.p25_30d,
        row.p50_30d,
        row.p75_30d,
        row.n_samples,
        row.last_updated.timestamp()
    ])?;
    Ok(())
}

fn month_bounds(month: NaiveDate) -> Result<(String, String)> {
    let next = month
        .checked_add_months(Months::new(1))
        .context("month out of range")?;
    Ok((month.to_string(), next.to_string()))
}

fn parse_month(ym: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{ym}-01"), "%Y-%m-%d")
        .with_context(|| format!("bad year-month '{ym}'"))
}

fn ts_to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0).context("timestamp out of range")
}
