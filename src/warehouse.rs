//! Read-only handle over the analytical store.
//!
//! The ingestion collaborator writes one `snap_*_daily` table per entity
//! kind; this module serves windowed aggregates from them. All reads are
//! side-effect-free. A failed read surfaces as `WarehouseUnavailable` and is
//! never retried at this layer.

use chrono::NaiveDate;
use rusqlite::params;
use std::collections::BTreeMap;

use crate::db::Db;
use crate::error::{AutopilotError, Result};
use crate::models::{
    EntityKind, EntityRef, EntityState, EntityStatus, EntityWithMetrics, Lever, MatchType,
    MetricRow, WindowedMetrics,
};

/// Snapshot tables share a column layout; only the name of the id column
/// differs. Columns that do not apply to a kind stay NULL.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snap_campaign_daily (
    customer_id INTEGER NOT NULL,
    campaign_id INTEGER NOT NULL,
    ad_group_id INTEGER,
    keyword_text TEXT,
    match_type TEXT,
    status TEXT NOT NULL DEFAULT 'ENABLED',
    bid REAL,
    budget REAL,
    snapshot_date TEXT NOT NULL,
    impressions INTEGER NOT NULL DEFAULT 0,
    clicks INTEGER NOT NULL DEFAULT 0,
    cost REAL NOT NULL DEFAULT 0,
    conversions REAL NOT NULL DEFAULT 0,
    conversions_value REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (customer_id, campaign_id, snapshot_date)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snap_campaign_date
    ON snap_campaign_daily(customer_id, snapshot_date DESC);

CREATE TABLE IF NOT EXISTS snap_ad_group_daily (
    customer_id INTEGER NOT NULL,
    ad_group_id INTEGER NOT NULL,
    parent_ad_group_id INTEGER,
    keyword_text TEXT,
    match_type TEXT,
    status TEXT NOT NULL DEFAULT 'ENABLED',
    bid REAL,
    budget REAL,
    snapshot_date TEXT NOT NULL,
    impressions INTEGER NOT NULL DEFAULT 0,
    clicks INTEGER NOT NULL DEFAULT 0,
    cost REAL NOT NULL DEFAULT 0,
    conversions REAL NOT NULL DEFAULT 0,
    conversions_value REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (customer_id, ad_group_id, snapshot_date)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snap_ad_group_date
    ON snap_ad_group_daily(customer_id, snapshot_date DESC);

CREATE TABLE IF NOT EXISTS snap_keyword_daily (
    customer_id INTEGER NOT NULL,
    criterion_id INTEGER NOT NULL,
    ad_group_id INTEGER,
    keyword_text TEXT,
    match_type TEXT,
    status TEXT NOT NULL DEFAULT 'ENABLED',
    bid REAL,
    budget REAL,
    snapshot_date TEXT NOT NULL,
    impressions INTEGER NOT NULL DEFAULT 0,
    clicks INTEGER NOT NULL DEFAULT 0,
    cost REAL NOT NULL DEFAULT 0,
    conversions REAL NOT NULL DEFAULT 0,
    conversions_value REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (customer_id, criterion_id, snapshot_date)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snap_keyword_date
    ON snap_keyword_daily(customer_id, snapshot_date DESC);

CREATE TABLE IF NOT EXISTS snap_ad_daily (
    customer_id INTEGER NOT NULL,
    ad_id INTEGER NOT NULL,
    ad_group_id INTEGER,
    keyword_text TEXT,
    match_type TEXT,
    status TEXT NOT NULL DEFAULT 'ENABLED',
    bid REAL,
    budget REAL,
    snapshot_date TEXT NOT NULL,
    impressions INTEGER NOT NULL DEFAULT 0,
    clicks INTEGER NOT NULL DEFAULT 0,
    cost REAL NOT NULL DEFAULT 0,
    conversions REAL NOT NULL DEFAULT 0,
    conversions_value REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (customer_id, ad_id, snapshot_date)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snap_ad_date
    ON snap_ad_daily(customer_id, snapshot_date DESC);

CREATE TABLE IF NOT EXISTS snap_product_daily (
    customer_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    ad_group_id INTEGER,
    keyword_text TEXT,
    match_type TEXT,
    status TEXT NOT NULL DEFAULT 'ENABLED',
    bid REAL,
    budget REAL,
    snapshot_date TEXT NOT NULL,
    impressions INTEGER NOT NULL DEFAULT 0,
    clicks INTEGER NOT NULL DEFAULT 0,
    cost REAL NOT NULL DEFAULT 0,
    conversions REAL NOT NULL DEFAULT 0,
    conversions_value REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (customer_id, product_id, snapshot_date)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snap_product_date
    ON snap_product_daily(customer_id, snapshot_date DESC);
"#;

const DATE_FMT: &str = "%Y-%m-%d";

fn kind_table(kind: EntityKind) -> (&'static str, &'static str) {
    match kind {
        EntityKind::Campaign => ("snap_campaign_daily", "campaign_id"),
        EntityKind::AdGroup => ("snap_ad_group_daily", "ad_group_id"),
        EntityKind::Keyword => ("snap_keyword_daily", "criterion_id"),
        EntityKind::Ad => ("snap_ad_daily", "ad_id"),
        EntityKind::Product => ("snap_product_daily", "product_id"),
    }
}

/// Seam between the engines and the analytical store. Production uses
/// [`SqliteWarehouse`]; tests run the same implementation over a scratch db.
pub trait Warehouse: Send + Sync {
    /// All entities of a kind with 7-day and 30-day windows ending at
    /// `snapshot_date`.
    fn get_entity_window(
        &self,
        kind: EntityKind,
        customer_id: i64,
        snapshot_date: NaiveDate,
    ) -> Result<Vec<EntityWithMetrics>>;

    /// Daily rows for one entity over an inclusive date range.
    fn get_entity_metrics_between(
        &self,
        kind: EntityKind,
        customer_id: i64,
        entity_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MetricRow>>;

    /// Latest known attributes of an entity, for the staleness guardrail.
    fn current_state(&self, entity: &EntityRef) -> Result<Option<EntityState>>;
}

impl dyn Warehouse {
    /// Current value of the lever under change, read fresh from the store.
    pub fn current_value(&self, entity: &EntityRef, lever: Lever) -> Result<Option<f64>> {
        let state = match self.current_state(entity)? {
            Some(state) => state,
            None => return Ok(None),
        };
        Ok(match lever {
            Lever::Bid => state.bid,
            Lever::Budget => state.budget,
            // Status levers compare against the serving state; encoded as
            // 1.0 for ENABLED so a paused entity reads differently.
            Lever::Status => Some(if state.status == EntityStatus::Enabled {
                1.0
            } else {
                0.0
            }),
        })
    }
}

pub struct SqliteWarehouse {
    conn: Db,
}

struct SnapshotRow {
    entity_id: i64,
    ad_group_id: Option<i64>,
    keyword_text: Option<String>,
    match_type: Option<String>,
    status: String,
    bid: Option<f64>,
    budget: Option<f64>,
    metric: MetricRow,
}

impl SqliteWarehouse {
    pub fn new(conn: Db) -> Self {
        Self { conn }
    }

    fn unavailable(err: impl std::fmt::Display) -> AutopilotError {
        AutopilotError::WarehouseUnavailable(err.to_string())
    }

    fn fetch_range(
        &self,
        kind: EntityKind,
        customer_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SnapshotRow>> {
        let (table, id_col) = kind_table(kind);
        let ad_group_col = if kind == EntityKind::AdGroup {
            "parent_ad_group_id"
        } else {
            "ad_group_id"
        };
        let sql = format!(
            "SELECT {id_col}, {ad_group_col}, keyword_text, match_type, status, bid, budget, \
                    snapshot_date, impressions, clicks, cost, conversions, conversions_value \
             FROM {table} \
             WHERE customer_id = ?1 AND snapshot_date >= ?2 AND snapshot_date <= ?3 \
             ORDER BY {id_col}, snapshot_date"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(Self::unavailable)?;
        let rows = stmt
            .query_map(
                params![
                    customer_id,
                    start.format(DATE_FMT).to_string(),
                    end.format(DATE_FMT).to_string()
                ],
                |row| {
                    let date: String = row.get(7)?;
                    Ok(SnapshotRow {
                        entity_id: row.get(0)?,
                        ad_group_id: row.get(1)?,
                        keyword_text: row.get(2)?,
                        match_type: row.get(3)?,
                        status: row.get(4)?,
                        bid: row.get(5)?,
                        budget: row.get(6)?,
                        metric: MetricRow {
                            snapshot_date: NaiveDate::parse_from_str(&date, DATE_FMT)
                                .unwrap_or_default(),
                            impressions: row.get::<_, i64>(8)? as u64,
                            clicks: row.get::<_, i64>(9)? as u64,
                            cost: row.get(10)?,
                            conversions: row.get(11)?,
                            conversions_value: row.get(12)?,
                        },
                    })
                },
            )
            .map_err(Self::unavailable)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::unavailable)?;
        Ok(rows)
    }
}

impl Warehouse for SqliteWarehouse {
    fn get_entity_window(
        &self,
        kind: EntityKind,
        customer_id: i64,
        snapshot_date: NaiveDate,
    ) -> Result<Vec<EntityWithMetrics>> {
        let start = snapshot_date - chrono::Duration::days(29);
        let rows = self.fetch_range(kind, customer_id, start, snapshot_date)?;
        let d7_start = snapshot_date - chrono::Duration::days(6);

        // Group by entity, keeping the newest row's attributes as current.
        let mut grouped: BTreeMap<i64, (SnapshotRow, WindowedMetrics)> = BTreeMap::new();
        for row in rows {
            let entry = grouped.entry(row.entity_id).or_insert_with(|| {
                (
                    SnapshotRow {
                        entity_id: row.entity_id,
                        ad_group_id: None,
                        keyword_text: None,
                        match_type: None,
                        status: "ENABLED".to_string(),
                        bid: None,
                        budget: None,
                        metric: row.metric.clone(),
                    },
                    WindowedMetrics {
                        snapshot_date: Some(snapshot_date),
                        ..WindowedMetrics::default()
                    },
                )
            });
            entry.1.d30.accumulate(&row.metric);
            if row.metric.snapshot_date >= d7_start {
                entry.1.d7.accumulate(&row.metric);
            }
            // Rows arrive date-ascending, so the last one wins as "current".
            if row.metric.snapshot_date >= entry.0.metric.snapshot_date {
                entry.0 = row;
            }
        }

        Ok(grouped
            .into_values()
            .map(|(latest, window)| EntityWithMetrics {
                entity: EntityRef {
                    customer_id,
                    entity_kind: kind,
                    entity_id: latest.entity_id,
                    ad_group_id: latest.ad_group_id,
                    match_type: latest.match_type.as_deref().and_then(MatchType::parse),
                    keyword_text: latest.keyword_text,
                },
                state: EntityState {
                    status: EntityStatus::parse(&latest.status).unwrap_or(EntityStatus::Enabled),
                    bid: latest.bid,
                    budget: latest.budget,
                },
                window,
            })
            .collect())
    }

    fn get_entity_metrics_between(
        &self,
        kind: EntityKind,
        customer_id: i64,
        entity_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MetricRow>> {
        let (table, id_col) = kind_table(kind);
        let sql = format!(
            "SELECT snapshot_date, impressions, clicks, cost, conversions, conversions_value \
             FROM {table} \
             WHERE customer_id = ?1 AND {id_col} = ?2 \
               AND snapshot_date >= ?3 AND snapshot_date <= ?4 \
             ORDER BY snapshot_date"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(Self::unavailable)?;
        let rows = stmt
            .query_map(
                params![
                    customer_id,
                    entity_id,
                    start.format(DATE_FMT).to_string(),
                    end.format(DATE_FMT).to_string()
                ],
                |row| {
                    let date: String = row.get(0)?;
                    Ok(MetricRow {
                        snapshot_date: NaiveDate::parse_from_str(&date, DATE_FMT)
                            .unwrap_or_default(),
                        impressions: row.get::<_, i64>(1)? as u64,
                        clicks: row.get::<_, i64>(2)? as u64,
                        cost: row.get(3)?,
                        conversions: row.get(4)?,
                        conversions_value: row.get(5)?,
                    })
                },
            )
            .map_err(Self::unavailable)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::unavailable)?;
        Ok(rows)
    }

    fn current_state(&self, entity: &EntityRef) -> Result<Option<EntityState>> {
        let (table, id_col) = kind_table(entity.entity_kind);
        let sql = format!(
            "SELECT status, bid, budget FROM {table} \
             WHERE customer_id = ?1 AND {id_col} = ?2 \
             ORDER BY snapshot_date DESC LIMIT 1"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(Self::unavailable)?;
        let state = stmt
            .query_row(params![entity.customer_id, entity.entity_id], |row| {
                let status: String = row.get(0)?;
                Ok(EntityState {
                    status: EntityStatus::parse(&status).unwrap_or(EntityStatus::Enabled),
                    bid: row.get(1)?,
                    budget: row.get(2)?,
                })
            })
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Self::unavailable(other)),
            })?;
        Ok(state)
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Seeding helpers shared by unit tests.

    use super::*;
    use rusqlite::params;

    pub struct SeedRow<'a> {
        pub kind: EntityKind,
        pub customer_id: i64,
        pub entity_id: i64,
        pub date: NaiveDate,
        pub status: &'a str,
        pub bid: Option<f64>,
        pub budget: Option<f64>,
        pub impressions: i64,
        pub clicks: i64,
        pub cost: f64,
        pub conversions: f64,
        pub conversions_value: f64,
    }

    pub fn seed(conn: &Db, row: &SeedRow<'_>) {
        let (table, id_col) = kind_table(row.kind);
        let sql = format!(
            "INSERT OR REPLACE INTO {table} \
                 (customer_id, {id_col}, status, bid, budget, snapshot_date, \
                  impressions, clicks, cost, conversions, conversions_value) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        );
        conn.lock()
            .execute(
                &sql,
                params![
                    row.customer_id,
                    row.entity_id,
                    row.status,
                    row.bid,
                    row.budget,
                    row.date.format(DATE_FMT).to_string(),
                    row.impressions,
                    row.clicks,
                    row.cost,
                    row.conversions,
                    row.conversions_value,
                ],
            )
            .expect("seed snapshot row");
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::{seed, SeedRow};
    use super::*;
    use crate::db;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn seed_day(conn: &Db, entity_id: i64, day: NaiveDate, clicks: i64, cost: f64) {
        seed(
            conn,
            &SeedRow {
                kind: EntityKind::Keyword,
                customer_id: 9_999_999_999,
                entity_id,
                date: day,
                status: "ENABLED",
                bid: Some(1.0),
                budget: None,
                impressions: clicks * 20,
                clicks,
                cost,
                conversions: clicks as f64 / 10.0,
                conversions_value: cost * 3.0,
            },
        );
    }

    #[test]
    fn windows_split_7_and_30_days() {
        let conn = db::open_in_memory().unwrap();
        let snapshot = date(2025, 6, 30);
        // 10 days of history: 3 inside the 7-day window tail, all inside 30.
        for offset in 0..10 {
            seed_day(
                &conn,
                3005,
                snapshot - chrono::Duration::days(offset),
                10,
                5.0,
            );
        }

        let warehouse = SqliteWarehouse::new(conn);
        let entities = warehouse
            .get_entity_window(EntityKind::Keyword, 9_999_999_999, snapshot)
            .unwrap();
        assert_eq!(entities.len(), 1);
        let window = &entities[0].window;
        assert_eq!(window.d30.clicks, 100);
        assert_eq!(window.d7.clicks, 70);
        assert!((window.d30.cost - 50.0).abs() < 1e-9);
    }

    #[test]
    fn current_state_reads_latest_snapshot() {
        let conn = db::open_in_memory().unwrap();
        seed_day(&conn, 3005, date(2025, 6, 29), 5, 2.0);
        seed(
            &conn,
            &SeedRow {
                kind: EntityKind::Keyword,
                customer_id: 9_999_999_999,
                entity_id: 3005,
                date: date(2025, 6, 30),
                status: "ENABLED",
                bid: Some(1.25),
                budget: None,
                impressions: 0,
                clicks: 0,
                cost: 0.0,
                conversions: 0.0,
                conversions_value: 0.0,
            },
        );

        let warehouse = SqliteWarehouse::new(conn);
        let entity = EntityRef::new(9_999_999_999, EntityKind::Keyword, 3005);
        let state = warehouse.current_state(&entity).unwrap().unwrap();
        assert_eq!(state.bid, Some(1.25));

        let missing = EntityRef::new(9_999_999_999, EntityKind::Keyword, 4242);
        assert!(warehouse.current_state(&missing).unwrap().is_none());
    }

    #[test]
    fn metrics_between_is_inclusive_and_ordered() {
        let conn = db::open_in_memory().unwrap();
        for offset in 0..5 {
            seed_day(
                &conn,
                3005,
                date(2025, 6, 30) - chrono::Duration::days(offset),
                offset + 1,
                1.0,
            );
        }

        let warehouse = SqliteWarehouse::new(conn);
        let rows = warehouse
            .get_entity_metrics_between(
                EntityKind::Keyword,
                9_999_999_999,
                3005,
                date(2025, 6, 27),
                date(2025, 6, 29),
            )
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].snapshot_date < w[1].snapshot_date));
    }
}
