//! Append-only change ledger.
//!
//! The single source of truth for cooldowns and rollback state. Rows are
//! never updated except for the rollback-tracking columns, and never deleted.
//! A rollback is a new row pointing back at the original via `rollback_id`.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};
use tracing::info;

use crate::db::Db;
use crate::error::{AutopilotError, Result};
use crate::models::{
    ChangeMetadata, ChangeRecord, EntityKind, EntityRef, Lever, MatchType, RiskTier,
    RollbackStatus,
};

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id INTEGER NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    ad_group_id INTEGER,
    keyword_text TEXT,
    match_type TEXT,
    action_type TEXT NOT NULL,
    lever TEXT NOT NULL,
    old_value REAL NOT NULL,
    new_value REAL NOT NULL,
    change_pct REAL NOT NULL,
    rule_id TEXT NOT NULL,
    risk_tier TEXT NOT NULL,
    metadata TEXT NOT NULL,
    change_date TEXT NOT NULL,
    executed_at TEXT NOT NULL,
    approved_by TEXT,
    rollback_status TEXT,
    rollback_id INTEGER,
    monitoring_started_at TEXT,
    monitoring_completed_at TEXT,
    rollback_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_change_log_cooldown
    ON change_log(customer_id, entity_id, lever, change_date DESC);

CREATE INDEX IF NOT EXISTS idx_change_log_monitoring
    ON change_log(rollback_status, change_date DESC);

CREATE INDEX IF NOT EXISTS idx_change_log_customer_date
    ON change_log(customer_id, change_date DESC);
"#;

/// Everything a ledger row carries except its assigned id.
#[derive(Debug, Clone)]
pub struct NewChangeRecord {
    pub entity: EntityRef,
    pub action_type: String,
    pub lever: Lever,
    pub old_value: f64,
    pub new_value: f64,
    pub change_pct: f64,
    pub rule_id: String,
    pub risk_tier: RiskTier,
    pub metadata: ChangeMetadata,
    pub change_date: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub rollback_status: Option<RollbackStatus>,
    pub rollback_id: Option<i64>,
    pub monitoring_started_at: Option<DateTime<Utc>>,
}

/// A lever change as seen by cooldown checks. Pending entries (accepted
/// earlier in the same batch, not yet written) carry `change_id = 0`.
#[derive(Debug, Clone)]
pub struct LeverChange {
    pub change_id: i64,
    pub entity_id: i64,
    pub lever: Lever,
    pub change_date: DateTime<Utc>,
}

/// Point-in-time view of recent lever changes for one customer, taken at the
/// start of a batch and extended with in-batch accepts so two proposals in
/// the same batch cannot both pass cooldown on one entity-lever.
#[derive(Debug, Default, Clone)]
pub struct LedgerView {
    entries: Vec<LeverChange>,
}

impl LedgerView {
    pub fn new(entries: Vec<LeverChange>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Record an accept from the current batch.
    pub fn note_pending(&mut self, entity_id: i64, lever: Lever, change_date: DateTime<Utc>) {
        self.entries.push(LeverChange {
            change_id: 0,
            entity_id,
            lever,
            change_date,
        });
    }

    /// Most recent change on this entity-lever at or after `since`.
    /// Date ties break by `change_id` descending.
    pub fn last_change(
        &self,
        entity_id: i64,
        lever: Lever,
        since: DateTime<Utc>,
    ) -> Option<&LeverChange> {
        self.entries
            .iter()
            .filter(|e| e.entity_id == entity_id && e.lever == lever && e.change_date >= since)
            .max_by(|a, b| {
                a.change_date
                    .cmp(&b.change_date)
                    .then(a.change_id.cmp(&b.change_id))
            })
    }

    /// Most recent change on the same entity via any *other* lever.
    pub fn other_lever_change(
        &self,
        entity_id: i64,
        lever: Lever,
        since: DateTime<Utc>,
    ) -> Option<&LeverChange> {
        self.entries
            .iter()
            .filter(|e| e.entity_id == entity_id && e.lever != lever && e.change_date >= since)
            .max_by(|a, b| {
                a.change_date
                    .cmp(&b.change_date)
                    .then(a.change_id.cmp(&b.change_id))
            })
    }
}

pub struct ChangeLedger {
    conn: Db,
}

impl ChangeLedger {
    pub fn new(conn: Db) -> Self {
        Self { conn }
    }

    fn unavailable(err: impl std::fmt::Display) -> AutopilotError {
        AutopilotError::LedgerUnavailable(err.to_string())
    }

    /// Append one record, returning its assigned monotonic id.
    pub fn append(&self, record: NewChangeRecord) -> Result<i64> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(Self::unavailable)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO change_log \
                 (customer_id, entity_kind, entity_id, ad_group_id, keyword_text, match_type, \
                  action_type, lever, old_value, new_value, change_pct, rule_id, risk_tier, \
                  metadata, change_date, executed_at, approved_by, rollback_status, rollback_id, \
                  monitoring_started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20)",
            params![
                record.entity.customer_id,
                record.entity.entity_kind.as_str(),
                record.entity.entity_id,
                record.entity.ad_group_id,
                record.entity.keyword_text,
                record.entity.match_type.map(|m| m.as_str()),
                record.action_type,
                record.lever.as_str(),
                record.old_value,
                record.new_value,
                record.change_pct,
                record.rule_id,
                record.risk_tier.as_str(),
                metadata,
                record.change_date.to_rfc3339(),
                record.executed_at.to_rfc3339(),
                record.approved_by,
                record.rollback_status.map(|s| s.as_str()),
                record.rollback_id,
                record.monitoring_started_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(Self::unavailable)?;

        let change_id = conn.last_insert_rowid();
        info!(
            change_id,
            entity = %record.entity,
            lever = record.lever.as_str(),
            rule_id = %record.rule_id,
            "ledger append"
        );
        Ok(change_id)
    }

    /// Records on this entity-lever with `change_date >= since`, newest first
    /// (ties by id descending).
    pub fn query_cooldown(
        &self,
        customer_id: i64,
        entity_id: i64,
        lever: Lever,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {COLUMNS} FROM change_log \
                 WHERE customer_id = ?1 AND entity_id = ?2 AND lever = ?3 \
                   AND change_date >= ?4 \
                 ORDER BY change_date DESC, change_id DESC"
            ))
            .map_err(Self::unavailable)?;
        let rows = stmt
            .query_map(
                params![customer_id, entity_id, lever.as_str(), since.to_rfc3339()],
                row_to_record,
            )
            .map_err(Self::unavailable)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::unavailable)?;
        Ok(rows)
    }

    /// All lever changes for a customer since a horizon, for building a
    /// batch-stable [`LedgerView`].
    pub fn lever_changes_since(
        &self,
        customer_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<LeverChange>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT change_id, entity_id, lever, change_date FROM change_log \
                 WHERE customer_id = ?1 AND change_date >= ?2",
            )
            .map_err(Self::unavailable)?;
        let rows = stmt
            .query_map(params![customer_id, since.to_rfc3339()], |row| {
                let lever: String = row.get(2)?;
                let date: String = row.get(3)?;
                Ok(LeverChange {
                    change_id: row.get(0)?,
                    entity_id: row.get(1)?,
                    lever: Lever::parse(&lever).unwrap_or(Lever::Status),
                    change_date: parse_ts(&date),
                })
            })
            .map_err(Self::unavailable)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::unavailable)?;
        Ok(rows)
    }

    /// Records still under monitoring whose observation window has elapsed.
    pub fn due_for_monitoring(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<ChangeRecord>> {
        let cutoff = now - window;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {COLUMNS} FROM change_log \
                 WHERE rollback_status = 'monitoring' AND executed_at <= ?1 \
                 ORDER BY change_id"
            ))
            .map_err(Self::unavailable)?;
        let rows = stmt
            .query_map(params![cutoff.to_rfc3339()], row_to_record)
            .map_err(Self::unavailable)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::unavailable)?;
        Ok(rows)
    }

    /// Settle a monitored record. Only rows still in `monitoring` move;
    /// returns whether this call won the transition.
    pub fn mark_rollback_result(
        &self,
        change_id: i64,
        outcome: RollbackStatus,
        reason: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE change_log \
                 SET rollback_status = ?2, rollback_reason = ?3, monitoring_completed_at = ?4 \
                 WHERE change_id = ?1 AND rollback_status = 'monitoring'",
                params![
                    change_id,
                    outcome.as_str(),
                    reason,
                    completed_at.to_rfc3339()
                ],
            )
            .map_err(Self::unavailable)?;
        Ok(updated == 1)
    }

    pub fn get(&self, change_id: i64) -> Result<Option<ChangeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {COLUMNS} FROM change_log WHERE change_id = ?1"
            ))
            .map_err(Self::unavailable)?;
        stmt.query_row(params![change_id], row_to_record)
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Self::unavailable(other)),
            })
    }

    /// Recent entries for a customer, newest first.
    pub fn recent(&self, customer_id: i64, since: DateTime<Utc>) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {COLUMNS} FROM change_log \
                 WHERE customer_id = ?1 AND change_date >= ?2 \
                 ORDER BY change_date DESC, change_id DESC"
            ))
            .map_err(Self::unavailable)?;
        let rows = stmt
            .query_map(params![customer_id, since.to_rfc3339()], row_to_record)
            .map_err(Self::unavailable)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::unavailable)?;
        Ok(rows)
    }
}

const COLUMNS: &str = "change_id, customer_id, entity_kind, entity_id, ad_group_id, \
                       keyword_text, match_type, action_type, lever, old_value, new_value, \
                       change_pct, rule_id, risk_tier, metadata, change_date, executed_at, \
                       approved_by, rollback_status, rollback_id, monitoring_started_at, \
                       monitoring_completed_at, rollback_reason";

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    let entity_kind: String = row.get(2)?;
    let match_type: Option<String> = row.get(6)?;
    let lever: String = row.get(8)?;
    let risk_tier: String = row.get(13)?;
    let metadata: String = row.get(14)?;
    let change_date: String = row.get(15)?;
    let executed_at: String = row.get(16)?;
    let rollback_status: Option<String> = row.get(18)?;
    let monitoring_started_at: Option<String> = row.get(20)?;
    let monitoring_completed_at: Option<String> = row.get(21)?;

    Ok(ChangeRecord {
        change_id: row.get(0)?,
        entity: EntityRef {
            customer_id: row.get(1)?,
            entity_kind: EntityKind::parse(&entity_kind).unwrap_or(EntityKind::Campaign),
            entity_id: row.get(3)?,
            ad_group_id: row.get(4)?,
            keyword_text: row.get(5)?,
            match_type: match_type.as_deref().and_then(MatchType::parse),
        },
        action_type: row.get(7)?,
        lever: Lever::parse(&lever).unwrap_or(Lever::Status),
        old_value: row.get(9)?,
        new_value: row.get(10)?,
        change_pct: row.get(11)?,
        rule_id: row.get(12)?,
        risk_tier: RiskTier::parse(&risk_tier).unwrap_or(RiskTier::Low),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        change_date: parse_ts(&change_date),
        executed_at: parse_ts(&executed_at),
        approved_by: row.get(17)?,
        rollback_status: rollback_status.as_deref().and_then(RollbackStatus::parse),
        rollback_id: row.get(19)?,
        monitoring_started_at: monitoring_started_at.as_deref().map(parse_ts),
        monitoring_completed_at: monitoring_completed_at.as_deref().map(parse_ts),
        rollback_reason: row.get(22)?,
    })
}
