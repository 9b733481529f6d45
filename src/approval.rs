//! Approval store for recommendations.
//!
//! Holds every proposal the engine emits and enforces the legal status
//! transitions. Updates are compare-and-set on the current status so a racing
//! approve/reject cannot skip a state.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Row};
use tracing::info;

use crate::db::Db;
use crate::error::{AutopilotError, Result};
use crate::models::{
    Action, EntityKind, EntityRef, Lever, MatchType, Recommendation, RecommendationStatus,
    RiskTier,
};

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS recommendations (
    recommendation_id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    customer_id INTEGER NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    ad_group_id INTEGER,
    keyword_text TEXT,
    match_type TEXT,
    action TEXT NOT NULL,
    lever TEXT NOT NULL,
    old_value REAL NOT NULL,
    new_value REAL NOT NULL,
    change_pct REAL NOT NULL,
    risk_tier TEXT NOT NULL,
    confidence REAL NOT NULL,
    evidence TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    status TEXT NOT NULL,
    snapshot_date TEXT NOT NULL,
    created_at TEXT NOT NULL,
    decided_at TEXT,
    approved_by TEXT,
    failure_reason TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_recommendations_status
    ON recommendations(status, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_recommendations_run
    ON recommendations(customer_id, snapshot_date, status);
"#;

/// Optional filters for `list`.
#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub status: Option<RecommendationStatus>,
    pub customer_id: Option<i64>,
    pub snapshot_date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

pub struct ApprovalStore {
    conn: Db,
}

impl ApprovalStore {
    pub fn new(conn: Db) -> Self {
        Self { conn }
    }

    fn unavailable(err: impl std::fmt::Display) -> AutopilotError {
        AutopilotError::StoreUnavailable(err.to_string())
    }

    pub fn create(&self, rec: &Recommendation) -> Result<()> {
        let conn = self.conn.lock();
        insert(&conn, rec).map_err(Self::unavailable)
    }

    /// Replace the prior PENDING set for `(customer_id, snapshot_date)` in one
    /// transaction. Rows in any other status are untouched, which keeps
    /// regeneration idempotent without losing decisions already made.
    pub fn replace_pending(
        &self,
        customer_id: i64,
        snapshot_date: NaiveDate,
        recs: &[Recommendation],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Self::unavailable)?;
        tx.execute(
            "DELETE FROM recommendations \
             WHERE customer_id = ?1 AND snapshot_date = ?2 AND status = 'PENDING'",
            params![customer_id, snapshot_date.to_string()],
        )
        .map_err(Self::unavailable)?;
        for rec in recs {
            insert(&tx, rec).map_err(Self::unavailable)?;
        }
        tx.commit().map_err(Self::unavailable)?;
        info!(customer_id, %snapshot_date, count = recs.len(), "pending set replaced");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Recommendation> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {COLUMNS} FROM recommendations WHERE recommendation_id = ?1"
            ))
            .map_err(Self::unavailable)?;
        stmt.query_row(params![id], row_to_recommendation)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => {
                    Err(AutopilotError::NotFound(id.to_string()))
                }
                other => Err(Self::unavailable(other)),
            })
    }

    pub fn approve(&self, id: &str, approver: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(
            id,
            RecommendationStatus::Pending,
            RecommendationStatus::Approved,
            Some(approver),
            None,
            now,
        )
    }

    pub fn reject(&self, id: &str, approver: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(
            id,
            RecommendationStatus::Pending,
            RecommendationStatus::Rejected,
            Some(approver),
            Some(reason),
            now,
        )
    }

    pub fn mark_executed(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(
            id,
            RecommendationStatus::Approved,
            RecommendationStatus::Executed,
            None,
            None,
            now,
        )
    }

    pub fn mark_failed(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(
            id,
            RecommendationStatus::Approved,
            RecommendationStatus::Failed,
            None,
            Some(reason),
            now,
        )
    }

    fn transition(
        &self,
        id: &str,
        from: RecommendationStatus,
        to: RecommendationStatus,
        approver: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        debug_assert!(from.can_transition_to(to));

        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE recommendations \
                 SET status = ?2, decided_at = ?3, \
                     approved_by = COALESCE(?4, approved_by), \
                     failure_reason = COALESCE(?5, failure_reason) \
                 WHERE recommendation_id = ?1 AND status = ?6",
                params![id, to.as_str(), now.to_rfc3339(), approver, reason, from.as_str()],
            )
            .map_err(Self::unavailable)?;

        if updated == 1 {
            return Ok(());
        }

        // Figure out why: missing row vs illegal transition.
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM recommendations WHERE recommendation_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Self::unavailable(other)),
            })?;

        match current.as_deref().and_then(RecommendationStatus::parse) {
            None => Err(AutopilotError::NotFound(id.to_string())),
            Some(actual) => Err(AutopilotError::IllegalTransition { from: actual, to }),
        }
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Recommendation>> {
        let mut sql = format!("SELECT {COLUMNS} FROM recommendations WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(customer_id) = filter.customer_id {
            args.push(Box::new(customer_id));
            sql.push_str(&format!(" AND customer_id = ?{}", args.len()));
        }
        if let Some(snapshot_date) = filter.snapshot_date {
            args.push(Box::new(snapshot_date.to_string()));
            sql.push_str(&format!(" AND snapshot_date = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, recommendation_id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(Self::unavailable)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                row_to_recommendation,
            )
            .map_err(Self::unavailable)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::unavailable)?;
        Ok(rows)
    }

    /// Expire PENDING proposals older than the TTL. Returns how many moved.
    pub fn expire_overdue(&self, now: DateTime<Utc>, ttl: Duration) -> Result<usize> {
        let cutoff = now - ttl;
        let conn = self.conn.lock();
        let expired = conn
            .execute(
                "UPDATE recommendations \
                 SET status = 'EXPIRED', decided_at = ?1 \
                 WHERE status = 'PENDING' AND created_at < ?2",
                params![now.to_rfc3339(), cutoff.to_rfc3339()],
            )
            .map_err(Self::unavailable)?;
        if expired > 0 {
            info!(expired, "pending recommendations expired");
        }
        Ok(expired)
    }
}

const COLUMNS: &str = "recommendation_id, rule_id, customer_id, entity_kind, entity_id, \
                       ad_group_id, keyword_text, match_type, action, lever, old_value, \
                       new_value, change_pct, risk_tier, confidence, evidence, reasoning, \
                       status, snapshot_date, created_at, decided_at, approved_by, \
                       failure_reason";

fn insert(conn: &rusqlite::Connection, rec: &Recommendation) -> rusqlite::Result<()> {
    let action = serde_json::to_string(&rec.action)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let evidence = serde_json::to_string(&rec.evidence)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        &format!(
            "INSERT INTO recommendations ({COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
        ),
        params![
            rec.recommendation_id,
            rec.rule_id,
            rec.entity.customer_id,
            rec.entity.entity_kind.as_str(),
            rec.entity.entity_id,
            rec.entity.ad_group_id,
            rec.entity.keyword_text,
            rec.entity.match_type.map(|m| m.as_str()),
            action,
            rec.lever.as_str(),
            rec.old_value,
            rec.new_value,
            rec.change_pct,
            rec.risk_tier.as_str(),
            rec.confidence,
            evidence,
            rec.reasoning,
            rec.status.as_str(),
            rec.snapshot_date.to_string(),
            rec.created_at.to_rfc3339(),
            rec.decided_at.map(|t| t.to_rfc3339()),
            rec.approved_by,
            rec.failure_reason,
        ],
    )?;
    Ok(())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn row_to_recommendation(row: &Row<'_>) -> rusqlite::Result<Recommendation> {
    let entity_kind: String = row.get(3)?;
    let match_type: Option<String> = row.get(7)?;
    let action: String = row.get(8)?;
    let lever: String = row.get(9)?;
    let risk_tier: String = row.get(13)?;
    let evidence: String = row.get(15)?;
    let status: String = row.get(17)?;
    let snapshot_date: String = row.get(18)?;
    let created_at: String = row.get(19)?;
    let decided_at: Option<String> = row.get(20)?;

    Ok(Recommendation {
        recommendation_id: row.get(0)?,
        rule_id: row.get(1)?,
        entity: EntityRef {
            customer_id: row.get(2)?,
            entity_kind: EntityKind::parse(&entity_kind).unwrap_or(EntityKind::Campaign),
            entity_id: row.get(4)?,
            ad_group_id: row.get(5)?,
            keyword_text: row.get(6)?,
            match_type: match_type.as_deref().and_then(MatchType::parse),
        },
        action: serde_json::from_str::<Action>(&action)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e)))?,
        lever: Lever::parse(&lever).unwrap_or(Lever::Status),
        old_value: row.get(10)?,
        new_value: row.get(11)?,
        change_pct: row.get(12)?,
        risk_tier: RiskTier::parse(&risk_tier).unwrap_or(RiskTier::Low),
        confidence: row.get(14)?,
        evidence: serde_json::from_str(&evidence).unwrap_or_default(),
        reasoning: row.get(16)?,
        status: RecommendationStatus::parse(&status).unwrap_or(RecommendationStatus::Pending),
        snapshot_date: snapshot_date.parse().unwrap_or_default(),
        created_at: parse_ts(&created_at),
        decided_at: decided_at.as_deref().map(parse_ts),
        approved_by: row.get(21)?,
        failure_reason: row.get(22)?,
    })
}
