#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use activity_pipeline_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Activity, ActivityId, ActivityStore, FollowUpId,
    FollowUpRecord, PipelineError,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{
    params, params_from_iter, Connection, InterruptHandle, OptionalExtension, Transaction,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const ACTIVITY_MIGRATION_VERSION: i64 = 1;

// SQLite caps bound parameters per statement; follow-up lookups are chunked.
const FOLLOW_UP_ID_CHUNK: usize = 500;

const SCHEMA_ACTIVITY_V1: &str = r"
CREATE TABLE IF NOT EXISTS activities (
  id TEXT PRIMARY KEY,
  activity_date TEXT NOT NULL,
  activity_type TEXT NOT NULL,
  parent_activity_id TEXT,
  customer_id TEXT,
  lead_id TEXT,
  contact_id TEXT,
  notes TEXT,
  pipeline_stage TEXT
);

CREATE INDEX IF NOT EXISTS idx_activities_parent
  ON activities(parent_activity_id);

CREATE TABLE IF NOT EXISTS follow_ups (
  id TEXT PRIMARY KEY,
  activity_id TEXT NOT NULL,
  follow_up_note TEXT NOT NULL,
  follow_up_date TEXT NOT NULL,
  priority TEXT NOT NULL DEFAULT 'medium',
  is_done INTEGER NOT NULL DEFAULT 0 CHECK (is_done IN (0, 1)),
  created_at TEXT NOT NULL,
  FOREIGN KEY (activity_id) REFERENCES activities(id)
);

CREATE INDEX IF NOT EXISTS idx_follow_ups_activity_date
  ON follow_ups(activity_id, follow_up_date);
";

const ACTIVITY_COLUMNS: &str = "id, activity_date, activity_type, parent_activity_id, \
     customer_id, lead_id, contact_id, notes, pipeline_stage";

const FOLLOW_UP_COLUMNS: &str =
    "id, activity_id, follow_up_note, follow_up_date, priority, is_done, created_at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            operation_timeout_ms: 2500,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.busy_timeout_ms == 0 {
            return Err(anyhow!("busy_timeout_ms MUST be >= 1"));
        }
        if self.operation_timeout_ms == 0 {
            return Err(anyhow!("operation_timeout_ms MUST be >= 1"));
        }
        Ok(())
    }
}

/// Records to load in one go, as read from a JSON bundle file.
///
/// `follow_ups` nested inside an activity are ignored; only the top-level
/// `follow_ups` list is imported.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedBundle {
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUpRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub activities: usize,
    pub follow_ups: usize,
}

/// SQLite-backed record store. Clones share one connection.
///
/// A read that exceeds `operation_timeout` is interrupted so the connection
/// is free for the next read.
#[derive(Clone)]
pub struct SqliteActivityStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    operation_timeout: Duration,
}

impl SqliteActivityStore {
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        config.validate().context("invalid store configuration")?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .context("failed to configure sqlite busy timeout")?;

        let interrupt = Arc::new(conn.get_interrupt_handle());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_ACTIVITY_V1)
            .context("failed to apply activity schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ACTIVITY_MIGRATION_VERSION, now],
            )
            .context("failed to register activity schema migration")?;
        debug!(
            version = ACTIVITY_MIGRATION_VERSION,
            applied = inserted > 0,
            "activity schema migrated"
        );

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let conn = self.lock()?;
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("failed to read schema version")
    }

    pub fn insert_activity(&self, activity: &Activity) -> Result<()> {
        let conn = self.lock()?;
        insert_activity_row(&conn, activity)
    }

    pub fn insert_follow_up(&self, follow_up: &FollowUpRecord) -> Result<()> {
        let conn = self.lock()?;
        insert_follow_up_row(&conn, follow_up)
    }

    /// Writes every record of `bundle` in a single transaction; nothing is
    /// kept when any row fails.
    pub fn import_bundle(&self, bundle: &SeedBundle) -> Result<ImportReport> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .context("failed to start import transaction")?;

        import_rows(&tx, bundle)?;
        tx.commit().context("failed to commit import transaction")?;

        let report = ImportReport {
            activities: bundle.activities.len(),
            follow_ups: bundle.follow_ups.len(),
        };
        info!(
            activities = report.activities,
            follow_ups = report.follow_ups,
            "seed bundle imported"
        );
        Ok(report)
    }

    pub fn list_activities(&self) -> Result<Vec<Activity>> {
        list_activities(&*self.lock()?)
    }

    pub fn get_activity(&self, id: &ActivityId) -> Result<Option<Activity>> {
        get_activity(&*self.lock()?, id)
    }

    pub fn list_children(&self, id: &ActivityId) -> Result<Vec<Activity>> {
        list_children(&*self.lock()?, id)
    }

    pub fn list_follow_ups_for(&self, ids: &BTreeSet<ActivityId>) -> Result<Vec<FollowUpRecord>> {
        list_follow_ups_for(&*self.lock()?, ids)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    async fn run_blocking<T, F>(&self, operation: &'static str, op: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let handle = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;
            op(&guard)
        });

        let timeout_ms = self.operation_timeout.as_millis();
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                // The blocking task still owns the connection; abort its statement.
                self.interrupt.interrupt();
                warn!(operation, timeout_ms, "sqlite read timed out; statement interrupted");
                PipelineError::StoreUnavailable(format!(
                    "{operation} timed out after {timeout_ms} ms"
                ))
            })?;

        let op_result = join_result.map_err(|err| {
            PipelineError::StoreUnavailable(format!("{operation} join failure: {err}"))
        })?;

        op_result.map_err(|err| PipelineError::StoreUnavailable(format!("{operation}: {err:#}")))
    }
}

#[async_trait]
impl ActivityStore for SqliteActivityStore {
    async fn fetch_all_activities(&self) -> Result<Vec<Activity>, PipelineError> {
        self.run_blocking("fetch_all_activities", list_activities)
            .await
    }

    async fn fetch_follow_ups(
        &self,
        activity_ids: &BTreeSet<ActivityId>,
    ) -> Result<Vec<FollowUpRecord>, PipelineError> {
        if activity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = activity_ids.clone();
        self.run_blocking("fetch_follow_ups", move |conn| {
            list_follow_ups_for(conn, &ids)
        })
        .await
    }

    async fn fetch_activity_by_id(
        &self,
        id: &ActivityId,
    ) -> Result<Option<Activity>, PipelineError> {
        let id = id.clone();
        self.run_blocking("fetch_activity_by_id", move |conn| get_activity(conn, &id))
            .await
    }

    async fn fetch_children_of(&self, id: &ActivityId) -> Result<Vec<Activity>, PipelineError> {
        let id = id.clone();
        self.run_blocking("fetch_children_of", move |conn| list_children(conn, &id))
            .await
    }
}

fn import_rows(tx: &Transaction<'_>, bundle: &SeedBundle) -> Result<()> {
    for activity in &bundle.activities {
        insert_activity_row(tx, activity)?;
    }
    for follow_up in &bundle.follow_ups {
        insert_follow_up_row(tx, follow_up)?;
    }
    Ok(())
}

fn insert_activity_row(conn: &Connection, activity: &Activity) -> Result<()> {
    let activity_date =
        format_rfc3339(activity.activity_date).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO activities(
            id, activity_date, activity_type, parent_activity_id,
            customer_id, lead_id, contact_id, notes, pipeline_stage
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            activity.id.as_str(),
            activity_date,
            activity.activity_type,
            activity.parent_activity_id.as_ref().map(ActivityId::as_str),
            activity.customer_id,
            activity.lead_id,
            activity.contact_id,
            activity.notes,
            activity.pipeline_stage,
        ],
    )
    .with_context(|| format!("failed to insert activity {}", activity.id))?;
    Ok(())
}

fn insert_follow_up_row(conn: &Connection, follow_up: &FollowUpRecord) -> Result<()> {
    let follow_up_date =
        format_rfc3339(follow_up.follow_up_date).map_err(|err| anyhow!(err.to_string()))?;
    let created_at = format_rfc3339(follow_up.created_at).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO follow_ups(
            id, activity_id, follow_up_note, follow_up_date, priority, is_done, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            follow_up.id.0,
            follow_up.activity_id.as_str(),
            follow_up.follow_up_note,
            follow_up_date,
            follow_up.priority,
            bool_to_sql(follow_up.is_done),
            created_at,
        ],
    )
    .with_context(|| {
        format!(
            "failed to insert follow-up {} for activity {}",
            follow_up.id, follow_up.activity_id
        )
    })?;
    Ok(())
}

fn list_activities(conn: &Connection) -> Result<Vec<Activity>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACTIVITY_COLUMNS} FROM activities ORDER BY rowid ASC"
    ))?;
    let rows = stmt.query_map([], parse_activity_row)?;
    collect_rows(rows).context("failed to list activities")
}

fn get_activity(conn: &Connection, id: &ActivityId) -> Result<Option<Activity>> {
    conn.query_row(
        &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1"),
        params![id.as_str()],
        parse_activity_row,
    )
    .optional()
    .with_context(|| format!("failed to load activity {id}"))
}

fn list_children(conn: &Connection, id: &ActivityId) -> Result<Vec<Activity>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACTIVITY_COLUMNS} FROM activities
         WHERE parent_activity_id = ?1
         ORDER BY rowid ASC"
    ))?;
    let rows = stmt.query_map(params![id.as_str()], parse_activity_row)?;
    collect_rows(rows).with_context(|| format!("failed to list children of {id}"))
}

fn list_follow_ups_for(conn: &Connection, ids: &BTreeSet<ActivityId>) -> Result<Vec<FollowUpRecord>> {
    let ids: Vec<&str> = ids.iter().map(ActivityId::as_str).collect();
    let mut records = Vec::new();
    for chunk in ids.chunks(FOLLOW_UP_ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups
             WHERE activity_id IN ({placeholders})
             ORDER BY follow_up_date ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), parse_follow_up_row)?;
        records.extend(collect_rows(rows).context("failed to list follow-ups")?);
    }
    records.sort_by(|lhs, rhs| {
        lhs.follow_up_date
            .cmp(&rhs.follow_up_date)
            .then_with(|| lhs.id.cmp(&rhs.id))
    });
    Ok(records)
}

fn parse_activity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
    let id: String = row.get(0)?;
    let activity_date_raw: String = row.get(1)?;
    let parent_raw: Option<String> = row.get(3)?;

    Ok(Activity {
        id: ActivityId(id),
        activity_date: parse_timestamp(1, &activity_date_raw)?,
        activity_type: row.get(2)?,
        parent_activity_id: parent_raw.map(ActivityId),
        customer_id: row.get(4)?,
        lead_id: row.get(5)?,
        contact_id: row.get(6)?,
        notes: row.get(7)?,
        pipeline_stage: row.get(8)?,
        follow_ups: Vec::new(),
    })
}

fn parse_follow_up_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FollowUpRecord> {
    let id: String = row.get(0)?;
    let activity_id: String = row.get(1)?;
    let follow_up_date_raw: String = row.get(3)?;
    let is_done: i64 = row.get(5)?;
    let created_at_raw: String = row.get(6)?;

    Ok(FollowUpRecord {
        id: FollowUpId(id),
        activity_id: ActivityId(activity_id),
        follow_up_note: row.get(2)?,
        follow_up_date: parse_timestamp(3, &follow_up_date_raw)?,
        priority: row.get(4)?,
        is_done: is_done != 0,
        created_at: parse_timestamp(6, &created_at_raw)?,
    })
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
