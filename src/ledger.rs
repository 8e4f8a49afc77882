//! Durable metadata ledger: tasks and per-(page, format) unit rows.
//!
//! The ledger is the sole shared mutable state of the pipeline and the only
//! source of truth for progress. All unit-lifecycle writes are row-scoped
//! upserts keyed on `(task_id, page_number, format_type)` — no multi-row
//! transactions. Task-level status is never written directly by processing
//! code; it is recomputed from the unit aggregate after each terminal unit
//! transition.
//!
//! Two backends: [`PgLedger`] over Postgres for production and
//! [`MemoryLedger`] for tests and local development.

use crate::error::LedgerError;
use crate::types::{
    FormatKind, PageUnit, SideKeys, TaskRecord, TaskStatus, UnitFormat, UnitStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info};

// ── Inputs & outcomes ────────────────────────────────────────────────────

/// A task row to create at dispatch time.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub user_id: String,
    pub source_file_key: String,
    pub requested_formats: Vec<FormatKind>,
    pub total_pages: u32,
}

/// A unit row to create at dispatch time.
#[derive(Debug, Clone)]
pub struct NewUnit {
    pub task_id: String,
    pub page_number: u32,
    pub total_pages: u32,
    pub format: UnitFormat,
    pub page_image_key: String,
}

/// Result of an idempotent unit insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Row already existed. `terminal` tells the dispatcher whether to skip
    /// the enqueue.
    Exists { terminal: bool },
}

/// Result of claiming a unit for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginUnit {
    Started,
    /// A prior delivery already completed this unit; skip without touching
    /// the model.
    AlreadyCompleted,
}

// ── Trait ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Idempotent task creation (`pending`).
    async fn create_task(&self, task: &NewTask) -> Result<(), LedgerError>;

    /// Idempotent unit creation (`pending`).
    async fn insert_unit(&self, unit: &NewUnit) -> Result<InsertOutcome, LedgerError>;

    /// Claim a unit: `pending|processing|failed → processing` with worker id
    /// and `started_at = COALESCE(started_at, now())`. A redelivered message
    /// for a completed unit short-circuits.
    async fn begin_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
    ) -> Result<BeginUnit, LedgerError>;

    /// Terminal success: result key, side keys and timing.
    async fn complete_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
        result_key: &str,
        side: &SideKeys,
        processing_time_ms: i64,
    ) -> Result<(), LedgerError>;

    /// Terminal failure with the operator-facing error message.
    async fn fail_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
        error_message: &str,
    ) -> Result<(), LedgerError>;

    /// Insert-or-update a derived unit (e.g. `txt` from `html`) directly in
    /// `completed`. The only way the ledger acquires rows with no queue
    /// message behind them.
    async fn upsert_derived_unit(
        &self,
        task_id: &str,
        page_number: u32,
        total_pages: u32,
        format: UnitFormat,
        worker_id: &str,
        result_key: &str,
    ) -> Result<(), LedgerError>;

    /// Update the task's preview key. An `html` key always wins; a non-html
    /// key never displaces an `html` key.
    async fn set_primary_result(
        &self,
        task_id: &str,
        result_key: &str,
        format: UnitFormat,
    ) -> Result<(), LedgerError>;

    /// `pending → processing` on first unit activity.
    async fn mark_task_processing(&self, task_id: &str) -> Result<(), LedgerError>;

    /// Recompute task status from the unit aggregate, persist it, and
    /// backfill the primary key for tasks that completed without one.
    async fn recompute_task_status(&self, task_id: &str) -> Result<TaskStatus, LedgerError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, LedgerError>;

    async fn get_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
    ) -> Result<Option<PageUnit>, LedgerError>;

    async fn list_units(&self, task_id: &str) -> Result<Vec<PageUnit>, LedgerError>;
}

// ── Aggregate computation ────────────────────────────────────────────────

/// Task status from the unit aggregate.
///
/// `completed` ⇔ every requested-format unit covers `[1..total_pages]`, all
/// are terminal, and at least one is `completed`. `failed` ⇔ all terminal
/// and none `completed`. Derived rows never gate completion.
pub fn aggregate_status(task: &TaskRecord, units: &[PageUnit]) -> TaskStatus {
    let mut all_terminal = true;
    let mut any_completed = false;
    let mut any_activity = false;

    for format in &task.requested_formats {
        let format = UnitFormat::from(*format);
        for page in 1..=task.total_pages {
            let unit = units
                .iter()
                .find(|u| u.format == format && u.page_number == page);
            match unit {
                // A missing row means dispatch has not finished fanning out.
                None => return TaskStatus::Pending,
                Some(u) => {
                    if u.status != UnitStatus::Pending {
                        any_activity = true;
                    }
                    if u.status == UnitStatus::Completed {
                        any_completed = true;
                    }
                    if !u.status.is_terminal() {
                        all_terminal = false;
                    }
                }
            }
        }
    }

    if all_terminal {
        if any_completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    } else if any_activity {
        TaskStatus::Processing
    } else {
        TaskStatus::Pending
    }
}

/// Completed unit whose result should back the preview, by priority
/// html > kvp > any other completed unit; ties break on lowest page.
pub fn preferred_primary(units: &[PageUnit]) -> Option<&PageUnit> {
    const PRIORITY: [UnitFormat; 5] = [
        UnitFormat::Html,
        UnitFormat::Kvp,
        UnitFormat::Json,
        UnitFormat::Anon,
        UnitFormat::Txt,
    ];
    for format in PRIORITY {
        let candidate = units
            .iter()
            .filter(|u| {
                u.format == format && u.status == UnitStatus::Completed && u.result_key.is_some()
            })
            .min_by_key(|u| u.page_number);
        if candidate.is_some() {
            return candidate;
        }
    }
    None
}

// ── Postgres backend ─────────────────────────────────────────────────────

pub struct PgLedger {
    pool: sqlx::PgPool,
}

impl PgLedger {
    pub async fn connect(database_url: &str) -> Result<PgLedger, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        info!("Connected to ledger database");
        Ok(PgLedger { pool })
    }

    pub fn from_pool(pool: sqlx::PgPool) -> PgLedger {
        PgLedger { pool }
    }

    fn row_to_unit(row: &sqlx::postgres::PgRow) -> Result<PageUnit, LedgerError> {
        let format: String = row.try_get("format_type")?;
        let status: String = row.try_get("status")?;
        Ok(PageUnit {
            task_id: row.try_get("task_id")?,
            page_number: row.try_get::<i32, _>("page_number")? as u32,
            total_pages: row.try_get::<i32, _>("total_pages")? as u32,
            format: UnitFormat::parse(&format)
                .ok_or_else(|| LedgerError::Corrupt(format!("unknown format '{format}'")))?,
            status: UnitStatus::parse(&status)
                .ok_or_else(|| LedgerError::Corrupt(format!("unknown status '{status}'")))?,
            worker_id: row.try_get("worker_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            processing_time_ms: row.try_get("processing_time_ms")?,
            result_key: row.try_get("result_key")?,
            side: SideKeys {
                json_result_key: row.try_get("json_result_key")?,
                anon_json_key: row.try_get("anon_json_key")?,
                anon_txt_key: row.try_get("anon_txt_key")?,
                anon_mapping_key: row.try_get("anon_mapping_key")?,
                anon_audit_key: row.try_get("anon_audit_key")?,
            },
            page_image_key: row.try_get("page_image_key")?,
            error_message: row.try_get("error_message")?,
        })
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<TaskRecord, LedgerError> {
        let status: String = row.try_get("status")?;
        let formats: Vec<String> = row.try_get("requested_formats")?;
        let primary_format: Option<String> = row.try_get("primary_result_format")?;
        Ok(TaskRecord {
            task_id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            source_file_key: row.try_get("source_file_key")?,
            requested_formats: formats
                .iter()
                .filter_map(|f| FormatKind::parse(f))
                .collect(),
            total_pages: row.try_get::<i32, _>("total_pages")? as u32,
            status: TaskStatus::parse(&status)
                .ok_or_else(|| LedgerError::Corrupt(format!("unknown status '{status}'")))?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            primary_result_key: row.try_get("primary_result_key")?,
            primary_result_format: primary_format.and_then(|f| UnitFormat::parse(&f)),
        })
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn create_task(&self, task: &NewTask) -> Result<(), LedgerError> {
        let formats: Vec<String> = task
            .requested_formats
            .iter()
            .map(|f| f.as_str().to_string())
            .collect();
        sqlx::query(
            "INSERT INTO tasks (id, user_id, source_file_key, requested_formats, total_pages, status)
             VALUES ($1, $2, $3, $4, $5, 'pending')
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&task.task_id)
        .bind(&task.user_id)
        .bind(&task.source_file_key)
        .bind(&formats)
        .bind(task.total_pages as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_unit(&self, unit: &NewUnit) -> Result<InsertOutcome, LedgerError> {
        let inserted = sqlx::query(
            "INSERT INTO task_pages (task_id, page_number, total_pages, format_type, status, page_image_key)
             VALUES ($1, $2, $3, $4, 'pending', $5)
             ON CONFLICT (task_id, page_number, format_type) DO NOTHING",
        )
        .bind(&unit.task_id)
        .bind(unit.page_number as i32)
        .bind(unit.total_pages as i32)
        .bind(unit.format.as_str())
        .bind(&unit.page_image_key)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            return Ok(InsertOutcome::Inserted);
        }

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM task_pages
             WHERE task_id = $1 AND page_number = $2 AND format_type = $3",
        )
        .bind(&unit.task_id)
        .bind(unit.page_number as i32)
        .bind(unit.format.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let terminal = status
            .and_then(|s| UnitStatus::parse(&s))
            .map(|s| s.is_terminal())
            .unwrap_or(false);
        Ok(InsertOutcome::Exists { terminal })
    }

    async fn begin_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
    ) -> Result<BeginUnit, LedgerError> {
        let updated = sqlx::query(
            "UPDATE task_pages
             SET status = 'processing',
                 worker_id = $4,
                 started_at = COALESCE(started_at, now())
             WHERE task_id = $1 AND page_number = $2 AND format_type = $3
               AND status <> 'completed'",
        )
        .bind(task_id)
        .bind(page_number as i32)
        .bind(format.as_str())
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            // Either the row is already completed or it never existed. A
            // missing row means the dispatcher contract was violated; treat
            // it as completed-equivalent only when the row proves it.
            let status: Option<String> = sqlx::query_scalar(
                "SELECT status FROM task_pages
                 WHERE task_id = $1 AND page_number = $2 AND format_type = $3",
            )
            .bind(task_id)
            .bind(page_number as i32)
            .bind(format.as_str())
            .fetch_optional(&self.pool)
            .await?;
            return match status.as_deref() {
                Some("completed") => Ok(BeginUnit::AlreadyCompleted),
                _ => Err(LedgerError::Corrupt(format!(
                    "unit ({task_id}, {page_number}, {format}) missing at begin"
                ))),
            };
        }

        Ok(BeginUnit::Started)
    }

    async fn complete_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
        result_key: &str,
        side: &SideKeys,
        processing_time_ms: i64,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE task_pages
             SET status = 'completed',
                 worker_id = $4,
                 result_key = $5,
                 json_result_key = COALESCE($6, json_result_key),
                 anon_json_key = COALESCE($7, anon_json_key),
                 anon_txt_key = COALESCE($8, anon_txt_key),
                 anon_mapping_key = COALESCE($9, anon_mapping_key),
                 anon_audit_key = COALESCE($10, anon_audit_key),
                 processing_time_ms = $11,
                 completed_at = now()
             WHERE task_id = $1 AND page_number = $2 AND format_type = $3",
        )
        .bind(task_id)
        .bind(page_number as i32)
        .bind(format.as_str())
        .bind(worker_id)
        .bind(result_key)
        .bind(&side.json_result_key)
        .bind(&side.anon_json_key)
        .bind(&side.anon_txt_key)
        .bind(&side.anon_mapping_key)
        .bind(&side.anon_audit_key)
        .bind(processing_time_ms)
        .execute(&self.pool)
        .await?;
        debug!("Unit ({task_id}, {page_number}, {format}) completed");
        Ok(())
    }

    async fn fail_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
        error_message: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE task_pages
             SET status = 'failed',
                 worker_id = $4,
                 error_message = $5,
                 completed_at = now()
             WHERE task_id = $1 AND page_number = $2 AND format_type = $3",
        )
        .bind(task_id)
        .bind(page_number as i32)
        .bind(format.as_str())
        .bind(worker_id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_derived_unit(
        &self,
        task_id: &str,
        page_number: u32,
        total_pages: u32,
        format: UnitFormat,
        worker_id: &str,
        result_key: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO task_pages (
                 task_id, page_number, total_pages, format_type, status,
                 worker_id, result_key, processing_time_ms, page_image_key,
                 started_at, completed_at
             )
             VALUES ($1, $2, $3, $4, 'completed', $5, $6, 0, '', now(), now())
             ON CONFLICT (task_id, page_number, format_type) DO UPDATE
             SET status = EXCLUDED.status,
                 worker_id = EXCLUDED.worker_id,
                 result_key = EXCLUDED.result_key,
                 completed_at = now()",
        )
        .bind(task_id)
        .bind(page_number as i32)
        .bind(total_pages as i32)
        .bind(format.as_str())
        .bind(worker_id)
        .bind(result_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_primary_result(
        &self,
        task_id: &str,
        result_key: &str,
        format: UnitFormat,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE tasks
             SET primary_result_key = $2, primary_result_format = $3
             WHERE id = $1
               AND ($3 = 'html' OR primary_result_format IS DISTINCT FROM 'html')",
        )
        .bind(task_id)
        .bind(result_key)
        .bind(format.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_task_processing(&self, task_id: &str) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE tasks
             SET status = 'processing', started_at = COALESCE(started_at, now())
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recompute_task_status(&self, task_id: &str) -> Result<TaskStatus, LedgerError> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| LedgerError::TaskNotFound(task_id.to_string()))?;
        let units = self.list_units(task_id).await?;
        let status = aggregate_status(&task, &units);

        if status.is_terminal() {
            sqlx::query(
                "UPDATE tasks
                 SET status = $2, completed_at = COALESCE(completed_at, now())
                 WHERE id = $1",
            )
            .bind(task_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

            // Re-derive the preview key on every terminal pass: backfills
            // tasks that completed without one and heals a lost or
            // lower-priority update (the guard keeps html on top).
            if status == TaskStatus::Completed {
                if let Some(unit) = preferred_primary(&units) {
                    if let Some(key) = &unit.result_key {
                        self.set_primary_result(task_id, key, unit.format).await?;
                    }
                }
            }
        }

        Ok(status)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_task(&r)).transpose()
    }

    async fn get_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
    ) -> Result<Option<PageUnit>, LedgerError> {
        let row = sqlx::query(
            "SELECT * FROM task_pages
             WHERE task_id = $1 AND page_number = $2 AND format_type = $3",
        )
        .bind(task_id)
        .bind(page_number as i32)
        .bind(format.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_to_unit(&r)).transpose()
    }

    async fn list_units(&self, task_id: &str) -> Result<Vec<PageUnit>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM task_pages WHERE task_id = $1
             ORDER BY format_type, page_number",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_unit).collect()
    }
}

// ── In-memory backend ────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    tasks: BTreeMap<String, TaskRecord>,
    units: BTreeMap<(String, String, u32), PageUnit>,
}

/// In-process ledger for tests and local development.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<MemoryInner>,
}

impl MemoryLedger {
    pub fn new() -> MemoryLedger {
        MemoryLedger::default()
    }

    fn key(task_id: &str, format: UnitFormat, page: u32) -> (String, String, u32) {
        (task_id.to_string(), format.as_str().to_string(), page)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_task(&self, task: &NewTask) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tasks
            .entry(task.task_id.clone())
            .or_insert_with(|| TaskRecord {
                task_id: task.task_id.clone(),
                user_id: task.user_id.clone(),
                source_file_key: task.source_file_key.clone(),
                requested_formats: task.requested_formats.clone(),
                total_pages: task.total_pages,
                status: TaskStatus::Pending,
                started_at: None,
                completed_at: None,
                primary_result_key: None,
                primary_result_format: None,
            });
        Ok(())
    }

    async fn insert_unit(&self, unit: &NewUnit) -> Result<InsertOutcome, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(&unit.task_id, unit.format, unit.page_number);
        if let Some(existing) = inner.units.get(&key) {
            return Ok(InsertOutcome::Exists {
                terminal: existing.status.is_terminal(),
            });
        }
        inner.units.insert(
            key,
            PageUnit {
                task_id: unit.task_id.clone(),
                page_number: unit.page_number,
                total_pages: unit.total_pages,
                format: unit.format,
                status: UnitStatus::Pending,
                worker_id: None,
                started_at: None,
                completed_at: None,
                processing_time_ms: None,
                result_key: None,
                side: SideKeys::default(),
                page_image_key: unit.page_image_key.clone(),
                error_message: None,
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn begin_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
    ) -> Result<BeginUnit, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(task_id, format, page_number);
        let unit = inner.units.get_mut(&key).ok_or_else(|| {
            LedgerError::Corrupt(format!(
                "unit ({task_id}, {page_number}, {format}) missing at begin"
            ))
        })?;
        if unit.status == UnitStatus::Completed {
            return Ok(BeginUnit::AlreadyCompleted);
        }
        unit.status = UnitStatus::Processing;
        unit.worker_id = Some(worker_id.to_string());
        unit.started_at.get_or_insert_with(Utc::now);
        Ok(BeginUnit::Started)
    }

    async fn complete_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
        result_key: &str,
        side: &SideKeys,
        processing_time_ms: i64,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(task_id, format, page_number);
        if let Some(unit) = inner.units.get_mut(&key) {
            unit.status = UnitStatus::Completed;
            unit.worker_id = Some(worker_id.to_string());
            unit.result_key = Some(result_key.to_string());
            let merge = |dst: &mut Option<String>, src: &Option<String>| {
                if src.is_some() {
                    *dst = src.clone();
                }
            };
            merge(&mut unit.side.json_result_key, &side.json_result_key);
            merge(&mut unit.side.anon_json_key, &side.anon_json_key);
            merge(&mut unit.side.anon_txt_key, &side.anon_txt_key);
            merge(&mut unit.side.anon_mapping_key, &side.anon_mapping_key);
            merge(&mut unit.side.anon_audit_key, &side.anon_audit_key);
            unit.processing_time_ms = Some(processing_time_ms);
            unit.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
        worker_id: &str,
        error_message: &str,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(task_id, format, page_number);
        if let Some(unit) = inner.units.get_mut(&key) {
            unit.status = UnitStatus::Failed;
            unit.worker_id = Some(worker_id.to_string());
            unit.error_message = Some(error_message.to_string());
            unit.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn upsert_derived_unit(
        &self,
        task_id: &str,
        page_number: u32,
        total_pages: u32,
        format: UnitFormat,
        worker_id: &str,
        result_key: &str,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let key = Self::key(task_id, format, page_number);
        let now = Utc::now();
        let unit = inner.units.entry(key).or_insert_with(|| PageUnit {
            task_id: task_id.to_string(),
            page_number,
            total_pages,
            format,
            status: UnitStatus::Completed,
            worker_id: None,
            started_at: Some(now),
            completed_at: None,
            processing_time_ms: Some(0),
            result_key: None,
            side: SideKeys::default(),
            page_image_key: String::new(),
            error_message: None,
        });
        unit.status = UnitStatus::Completed;
        unit.worker_id = Some(worker_id.to_string());
        unit.result_key = Some(result_key.to_string());
        unit.completed_at = Some(now);
        Ok(())
    }

    async fn set_primary_result(
        &self,
        task_id: &str,
        result_key: &str,
        format: UnitFormat,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            let html_held = task.primary_result_format == Some(UnitFormat::Html);
            if format == UnitFormat::Html || !html_held {
                task.primary_result_key = Some(result_key.to_string());
                task.primary_result_format = Some(format);
            }
        }
        Ok(())
    }

    async fn mark_task_processing(&self, task_id: &str) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Processing;
                task.started_at.get_or_insert_with(Utc::now);
            }
        }
        Ok(())
    }

    async fn recompute_task_status(&self, task_id: &str) -> Result<TaskStatus, LedgerError> {
        let (task, units) = {
            let inner = self.inner.lock().unwrap();
            let task = inner
                .tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| LedgerError::TaskNotFound(task_id.to_string()))?;
            let units: Vec<PageUnit> = inner
                .units
                .values()
                .filter(|u| u.task_id == task_id)
                .cloned()
                .collect();
            (task, units)
        };

        let status = aggregate_status(&task, &units);
        if status.is_terminal() {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(t) = inner.tasks.get_mut(task_id) {
                    t.status = status;
                    t.completed_at.get_or_insert_with(Utc::now);
                }
            }
            // Re-derive the preview key on every terminal pass: backfills
            // tasks that completed without one and heals a lost or
            // lower-priority update (the guard keeps html on top).
            if status == TaskStatus::Completed {
                if let Some(unit) = preferred_primary(&units) {
                    if let Some(key) = unit.result_key.clone() {
                        self.set_primary_result(task_id, &key, unit.format).await?;
                    }
                }
            }
        }
        Ok(status)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, LedgerError> {
        Ok(self.inner.lock().unwrap().tasks.get(task_id).cloned())
    }

    async fn get_unit(
        &self,
        task_id: &str,
        page_number: u32,
        format: UnitFormat,
    ) -> Result<Option<PageUnit>, LedgerError> {
        let key = Self::key(task_id, format, page_number);
        Ok(self.inner.lock().unwrap().units.get(&key).cloned())
    }

    async fn list_units(&self, task_id: &str) -> Result<Vec<PageUnit>, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .units
            .values()
            .filter(|u| u.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(formats: &[FormatKind], pages: u32) -> NewTask {
        NewTask {
            task_id: "t-1".into(),
            user_id: "u-1".into(),
            source_file_key: "uploads/u-1/2026-08/f/doc.pdf".into(),
            requested_formats: formats.to_vec(),
            total_pages: pages,
        }
    }

    fn new_unit(page: u32, format: UnitFormat) -> NewUnit {
        NewUnit {
            task_id: "t-1".into(),
            page_number: page,
            total_pages: 1,
            format,
            page_image_key: format!("uploads/u-1/2026-08/f/page_{page}.jpg"),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_and_reports_terminality() {
        let ledger = MemoryLedger::new();
        ledger
            .create_task(&new_task(&[FormatKind::Html], 1))
            .await
            .unwrap();

        let unit = new_unit(1, UnitFormat::Html);
        assert_eq!(
            ledger.insert_unit(&unit).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            ledger.insert_unit(&unit).await.unwrap(),
            InsertOutcome::Exists { terminal: false }
        );

        ledger
            .begin_unit("t-1", 1, UnitFormat::Html, "worker-1")
            .await
            .unwrap();
        ledger
            .complete_unit(
                "t-1",
                1,
                UnitFormat::Html,
                "worker-1",
                "results/u-1/x.html",
                &SideKeys::default(),
                120,
            )
            .await
            .unwrap();

        assert_eq!(
            ledger.insert_unit(&unit).await.unwrap(),
            InsertOutcome::Exists { terminal: true }
        );
    }

    #[tokio::test]
    async fn begin_short_circuits_completed_units() {
        let ledger = MemoryLedger::new();
        ledger
            .create_task(&new_task(&[FormatKind::Html], 1))
            .await
            .unwrap();
        ledger.insert_unit(&new_unit(1, UnitFormat::Html)).await.unwrap();

        assert_eq!(
            ledger
                .begin_unit("t-1", 1, UnitFormat::Html, "worker-1")
                .await
                .unwrap(),
            BeginUnit::Started
        );
        // Re-claiming a processing unit is allowed (crash replay).
        assert_eq!(
            ledger
                .begin_unit("t-1", 1, UnitFormat::Html, "worker-2")
                .await
                .unwrap(),
            BeginUnit::Started
        );

        ledger
            .complete_unit(
                "t-1",
                1,
                UnitFormat::Html,
                "worker-2",
                "k",
                &SideKeys::default(),
                5,
            )
            .await
            .unwrap();
        assert_eq!(
            ledger
                .begin_unit("t-1", 1, UnitFormat::Html, "worker-1")
                .await
                .unwrap(),
            BeginUnit::AlreadyCompleted
        );
    }

    #[tokio::test]
    async fn aggregate_completes_only_when_all_requested_units_terminal() {
        let ledger = MemoryLedger::new();
        ledger
            .create_task(&new_task(&[FormatKind::Html, FormatKind::Kvp], 1))
            .await
            .unwrap();
        ledger.insert_unit(&new_unit(1, UnitFormat::Html)).await.unwrap();
        ledger.insert_unit(&new_unit(1, UnitFormat::Kvp)).await.unwrap();

        ledger
            .begin_unit("t-1", 1, UnitFormat::Html, "w")
            .await
            .unwrap();
        ledger
            .complete_unit("t-1", 1, UnitFormat::Html, "w", "h.html", &SideKeys::default(), 10)
            .await
            .unwrap();

        // kvp still pending: task must not be terminal.
        assert_eq!(
            ledger.recompute_task_status("t-1").await.unwrap(),
            TaskStatus::Processing
        );

        ledger.begin_unit("t-1", 1, UnitFormat::Kvp, "w").await.unwrap();
        ledger
            .fail_unit("t-1", 1, UnitFormat::Kvp, "w", "generation failed")
            .await
            .unwrap();

        // One completed + one failed, all terminal → completed.
        assert_eq!(
            ledger.recompute_task_status("t-1").await.unwrap(),
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn all_failed_units_fail_the_task() {
        let ledger = MemoryLedger::new();
        ledger
            .create_task(&new_task(&[FormatKind::Json], 1))
            .await
            .unwrap();
        ledger.insert_unit(&new_unit(1, UnitFormat::Json)).await.unwrap();
        ledger.begin_unit("t-1", 1, UnitFormat::Json, "w").await.unwrap();
        ledger
            .fail_unit("t-1", 1, UnitFormat::Json, "w", "boom")
            .await
            .unwrap();

        assert_eq!(
            ledger.recompute_task_status("t-1").await.unwrap(),
            TaskStatus::Failed
        );
        let task = ledger.get_task("t-1").await.unwrap().unwrap();
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn derived_rows_never_gate_completion() {
        let ledger = MemoryLedger::new();
        ledger
            .create_task(&new_task(&[FormatKind::Html], 1))
            .await
            .unwrap();
        ledger.insert_unit(&new_unit(1, UnitFormat::Html)).await.unwrap();
        ledger.begin_unit("t-1", 1, UnitFormat::Html, "w").await.unwrap();
        ledger
            .complete_unit("t-1", 1, UnitFormat::Html, "w", "h.html", &SideKeys::default(), 10)
            .await
            .unwrap();
        ledger
            .upsert_derived_unit("t-1", 1, 1, UnitFormat::Txt, "w", "t.txt")
            .await
            .unwrap();
        // Upsert again: conflict resolves without error.
        ledger
            .upsert_derived_unit("t-1", 1, 1, UnitFormat::Txt, "w", "t2.txt")
            .await
            .unwrap();

        assert_eq!(
            ledger.recompute_task_status("t-1").await.unwrap(),
            TaskStatus::Completed
        );
        let txt = ledger
            .get_unit("t-1", 1, UnitFormat::Txt)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(txt.result_key.as_deref(), Some("t2.txt"));
        assert_eq!(txt.page_image_key, "");
    }

    #[tokio::test]
    async fn kvp_key_never_displaces_html_primary() {
        let ledger = MemoryLedger::new();
        ledger
            .create_task(&new_task(&[FormatKind::Html, FormatKind::Kvp], 1))
            .await
            .unwrap();

        ledger
            .set_primary_result("t-1", "page_1_kvp.html", UnitFormat::Kvp)
            .await
            .unwrap();
        ledger
            .set_primary_result("t-1", "page_1_html.html", UnitFormat::Html)
            .await
            .unwrap();
        // Later kvp completion must not displace the html preview.
        ledger
            .set_primary_result("t-1", "page_2_kvp.html", UnitFormat::Kvp)
            .await
            .unwrap();

        let task = ledger.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.primary_result_key.as_deref(), Some("page_1_html.html"));
        assert_eq!(task.primary_result_format, Some(UnitFormat::Html));
    }

    #[tokio::test]
    async fn terminal_recompute_backfills_primary_for_anon_only_tasks() {
        let ledger = MemoryLedger::new();
        ledger
            .create_task(&NewTask {
                requested_formats: vec![FormatKind::Anon],
                ..new_task(&[], 1)
            })
            .await
            .unwrap();
        ledger.insert_unit(&new_unit(1, UnitFormat::Anon)).await.unwrap();
        ledger.begin_unit("t-1", 1, UnitFormat::Anon, "w").await.unwrap();
        ledger
            .complete_unit("t-1", 1, UnitFormat::Anon, "w", "a.json", &SideKeys::default(), 9)
            .await
            .unwrap();

        assert_eq!(
            ledger.recompute_task_status("t-1").await.unwrap(),
            TaskStatus::Completed
        );
        let task = ledger.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.primary_result_key.as_deref(), Some("a.json"));
    }

    #[tokio::test]
    async fn terminal_recompute_heals_a_lost_html_primary_update() {
        let ledger = MemoryLedger::new();
        ledger
            .create_task(&new_task(&[FormatKind::Html, FormatKind::Kvp], 1))
            .await
            .unwrap();
        ledger.insert_unit(&new_unit(1, UnitFormat::Html)).await.unwrap();
        ledger.insert_unit(&new_unit(1, UnitFormat::Kvp)).await.unwrap();

        // kvp finishes first and takes the preview key.
        ledger.begin_unit("t-1", 1, UnitFormat::Kvp, "w").await.unwrap();
        ledger
            .complete_unit("t-1", 1, UnitFormat::Kvp, "w", "k.html", &SideKeys::default(), 5)
            .await
            .unwrap();
        ledger
            .set_primary_result("t-1", "k.html", UnitFormat::Kvp)
            .await
            .unwrap();

        // The html unit completes but its own primary update is lost.
        ledger.begin_unit("t-1", 1, UnitFormat::Html, "w").await.unwrap();
        ledger
            .complete_unit("t-1", 1, UnitFormat::Html, "w", "h.html", &SideKeys::default(), 5)
            .await
            .unwrap();

        assert_eq!(
            ledger.recompute_task_status("t-1").await.unwrap(),
            TaskStatus::Completed
        );
        let task = ledger.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.primary_result_format, Some(UnitFormat::Html));
        assert_eq!(task.primary_result_key.as_deref(), Some("h.html"));
    }

    #[test]
    fn preferred_primary_orders_html_kvp_any() {
        let unit = |format: UnitFormat, page: u32, key: &str| PageUnit {
            task_id: "t".into(),
            page_number: page,
            total_pages: 2,
            format,
            status: UnitStatus::Completed,
            worker_id: None,
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            result_key: Some(key.to_string()),
            side: SideKeys::default(),
            page_image_key: String::new(),
            error_message: None,
        };

        let units = vec![
            unit(UnitFormat::Json, 1, "j"),
            unit(UnitFormat::Kvp, 2, "k2"),
            unit(UnitFormat::Kvp, 1, "k1"),
        ];
        assert_eq!(
            preferred_primary(&units).unwrap().result_key.as_deref(),
            Some("k1")
        );

        let with_html = [units, vec![unit(UnitFormat::Html, 2, "h")]].concat();
        assert_eq!(
            preferred_primary(&with_html).unwrap().result_key.as_deref(),
            Some("h")
        );
    }
}
