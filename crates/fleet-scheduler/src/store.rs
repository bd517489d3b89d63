//! SQLite mapping for schedules and run records.
//!
//! Free functions take a plain `&Connection` so they work both on the shared
//! connection and inside a `Transaction` (which derefs to one).

use fleet_core::db::{self, uuid_column, SharedConnection};
use fleet_core::types::now_rfc3339;
use fleet_core::{PageRequest, Pager};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::types::{Record, RecordFilter, RecordStatus, Schedule, ScheduleFilter};

const SCHEDULE_COLUMNS: &str = "id, title, description, cron_expr, executor, params,
                                enabled, status, created_at, updated_at";

const RECORD_COLUMNS: &str = "id, schedule_id, title, executor, params, status, error,
                              created_at, updated_at";

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<RecordStatus>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse::<RecordStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
        })
    })
    .transpose()
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: uuid_column(row, 0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        cron_expr: row.get(3)?,
        executor: row.get(4)?,
        params: row.get(5)?,
        enabled: row.get(6)?,
        status: status_column(row, 7)?,
        next_run: None,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        id: uuid_column(row, 0)?,
        schedule_id: uuid_column(row, 1)?,
        title: row.get(2)?,
        executor: row.get(3)?,
        params: row.get(4)?,
        status: status_column(row, 5)?.unwrap_or(RecordStatus::Error),
        error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub fn insert_schedule(conn: &Connection, s: &Schedule) -> Result<()> {
    conn.execute(
        "INSERT INTO schedules
         (id, title, description, cron_expr, executor, params, enabled, status,
          created_at, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, NULL)",
        params![
            s.id.to_string(),
            s.title,
            s.description,
            s.cron_expr,
            s.executor,
            s.params,
            s.enabled,
            s.created_at,
            s.updated_at
        ],
    )?;
    Ok(())
}

/// Overwrite the user-editable fields. Fails with `ScheduleNotFound` if the
/// row is missing or soft-deleted.
pub fn update_schedule(conn: &Connection, s: &Schedule) -> Result<()> {
    let n = conn.execute(
        "UPDATE schedules
         SET title = ?2, description = ?3, cron_expr = ?4, executor = ?5,
             params = ?6, enabled = ?7, updated_at = ?8
         WHERE id = ?1 AND deleted_at IS NULL",
        params![
            s.id.to_string(),
            s.title,
            s.description,
            s.cron_expr,
            s.executor,
            s.params,
            s.enabled,
            s.updated_at
        ],
    )?;
    if n == 0 {
        return Err(SchedulerError::ScheduleNotFound { id: s.id });
    }
    Ok(())
}

pub fn find_schedule(conn: &Connection, id: Uuid) -> Result<Option<Schedule>> {
    let sql = format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1 AND deleted_at IS NULL"
    );
    Ok(conn
        .query_row(&sql, [id.to_string()], row_to_schedule)
        .optional()?)
}

pub fn soft_delete_schedule(conn: &Connection, id: Uuid) -> Result<()> {
    let now = now_rfc3339();
    let n = conn.execute(
        "UPDATE schedules SET deleted_at = ?2, enabled = 0, updated_at = ?2
         WHERE id = ?1 AND deleted_at IS NULL",
        params![id.to_string(), now],
    )?;
    if n == 0 {
        return Err(SchedulerError::ScheduleNotFound { id });
    }
    Ok(())
}

/// Flip `enabled` and return the updated row.
pub fn set_schedule_enabled(conn: &Connection, id: Uuid, enabled: bool) -> Result<Schedule> {
    let now = now_rfc3339();
    let n = conn.execute(
        "UPDATE schedules SET enabled = ?2, updated_at = ?3
         WHERE id = ?1 AND deleted_at IS NULL",
        params![id.to_string(), enabled, now],
    )?;
    if n == 0 {
        return Err(SchedulerError::ScheduleNotFound { id });
    }
    find_schedule(conn, id)?.ok_or(SchedulerError::ScheduleNotFound { id })
}

/// Store-level handle for schedules on the shared connection.
#[derive(Clone)]
pub struct ScheduleStore {
    conn: SharedConnection,
}

impl ScheduleStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    #[instrument(skip(self))]
    pub fn detail(&self, id: Uuid) -> Result<Schedule> {
        let db = db::lock(&self.conn);
        find_schedule(&db, id)?.ok_or(SchedulerError::ScheduleNotFound { id })
    }

    /// Every live enabled schedule, oldest first.
    pub fn list_enabled(&self) -> Result<Vec<Schedule>> {
        self.list(&ScheduleFilter {
            enabled: Some(true),
            executor: None,
        })
    }

    pub fn list(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let db = db::lock(&self.conn);
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE deleted_at IS NULL
               AND (?1 IS NULL OR enabled = ?1)
               AND (?2 IS NULL OR executor = ?2)
             ORDER BY created_at, id"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(params![filter.enabled, filter.executor], row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count(&self, filter: &ScheduleFilter) -> Result<u64> {
        let db = db::lock(&self.conn);
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM schedules
             WHERE deleted_at IS NULL
               AND (?1 IS NULL OR enabled = ?1)
               AND (?2 IS NULL OR executor = ?2)",
            params![filter.enabled, filter.executor],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    #[instrument(skip(self))]
    pub fn page(&self, filter: &ScheduleFilter, req: PageRequest) -> Result<Pager<Schedule>> {
        let total = self.count(filter)?;
        let db = db::lock(&self.conn);
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE deleted_at IS NULL
               AND (?1 IS NULL OR enabled = ?1)
               AND (?2 IS NULL OR executor = ?2)
             ORDER BY created_at DESC, id
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![filter.enabled, filter.executor, req.limit(), req.offset()],
                row_to_schedule,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Pager::new(rows, total, req))
    }

    /// Record the outcome of the latest run. A missing row is not an error:
    /// the schedule may have been deleted while it was running.
    pub fn set_status(&self, id: Uuid, status: RecordStatus) -> Result<()> {
        let db = db::lock(&self.conn);
        let n = db.execute(
            "UPDATE schedules SET status = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), status.as_str()],
        )?;
        if n == 0 {
            debug!(schedule_id = %id, "status not written, schedule is gone");
        }
        Ok(())
    }
}

/// Store-level handle for run records on the shared connection.
#[derive(Clone)]
pub struct RecordStore {
    conn: SharedConnection,
}

impl RecordStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Insert a `running` record for `schedule` and return it.
    pub fn insert_running(&self, schedule: &Schedule) -> Result<Record> {
        let now = now_rfc3339();
        let record = Record {
            id: Uuid::new_v4(),
            schedule_id: schedule.id,
            title: schedule.title.clone(),
            executor: schedule.executor.clone(),
            params: schedule.params.clone(),
            status: RecordStatus::Running,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        };
        let db = db::lock(&self.conn);
        db.execute(
            "INSERT INTO schedule_records
             (id, schedule_id, title, executor, params, status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
            params![
                record.id.to_string(),
                record.schedule_id.to_string(),
                record.title,
                record.executor,
                record.params,
                record.status.as_str(),
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(record)
    }

    /// Move a record to its terminal status.
    pub fn finish(&self, id: Uuid, status: RecordStatus, error: Option<&str>) -> Result<()> {
        let db = db::lock(&self.conn);
        let n = db.execute(
            "UPDATE schedule_records SET status = ?2, error = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id.to_string(), status.as_str(), error, now_rfc3339()],
        )?;
        if n == 0 {
            return Err(SchedulerError::RecordNotFound { id });
        }
        Ok(())
    }

    pub fn detail(&self, id: Uuid) -> Result<Record> {
        let db = db::lock(&self.conn);
        let sql = format!("SELECT {RECORD_COLUMNS} FROM schedule_records WHERE id = ?1");
        db.query_row(&sql, [id.to_string()], row_to_record)
            .optional()?
            .ok_or(SchedulerError::RecordNotFound { id })
    }

    #[instrument(skip(self))]
    pub fn page(&self, filter: &RecordFilter, req: PageRequest) -> Result<Pager<Record>> {
        let schedule_id = filter.schedule_id.map(|id| id.to_string());
        let status = filter.status.map(|s| s.as_str());
        let db = db::lock(&self.conn);

        let total: i64 = db.query_row(
            "SELECT COUNT(*) FROM schedule_records
             WHERE (?1 IS NULL OR schedule_id = ?1) AND (?2 IS NULL OR status = ?2)",
            params![schedule_id, status],
            |r| r.get(0),
        )?;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM schedule_records
             WHERE (?1 IS NULL OR schedule_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, id
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![schedule_id, status, req.limit(), req.offset()],
                row_to_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Pager::new(rows, total as u64, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn stores() -> (SharedConnection, ScheduleStore, RecordStore) {
        let conn = db::open_in_memory().unwrap();
        init_db(&db::lock(&conn)).unwrap();
        (
            conn.clone(),
            ScheduleStore::new(conn.clone()),
            RecordStore::new(conn),
        )
    }

    fn schedule(title: &str, executor: &str, enabled: bool) -> Schedule {
        let now = now_rfc3339();
        Schedule {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: String::new(),
            cron_expr: "0 * * * * *".to_string(),
            executor: executor.to_string(),
            params: "{}".to_string(),
            enabled,
            status: None,
            next_run: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn soft_deleted_schedules_disappear() {
        let (conn, store, _) = stores();
        let s = schedule("a", "test", true);
        insert_schedule(&db::lock(&conn), &s).unwrap();
        assert_eq!(store.detail(s.id).unwrap().title, "a");

        soft_delete_schedule(&db::lock(&conn), s.id).unwrap();
        assert!(matches!(
            store.detail(s.id),
            Err(SchedulerError::ScheduleNotFound { .. })
        ));
        assert!(store.list_enabled().unwrap().is_empty());
        // Deleting twice reports the row as gone.
        assert!(soft_delete_schedule(&db::lock(&conn), s.id).is_err());
    }

    #[test]
    fn page_filters_and_counts() {
        let (conn, store, _) = stores();
        for i in 0..5 {
            let executor = if i % 2 == 0 { "test" } else { "health" };
            insert_schedule(&db::lock(&conn), &schedule(&format!("s{i}"), executor, i < 3))
                .unwrap();
        }

        let all = store.page(&ScheduleFilter::default(), PageRequest::new(1, 2)).unwrap();
        assert_eq!(all.total, 5);
        assert_eq!(all.data.len(), 2);
        assert_eq!(all.pages(), 3);

        let filter = ScheduleFilter {
            enabled: Some(true),
            executor: Some("test".to_string()),
        };
        assert_eq!(store.count(&filter).unwrap(), 2);
        assert_eq!(store.list_enabled().unwrap().len(), 3);
    }

    #[test]
    fn record_lifecycle_and_last_status() {
        let (conn, schedules, records) = stores();
        let s = schedule("a", "test", true);
        insert_schedule(&db::lock(&conn), &s).unwrap();

        let rec = records.insert_running(&s).unwrap();
        assert_eq!(rec.status, RecordStatus::Running);

        records
            .finish(rec.id, RecordStatus::Error, Some("boom"))
            .unwrap();
        schedules.set_status(s.id, RecordStatus::Error).unwrap();

        let stored = records.detail(rec.id).unwrap();
        assert_eq!(stored.status, RecordStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert_eq!(schedules.detail(s.id).unwrap().status, Some(RecordStatus::Error));

        let page = records
            .page(
                &RecordFilter {
                    schedule_id: Some(s.id),
                    status: Some(RecordStatus::Error),
                },
                PageRequest::default(),
            )
            .unwrap();
        assert_eq!(page.total, 1);
        assert!(records.finish(Uuid::new_v4(), RecordStatus::Success, None).is_err());
    }

    #[test]
    fn enable_toggle_returns_updated_row() {
        let (conn, _, _) = stores();
        let s = schedule("a", "test", false);
        insert_schedule(&db::lock(&conn), &s).unwrap();
        let updated = set_schedule_enabled(&db::lock(&conn), s.id, true).unwrap();
        assert!(updated.enabled);
        assert!(set_schedule_enabled(&db::lock(&conn), Uuid::new_v4(), true).is_err());
    }
}
