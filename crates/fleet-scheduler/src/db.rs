use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// `schedules` rows are soft-deleted through `deleted_at`; `schedule_records`
/// is append-mostly and never pruned here.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id          TEXT    NOT NULL PRIMARY KEY,
            title       TEXT    NOT NULL,
            description TEXT    NOT NULL DEFAULT '',
            cron_expr   TEXT    NOT NULL,
            executor    TEXT    NOT NULL,
            params      TEXT    NOT NULL DEFAULT '',   -- opaque, decoded by the executor
            enabled     INTEGER NOT NULL DEFAULT 0,
            status      TEXT,                          -- last run outcome or NULL
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL,
            deleted_at  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedules_enabled
            ON schedules (enabled) WHERE deleted_at IS NULL;

        CREATE TABLE IF NOT EXISTS schedule_records (
            id          TEXT    NOT NULL PRIMARY KEY,
            schedule_id TEXT    NOT NULL,
            title       TEXT    NOT NULL,
            executor    TEXT    NOT NULL,
            params      TEXT    NOT NULL DEFAULT '',
            status      TEXT    NOT NULL,
            error       TEXT,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedule_records_schedule
            ON schedule_records (schedule_id, created_at);
        ",
    )?;
    Ok(())
}
