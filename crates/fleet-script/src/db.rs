use rusqlite::Connection;

use crate::error::Result;

/// Initialise the script, host and script-run tables in `conn`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scripts (
            id          TEXT    NOT NULL PRIMARY KEY,
            title       TEXT    NOT NULL,
            description TEXT    NOT NULL DEFAULT '',
            content     TEXT    NOT NULL,
            kind        TEXT    NOT NULL DEFAULT 'shell',
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS hosts (
            id            TEXT    NOT NULL PRIMARY KEY,
            title         TEXT    NOT NULL,
            address       TEXT    NOT NULL,
            port          INTEGER NOT NULL DEFAULT 22,
            username      TEXT    NOT NULL,
            password      TEXT,
            identity_file TEXT,
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS script_records (
            id           TEXT    NOT NULL PRIMARY KEY,
            script_title TEXT    NOT NULL,
            script       TEXT    NOT NULL,
            hosts        TEXT    NOT NULL DEFAULT '[]',  -- JSON host snapshots
            params       TEXT    NOT NULL DEFAULT '',
            result       TEXT    NOT NULL DEFAULT '{}',  -- JSON per-host log
            status       TEXT    NOT NULL,
            message      TEXT    NOT NULL DEFAULT '',
            error        TEXT    NOT NULL DEFAULT '',
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_script_records_created
            ON script_records (created_at);
        ",
    )?;
    Ok(())
}
