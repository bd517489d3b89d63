//! SQLite mapping for scripts, hosts and script-run records.

use fleet_core::db::{self, uuid_column, SharedConnection};
use fleet_core::types::now_rfc3339;
use fleet_core::{PageRequest, Pager};
use rusqlite::{params, OptionalExtension, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Result, ScriptError};
use crate::types::{
    Host, NewHost, NewScript, Script, ScriptKind, ScriptRecord, ScriptRecordFilter,
    ScriptRunStatus,
};

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// `%keyword%` for a LIKE filter, or NULL to match everything.
fn like(keyword: Option<&str>) -> Option<String> {
    keyword
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| format!("%{k}%"))
}

fn row_to_script(row: &Row<'_>) -> rusqlite::Result<Script> {
    Ok(Script {
        id: uuid_column(row, 0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        content: row.get(3)?,
        kind: parsed_column::<ScriptKind>(row, 4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[derive(Clone)]
pub struct ScriptStore {
    conn: SharedConnection,
}

impl ScriptStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    #[instrument(skip(self, input), fields(title = %input.title))]
    pub fn insert(&self, input: NewScript) -> Result<Script> {
        let now = now_rfc3339();
        let script = Script {
            id: Uuid::new_v4(),
            title: input.title,
            description: input.description,
            content: input.content,
            kind: input.kind,
            created_at: now.clone(),
            updated_at: now,
        };
        db::lock(&self.conn).execute(
            "INSERT INTO scripts (id, title, description, content, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                script.id.to_string(),
                script.title,
                script.description,
                script.content,
                script.kind.as_str(),
                script.created_at,
                script.updated_at
            ],
        )?;
        Ok(script)
    }

    pub fn update(&self, id: Uuid, input: NewScript) -> Result<Script> {
        let n = db::lock(&self.conn).execute(
            "UPDATE scripts SET title = ?2, description = ?3, content = ?4, kind = ?5,
                    updated_at = ?6
             WHERE id = ?1",
            params![
                id.to_string(),
                input.title,
                input.description,
                input.content,
                input.kind.as_str(),
                now_rfc3339()
            ],
        )?;
        if n == 0 {
            return Err(ScriptError::ScriptNotFound { id });
        }
        self.detail(id)
    }

    pub fn find(&self, id: Uuid) -> Result<Option<Script>> {
        Ok(db::lock(&self.conn)
            .query_row(
                "SELECT id, title, description, content, kind, created_at, updated_at
                 FROM scripts WHERE id = ?1",
                [id.to_string()],
                row_to_script,
            )
            .optional()?)
    }

    pub fn detail(&self, id: Uuid) -> Result<Script> {
        self.find(id)?.ok_or(ScriptError::ScriptNotFound { id })
    }

    pub fn page(&self, keyword: Option<&str>, req: PageRequest) -> Result<Pager<Script>> {
        let pattern = like(keyword);
        let db = db::lock(&self.conn);
        let total: i64 = db.query_row(
            "SELECT COUNT(*) FROM scripts WHERE (?1 IS NULL OR title LIKE ?1)",
            params![pattern],
            |r| r.get(0),
        )?;
        let mut stmt = db.prepare(
            "SELECT id, title, description, content, kind, created_at, updated_at
             FROM scripts WHERE (?1 IS NULL OR title LIKE ?1)
             ORDER BY created_at DESC, id LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![pattern, req.limit(), req.offset()], row_to_script)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Pager::new(rows, total as u64, req))
    }

    /// Delete every id or none of them.
    pub fn delete_many(&self, ids: &[Uuid]) -> Result<usize> {
        db::transaction(&self.conn, |tx| {
            for id in ids {
                if tx.execute("DELETE FROM scripts WHERE id = ?1", [id.to_string()])? == 0 {
                    return Err(ScriptError::ScriptNotFound { id: *id });
                }
            }
            Ok(ids.len())
        })
    }
}

const HOST_COLUMNS: &str =
    "id, title, address, port, username, password, identity_file, created_at, updated_at";

fn row_to_host(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: uuid_column(row, 0)?,
        title: row.get(1)?,
        address: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        password: row.get(5)?,
        identity_file: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[derive(Clone)]
pub struct HostStore {
    conn: SharedConnection,
}

impl HostStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    #[instrument(skip(self, input), fields(address = %input.address))]
    pub fn insert(&self, input: NewHost) -> Result<Host> {
        let now = now_rfc3339();
        let host = Host {
            id: Uuid::new_v4(),
            title: input.title,
            address: input.address,
            port: input.port,
            username: input.username,
            password: input.password,
            identity_file: input.identity_file,
            created_at: now.clone(),
            updated_at: now,
        };
        db::lock(&self.conn).execute(
            &format!("INSERT INTO hosts ({HOST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                host.id.to_string(),
                host.title,
                host.address,
                host.port,
                host.username,
                host.password,
                host.identity_file,
                host.created_at,
                host.updated_at
            ],
        )?;
        Ok(host)
    }

    pub fn update(&self, id: Uuid, input: NewHost) -> Result<Host> {
        let n = db::lock(&self.conn).execute(
            "UPDATE hosts SET title = ?2, address = ?3, port = ?4, username = ?5,
                    password = ?6, identity_file = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                id.to_string(),
                input.title,
                input.address,
                input.port,
                input.username,
                input.password,
                input.identity_file,
                now_rfc3339()
            ],
        )?;
        if n == 0 {
            return Err(ScriptError::HostNotFound { id });
        }
        self.detail(id)
    }

    pub fn find(&self, id: Uuid) -> Result<Option<Host>> {
        Ok(db::lock(&self.conn)
            .query_row(
                &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
                [id.to_string()],
                row_to_host,
            )
            .optional()?)
    }

    pub fn detail(&self, id: Uuid) -> Result<Host> {
        self.find(id)?.ok_or(ScriptError::HostNotFound { id })
    }

    pub fn page(&self, keyword: Option<&str>, req: PageRequest) -> Result<Pager<Host>> {
        let pattern = like(keyword);
        let db = db::lock(&self.conn);
        let total: i64 = db.query_row(
            "SELECT COUNT(*) FROM hosts
             WHERE (?1 IS NULL OR title LIKE ?1 OR address LIKE ?1)",
            params![pattern],
            |r| r.get(0),
        )?;
        let mut stmt = db.prepare(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts
             WHERE (?1 IS NULL OR title LIKE ?1 OR address LIKE ?1)
             ORDER BY created_at DESC, id LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(params![pattern, req.limit(), req.offset()], row_to_host)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Pager::new(rows, total as u64, req))
    }

    pub fn delete_many(&self, ids: &[Uuid]) -> Result<usize> {
        db::transaction(&self.conn, |tx| {
            for id in ids {
                if tx.execute("DELETE FROM hosts WHERE id = ?1", [id.to_string()])? == 0 {
                    return Err(ScriptError::HostNotFound { id: *id });
                }
            }
            Ok(ids.len())
        })
    }
}

const RECORD_COLUMNS: &str = "id, script_title, script, hosts, params, result, status, message,
                              error, created_at, updated_at";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ScriptRecord> {
    Ok(ScriptRecord {
        id: uuid_column(row, 0)?,
        script_title: row.get(1)?,
        script: row.get(2)?,
        hosts: row.get(3)?,
        params: row.get(4)?,
        result: row.get(5)?,
        status: parsed_column::<ScriptRunStatus>(row, 6)?,
        message: row.get(7)?,
        error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[derive(Clone)]
pub struct ScriptRecordStore {
    conn: SharedConnection,
}

impl ScriptRecordStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Write the whole row, inserting it on first save.
    ///
    /// Callers own the record exclusively while saving, so every write
    /// replaces a consistent snapshot rather than patching fields.
    pub fn save(&self, record: &ScriptRecord) -> Result<()> {
        db::lock(&self.conn).execute(
            &format!(
                "INSERT INTO script_records ({RECORD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    script_title = excluded.script_title,
                    script       = excluded.script,
                    hosts        = excluded.hosts,
                    params       = excluded.params,
                    result       = excluded.result,
                    status       = excluded.status,
                    message      = excluded.message,
                    error        = excluded.error,
                    updated_at   = excluded.updated_at"
            ),
            params![
                record.id.to_string(),
                record.script_title,
                record.script,
                record.hosts,
                record.params,
                record.result,
                record.status.as_str(),
                record.message,
                record.error,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn detail(&self, id: Uuid) -> Result<ScriptRecord> {
        db::lock(&self.conn)
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM script_records WHERE id = ?1"),
                [id.to_string()],
                row_to_record,
            )
            .optional()?
            .ok_or(ScriptError::RecordNotFound { id })
    }

    /// Newest first. The host snapshot is blanked out of every row.
    pub fn page(&self, filter: &ScriptRecordFilter, req: PageRequest) -> Result<Pager<ScriptRecord>> {
        let status = filter.status.map(|s| s.as_str());
        let title = like(filter.script_title.as_deref());
        let db = db::lock(&self.conn);
        let total: i64 = db.query_row(
            "SELECT COUNT(*) FROM script_records
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR script_title LIKE ?2)",
            params![status, title],
            |r| r.get(0),
        )?;
        let mut stmt = db.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM script_records
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR script_title LIKE ?2)
             ORDER BY created_at DESC, id LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt
            .query_map(params![status, title, req.limit(), req.offset()], row_to_record)?
            .map(|r| {
                r.map(|mut rec| {
                    rec.hosts.clear();
                    rec
                })
            })
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Pager::new(rows, total as u64, req))
    }
}
