//! Shared SQLite access.
//!
//! The whole process talks to one database file through a single
//! `Arc<Mutex<Connection>>`. Statements are short and never held across an
//! `.await`, so a plain std mutex is enough for the single-node target.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open (or create) the database file at `path`.
pub fn open(path: &str) -> Result<SharedConnection> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    info!(%path, "opening SQLite database");
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Private in-memory database, used by tests.
pub fn open_in_memory() -> Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Lock the shared connection.
///
/// A panic while the lock was held leaves SQLite itself consistent (an open
/// transaction is rolled back when its guard drops), so poisoning is ignored.
pub fn lock(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
pub fn transaction<T, E>(
    conn: &SharedConnection,
    f: impl FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
) -> std::result::Result<T, E>
where
    E: From<rusqlite::Error>,
{
    let mut guard = lock(conn);
    let tx = guard.transaction()?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

/// Read a TEXT column holding a UUID.
pub fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_rolls_back_on_error() {
        let conn = open_in_memory().unwrap();
        lock(&conn)
            .execute_batch("CREATE TABLE t (v INTEGER NOT NULL)")
            .unwrap();

        let failed: std::result::Result<(), rusqlite::Error> = transaction(&conn, |tx| {
            tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(failed.is_err());

        let ok: std::result::Result<(), rusqlite::Error> = transaction(&conn, |tx| {
            tx.execute("INSERT INTO t (v) VALUES (2)", [])?;
            Ok(())
        });
        assert!(ok.is_ok());

        let values: Vec<i64> = {
            let db = lock(&conn);
            let mut stmt = db.prepare("SELECT v FROM t").unwrap();
            let rows = stmt.query_map([], |r| r.get(0)).unwrap();
            rows.collect::<rusqlite::Result<_>>().unwrap()
        };
        assert_eq!(values, vec![2]);
    }

    #[test]
    fn uuid_column_rejects_garbage() {
        let conn = open_in_memory().unwrap();
        let db = lock(&conn);
        let id = Uuid::new_v4();
        let parsed = db
            .query_row("SELECT ?1", [id.to_string()], |r| uuid_column(r, 0))
            .unwrap();
        assert_eq!(parsed, id);
        assert!(db
            .query_row("SELECT 'nope'", [], |r| uuid_column(r, 0))
            .is_err());
    }
}
