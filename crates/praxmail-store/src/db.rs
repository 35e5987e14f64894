use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use praxmail_core::constants::STORE_CACHE_KIB;
use praxmail_core::error::MailError;
use praxmail_core::types::Timestamp;

/// Forward-only migration files, applied in order and recorded in the
/// `schema_migrations` ledger. Never edit an applied file; append a new one.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_schema.sql", include_str!("../migrations/0001_schema.sql")),
    ("0002_indexes.sql", include_str!("../migrations/0002_indexes.sql")),
];

/// Map a rusqlite error into the domain error without leaking the driver
/// type across crate boundaries.
pub fn storage(e: rusqlite::Error) -> MailError {
    MailError::Storage(e.to_string())
}

/// Durable store backed by a single SQLite file in WAL mode.
///
/// One handle per process; the mutex serializes writers (WAL still gives
/// readers of the file concurrency, but every core access goes through
/// this handle, which is the single-writer discipline the pipeline
/// relies on). All mutating component operations run inside
/// [`Store::transaction`].
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the store at `path`, apply durability pragmas and
    /// run any pending migrations in a single transaction.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MailError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| MailError::Storage(format!("creating {}: {e}", dir.display())))?;
            }
        }
        let conn = Connection::open(&path).map_err(storage)?;
        apply_pragmas(&conn)?;
        let store = Self { conn: Mutex::new(conn), path };
        store.run_migrations()?;
        Ok(store)
    }

    /// In-memory store for tests. Same pragmas and migrations, no file.
    pub fn open_in_memory() -> Result<Self, MailError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        apply_pragmas(&conn)?;
        let store = Self { conn: Mutex::new(conn), path: PathBuf::from(":memory:") };
        store.run_migrations()?;
        Ok(store)
    }

    /// Directory holding the store file (and its WAL/SHM sidecars).
    pub fn db_dir(&self) -> PathBuf {
        self.path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `f` against the connection without opening a transaction.
    /// For reads and single-statement writes.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, MailError>,
    ) -> Result<T, MailError> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside an immediate (write-locking) transaction. Any `Err`
    /// rolls the transaction back and is returned to the caller.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, MailError>,
    ) -> Result<T, MailError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(storage)?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls back; make it explicit.
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Liveness check: `SELECT 1` through the shared handle.
    pub fn ping(&self) -> Result<(), MailError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).map_err(storage)?;
            Ok(())
        })
    }

    /// Names of all user tables, for the store health probe.
    pub fn table_names(&self) -> Result<Vec<String>, MailError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .map_err(storage)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?;
            Ok(names)
        })
    }

    // ── Migrations ───────────────────────────────────────────────────────────

    fn run_migrations(&self) -> Result<(), MailError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 filename   TEXT PRIMARY KEY,
                 applied_at INTEGER NOT NULL
             )",
            [],
        )
        .map_err(storage)?;

        let now: Timestamp = chrono::Utc::now().timestamp();
        let mut applied = 0usize;
        for (filename, sql) in MIGRATIONS {
            let seen: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE filename = ?1)",
                    [filename],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            if seen {
                debug!(migration = filename, "already applied — skipping");
                continue;
            }
            tx.execute_batch(sql)
                .map_err(|e| MailError::Migration(format!("{filename}: {e}")))?;
            tx.execute(
                "INSERT INTO schema_migrations (filename, applied_at) VALUES (?1, ?2)",
                rusqlite::params![filename, now],
            )
            .map_err(storage)?;
            applied += 1;
        }
        tx.commit().map_err(storage)?;

        if applied > 0 {
            info!(applied, "database migrations applied");
        }
        Ok(())
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), MailError> {
    // journal_mode returns a row; the others do not.
    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
        .map_err(storage)?;
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA cache_size = -{STORE_CACHE_KIB};"
    ))
    .map_err(storage)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema_and_ledger() {
        let store = Store::open_in_memory().unwrap();
        store.ping().unwrap();
        let tables = store.table_names().unwrap();
        for required in ["emails", "events", "calendar_slots", "drafts", "settings"] {
            assert!(tables.iter().any(|t| t == required), "missing table {required}");
        }
        let recorded: i64 = store
            .with_conn(|c| {
                c.query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
                    .map_err(storage)
            })
            .unwrap();
        assert_eq!(recorded as usize, MIGRATIONS.len());
    }

    #[test]
    fn reopening_reapplies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("praxmail.db");
        {
            let _ = Store::open(&path).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let recorded: i64 = store
            .with_conn(|c| {
                c.query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
                    .map_err(storage)
            })
            .unwrap();
        assert_eq!(recorded as usize, MIGRATIONS.len(), "migrations must be recorded once");
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), MailError> = store.transaction(|tx| {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES ('k', 'v')",
                [],
            )
            .map_err(storage)?;
            Err(MailError::Storage("forced failure".into()))
        });
        assert!(result.is_err());
        let count: i64 = store
            .with_conn(|c| {
                c.query_row("SELECT COUNT(*) FROM settings WHERE key = 'k'", [], |r| r.get(0))
                    .map_err(storage)
            })
            .unwrap();
        assert_eq!(count, 0, "rolled-back insert must not be visible");
    }
}
