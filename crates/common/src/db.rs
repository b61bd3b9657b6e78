use anyhow::Result;
use rusqlite::Connection;
use std::time::Duration;

/// Ordered schema steps. A step's version is its 1-based position; never
/// reorder or edit a shipped step, append a new one instead.
const MIGRATIONS: &[(&str, &str)] = &[
    ("initial schema", include_str!("../migrations/001_initial.sql")),
    (
        "audit failures and claims",
        include_str!("../migrations/002_failures_and_claims.sql"),
    ),
    (
        "token queue, hit listings and run history",
        include_str!("../migrations/003_token_queue_and_runs.sql"),
    ),
];

pub fn schema_version(conn: &Connection) -> std::result::Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Apply every migration newer than the stored version, each in its own
/// transaction together with its `schema_version` row.
pub fn run_migrations(conn: &mut Connection) -> std::result::Result<usize, rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let current = schema_version(conn)?;

    let mut applied = 0;
    for (i, (description, sql)) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
            rusqlite::params![version, description],
        )?;
        tx.commit()?;
        tracing::info!(version, description, "applied schema migration");
        applied += 1;
    }
    Ok(applied)
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// SQLite access for async code.
///
/// All writes go through one `tokio_rusqlite` connection, i.e. one
/// background thread, so concurrent callers queue instead of hitting
/// `database is locked`. File-backed databases also get a second,
/// query-only connection for reads, which WAL lets run beside the writer.
/// `:memory:` databases are private to their connection, so reads share
/// the writer there. Clone is cheap.
#[derive(Clone)]
pub struct AsyncDb {
    writer: tokio_rusqlite::Connection,
    reader: Option<tokio_rusqlite::Connection>,
}

/// Startup lock handling: SQLite's own wait stays short and this loop backs
/// off between attempts, so an overlapping run or an admin shell holding the
/// write lock delays startup instead of failing it.
const LOCK_BACKOFF_FIRST: Duration = Duration::from_secs(1);
const LOCK_BACKOFF_CAP: Duration = Duration::from_secs(30);
const LOCK_WAIT_LIMIT: Duration = Duration::from_secs(10 * 60);

async fn prepare_writer(writer: &tokio_rusqlite::Connection) -> Result<usize> {
    let waited_since = std::time::Instant::now();
    let mut pause = LOCK_BACKOFF_FIRST;
    loop {
        let attempt = writer
            .call(|conn| -> std::result::Result<usize, rusqlite::Error> {
                conn.busy_timeout(Duration::from_secs(1))?;
                let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get(0)
                })?;
                if !mode.eq_ignore_ascii_case("wal") {
                    tracing::debug!(mode, "journal mode stays non-WAL");
                }
                conn.pragma_update(None, "foreign_keys", "ON")?;
                let applied = run_migrations(conn)?;
                conn.busy_timeout(Duration::from_secs(30))?;
                Ok(applied)
            })
            .await;

        let err = match attempt {
            Ok(applied) => return Ok(applied),
            Err(tokio_rusqlite::Error::Error(err)) => err,
            Err(other) => anyhow::bail!("schema setup failed: {other}"),
        };
        if !is_locked(&err) {
            return Err(anyhow::Error::from(err).context("schema migration failed"));
        }
        if waited_since.elapsed() >= LOCK_WAIT_LIMIT {
            return Err(anyhow::Error::from(err)
                .context("schema migration failed: database stayed locked"));
        }
        tracing::warn!(retry_in = ?pause, "database locked during startup; waiting");
        tokio::time::sleep(pause).await;
        pause = (pause * 2).min(LOCK_BACKOFF_CAP);
    }
}

fn flatten(err: tokio_rusqlite::Error<anyhow::Error>) -> anyhow::Error {
    match err {
        tokio_rusqlite::Error::Error(inner) => inner,
        tokio_rusqlite::Error::ConnectionClosed => anyhow::anyhow!("sqlite worker has shut down"),
        tokio_rusqlite::Error::Close((_, close_err)) => {
            anyhow::anyhow!("sqlite close failed: {close_err}")
        }
        other => anyhow::anyhow!("sqlite call failed: {other}"),
    }
}

impl AsyncDb {
    /// Open `path`, set PRAGMAs and run pending migrations.
    pub async fn open(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";
        if !in_memory {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let writer = tokio_rusqlite::Connection::open(path).await?;
        let applied = prepare_writer(&writer).await?;
        tracing::debug!(path, applied, "store schema ready");

        let reader = if in_memory {
            None
        } else {
            let reader = tokio_rusqlite::Connection::open(path).await?;
            reader
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(Duration::from_secs(30))?;
                    conn.pragma_update(None, "query_only", "ON")?;
                    Ok(())
                })
                .await
                .map_err(|e| anyhow::anyhow!("read connection setup failed: {e}"))?;
            Some(reader)
        };

        Ok(Self { writer, reader })
    }

    async fn run_on<F, R>(conn: &tokio_rusqlite::Connection, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        conn.call(function).await.map_err(flatten)
    }

    /// Run a closure on the writer thread.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        Self::run_on(&self.writer, function).await
    }

    /// Like [`Self::call`], recording `auditor_db_query_latency_ms` and
    /// `auditor_db_query_errors_total` under `op`. Latency includes queueing
    /// behind other writes.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        timed(op, Self::run_on(&self.writer, function)).await
    }

    /// Read-only variant of [`Self::call_named`]; does not queue behind writes
    /// on file-backed databases.
    pub async fn read_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.reader.as_ref().unwrap_or(&self.writer);
        timed(op, Self::run_on(conn, function)).await
    }
}

async fn timed<R>(op: &'static str, fut: impl std::future::Future<Output = Result<R>>) -> Result<R> {
    let began = std::time::Instant::now();
    let res = fut.await;
    let ms = began.elapsed().as_secs_f64() * 1000.0;

    let status = if res.is_ok() { "ok" } else { "err" };
    metrics::histogram!("auditor_db_query_latency_ms", "op" => op, "status" => status).record(ms);
    if res.is_err() {
        metrics::counter!("auditor_db_query_errors_total", "op" => op).increment(1);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_database_gets_every_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        let tables = table_names(&conn);
        for t in [
            "tokens",
            "wallets",
            "discovery_hits",
            "audit_records",
            "wallet_portfolio",
            "bots",
            "manual_queue",
            "audit_failures",
            "audit_claims",
            "token_queue",
            "run_history",
            "schema_version",
        ] {
            assert!(tables.contains(&t.to_string()), "missing table {t}; got {tables:?}");
        }
        assert_eq!(schema_version(&conn).unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_second_migration_pass_is_a_no_op() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&mut conn).unwrap(), 0);

        let logged: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(logged, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_partial_schema_is_upgraded_in_order() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .unwrap();
        conn.execute_batch(MIGRATIONS[0].1).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, description) VALUES (1, 'initial schema')",
            [],
        )
        .unwrap();

        assert_eq!(run_migrations(&mut conn).unwrap(), MIGRATIONS.len() - 1);
        let has_listing: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('discovery_hits') WHERE name='listing'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(has_listing, 1);
    }

    #[tokio::test]
    async fn test_open_in_memory_is_fully_migrated() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let version: i64 = db.call(|conn| Ok(schema_version(conn)?)).await.unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_file_db_reads_see_committed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("auditor.db");
        let db = AsyncDb::open(path.to_str().unwrap()).await.unwrap();
        assert!(db.reader.is_some());

        db.call(|conn| {
            conn.execute("INSERT INTO wallets (address) VALUES ('W1')", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let n: i64 = db
            .read_named("test.count", |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM wallets", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(n, 1);

        let write_on_reader: Result<()> = db
            .read_named("test.write", |conn| {
                conn.execute("INSERT INTO wallets (address) VALUES ('W2')", [])?;
                Ok(())
            })
            .await;
        assert!(write_on_reader.is_err());
    }

    #[tokio::test]
    async fn test_sql_errors_surface_through_call() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let err = db
            .call(|conn| Ok(conn.execute("DELETE FROM no_such_table", [])?))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no_such_table"));
    }
}
