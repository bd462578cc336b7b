use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::fs::{self, File};
use std::future::Future;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::{info, warn};

static JOURNAL_RUNTIME: OnceLock<Runtime> = OnceLock::new();
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const OUTPUT_TAIL_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("unsupported journal url: {0} (only sqlite:// is supported)")]
    Unsupported(String),
    #[error("{0}")]
    Storage(String),
    #[error("journal runtime: {0}")]
    Runtime(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] MigrateError),
}

impl JournalError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "journal-url-unsupported",
            Self::Storage(_) => "journal-storage",
            Self::Runtime(_) => "journal-runtime",
            Self::Db(_) => "journal-db",
            Self::Migrate(_) => "journal-migrate",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEvent {
    pub iteration: i64,
    pub phase: String,
    pub code: i64,
    pub output: String,
}

/// Sqlite record of one run and its loop steps.
pub struct RunJournal {
    pool: SqlitePool,
    run_id: String,
}

fn runtime() -> Result<&'static Runtime, JournalError> {
    if let Some(runtime) = JOURNAL_RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = Runtime::new().map_err(|e| JournalError::Runtime(e.to_string()))?;
    Ok(JOURNAL_RUNTIME.get_or_init(|| runtime))
}

fn ensure_sqlite_storage(url: &str) -> Result<(), JournalError> {
    let Some(path) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = Path::new(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            JournalError::Storage(format!("journal-dir-create-failed path={} err={err}", parent.display()))
        })?;
    }
    // sqlx does not create a missing file on every sqlite build.
    if !path.exists() {
        File::create(path).map_err(|err| {
            JournalError::Storage(format!("journal-file-create-failed path={} err={err}", path.display()))
        })?;
    }
    Ok(())
}

fn output_tail(output: &str) -> &str {
    let trimmed = output.trim();
    let count = trimmed.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return trimmed;
    }
    let skip = count - OUTPUT_TAIL_CHARS;
    let start = trimmed.char_indices().nth(skip).map_or(0, |(idx, _)| idx);
    &trimmed[start..]
}

impl RunJournal {
    pub fn open(url: &str) -> Result<Self, JournalError> {
        let url = url.trim();
        if !url.starts_with("sqlite://") && !url.starts_with("sqlite::") {
            return Err(JournalError::Unsupported(url.to_string()));
        }
        ensure_sqlite_storage(url)?;
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = runtime()?.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await?;
            MIGRATOR.run(&pool).await?;
            Ok::<SqlitePool, JournalError>(pool)
        })?;
        let run_id = nanoid::nanoid!(12);
        info!("journal-open url={url} run_id={run_id}");
        Ok(Self { pool, run_id })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn with_pool<F, Fut, T>(&self, f: F) -> Result<T, JournalError>
    where
        F: FnOnce(SqlitePool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let pool = self.pool.clone();
        Ok(runtime()?.block_on(async move { f(pool).await })?)
    }

    pub fn begin(&self, crash_method: &str, target: &str, loops: Option<u64>) -> Result<(), JournalError> {
        let run_id = self.run_id.clone();
        let crash_method = crash_method.to_string();
        let target = target.to_string();
        let loops = loops.map(|n| n as i64);
        self.with_pool(|pool| async move {
            sqlx::query(
                "INSERT INTO runs (run_id, crash_method, target, loops_planned, started_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(crash_method)
            .bind(target)
            .bind(loops)
            .bind(crate::current_unix_secs() as i64)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    pub fn record(&self, iteration: u64, phase: &str, code: i32, output: &str) -> Result<(), JournalError> {
        let run_id = self.run_id.clone();
        let phase = phase.to_string();
        let output = output_tail(output).to_string();
        self.with_pool(|pool| async move {
            sqlx::query(
                "INSERT INTO run_events (run_id, ts, iteration, phase, code, output) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(crate::current_unix_secs() as i64)
            .bind(iteration as i64)
            .bind(phase)
            .bind(code)
            .bind(output)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    pub fn finish(&self, exit_code: i32, iterations: u64) -> Result<(), JournalError> {
        let run_id = self.run_id.clone();
        let status = if exit_code == 0 { "succeeded" } else { "failed" };
        self.with_pool(|pool| async move {
            sqlx::query(
                "UPDATE runs SET finished_at = ?, status = ?, exit_code = ?, iterations = ? WHERE run_id = ?",
            )
            .bind(crate::current_unix_secs() as i64)
            .bind(status)
            .bind(exit_code)
            .bind(iterations as i64)
            .bind(run_id)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    pub fn status(&self) -> Result<Option<(String, Option<i64>)>, JournalError> {
        let run_id = self.run_id.clone();
        self.with_pool(|pool| async move {
            let row = sqlx::query("SELECT status, exit_code FROM runs WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&pool)
                .await?;
            Ok(row.map(|row| (row.get::<String, _>("status"), row.get::<Option<i64>, _>("exit_code"))))
        })
    }

    pub fn events(&self) -> Result<Vec<JournalEvent>, JournalError> {
        let run_id = self.run_id.clone();
        self.with_pool(|pool| async move {
            let rows: Vec<SqliteRow> = sqlx::query(
                "SELECT iteration, phase, code, output FROM run_events WHERE run_id = ? ORDER BY id",
            )
            .bind(run_id)
            .fetch_all(&pool)
            .await?;
            Ok(rows
                .into_iter()
                .map(|row| JournalEvent {
                    iteration: row.get("iteration"),
                    phase: row.get("phase"),
                    code: row.get("code"),
                    output: row.get("output"),
                })
                .collect())
        })
    }
}

/// Opens the journal, degrading to no journal when it cannot be opened.
pub fn open_optional(url: Option<&str>) -> Option<RunJournal> {
    let url = url?.trim();
    if url.is_empty() {
        return None;
    }
    match RunJournal::open(url) {
        Ok(journal) => Some(journal),
        Err(err) => {
            warn!("journal-open-failed kind={} url={url} err={err}", err.kind());
            None
        }
    }
}
