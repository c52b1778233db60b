use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::BoxFuture;
use super::error::{
    CreateSqliteDirectorySnafu, OpenDatabaseSnafu, SqliteMigrateSnafu, SqliteQuerySnafu,
    StorageResult,
};
use super::kv::KeyValueStore;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the history database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteLocation {
    Memory,
    File(PathBuf),
    /// Passed to sqlx untouched.
    Url(String),
}

impl SqliteLocation {
    pub fn parse(location: &str) -> Self {
        match location.trim() {
            ":memory:" | "sqlite::memory:" => Self::Memory,
            url if url.starts_with("sqlite:") => Self::Url(url.to_string()),
            path => Self::File(PathBuf::from(path)),
        }
    }

    pub fn database_url(&self) -> String {
        match self {
            Self::Memory => "sqlite::memory:".to_string(),
            Self::File(path) => format!("sqlite://{}", path.display()),
            Self::Url(url) => url.clone(),
        }
    }

    fn connect_options(&self) -> StorageResult<SqliteConnectOptions> {
        match self {
            // Paths skip URL parsing, so `?`, `#` and `%` stay literal.
            Self::File(path) => Ok(SqliteConnectOptions::new().filename(path)),
            Self::Memory | Self::Url(_) => {
                let database_url = self.database_url();
                SqliteConnectOptions::from_str(&database_url).context(OpenDatabaseSnafu {
                    stage: "sqlite-open-parse-url",
                    database_url,
                })
            }
        }
    }

    fn prepare(&self) -> StorageResult<()> {
        let Self::File(path) = self else {
            return Ok(());
        };

        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
                    stage: "sqlite-open-create-directory",
                    path: parent.to_path_buf(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl From<&Path> for SqliteLocation {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

/// SQLite-backed key-value table (`kv_entries`).
#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteKeyValueStore {
    pub async fn open(location: impl Into<SqliteLocation>) -> StorageResult<Self> {
        let location = location.into();
        location.prepare()?;

        let database_url = location.database_url();
        let options = location
            .connect_options()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        // One connection that never expires: `:memory:` data lives exactly as long as it does.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context(OpenDatabaseSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite key-value store");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu { stage: "kv-get" })
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(unix_timestamp_seconds())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu { stage: "kv-set" })?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM kv_entries WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu { stage: "kv-remove" })?;
            Ok(())
        })
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}
