use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("could not create history directory {path:?} on `{stage}`: {source}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not open history database `{database_url}` on `{stage}`: {source}"))]
    OpenDatabase {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("history schema migration failed on `{stage}`: {source}"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed on `{stage}`: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to encode chat history on `{stage}`: {source}"))]
    EncodeHistory {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode chat history on `{stage}`: {source}"))]
    DecodeHistory {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("chat history record has unknown role `{role}` on `{stage}`"))]
    UnknownRole { stage: &'static str, role: String },
}

pub type StorageResult<T> = Result<T, StorageError>;
