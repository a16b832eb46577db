//! Persistence contracts and SQLite implementations.
//!
//! # Responsibility
//! - Keep SQL inside the persistence boundary.
//! - Expose use-case oriented traits that services compose inside one
//!   transaction (`rusqlite::Transaction` derefs to `Connection`).
//!
//! # Invariants
//! - Read paths reject invalid persisted state instead of masking it.
//! - Repositories never open transactions of their own, except the
//!   savepoint used by `EventStore::append_batch`.

use crate::db::DbError;
use crate::model::project::ProjectValidationError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod event_store;
pub mod package_repo;
pub mod project_repo;
pub mod quarantine_repo;
pub mod snapshot_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository failure.
#[derive(Debug)]
pub enum RepoError {
    Validation(ProjectValidationError),
    Db(DbError),
    NotFound { entity: &'static str, id: String },
    InvalidData(String),
}

impl RepoError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound { .. } | Self::InvalidData(_) => None,
        }
    }
}

impl From<ProjectValidationError> for RepoError {
    fn from(value: ProjectValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

pub(crate) fn parse_optional_uuid(value: Option<String>, column: &str) -> RepoResult<Option<Uuid>> {
    value.map(|text| parse_uuid(&text, column)).transpose()
}

pub(crate) fn to_db_int(value: u64, column: &str) -> RepoResult<i64> {
    i64::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("value {value} overflows {column}")))
}

pub(crate) fn from_db_int(value: i64, column: &str) -> RepoResult<u64> {
    u64::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("negative value {value} in {column}")))
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    i64::from(value)
}

/// Appends `LIMIT`/`OFFSET` clauses and their bind values.
pub(crate) fn push_page(
    sql: &mut String,
    bind_values: &mut Vec<rusqlite::types::Value>,
    limit: Option<u32>,
    offset: u32,
) {
    use rusqlite::types::Value;
    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        bind_values.push(Value::Integer(i64::from(limit)));
        if offset > 0 {
            sql.push_str(" OFFSET ?");
            bind_values.push(Value::Integer(i64::from(offset)));
        }
    } else if offset > 0 {
        sql.push_str(" LIMIT -1 OFFSET ?");
        bind_values.push(Value::Integer(i64::from(offset)));
    }
}
