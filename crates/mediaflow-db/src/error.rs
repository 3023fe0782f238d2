//! Database errors, classified by what a caller can do about them.
//!
//! | Driver error | Variant |
//! |--------------|---------|
//! | Unique / primary key violation (SQLite 2067, 1555; Postgres 23505) | `Constraint(Unique)` |
//! | Foreign key violation (SQLite 787; Postgres 23503) | `Constraint(ForeignKey)` |
//! | Check violation (SQLite 275; Postgres 23514) | `Constraint(Check)` |
//! | Not-null violation (SQLite 1299; Postgres 23502) | `Constraint(NotNull)` |
//! | Pool exhausted / closed, IO, TLS | `Unavailable` |
//! | Anything else | `Query` |

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::Check => "check",
            ConstraintKind::NotNull => "not null",
        })
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Constraint violation ({kind}): {message}")]
    Constraint { kind: ConstraintKind, message: String },

    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Query(#[source] sqlx::Error),
}

impl DbError {
    /// Worth retrying later: the store could not be reached.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, DbError::Constraint { .. })
    }
}

fn constraint_kind(code: &str) -> Option<ConstraintKind> {
    match code {
        "2067" | "1555" | "23505" => Some(ConstraintKind::Unique),
        "787" | "23503" => Some(ConstraintKind::ForeignKey),
        "275" | "23514" => Some(ConstraintKind::Check),
        "1299" | "23502" => Some(ConstraintKind::NotNull),
        _ => None,
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                DbError::Unavailable("connection pool exhausted".to_string())
            }
            sqlx::Error::PoolClosed => DbError::Unavailable("connection pool is closed".to_string()),
            sqlx::Error::Io(e) => DbError::Unavailable(e.to_string()),
            sqlx::Error::Tls(e) => DbError::Unavailable(e.to_string()),
            sqlx::Error::Database(db_err) => {
                let kind = db_err
                    .code()
                    .and_then(|code| constraint_kind(code.as_ref()))
                    .or(match db_err.kind() {
                        sqlx::error::ErrorKind::UniqueViolation => Some(ConstraintKind::Unique),
                        sqlx::error::ErrorKind::ForeignKeyViolation => {
                            Some(ConstraintKind::ForeignKey)
                        }
                        sqlx::error::ErrorKind::CheckViolation => Some(ConstraintKind::Check),
                        sqlx::error::ErrorKind::NotNullViolation => Some(ConstraintKind::NotNull),
                        _ => None,
                    });

                match kind {
                    Some(kind) => DbError::Constraint {
                        kind,
                        message: db_err.message().to_string(),
                    },
                    None => DbError::Query(sqlx::Error::Database(db_err)),
                }
            }
            other => DbError::Query(other),
        }
    }
}
