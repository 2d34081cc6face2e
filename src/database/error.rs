use thiserror::Error;

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Clone)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    /// A unique constraint rejected the write (e.g. a reused idempotency reference).
    UniqueViolation { constraint: Option<String> },
    Connection { message: String },
    /// A stored value could not be mapped back into a domain type.
    Decode { message: String },
    Query { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{}", self.describe())]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Decode {
            message: message.into(),
        })
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DatabaseErrorKind::UniqueViolation {
                    constraint: db.constraint().map(|c| c.to_string()),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::Connection {
                    message: err.to_string(),
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => DatabaseErrorKind::Decode {
                message: err.to_string(),
            },
            _ => DatabaseErrorKind::Query {
                message: err.to_string(),
            },
        };
        Self::new(kind)
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Connection { .. })
    }

    fn describe(&self) -> String {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => format!("{} '{}' not found", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => match constraint {
                Some(c) => format!("unique constraint violated: {}", c),
                None => "unique constraint violated".to_string(),
            },
            DatabaseErrorKind::Connection { message } => format!("connection error: {}", message),
            DatabaseErrorKind::Decode { message } => format!("decode error: {}", message),
            DatabaseErrorKind::Query { message } => format!("query error: {}", message),
        }
    }
}

impl From<DatabaseError> for crate::error::AppError {
    fn from(err: DatabaseError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable: err.is_retryable(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = DatabaseError::from_sqlx(sqlx::Error::RowNotFound);
        assert!(matches!(err.kind, DatabaseErrorKind::NotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err = DatabaseError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert!(!err.is_unique_violation());
    }
}
