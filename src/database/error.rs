use std::fmt;

/// Storage failure kinds shared by the Postgres and in-memory stores
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseErrorKind {
    /// No connection became free before the acquire timeout
    PoolExhausted,
    NotFound { entity: String, id: String },
    /// Postgres 23505, e.g. a second payment for the same transaction reference
    UniqueConstraintViolation { constraint: String },
    /// Postgres 23503, e.g. a mismatch for a payment that was never stored
    ForeignKeyViolation { table: String, constraint: String },
    /// A stored value could not be mapped back to a domain type
    InvalidData { entity: String, message: String },
    QueryError { message: String },
    TransactionError { message: String },
    ConnectionError { message: String },
    ConfigError { message: String },
    Unknown { message: String },
}

pub type DbResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.into(),
            id: id.into(),
        })
    }

    pub fn invalid_data(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::InvalidData {
            entity: entity.into(),
            message: message.into(),
        })
    }

    /// Worth retrying once the database is reachable again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::PoolExhausted | DatabaseErrorKind::ConnectionError { .. }
        )
    }

    pub fn from_sqlx(error: sqlx::Error) -> Self {
        let kind = match error {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut => DatabaseErrorKind::PoolExhausted,
            sqlx::Error::PoolClosed => DatabaseErrorKind::ConnectionError {
                message: "pool is closed".to_string(),
            },
            sqlx::Error::Configuration(msg) => DatabaseErrorKind::ConfigError {
                message: msg.to_string(),
            },
            sqlx::Error::Io(io_err) => DatabaseErrorKind::ConnectionError {
                message: io_err.to_string(),
            },
            sqlx::Error::Database(db_err) => {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                match db_err.code().as_deref() {
                    Some("23505") => DatabaseErrorKind::UniqueConstraintViolation { constraint },
                    Some("23503") => DatabaseErrorKind::ForeignKeyViolation {
                        table: db_err.table().unwrap_or("unknown").to_string(),
                        constraint,
                    },
                    _ => DatabaseErrorKind::QueryError {
                        message: db_err.message().to_string(),
                    },
                }
            }
            sqlx::Error::ColumnDecode { index, source } => DatabaseErrorKind::InvalidData {
                entity: "row".to_string(),
                message: format!("column {} could not be decoded: {}", index, source),
            },
            other => DatabaseErrorKind::Unknown {
                message: other.to_string(),
            },
        };
        Self::new(kind)
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::PoolExhausted => write!(f, "database pool exhausted"),
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            DatabaseErrorKind::UniqueConstraintViolation { constraint } => {
                write!(f, "duplicate value violates {}", constraint)
            }
            DatabaseErrorKind::ForeignKeyViolation { table, constraint } => {
                write!(f, "{} references a missing row ({})", table, constraint)
            }
            DatabaseErrorKind::InvalidData { entity, message } => {
                write!(f, "stored {} is invalid: {}", entity, message)
            }
            DatabaseErrorKind::QueryError { message } => write!(f, "query failed: {}", message),
            DatabaseErrorKind::TransactionError { message } => {
                write!(f, "transaction failed: {}", message)
            }
            DatabaseErrorKind::ConnectionError { message } => {
                write!(f, "database connection error: {}", message)
            }
            DatabaseErrorKind::ConfigError { message } => {
                write!(f, "database configuration error: {}", message)
            }
            DatabaseErrorKind::Unknown { message } => write!(f, "database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_retryable() {
        assert!(DatabaseError::new(DatabaseErrorKind::PoolExhausted).is_retryable());
        assert!(DatabaseError::from_sqlx(sqlx::Error::PoolClosed).is_retryable());
        assert!(!DatabaseError::not_found("payout", "ORD-1").is_retryable());
    }

    #[test]
    fn test_invalid_data_message() {
        let err = DatabaseError::invalid_data("payout", "unknown status 'paid'");
        assert_eq!(err.to_string(), "stored payout is invalid: unknown status 'paid'");
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = DatabaseError::from_sqlx(sqlx::Error::RowNotFound);
        assert!(matches!(err.kind, DatabaseErrorKind::NotFound { .. }));
    }
}
