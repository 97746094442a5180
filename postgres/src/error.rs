//! Translation of driver errors into [`StoreError`].
//!
//! | SQLSTATE | Meaning | `StoreError` |
//! |---|---|---|
//! | `40001` | serialization failure | `SerializationFailure` |
//! | `40P01` | deadlock detected | `Deadlock` |
//! | `23505` | unique violation | `UniqueViolation { constraint }` |
//! | other | | `Database` |

use turnstile_core::StoreError;

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

/// Classify a driver error.
pub(crate) fn map_sqlx(error: sqlx::Error) -> StoreError {
    let mapped = match &error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(SERIALIZATION_FAILURE) => StoreError::SerializationFailure(db.message().to_string()),
            Some(DEADLOCK_DETECTED) => StoreError::Deadlock(db.message().to_string()),
            Some(UNIQUE_VIOLATION) => StoreError::UniqueViolation {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            },
            _ => StoreError::Database(error.to_string()),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Codec(error.to_string())
        }
        _ => StoreError::Database(error.to_string()),
    };

    metrics::counter!("turnstile_store_errors_total", "kind" => kind(&mapped)).increment(1);
    match &mapped {
        StoreError::Database(detail) => tracing::error!(error = %detail, "Database error"),
        other => tracing::debug!(error = %other, "Store reported a rejection"),
    }
    mapped
}

/// Error for a stored value the model rejects.
pub(crate) fn codec(column: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Codec(format!("column {column}: {detail}"))
}

const fn kind(error: &StoreError) -> &'static str {
    match error {
        StoreError::VersionConflict { .. } => "version_conflict",
        StoreError::SerializationFailure(_) => "serialization_failure",
        StoreError::Deadlock(_) => "deadlock",
        StoreError::UniqueViolation { .. } => "unique_violation",
        StoreError::NotFound(_) => "not_found",
        StoreError::Database(_) => "database",
        StoreError::Codec(_) => "codec",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_infrastructure() {
        assert!(matches!(
            map_sqlx(sqlx::Error::PoolTimedOut),
            StoreError::Database(_)
        ));
        assert!(matches!(
            map_sqlx(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
    }

    #[test]
    fn codec_errors_name_the_column() {
        let error = codec("status", "invalid registration status: lost");
        assert_eq!(
            error,
            StoreError::Codec("column status: invalid registration status: lost".to_string())
        );
    }
}
