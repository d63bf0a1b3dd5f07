//! Error types for creditline storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
///
/// Insufficient balance and duplicate notifications are not errors at this
/// layer; they are reported through the return values of the compound
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record (`account`, `order`, `job`).
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Credit amounts must be positive and keep the balance in range.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),
}

impl StoreError {
    /// Build a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::Database(e.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<creditline_core::IdError> for StoreError {
    fn from(e: creditline_core::IdError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<StoreError> for creditline_core::BillingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity: "account", id } => Self::AccountNotFound { account_id: id },
            StoreError::NotFound { entity: "order", id } => Self::OrderNotFound { order_id: id },
            StoreError::NotFound { entity: "job", id } => Self::JobNotFound { job_id: id },
            StoreError::InvalidAmount(amount) => {
                Self::InvalidAmount(format!(
                    "amount must be positive and keep the balance in range, got {amount}"
                ))
            }
            other => Self::Storage(other.to_string()),
        }
    }
}
