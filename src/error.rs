use diesel::result::DatabaseErrorKind;
use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Business and infrastructure failures surfaced by the engines.
///
/// Business outcomes (insufficient stock, expired hold, settled order) are
/// ordinary variants; the HTTP layer maps each kind to a status code in one
/// place.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: i32,
        requested: i32,
        available: i64,
    },

    #[error("hold {0} has expired")]
    HoldExpired(Uuid),

    #[error("hold {hold_id} is {status}, expected active")]
    HoldNotActive { hold_id: Uuid, status: String },

    #[error("order {order_id} is already {status}")]
    TerminalState { order_id: Uuid, status: String },

    #[error("admission lock busy for product {0}")]
    SystemBusy(i32),

    #[error("stock invariant violated for product {product_id}: stock {stock}, deduction {quantity}")]
    StockInvariantViolation {
        product_id: i32,
        stock: i32,
        quantity: i32,
    },

    #[error("transaction failed after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        source: diesel::result::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Deadlock-class failures are retried transparently by the store.
    pub fn is_deadlock(&self) -> bool {
        match self {
            EngineError::Database(source) => is_deadlock_error(source),
            _ => false,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            EngineError::Database(diesel::result::Error::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _,
            ))
        )
    }

    /// Tag a retried-out deadlock with the attempt budget it exhausted.
    pub fn into_transient(self, attempts: u32) -> Self {
        match self {
            EngineError::Database(source) => EngineError::Transient { attempts, source },
            other => other,
        }
    }
}

fn is_deadlock_error(error: &diesel::result::Error) -> bool {
    match error {
        diesel::result::Error::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => true,
        // Postgres reports lock cycles as 40P01, which diesel does not classify.
        diesel::result::Error::DatabaseError(_, info) => {
            info.message().contains("deadlock detected")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_error(kind: DatabaseErrorKind, message: &str) -> EngineError {
        EngineError::Database(diesel::result::Error::DatabaseError(
            kind,
            Box::new(message.to_string()),
        ))
    }

    #[test]
    fn serialization_failure_is_deadlock() {
        let err = db_error(DatabaseErrorKind::SerializationFailure, "could not serialize");
        assert!(err.is_deadlock());
    }

    #[test]
    fn postgres_deadlock_message_is_deadlock() {
        let err = db_error(DatabaseErrorKind::Unknown, "deadlock detected");
        assert!(err.is_deadlock());
    }

    #[test]
    fn unique_violation_is_not_deadlock() {
        let err = db_error(DatabaseErrorKind::UniqueViolation, "duplicate key value");
        assert!(!err.is_deadlock());
        assert!(err.is_unique_violation());
    }

    #[test]
    fn business_errors_are_not_retryable() {
        let err = EngineError::InsufficientStock {
            product_id: 1,
            requested: 5,
            available: 2,
        };
        assert!(!err.is_deadlock());
        assert!(!err.is_unique_violation());
    }

    #[test]
    fn into_transient_preserves_non_database_errors() {
        let err = EngineError::SystemBusy(7).into_transient(5);
        assert!(matches!(err, EngineError::SystemBusy(7)));

        let err = db_error(DatabaseErrorKind::SerializationFailure, "retry").into_transient(5);
        assert!(matches!(err, EngineError::Transient { attempts: 5, .. }));
    }
}
