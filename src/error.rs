//! Error types surfaced by the ledger and the approval workflows
use std::time::Duration;

use crate::types::BloodGroup;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("quantity must be a positive number of units")]
    ZeroQuantity,
    #[error("unknown blood group category: {0:?}")]
    UnknownBloodGroup(String),
    #[error("unknown movement kind: {0:?}")]
    UnknownMovement(String),
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("rejection reasons are only accepted with a Rejected outcome")]
    UnexpectedReason,
}

#[derive(thiserror::Error, Debug)]
pub enum BankError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{kind} '{id}' was not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("'{actor}' is not allowed to {action}")]
    Authorization { actor: String, action: &'static str },
    #[error("{kind} '{id}' cannot move from {from} to {to}")]
    InvalidState {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("insufficient {category} stock. Available: {available}, Requested: {requested}")]
    InsufficientStock {
        category: BloodGroup,
        available: i64,
        requested: u32,
    },
    #[error("{category} section is busy, gave up after {waited:?}")]
    Contention {
        category: BloodGroup,
        waited: Duration,
    },
    #[error("{category} ledger moved under another handle")]
    Stale { category: BloodGroup },
    #[error("ledger integrity check failed for {category}: {reason}")]
    Integrity {
        category: BloodGroup,
        reason: String,
    },
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("encoding failure: {0}")]
    Codec(String),
}

impl BankError {
    /// Lock contention and a head moved by another handle are worth
    /// retrying; every other failure is final for the given input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BankError::Contention { .. } | BankError::Stale { .. }
        )
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for BankError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        BankError::Codec(value.to_string())
    }
}

impl From<minicbor::decode::Error> for BankError {
    fn from(value: minicbor::decode::Error) -> Self {
        BankError::Codec(value.to_string())
    }
}

impl From<sled::transaction::TransactionError<BankError>> for BankError {
    fn from(value: sled::transaction::TransactionError<BankError>) -> Self {
        match value {
            sled::transaction::TransactionError::Abort(err) => err,
            sled::transaction::TransactionError::Storage(err) => BankError::Storage(err),
        }
    }
}

pub type Result<T, E = BankError> = std::result::Result<T, E>;

/// Lifts a fallible step into a sled transaction body, aborting the
/// transaction with the error instead of retrying it.
pub(crate) fn or_abort<T, E: Into<BankError>>(
    result: std::result::Result<T, E>,
) -> sled::transaction::ConflictableTransactionResult<T, BankError> {
    result.map_err(|err| sled::transaction::ConflictableTransactionError::Abort(err.into()))
}
