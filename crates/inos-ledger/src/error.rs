use inos_shm::ShmError;
use thiserror::Error;

/// Errors raised by ledger operations.
///
/// Fatal to the calling operation, never to the process; balances are only
/// mutated after every check passes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The account registry is at its fixed ceiling.
    #[error("account registry is full ({max} accounts)")]
    CapacityExhausted { max: usize },

    /// No account is registered under this did.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// A negative amount, or a release larger than the outstanding hold.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// A region access escaped its bounds.
    #[error(transparent)]
    Shm(#[from] ShmError),
}
