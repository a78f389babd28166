#![deny(missing_docs)]

//! `taipan` is a library to create and update Conda environments: it ties
//! the repodata gateway, the solver, the package cache and the fetch
//! pipeline together and applies the resulting plan to a prefix as a
//! transaction with rollback.
//!
//! The typical flow of an install operation:
//!
//! 1. Load the installed state with
//!    [`taipan_conda_types::PrefixData::from_prefix`].
//! 2. Load the channel indices with [`taipan_repodata::SubdirData::load`]
//!    and feed the records into a [`taipan_solve::Pool`].
//! 3. Build jobs with [`solve::prepare_jobs`] (this applies the python
//!    pinning rule) and solve them.
//! 4. Diff the solution against the installed state with
//!    [`transaction::Transaction::from_current_and_desired`].
//! 5. Apply it with [`driver::execute_transaction`].

pub mod context;
pub mod driver;
pub mod explicit;
pub mod fetch;
pub mod install;
pub mod prefix_lock;
pub mod solve;
pub mod transaction;

pub use context::{CancellationFlag, Cancelled, Context};
pub use driver::{execute_transaction, ExecuteTransactionError, StepError, UserRequest};
pub use fetch::{fetch_packages, FetchPackagesError};
pub use prefix_lock::{PrefixLock, PrefixLockError};
pub use transaction::{Transaction, TransactionError, TransactionOperation};

/// The coarse classification of a failed operation, used by embedders to
/// map errors to process exit codes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// The specs cannot be satisfied; the prefix was not modified.
    Unsolvable,
    /// Fetching repodata or packages failed; the prefix was not modified.
    FetchFailed,
    /// The transaction failed and was rolled back.
    TransactionRolledBack,
    /// The transaction failed and rollback was incomplete.
    TransactionFailed,
    /// The operation was interrupted and rolled back.
    Interrupted,
    /// Another process owns the prefix.
    PrefixLocked,
}

impl ErrorKind {
    /// The conventional exit code of this error kind.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Unsolvable => 1,
            ErrorKind::FetchFailed => 2,
            ErrorKind::TransactionRolledBack => 3,
            ErrorKind::TransactionFailed => 4,
            ErrorKind::PrefixLocked => 5,
            ErrorKind::Interrupted => 130,
        }
    }
}

impl From<&ExecuteTransactionError> for ErrorKind {
    fn from(error: &ExecuteTransactionError) -> Self {
        match error {
            ExecuteTransactionError::PrefixLock(_) => ErrorKind::PrefixLocked,
            ExecuteTransactionError::Fetch(FetchPackagesError::Cancelled) => ErrorKind::Interrupted,
            ExecuteTransactionError::Fetch(_) => ErrorKind::FetchFailed,
            ExecuteTransactionError::RolledBack(
                StepError::Cancelled
                | StepError::InstallError(install::InstallError::Cancelled),
            ) => ErrorKind::Interrupted,
            ExecuteTransactionError::RolledBack(_) => ErrorKind::TransactionRolledBack,
            ExecuteTransactionError::RollbackFailed(_) => ErrorKind::TransactionFailed,
            ExecuteTransactionError::HistoryError(_) => ErrorKind::TransactionFailed,
        }
    }
}
