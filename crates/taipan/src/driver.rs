//! Executing a transaction against a prefix.
//!
//! The driver owns the whole lifecycle: it takes the prefix lock, cleans
//! leftover trash, runs the fetch pipeline, applies the ordered link and
//! unlink operations while maintaining a rollback stack, drains the
//! bytecode compilation queue, and appends the history entry. Any failure
//! after the first prefix mutation unwinds the completed operations in
//! reverse order; the original error is surfaced and rollback errors are
//! only logged.

use std::collections::BTreeSet;
use std::path::Path;

use taipan_cache::MultiPackageCache;
use taipan_conda_types::{History, Link, PrefixRecord, RepoDataRecord, Revision};

use crate::{
    context::Context,
    fetch::{fetch_packages, FetchPackagesError},
    install::{
        link_package, link_script::LinkScriptError, link_script::LinkScriptKind,
        link_script::run_link_script, pyc::PycCompilationQueue, unlink_package, InstallError,
        InstallOptions, UnlinkError,
    },
    prefix_lock::{PrefixLock, PrefixLockError},
    transaction::{Transaction, TransactionOperation},
};

/// The description of the user request recorded in the history file.
#[derive(Debug, Clone, Default)]
pub struct UserRequest {
    /// The command line that initiated the transaction.
    pub cmd: String,
    /// The specs the user asked to install or update.
    pub update_specs: Vec<String>,
    /// The specs the user asked to remove.
    pub remove_specs: Vec<String>,
}

/// A failure of a single transaction step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The package is not available in any cache, although the fetch
    /// pipeline ran.
    #[error("package '{0}' is not available in the package cache")]
    PackageNotAvailable(String),

    /// Linking the package failed.
    #[error(transparent)]
    InstallError(#[from] InstallError),

    /// Unlinking the package failed.
    #[error(transparent)]
    UnlinkError(#[from] UnlinkError),

    /// A pre/post link script failed.
    #[error(transparent)]
    LinkScriptError(#[from] LinkScriptError),

    /// Writing a conda-meta record failed.
    #[error("failed to write the conda-meta record")]
    FailedToWriteRecord(#[source] std::io::Error),

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

/// The error of [`execute_transaction`].
#[derive(Debug, thiserror::Error)]
pub enum ExecuteTransactionError {
    /// The prefix lock could not be acquired.
    #[error(transparent)]
    PrefixLock(#[from] PrefixLockError),

    /// The fetch pipeline failed; the prefix was not touched.
    #[error(transparent)]
    Fetch(#[from] FetchPackagesError),

    /// A step failed after the prefix had been touched; all completed
    /// steps were undone and the prefix is back in its previous state.
    #[error("the transaction was rolled back")]
    RolledBack(#[source] StepError),

    /// A step failed and undoing the completed steps failed too; the
    /// prefix may be inconsistent.
    #[error("the transaction failed and could not be fully rolled back")]
    RollbackFailed(#[source] StepError),

    /// Appending to the history file failed after a successful
    /// transaction.
    #[error(transparent)]
    HistoryError(#[from] taipan_conda_types::HistoryError),
}

impl ExecuteTransactionError {
    /// Returns true if the prefix was left in its pre-transaction state.
    pub fn prefix_unchanged(&self) -> bool {
        !matches!(self, ExecuteTransactionError::RollbackFailed(_))
    }
}

/// A completed prefix mutation, kept on the rollback stack.
enum CompletedOp {
    Linked(PrefixRecord),
    Unlinked(PrefixRecord),
}

/// Applies the transaction to the prefix.
pub async fn execute_transaction(
    ctx: &Context,
    prefix: &Path,
    transaction: &Transaction<PrefixRecord, RepoDataRecord>,
    cache: &MultiPackageCache,
    client: &reqwest_middleware::ClientWithMiddleware,
    user_request: UserRequest,
) -> Result<(), ExecuteTransactionError> {
    // An empty plan must not touch the prefix at all.
    if transaction.is_empty() {
        return Ok(());
    }

    // Exclusive ownership of the prefix for the whole transaction; the
    // guard releases the lock on every exit path.
    let _lock = PrefixLock::acquire(prefix)?;

    // Clean up what a previous run could not delete.
    if let Err(e) = crate::install::empty_trash(prefix) {
        tracing::warn!("failed to empty trash: {e}");
    }

    // Make every package available before the first prefix mutation.
    let records_to_link: Vec<RepoDataRecord> =
        transaction.records_to_link().cloned().collect();
    fetch_packages(&records_to_link, cache, client, ctx).await?;

    if ctx.download_only {
        tracing::info!("download-only requested, leaving the prefix untouched");
        return Ok(());
    }

    let mut rollback_stack: Vec<CompletedOp> = Vec::new();
    let mut pyc_queue = PycCompilationQueue::new();

    let result = apply_operations(
        ctx,
        prefix,
        transaction,
        cache,
        &mut rollback_stack,
        &mut pyc_queue,
    );

    if let Err(step_error) = result {
        tracing::warn!("transaction step failed: {step_error}, rolling back");
        return Err(match rollback(prefix, cache, rollback_stack) {
            Ok(()) => ExecuteTransactionError::RolledBack(step_error),
            Err(()) => ExecuteTransactionError::RollbackFailed(step_error),
        });
    }

    // Wait for the bytecode pool to drain before declaring success.
    if let Some(python_info) = &transaction.python_info {
        pyc_queue
            .drain(prefix, python_info, ctx.pyc_concurrency)
            .await;
    }

    // The history entry is the final, serialized-behind-the-lock write.
    let link_dists: BTreeSet<String> = transaction
        .records_to_link()
        .map(|record| record.package_record.dist_str())
        .collect();
    let unlink_dists: BTreeSet<String> = transaction
        .records_to_remove()
        .map(|record| record.repodata_record.package_record.dist_str())
        .collect();
    History::from_prefix(prefix).append(
        &Revision {
            cmd: user_request.cmd,
            update_specs: user_request.update_specs,
            remove_specs: user_request.remove_specs,
            link_dists,
            unlink_dists,
        },
        chrono::Utc::now(),
    )?;

    Ok(())
}

/// Walks the ordered plan, pushing each completed mutation on the
/// rollback stack.
fn apply_operations(
    ctx: &Context,
    prefix: &Path,
    transaction: &Transaction<PrefixRecord, RepoDataRecord>,
    cache: &MultiPackageCache,
    rollback_stack: &mut Vec<CompletedOp>,
    pyc_queue: &mut PycCompilationQueue,
) -> Result<(), StepError> {
    for operation in &transaction.operations {
        // Cancellation checkpoint between operations.
        if ctx.cancellation.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        match operation {
            TransactionOperation::Install(new) => {
                let record = link_step(ctx, prefix, transaction, cache, new, pyc_queue)?;
                rollback_stack.push(CompletedOp::Linked(record));
            }
            TransactionOperation::Remove(old) => {
                unlink_step(prefix, old)?;
                rollback_stack.push(CompletedOp::Unlinked(old.clone()));
            }
            TransactionOperation::Change { old, new } => {
                unlink_step(prefix, old)?;
                rollback_stack.push(CompletedOp::Unlinked(old.clone()));
                let record = link_step(ctx, prefix, transaction, cache, new, pyc_queue)?;
                rollback_stack.push(CompletedOp::Linked(record));
            }
            TransactionOperation::Reinstall(old) => {
                unlink_step(prefix, old)?;
                rollback_stack.push(CompletedOp::Unlinked(old.clone()));
                let record = link_step(
                    ctx,
                    prefix,
                    transaction,
                    cache,
                    &old.repodata_record,
                    pyc_queue,
                )?;
                rollback_stack.push(CompletedOp::Linked(record));
            }
        }
    }
    Ok(())
}

/// Links one package and writes its conda-meta record.
fn link_step(
    ctx: &Context,
    prefix: &Path,
    transaction: &Transaction<PrefixRecord, RepoDataRecord>,
    cache: &MultiPackageCache,
    record: &RepoDataRecord,
    pyc_queue: &mut PycCompilationQueue,
) -> Result<PrefixRecord, StepError> {
    let package_dir = cache
        .get_extracted_dir_path(record, false)
        .ok_or_else(|| StepError::PackageNotAvailable(record.file_name.clone()))?;

    run_link_script(
        LinkScriptKind::PreLink,
        &record.package_record,
        Some(&package_dir),
        prefix,
    )?;

    let options = InstallOptions {
        target_prefix: None,
        allow_hard_links: None,
        platform: Some(ctx.platform),
        python_info: transaction.python_info.clone(),
        cancellation: Some(ctx.cancellation.clone()),
    };
    let linked = link_package(&package_dir, prefix, &options)?;

    run_link_script(
        LinkScriptKind::PostLink,
        &record.package_record,
        Some(&package_dir),
        prefix,
    )?;

    pyc_queue.extend(linked.pyc_sources);

    let prefix_record = PrefixRecord::from_repodata_record(
        record.clone(),
        linked.paths.into(),
        Some(Link {
            source: package_dir,
            link_type: Some(linked.link_type),
        }),
        None,
    );
    let conda_meta = prefix.join("conda-meta");
    fs_err::create_dir_all(&conda_meta).map_err(StepError::FailedToWriteRecord)?;
    prefix_record
        .write_to_path(conda_meta.join(prefix_record.file_name()))
        .map_err(StepError::FailedToWriteRecord)?;

    Ok(prefix_record)
}

/// Runs the pre-unlink script and removes one package.
fn unlink_step(prefix: &Path, record: &PrefixRecord) -> Result<(), StepError> {
    run_link_script(
        LinkScriptKind::PreUnlink,
        &record.repodata_record.package_record,
        record.extracted_package_dir.as_deref(),
        prefix,
    )?;
    unlink_package(prefix, record)?;
    Ok(())
}

/// Undoes the completed operations in reverse order. Errors are logged;
/// the function reports only whether everything could be undone.
fn rollback(
    prefix: &Path,
    cache: &MultiPackageCache,
    rollback_stack: Vec<CompletedOp>,
) -> Result<(), ()> {
    let mut clean = true;
    for op in rollback_stack.into_iter().rev() {
        match op {
            CompletedOp::Linked(record) => {
                if let Err(e) = unlink_package(prefix, &record) {
                    tracing::warn!(
                        "rollback: failed to unlink {}: {e}",
                        record.repodata_record.package_record.dist_str()
                    );
                    clean = false;
                }
            }
            CompletedOp::Unlinked(record) => {
                if let Err(e) = relink(prefix, cache, &record) {
                    tracing::warn!(
                        "rollback: failed to restore {}: {e}",
                        record.repodata_record.package_record.dist_str()
                    );
                    clean = false;
                }
            }
        }
    }
    if clean {
        Ok(())
    } else {
        Err(())
    }
}

/// Restores an unlinked package from its still extracted cache copy.
fn relink(
    prefix: &Path,
    cache: &MultiPackageCache,
    record: &PrefixRecord,
) -> Result<(), StepError> {
    let package_dir = cache
        .get_extracted_dir_path(&record.repodata_record, false)
        .or_else(|| record.extracted_package_dir.clone())
        .ok_or_else(|| {
            StepError::PackageNotAvailable(record.repodata_record.file_name.clone())
        })?;

    let options = InstallOptions::default();
    let linked = link_package(&package_dir, prefix, &options)?;

    let restored = PrefixRecord {
        paths_data: linked.paths.into(),
        ..record.clone()
    };
    let conda_meta = prefix.join("conda-meta");
    fs_err::create_dir_all(&conda_meta).map_err(StepError::FailedToWriteRecord)?;
    restored
        .write_to_path(conda_meta.join(restored.file_name()))
        .map_err(StepError::FailedToWriteRecord)?;
    Ok(())
}
