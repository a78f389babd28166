//! The bounded download and extract pipeline.
//!
//! For every package that is not already validly extracted in some cache,
//! a per-package chain runs: download (when no valid tarball is cached),
//! checksum validation, extraction. Chains of different packages are
//! independent; downloads and extractions are gated by separate
//! concurrency limits. Downloads are started largest-first so the big
//! transfers overlap with the extraction of smaller packages.

use std::{io::Write, sync::Arc};

use futures::{future::try_join_all, StreamExt};
use tokio::sync::Semaphore;
use url::Url;

use taipan_cache::{MultiPackageCache, PackageCacheError};
use taipan_conda_types::RepoDataRecord;
use taipan_digest::{Digest, Md5, Sha256};

use crate::context::Context;

/// Errors of the fetch pipeline. The first error aborts the whole
/// pipeline; in-flight chains of other packages are dropped.
#[derive(Debug, thiserror::Error)]
pub enum FetchPackagesError {
    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,

    /// No writable cache directory exists for downloads.
    #[error("none of the package cache directories is writable")]
    NoWritableCache,

    /// The transfer itself failed.
    #[error("failed to download {0}")]
    DownloadFailed(Url, #[source] std::io::Error),

    /// The server answered with a failure status.
    #[error(transparent)]
    HttpError(#[from] reqwest_middleware::Error),

    /// The downloaded archive does not match its recorded digest. The
    /// offending tarball and any partial extraction have been deleted.
    #[error("checksum mismatch for '{file_name}'")]
    ChecksumMismatch {
        /// The archive file name.
        file_name: String,
    },

    /// Extraction or cache interaction failed.
    #[error(transparent)]
    CacheError(#[from] PackageCacheError),

    /// An io error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchPackagesError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpError(err.into())
    }
}

/// Ensures every record has a validated extracted tree in some cache:
/// reuses cached artifacts where possible, downloads and extracts the
/// rest. Returns once all packages are available; any failure aborts the
/// remaining work.
pub async fn fetch_packages(
    records: &[RepoDataRecord],
    cache: &MultiPackageCache,
    client: &reqwest_middleware::ClientWithMiddleware,
    ctx: &Context,
) -> Result<(), FetchPackagesError> {
    // Anything already extracted needs no work at all.
    let mut pending: Vec<&RepoDataRecord> = records
        .iter()
        .filter(|record| cache.get_extracted_dir_path(record, false).is_none())
        .collect();

    // Start order: descending expected size, so large downloads begin
    // early. The download semaphore is fair, which preserves this order.
    pending.sort_by_key(|record| std::cmp::Reverse(record.package_record.size.unwrap_or(0)));

    let download_limit = Arc::new(Semaphore::new(ctx.download_concurrency.max(1)));
    let extract_limit = Arc::new(Semaphore::new(ctx.extract_concurrency.max(1)));

    let chains = pending.into_iter().map(|record| {
        let download_limit = Arc::clone(&download_limit);
        let extract_limit = Arc::clone(&extract_limit);
        async move {
            ctx.cancellation
                .err_if_cancelled()
                .map_err(|_| FetchPackagesError::Cancelled)?;

            // Reuse a cached tarball when it validates; download
            // otherwise.
            let tarball = match cache.get_tarball_path(record) {
                Some(tarball) => tarball,
                None => {
                    let _permit = download_limit
                        .acquire()
                        .await
                        .expect("semaphore never closes");
                    download_tarball(record, cache, client, ctx).await?
                }
            };

            ctx.cancellation
                .err_if_cancelled()
                .map_err(|_| FetchPackagesError::Cancelled)?;

            let _permit = extract_limit
                .acquire()
                .await
                .expect("semaphore never closes");
            let record_clone = record.clone();
            let cache_dirs = cache.paths().to_vec();
            let flag = ctx.cancellation.clone();
            let extracted = tokio::task::spawn_blocking(move || {
                // The hook makes the extraction stop between entries when
                // the flag is raised mid-package.
                MultiPackageCache::new(cache_dirs).extract_into_cache(
                    &tarball,
                    &record_clone,
                    &|| flag.is_cancelled(),
                )
            })
            .await
            .map_err(|e| FetchPackagesError::IoError(std::io::Error::other(e)))?
            .map_err(|e| match e {
                PackageCacheError::ExtractError(
                    _,
                    taipan_package_streaming::ExtractError::Cancelled,
                ) => FetchPackagesError::Cancelled,
                e => FetchPackagesError::CacheError(e),
            })?;
            cache.clear_query_cache(record);

            // Remember where the package came from.
            if let Some(cache_dir) = extracted.parent() {
                cache.append_url(cache_dir, &record.url)?;
            }

            tracing::debug!("{} is ready at {}", record.file_name, extracted.display());
            Ok::<(), FetchPackagesError>(())
        }
    });

    try_join_all(chains).await?;
    Ok(())
}

/// Downloads one archive into the first writable cache, verifying its
/// digests while streaming. On a digest mismatch the partial artifacts are
/// removed and the pipeline fails; the download is not retried within the
/// same run.
async fn download_tarball(
    record: &RepoDataRecord,
    cache: &MultiPackageCache,
    client: &reqwest_middleware::ClientWithMiddleware,
    ctx: &Context,
) -> Result<std::path::PathBuf, FetchPackagesError> {
    let cache_dir = cache
        .first_writable_path()
        .ok_or(FetchPackagesError::NoWritableCache)?;
    let target = cache_dir.join(&record.file_name);

    tracing::debug!("downloading {}", record.url);
    let response = client.get(record.url.clone()).send().await?;
    let response = response.error_for_status().map_err(|e| {
        FetchPackagesError::HttpError(e.into())
    })?;

    let mut sha256 = Sha256::new();
    let mut md5 = Md5::new();
    let mut size: u64 = 0;
    let mut temp_file = tempfile::NamedTempFile::new_in(&cache_dir)?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        // Cancellation checkpoint between chunks.
        ctx.cancellation
            .err_if_cancelled()
            .map_err(|_| FetchPackagesError::Cancelled)?;

        let chunk = chunk.map_err(|e| {
            FetchPackagesError::DownloadFailed(record.url.clone(), std::io::Error::other(e))
        })?;
        sha256.update(&chunk);
        md5.update(&chunk);
        size += chunk.len() as u64;
        temp_file.write_all(&chunk)?;
    }
    temp_file.as_file().sync_all()?;

    // Size first, then the strongest digest available.
    let package_record = &record.package_record;
    let valid = package_record.size.map_or(true, |expected| expected == size)
        && match (&package_record.sha256, &package_record.md5) {
            (Some(expected), _) => sha256.finalize() == *expected,
            (None, Some(expected)) => md5.finalize() == *expected,
            (None, None) => true,
        };
    if !valid {
        // Drop the partial tarball and any partial extraction.
        drop(temp_file);
        let extraction_dir = cache_dir.join(
            taipan_package_streaming::ArchiveIdentifier::try_from_file_name(&record.file_name)
                .map(|id| id.to_directory_name())
                .unwrap_or_else(|| package_record.dist_str()),
        );
        if extraction_dir.exists() {
            let _ = fs_err::remove_dir_all(&extraction_dir);
        }
        return Err(FetchPackagesError::ChecksumMismatch {
            file_name: record.file_name.clone(),
        });
    }

    temp_file
        .persist(&target)
        .map_err(|e| FetchPackagesError::IoError(e.error))?;
    cache.clear_query_cache(record);
    Ok(target)
}
