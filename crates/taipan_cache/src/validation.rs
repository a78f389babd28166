//! Validity checks for cached tarballs and extracted package trees.

use std::path::Path;

use taipan_conda_types::RepoDataRecord;
use taipan_digest::{compute_file_digest, Md5, Sha256};

/// Why a cached tarball was rejected.
#[derive(Debug, thiserror::Error)]
pub enum TarballValidationError {
    /// The tarball does not exist.
    #[error("the tarball does not exist")]
    NotFound,

    /// The size on disk does not match the record.
    #[error("incorrect size, expected {expected} but found {actual}")]
    IncorrectSize {
        /// The size the record declares.
        expected: u64,
        /// The size of the file on disk.
        actual: u64,
    },

    /// The digest does not match the record.
    #[error("{kind} digest mismatch")]
    DigestMismatch {
        /// Which digest failed, `sha256` or `md5`.
        kind: &'static str,
    },

    /// An io error occurred while hashing.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Validates a downloaded tarball against its record: the size must match
/// when known, and the sha256 digest must match; only when the record has
/// no sha256 is the md5 digest used instead.
pub fn validate_tarball(
    path: &Path,
    record: &RepoDataRecord,
) -> Result<(), TarballValidationError> {
    let metadata = match path.metadata() {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TarballValidationError::NotFound)
        }
        Err(e) => return Err(e.into()),
    };

    let package_record = &record.package_record;
    if let Some(expected) = package_record.size {
        if metadata.len() != expected {
            return Err(TarballValidationError::IncorrectSize {
                expected,
                actual: metadata.len(),
            });
        }
    }

    if let Some(expected) = &package_record.sha256 {
        let actual = compute_file_digest::<Sha256>(path)?;
        if &actual != expected {
            return Err(TarballValidationError::DigestMismatch { kind: "sha256" });
        }
    } else if let Some(expected) = &package_record.md5 {
        let actual = compute_file_digest::<Md5>(path)?;
        if &actual != expected {
            return Err(TarballValidationError::DigestMismatch { kind: "md5" });
        }
    }

    Ok(())
}

/// Why an extracted package tree was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ExtractedDirValidationError {
    /// The directory does not exist.
    #[error("the extracted directory does not exist")]
    NotFound,

    /// An extraction is (or was) in progress for this directory.
    #[error("an extraction of this package never completed")]
    FetchInProgress,

    /// `info/repodata_record.json` is missing or does not parse.
    #[error("missing or unreadable repodata record")]
    MissingRecord(#[source] std::io::Error),

    /// The recorded identity does not match the expected record.
    #[error("the extracted package is '{actual}', expected '{expected}'")]
    WrongPackage {
        /// The identity found in the directory.
        actual: String,
        /// The identity that was expected.
        expected: String,
    },
}

/// The sentinel marking a directory whose extraction has not completed.
pub const FETCH_IN_PROGRESS_SENTINEL: &str = "info/.fetch-in-progress";

/// The name of the record written into an extracted tree on completion.
pub const REPODATA_RECORD_FILE: &str = "info/repodata_record.json";

fn identity(record: &RepoDataRecord) -> String {
    let package_record = &record.package_record;
    format!(
        "{}/{}",
        package_record.subdir,
        package_record.dist_str()
    )
}

/// Validates an extracted package tree: it must hold an
/// `info/repodata_record.json` whose `(name, version, build, subdir)`
/// matches the expected record, and the extraction sentinel must be gone.
pub fn validate_extracted_dir(
    path: &Path,
    record: &RepoDataRecord,
) -> Result<(), ExtractedDirValidationError> {
    if !path.is_dir() {
        return Err(ExtractedDirValidationError::NotFound);
    }
    if path.join(FETCH_IN_PROGRESS_SENTINEL).exists() {
        return Err(ExtractedDirValidationError::FetchInProgress);
    }

    let record_path = path.join(REPODATA_RECORD_FILE);
    let stored: RepoDataRecord = fs_err::read(&record_path)
        .map_err(ExtractedDirValidationError::MissingRecord)
        .and_then(|content| {
            serde_json::from_slice(&content)
                .map_err(|e| ExtractedDirValidationError::MissingRecord(e.into()))
        })?;

    let stored_record = &stored.package_record;
    let expected_record = &record.package_record;
    if stored_record.name != expected_record.name
        || stored_record.version != expected_record.version
        || stored_record.build != expected_record.build
        || stored_record.subdir != expected_record.subdir
    {
        return Err(ExtractedDirValidationError::WrongPackage {
            actual: identity(&stored),
            expected: identity(record),
        });
    }

    Ok(())
}
