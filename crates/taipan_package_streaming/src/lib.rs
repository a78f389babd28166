#![deny(missing_docs)]

//! Functions to extract Conda package archives.
//!
//! Two archive formats exist in the ecosystem:
//!
//! * `.tar.bz2`: a tar stream compressed with bzip2.
//! * `.conda`: a zip container holding two zstd compressed inner tars,
//!   `info-<pkg>.tar.zst` and `pkg-<pkg>.tar.zst`, whose contents are
//!   concatenated on extraction.

pub mod fs;
pub mod read;

use std::path::Path;

/// A hook polled between archive entries while extracting, so long
/// extractions can be interrupted cooperatively. When it returns true the
/// extraction stops with [`ExtractError::Cancelled`]. Pass `&|| false`
/// when cancellation is not needed.
pub type CancellationCheck<'a> = &'a (dyn Fn() -> bool + Sync);

/// An error that can occur while extracting an archive.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// An io error occurred while reading or writing.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The destination directory could not be created.
    #[error("failed to create the destination directory")]
    CouldNotCreateDestination(#[source] std::io::Error),

    /// The outer zip container of a `.conda` file is invalid.
    #[error("invalid zip archive")]
    ZipError(#[from] zip::result::ZipError),

    /// The file does not have a recognized archive extension.
    #[error("unsupported archive type: '{0}'")]
    UnsupportedArchiveType(String),

    /// The extraction was cancelled between two entries.
    #[error("the extraction was cancelled")]
    Cancelled,
}

/// The two Conda package archive formats.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ArchiveType {
    /// A `.tar.bz2` archive.
    TarBz2,
    /// A `.conda` archive.
    Conda,
}

impl ArchiveType {
    /// Determines the archive type from a file name, returning `None` for
    /// unrecognized extensions.
    pub fn try_from_file_name(file_name: &str) -> Option<ArchiveType> {
        if file_name.ends_with(".tar.bz2") {
            Some(ArchiveType::TarBz2)
        } else if file_name.ends_with(".conda") {
            Some(ArchiveType::Conda)
        } else {
            None
        }
    }

    /// Splits a file name into its stem and archive type.
    pub fn split(file_name: &str) -> Option<(&str, ArchiveType)> {
        let archive_type = Self::try_from_file_name(file_name)?;
        let stem = match archive_type {
            ArchiveType::TarBz2 => file_name.strip_suffix(".tar.bz2"),
            ArchiveType::Conda => file_name.strip_suffix(".conda"),
        }?;
        Some((stem, archive_type))
    }

    /// The file extension of this archive type, without a leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveType::TarBz2 => "tar.bz2",
            ArchiveType::Conda => "conda",
        }
    }
}

/// The `<name>-<version>-<build>` identity encoded in an archive file name.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ArchiveIdentifier {
    /// The package name.
    pub name: String,
    /// The version string.
    pub version: String,
    /// The build string.
    pub build_string: String,
    /// The archive type of the file name this was parsed from.
    pub archive_type: ArchiveType,
}

impl ArchiveIdentifier {
    /// Parses the identity from an archive file name like
    /// `python-3.11.4-h2c4edbf_0.conda`.
    pub fn try_from_file_name(file_name: &str) -> Option<ArchiveIdentifier> {
        let (stem, archive_type) = ArchiveType::split(file_name)?;

        // Name may contain dashes; version and build may not.
        let (rest, build_string) = stem.rsplit_once('-')?;
        let (name, version) = rest.rsplit_once('-')?;
        if name.is_empty() || version.is_empty() || build_string.is_empty() {
            return None;
        }

        Some(ArchiveIdentifier {
            name: name.to_owned(),
            version: version.to_owned(),
            build_string: build_string.to_owned(),
            archive_type,
        })
    }

    /// Parses the identity from a path.
    pub fn try_from_path(path: &Path) -> Option<ArchiveIdentifier> {
        Self::try_from_file_name(path.file_name()?.to_str()?)
    }

    /// The directory name used for the extracted package:
    /// `<name>-<version>-<build>`.
    pub fn to_directory_name(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.build_string)
    }
}

#[cfg(test)]
mod test {
    use super::{ArchiveIdentifier, ArchiveType};

    #[test]
    fn test_archive_type() {
        assert_eq!(
            ArchiveType::try_from_file_name("foo-1.0-0.tar.bz2"),
            Some(ArchiveType::TarBz2)
        );
        assert_eq!(
            ArchiveType::try_from_file_name("foo-1.0-0.conda"),
            Some(ArchiveType::Conda)
        );
        assert_eq!(ArchiveType::try_from_file_name("foo-1.0-0.zip"), None);
    }

    #[test]
    fn test_archive_identifier() {
        let id = ArchiveIdentifier::try_from_file_name("python-3.11.4-h2c4edbf_0.conda").unwrap();
        assert_eq!(id.name, "python");
        assert_eq!(id.version, "3.11.4");
        assert_eq!(id.build_string, "h2c4edbf_0");
        assert_eq!(id.to_directory_name(), "python-3.11.4-h2c4edbf_0");

        let id = ArchiveIdentifier::try_from_file_name("ruamel.yaml-0.17-py38_1.tar.bz2").unwrap();
        assert_eq!(id.name, "ruamel.yaml");

        assert!(ArchiveIdentifier::try_from_file_name("nonsense.conda").is_none());
    }
}
