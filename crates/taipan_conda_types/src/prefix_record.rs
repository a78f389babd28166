//! The conda-meta records of installed packages.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};

use taipan_digest::{serde::SerializableHash, Sha256, Sha256Hash};

use crate::{package::FileMode, package_record::RepoDataRecord, utils};

/// How a file ended up in a prefix.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    /// The file is a hard link to a file in the package cache.
    #[serde(rename = "hardlink")]
    HardLink,
    /// The file is a symbolic link.
    #[serde(rename = "softlink")]
    SoftLink,
    /// An empty directory created at link time.
    Directory,
    /// Python bytecode compiled when the package was linked.
    PycFile,
    /// A generated python entry point script (unix) or `-script.py` file
    /// (windows).
    WindowsPythonEntryPointScript,
    /// A generated `.exe` launcher for a python entry point on windows.
    WindowsPythonEntryPointExe,
    /// A generated unix python entry point.
    UnixPythonEntryPoint,
}

/// A file installed into a prefix by a package. Unlike
/// [`crate::package::PathsEntry`] this describes the installed file, after
/// placeholder substitution and noarch relocation.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PathsEntry {
    /// The path of the installed file, relative to the prefix.
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,

    /// How the file was installed.
    pub path_type: PathType,

    /// The placeholder that was substituted when the file was written, if
    /// any.
    #[serde(default)]
    pub prefix_placeholder: Option<String>,

    /// Whether substitution was textual or binary.
    #[serde(default)]
    pub file_mode: Option<FileMode>,

    /// The digest of the file as present in the package archive.
    #[serde_as(as = "Option<SerializableHash<Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,

    /// The digest of the file as written to the prefix. Differs from
    /// `sha256` when a placeholder was substituted.
    #[serde_as(as = "Option<SerializableHash<Sha256>>")]
    #[serde(default)]
    pub sha256_in_prefix: Option<Sha256Hash>,

    /// The size of the installed file in bytes.
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
}

/// The `paths_data` section of a conda-meta record.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrefixPaths {
    /// The version of the file format.
    pub paths_version: u64,

    /// All files installed for the package.
    #[serde(default)]
    pub paths: Vec<PathsEntry>,
}

impl Default for PrefixPaths {
    fn default() -> Self {
        Self {
            paths_version: 1,
            paths: Vec::default(),
        }
    }
}

impl From<Vec<PathsEntry>> for PrefixPaths {
    fn from(paths: Vec<PathsEntry>) -> Self {
        Self {
            paths,
            ..Default::default()
        }
    }
}

/// The way a package's files were brought into the prefix. Stored as the
/// numeric values conda has always used in its records.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    serde_repr::Serialize_repr,
    serde_repr::Deserialize_repr,
)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum LinkType {
    HardLink = 1,
    SoftLink = 2,
    Copy = 3,
    Directory = 4,
}

/// The `link` section of a conda-meta record: where the package was linked
/// from and how.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// The path of the extracted package in the cache.
    pub source: PathBuf,

    /// The dominant link type used for the package's files.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<LinkType>,
}

/// The record of an installed package, persisted as
/// `conda-meta/<name>-<version>-<build>.json` inside the prefix.
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrefixRecord {
    /// The repodata record the package was installed from.
    #[serde(flatten)]
    pub repodata_record: RepoDataRecord,

    /// The path of the downloaded archive, if known.
    #[serde(default)]
    pub package_tarball_full_path: Option<PathBuf>,

    /// The path of the extracted package in the cache, if known.
    #[serde(default)]
    pub extracted_package_dir: Option<PathBuf>,

    /// All files installed by the package, relative to the prefix.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Detailed metadata about the installed files.
    #[serde(default)]
    pub paths_data: PrefixPaths,

    /// Where and how the package was linked.
    #[serde(default)]
    pub link: Option<Link>,

    /// The spec that was requested when this package was installed, if it
    /// was installed directly by the user.
    #[serde(default)]
    pub requested_spec: Option<String>,
}

impl PrefixRecord {
    /// Creates a record from a repodata record and the result of linking.
    pub fn from_repodata_record(
        repodata_record: RepoDataRecord,
        paths_data: PrefixPaths,
        link: Option<Link>,
        requested_spec: Option<String>,
    ) -> Self {
        Self {
            files: paths_data
                .paths
                .iter()
                .map(|entry| entry.relative_path.clone())
                .collect(),
            repodata_record,
            package_tarball_full_path: None,
            extracted_package_dir: None,
            paths_data,
            link,
            requested_spec,
        }
    }

    /// The file name under which this record is stored in `conda-meta/`.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.repodata_record.package_record.dist_str())
    }

    /// Parses a record from a file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = fs_err::read(path.as_ref())?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Writes the record to the given path through a temporary file and an
    /// atomic rename.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)?;
        utils::atomic_write(path.as_ref(), json.as_bytes())
    }

    /// Collects all records from the `conda-meta` directory of a prefix.
    pub fn collect_from_prefix(prefix: &Path) -> Result<Vec<Self>, std::io::Error> {
        let conda_meta = prefix.join("conda-meta");
        let mut records = Vec::new();
        let read_dir = match fs_err::read_dir(&conda_meta) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e),
        };
        for entry in read_dir {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                records.push(Self::from_path(&path)?);
            }
        }
        // Directory iteration order is platform dependent.
        records.sort_by(|a, b| {
            a.repodata_record
                .package_record
                .name
                .cmp(&b.repodata_record.package_record.name)
        });
        Ok(records)
    }
}

impl AsRef<RepoDataRecord> for PrefixRecord {
    fn as_ref(&self) -> &RepoDataRecord {
        &self.repodata_record
    }
}

impl AsRef<crate::PackageRecord> for PrefixRecord {
    fn as_ref(&self) -> &crate::PackageRecord {
        &self.repodata_record.package_record
    }
}
