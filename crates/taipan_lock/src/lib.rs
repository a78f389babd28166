#![deny(missing_docs)]

//! `taipan_lock` models environment lockfiles: a YAML document pinning the
//! exact set of packages (by url and hash) that make up an environment,
//! per platform.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use url::Url;

use taipan_conda_types::Platform;
use taipan_digest::{serde::SerializableHash, Md5, Md5Hash, Sha256, Sha256Hash};

/// Which installer manages a locked package.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// The package is a conda archive.
    Conda,
    /// The package is installed by pip.
    Pip,
}

/// The hashes of a locked package archive.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackageHashes {
    /// The MD5 digest of the archive.
    #[serde_as(as = "Option<SerializableHash<Md5>>")]
    #[serde(default)]
    pub md5: Option<Md5Hash>,

    /// The SHA256 digest of the archive.
    #[serde_as(as = "Option<SerializableHash<Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,
}

/// One locked package.
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LockedPackage {
    /// The package name.
    pub name: String,

    /// The exact version that was locked.
    pub version: String,

    /// The url of the package archive.
    pub url: Url,

    /// The archive hashes.
    #[serde(default)]
    pub hash: PackageHashes,

    /// The dependency category the package belongs to (e.g. `main`).
    #[serde(default = "default_category")]
    pub category: String,

    /// The installer that manages the package.
    pub manager: PackageManager,

    /// The platform the package was locked for.
    pub platform: Platform,
}

fn default_category() -> String {
    "main".to_owned()
}

/// A parsed environment lockfile.
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentLockFile {
    /// The locked packages, in lock order.
    #[serde(default, rename = "package")]
    pub packages: Vec<LockedPackage>,
}

/// Errors reading or writing lockfiles.
#[derive(Debug, thiserror::Error)]
pub enum LockFileError {
    /// An io error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The document is not valid lockfile YAML.
    #[error("failed to parse the lockfile")]
    ParseError(#[from] serde_yaml::Error),
}

impl EnvironmentLockFile {
    /// Reads and parses a lockfile from disk.
    pub fn from_path(path: &Path) -> Result<Self, LockFileError> {
        let content = fs_err::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Serializes the lockfile to YAML.
    pub fn to_yaml(&self) -> Result<String, LockFileError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the lockfile to disk.
    pub fn to_path(&self, path: &Path) -> Result<(), LockFileError> {
        fs_err::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// The conda packages locked for the given platform, in lock order.
    pub fn conda_packages_for(&self, platform: Platform) -> impl Iterator<Item = &LockedPackage> {
        self.packages.iter().filter(move |package| {
            package.manager == PackageManager::Conda && package.platform == platform
        })
    }
}

#[cfg(test)]
mod test {
    use taipan_conda_types::Platform;

    use super::{EnvironmentLockFile, PackageManager};

    const LOCKFILE: &str = r#"
package:
- name: python
  version: 3.11.4
  url: https://conda.anaconda.org/conda-forge/linux-64/python-3.11.4-hab00c5b_0_cpython.conda
  hash:
    md5: bf7f54dd0f25c3f06ecb82a07341841a
    sha256: 7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c
  category: main
  manager: conda
  platform: linux-64
- name: requests
  version: 2.31.0
  url: https://pypi.org/packages/requests-2.31.0-py3-none-any.whl
  hash:
    sha256: 7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c
  category: main
  manager: pip
  platform: linux-64
"#;

    #[test]
    fn test_parse() {
        let lockfile: EnvironmentLockFile = serde_yaml::from_str(LOCKFILE).unwrap();
        assert_eq!(lockfile.packages.len(), 2);
        assert_eq!(lockfile.packages[0].name, "python");
        assert_eq!(lockfile.packages[0].manager, PackageManager::Conda);
        assert!(lockfile.packages[0].hash.md5.is_some());
        assert_eq!(lockfile.packages[1].manager, PackageManager::Pip);

        let conda: Vec<_> = lockfile.conda_packages_for(Platform::Linux64).collect();
        assert_eq!(conda.len(), 1);
        assert_eq!(lockfile.conda_packages_for(Platform::Osx64).count(), 0);
    }

    #[test]
    fn test_roundtrip() {
        let lockfile: EnvironmentLockFile = serde_yaml::from_str(LOCKFILE).unwrap();
        let yaml = lockfile.to_yaml().unwrap();
        let reparsed: EnvironmentLockFile = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reparsed, lockfile);
    }
}
