use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use url::Url;

use taipan_digest::{serde::SerializableHash, Md5, Md5Hash, Sha256, Sha256Hash};

use crate::{no_arch_type::NoArchType, utils, version::Version};

/// A single record in the conda repodata: one binary distribution of a
/// package. This is also the core of the conda-meta records written for
/// installed packages.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// The lowercase name of the package.
    pub name: String,

    /// The version of the package.
    pub version: Version,

    /// The build string of the package, e.g. `py38h1234567_0`.
    pub build: String,

    /// The build number of the package.
    #[serde(default)]
    pub build_number: u64,

    /// The subdirectory (platform) this package is built for.
    #[serde(default)]
    pub subdir: String,

    /// The package constraints that must be installed alongside this
    /// package, as raw match-spec strings.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Additional constraints on packages that are not dependencies: when
    /// one of these packages is installed it must match the spec, but the
    /// constraint does not pull the package in.
    #[serde(default)]
    pub constrains: Vec<String>,

    /// Features tracked by this package. Packages with track features are
    /// deprioritized by the solver.
    #[serde(default, with = "utils::features", skip_serializing_if = "Vec::is_empty")]
    pub track_features: Vec<String>,

    /// The MD5 digest of the package archive.
    #[serde_as(as = "Option<SerializableHash<Md5>>")]
    #[serde(default)]
    pub md5: Option<Md5Hash>,

    /// The SHA256 digest of the package archive.
    #[serde_as(as = "Option<SerializableHash<Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,

    /// The size of the package archive in bytes.
    pub size: Option<u64>,

    /// The moment the package was created or uploaded.
    #[serde(default, with = "utils::timestamp")]
    pub timestamp: Option<DateTime<Utc>>,

    /// The noarch kind of the package.
    #[serde(default, skip_serializing_if = "NoArchType::is_none")]
    pub noarch: NoArchType,

    /// The license of the package.
    pub license: Option<String>,

    /// The relative path to the site-packages directory reported by a
    /// python interpreter package, when it deviates from the default.
    pub python_site_packages_path: Option<String>,
}

impl PackageRecord {
    /// Creates a record with the given identity and empty metadata.
    pub fn new(name: String, version: Version, build: String) -> Self {
        Self {
            name,
            version,
            build,
            build_number: 0,
            subdir: String::new(),
            depends: Vec::new(),
            constrains: Vec::new(),
            track_features: Vec::new(),
            md5: None,
            sha256: None,
            size: None,
            timestamp: None,
            noarch: NoArchType::none(),
            license: None,
            python_site_packages_path: None,
        }
    }

    /// The distribution string of this record, e.g. `python-3.11.4-h2c4edbf_0`.
    pub fn dist_str(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.build)
    }
}

impl Display for PackageRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}={}", self.name, self.version, self.build)
    }
}

impl AsRef<PackageRecord> for PackageRecord {
    fn as_ref(&self) -> &PackageRecord {
        self
    }
}

/// A [`PackageRecord`] augmented with the source of the data: the filename
/// within the subdir, the download url, and the channel it came from.
///
/// Records are deduplicated by `(channel, subdir, file_name)`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepoDataRecord {
    /// The data stored in the repodata.json.
    #[serde(flatten)]
    pub package_record: PackageRecord,

    /// The filename of the package archive.
    #[serde(rename = "fn")]
    pub file_name: String,

    /// The canonical URL from where to get this package.
    pub url: Url,

    /// The url of the channel the package came from.
    pub channel: String,
}

impl RepoDataRecord {
    /// The identity used to deduplicate records across subdir fetches.
    pub fn identity(&self) -> (&str, &str, &str) {
        (
            self.channel.as_str(),
            self.package_record.subdir.as_str(),
            self.file_name.as_str(),
        )
    }
}

impl AsRef<PackageRecord> for RepoDataRecord {
    fn as_ref(&self) -> &PackageRecord {
        &self.package_record
    }
}

impl Display for RepoDataRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.package_record)
    }
}

#[cfg(test)]
mod test {
    use super::PackageRecord;

    #[test]
    fn test_parse_repodata_record() {
        let record: PackageRecord = serde_json::from_str(
            r#"{
                "build": "pyhd8ed1ab_0",
                "build_number": 0,
                "depends": ["python >=3.5", "six"],
                "license": "Apache-2.0",
                "md5": "bf7f54dd0f25c3f06ecb82a07341841a",
                "name": "asttokens",
                "noarch": "python",
                "sha256": "7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c",
                "size": 27831,
                "subdir": "noarch",
                "timestamp": 1670264089059,
                "track_features": "",
                "version": "2.2.1"
            }"#,
        )
        .unwrap();

        assert_eq!(record.name, "asttokens");
        assert!(record.noarch.is_python());
        assert!(record.track_features.is_empty());
        assert_eq!(record.timestamp.unwrap().timestamp_millis(), 1670264089059);
        assert_eq!(record.dist_str(), "asttokens-2.2.1-pyhd8ed1ab_0");

        // Serialization keeps the fields the solver reads.
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["version"], "2.2.1");
        assert_eq!(value["timestamp"], 1670264089059i64);
        assert_eq!(
            value["sha256"],
            "7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c"
        );
    }
}
