use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{channel::Channel, package_record::PackageRecord, package_record::RepoDataRecord};

/// The parsed contents of a `repodata.json` file: an index of the package
/// archives available in one subdirectory of a channel.
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepoData {
    /// Information about the subdirectory itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ChannelInfo>,

    /// The `.tar.bz2` packages in the subdirectory, keyed by filename.
    #[serde(default)]
    pub packages: HashMap<String, PackageRecord>,

    /// The `.conda` packages in the subdirectory, stored under a separate
    /// key for backwards compatibility with older conda versions.
    #[serde(default, rename = "packages.conda")]
    pub conda_packages: HashMap<String, PackageRecord>,

    /// Filenames that have been removed from the index but whose archives
    /// are still reachable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,

    /// The version of the repodata format.
    #[serde(default, rename = "repodata_version", skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Information about the subdirectory of a channel in [`RepoData`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// The subdirectory name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,

    /// An optional base url for the package archives, absolute or relative
    /// to the location of the repodata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// An error converting repodata entries into [`RepoDataRecord`]s.
#[derive(Debug, Error)]
pub enum ConvertSubdirError {
    /// A record's download url could not be constructed.
    #[error("could not determine an url for '{filename}'")]
    InvalidUrl {
        /// The filename of the offending record.
        filename: String,
    },
}

impl RepoData {
    /// Reads and parses a `repodata.json` file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = fs_err::read(path.as_ref())?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// The base url for the package archives of this subdirectory: the
    /// `info.base_url` when present (resolved against the subdir url when
    /// relative), otherwise the subdir url itself.
    fn base_url(&self, subdir_url: &Url) -> Result<Url, url::ParseError> {
        match self.info.as_ref().and_then(|info| info.base_url.as_deref()) {
            Some(base_url) => match Url::parse(base_url) {
                Ok(url) => Ok(url),
                Err(url::ParseError::RelativeUrlWithoutBase) => subdir_url.join(base_url),
                Err(e) => Err(e),
            },
            None => Ok(subdir_url.clone()),
        }
    }

    /// Converts all entries into [`RepoDataRecord`]s, attaching the channel
    /// and computing each record's download url as channel base + subdir +
    /// filename. The records of the `packages.conda` section come last so a
    /// later deduplication pass prefers them.
    pub fn into_repo_data_records(
        self,
        channel: &Channel,
        subdir: &str,
    ) -> Result<Vec<RepoDataRecord>, ConvertSubdirError> {
        let subdir_url = channel
            .base_url
            .join(&format!("{subdir}/"))
            .map_err(|_| ConvertSubdirError::InvalidUrl {
                filename: subdir.to_owned(),
            })?;
        let base_url = self
            .base_url(&subdir_url)
            .map_err(|_| ConvertSubdirError::InvalidUrl {
                filename: subdir.to_owned(),
            })?;
        let channel_name = channel.canonical_name();

        let mut records = Vec::with_capacity(self.packages.len() + self.conda_packages.len());
        for (filename, package_record) in
            itertools::chain(self.packages, self.conda_packages)
        {
            let url = base_url
                .join(&filename)
                .map_err(|_| ConvertSubdirError::InvalidUrl {
                    filename: filename.clone(),
                })?;
            records.push(RepoDataRecord {
                package_record,
                file_name: filename,
                url,
                channel: channel_name.clone(),
            });
        }

        // Hash map iteration order is unspecified; keep the output
        // deterministic for the solver.
        records.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(records)
    }
}
