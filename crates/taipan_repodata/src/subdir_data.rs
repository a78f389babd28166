//! One `(channel, subdir)` pair and its parsed records.

use std::path::PathBuf;

use tracing::instrument;

use taipan_conda_types::{Channel, ConvertSubdirError, Platform, RepoData, RepoDataRecord};

use crate::fetch::{fetch_repo_data, CachedRepoData, FetchRepoDataError, FetchRepoDataOptions};

/// Errors produced while loading the records of a subdirectory.
#[derive(Debug, thiserror::Error)]
pub enum SubdirDataError {
    /// Downloading the repodata failed.
    #[error("failed to fetch repodata for {channel}/{subdir}")]
    FetchError {
        /// The canonical channel name.
        channel: String,
        /// The subdir.
        subdir: String,
        /// The underlying fetch error.
        #[source]
        source: FetchRepoDataError,
    },

    /// The repodata could not be parsed, even after quarantining the cache
    /// and fetching a fresh copy.
    #[error("corrupted repodata for {channel}/{subdir}")]
    CorruptedRepoData {
        /// The canonical channel name.
        channel: String,
        /// The subdir.
        subdir: String,
        /// The parse error of the refetched payload.
        #[source]
        source: std::io::Error,
    },

    /// Records could not be converted (bad urls in the repodata).
    #[error(transparent)]
    ConvertError(#[from] ConvertSubdirError),
}

/// The repodata of one channel subdirectory, loaded through the local
/// cache.
pub struct SubdirData {
    /// The channel the data belongs to.
    pub channel: Channel,
    /// The platform of the subdirectory.
    pub platform: Platform,
    /// The parsed records.
    pub records: Vec<RepoDataRecord>,
    /// The path of the cached payload the records were parsed from.
    pub repo_data_path: PathBuf,
}

impl SubdirData {
    /// Fetches (or reuses) the cached repodata for `channel`/`platform`
    /// and parses it into records.
    ///
    /// A cached payload that fails to parse is quarantined with a `.bad`
    /// suffix and fetched once more; a second parse failure is fatal for
    /// the subdirectory.
    #[instrument(skip(client, options), fields(channel = %channel.name, platform = %platform))]
    pub async fn load(
        channel: &Channel,
        platform: Platform,
        client: reqwest_middleware::ClientWithMiddleware,
        cache_path: PathBuf,
        options: FetchRepoDataOptions,
    ) -> Result<SubdirData, SubdirDataError> {
        let subdir_url = channel.platform_url(platform);
        let fetch_error = |source| SubdirDataError::FetchError {
            channel: channel.canonical_name(),
            subdir: platform.to_string(),
            source,
        };

        let cached = fetch_repo_data(
            subdir_url.clone(),
            client.clone(),
            cache_path.clone(),
            options.clone(),
        )
        .await
        .map_err(fetch_error)?;

        let repo_data = match RepoData::from_path(&cached.repo_data_path) {
            Ok(repo_data) => repo_data,
            Err(parse_error) => {
                tracing::warn!(
                    "quarantining corrupted repodata {}: {parse_error}",
                    cached.repo_data_path.display()
                );
                Self::quarantine(&cached).await;

                // One fresh fetch; a second parse failure is fatal.
                let refetched = fetch_repo_data(subdir_url, client, cache_path, options)
                    .await
                    .map_err(fetch_error)?;
                RepoData::from_path(&refetched.repo_data_path).map_err(|source| {
                    SubdirDataError::CorruptedRepoData {
                        channel: channel.canonical_name(),
                        subdir: platform.to_string(),
                        source,
                    }
                })?
            }
        };

        let records = repo_data.into_repo_data_records(channel, platform.as_str())?;
        tracing::debug!("loaded {} records", records.len());

        Ok(SubdirData {
            channel: channel.clone(),
            platform,
            records,
            repo_data_path: cached.repo_data_path,
        })
    }

    /// Renames the payload and its state file with a `.bad` suffix so the
    /// next fetch starts clean.
    async fn quarantine(cached: &CachedRepoData) {
        let bad_path = cached.repo_data_path.with_extension("json.bad");
        let _ = fs_err::rename(&cached.repo_data_path, bad_path);
        let state_path = cached
            .repo_data_path
            .with_extension("state.json");
        let _ = fs_err::rename(&state_path, state_path.with_extension("json.bad"));
    }
}
