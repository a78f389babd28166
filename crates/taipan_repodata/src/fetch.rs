//! Downloading `repodata.json` with a local cache.
//!
//! The cache consists of a payload file (`<key>.json`) and a state file
//! (`<key>.state.json`, see [`SubdirState`]) per subdirectory. A refresh
//! first consults the state file: a payload younger than the configured TTL
//! is used without any network traffic; otherwise a conditional `GET` is
//! issued, and only a `200` response replaces the payload (written to a
//! temporary sibling and atomically renamed into place). A
//! `repodata.json.zst` variant is preferred when the server offers one and
//! is transparently decompressed while downloading.

use std::{
    io::ErrorKind,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use reqwest::{header, StatusCode};
use retry_policies::{policies::ExponentialBackoff, RetryDecision, RetryPolicy};
use tokio_util::io::StreamReader;
use tracing::instrument;
use url::Url;

use crate::cache::{CacheHeaders, Expiring, SubdirState};
use crate::utils::{normalize_subdir_url, url_to_cache_key};

/// How long a zst availability probe stays valid.
fn zst_probe_expiration() -> chrono::Duration {
    chrono::Duration::days(7)
}

/// Errors that can occur while fetching repodata.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum FetchRepoDataError {
    #[error(transparent)]
    HttpError(#[from] reqwest_middleware::Error),

    #[error("repodata was not found at {url}")]
    NotFound {
        /// The url that returned 404.
        url: Url,
    },

    #[error("request to {url} failed with status {status}")]
    HttpStatus {
        /// The status of the final response.
        status: StatusCode,
        /// The requested url.
        url: Url,
    },

    #[error("failed to download {0}")]
    FailedToDownload(Url, #[source] std::io::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("failed to persist the downloaded repodata")]
    FailedToPersist(#[from] tempfile::PersistError),

    #[error("there is no valid cached repodata and fetching is disabled")]
    NoCacheAvailable,
}

impl From<reqwest::Error> for FetchRepoDataError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpError(err.into())
    }
}

/// Defines how the local cache is used.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum CacheAction {
    /// Use the cache when fresh, fetch otherwise.
    #[default]
    CacheOrFetch,
    /// Use the cache even when stale, but never fetch.
    ForceCacheOnly,
    /// Use the cache only when fresh; never fetch.
    UseCacheOnly,
    /// Ignore the cache entirely.
    NoCache,
}

/// Options for [`fetch_repo_data`].
#[derive(Debug, Clone)]
pub struct FetchRepoDataOptions {
    /// How the cache is used.
    pub cache_action: CacheAction,
    /// How long a cached payload is used without talking to the server.
    pub local_repodata_ttl: Duration,
    /// Whether to probe for and prefer `repodata.json.zst`.
    pub zst_enabled: bool,
    /// The number of times a retryable response (413, 429, 5xx) is retried.
    pub max_retries: u32,
}

impl Default for FetchRepoDataOptions {
    fn default() -> Self {
        Self {
            cache_action: CacheAction::default(),
            local_repodata_ttl: Duration::from_secs(60),
            zst_enabled: true,
            max_retries: 3,
        }
    }
}

/// How the cache was used for a particular fetch.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CacheResult {
    /// The cache was fresh; no request was made.
    CacheHit,
    /// The server confirmed the cache is still valid (304).
    CacheHitAfterFetch,
    /// The cache existed but was replaced by a newer payload.
    CacheOutdated,
    /// Nothing was cached; the payload was downloaded.
    CacheNotPresent,
}

/// The product of a successful [`fetch_repo_data`] call.
#[derive(Debug)]
pub struct CachedRepoData {
    /// The path of the cached `repodata.json` payload.
    pub repo_data_path: PathBuf,
    /// The state describing the payload.
    pub cache_state: SubdirState,
    /// How the cache was used.
    pub cache_result: CacheResult,
}

/// Fetches the `repodata.json` of one subdirectory, using and maintaining
/// the local cache in `cache_path`.
#[instrument(err, skip_all, fields(subdir_url = %subdir_url, cache_path = %cache_path.display()))]
pub async fn fetch_repo_data(
    subdir_url: Url,
    client: reqwest_middleware::ClientWithMiddleware,
    cache_path: PathBuf,
    options: FetchRepoDataOptions,
) -> Result<CachedRepoData, FetchRepoDataError> {
    let subdir_url = normalize_subdir_url(subdir_url);
    fs_err::create_dir_all(&cache_path)?;

    let cache_key = url_to_cache_key(&subdir_url);
    let repo_data_path = cache_path.join(format!("{cache_key}.json"));
    let state_path = cache_path.join(format!("{cache_key}.state.json"));

    // A state file that does not parse is quarantined, the payload is
    // refetched from scratch.
    let mut state = match SubdirState::from_path(&state_path) {
        Ok(state) => Some(state),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(
                "quarantining malformed cache state {}: {e}",
                state_path.display()
            );
            let _ = fs_err::rename(&state_path, state_path.with_extension("json.bad"));
            None
        }
    };
    if options.cache_action == CacheAction::NoCache {
        state = None;
    }

    // Use the cache outright when it is fresh enough.
    let payload_matches = state
        .as_ref()
        .map_or(false, |state| state.matches_payload(&repo_data_path));
    if let Some(state) = state.as_ref().filter(|_| payload_matches) {
        let age = SystemTime::now()
            .duration_since(state.cache_last_modified)
            .unwrap_or_default();
        let fresh = age < options.local_repodata_ttl;
        match options.cache_action {
            CacheAction::ForceCacheOnly => {
                return Ok(CachedRepoData {
                    repo_data_path,
                    cache_state: state.clone(),
                    cache_result: CacheResult::CacheHit,
                });
            }
            CacheAction::UseCacheOnly if !fresh => return Err(FetchRepoDataError::NoCacheAvailable),
            CacheAction::UseCacheOnly | CacheAction::CacheOrFetch if fresh => {
                tracing::debug!("repodata cache is fresh, skipping the request");
                return Ok(CachedRepoData {
                    repo_data_path,
                    cache_state: state.clone(),
                    cache_result: CacheResult::CacheHit,
                });
            }
            _ => {}
        }
    } else if matches!(
        options.cache_action,
        CacheAction::ForceCacheOnly | CacheAction::UseCacheOnly
    ) {
        return Err(FetchRepoDataError::NoCacheAvailable);
    }

    // Decide between repodata.json and repodata.json.zst.
    let has_zst = if options.zst_enabled {
        match state
            .as_ref()
            .and_then(|state| state.has_zst.as_ref())
            .and_then(|expiring| expiring.value(zst_probe_expiration()))
        {
            Some(&value) => Expiring {
                value,
                last_checked: state
                    .as_ref()
                    .and_then(|s| s.has_zst.as_ref())
                    .map(|e| e.last_checked)
                    .unwrap_or_else(chrono::Utc::now),
            },
            None => Expiring {
                value: probe_zst(&client, &subdir_url).await,
                last_checked: chrono::Utc::now(),
            },
        }
    } else {
        Expiring {
            value: false,
            last_checked: chrono::Utc::now(),
        }
    };

    let (file_url, is_zst) = if has_zst.value {
        (
            subdir_url
                .join("repodata.json.zst")
                .expect("a fixed file name always joins"),
            true,
        )
    } else {
        (
            subdir_url
                .join("repodata.json")
                .expect("a fixed file name always joins"),
            false,
        )
    };

    // Only send conditional headers when we still hold the payload the
    // state refers to, and for the same file variant.
    let conditional_headers = state
        .as_ref()
        .filter(|state| payload_matches && state.url == file_url)
        .map(|state| state.cache_headers.clone());

    let response = send_with_retries(&client, &file_url, conditional_headers, options.max_retries)
        .await?;

    if response.status() == StatusCode::NOT_MODIFIED {
        tracing::debug!("server confirmed the cached repodata is up to date");
        let mut state = state.expect("a 304 can only happen with conditional headers");
        // Re-stamp the payload so the TTL window restarts now.
        let now = filetime_now(&repo_data_path)?;
        state.cache_last_modified = now;
        state.has_zst = Some(has_zst);
        state.to_path(&state_path)?;
        return Ok(CachedRepoData {
            repo_data_path,
            cache_state: state,
            cache_result: CacheResult::CacheHitAfterFetch,
        });
    }

    // Stream the body into a temporary file, decompressing when needed.
    let cache_headers = CacheHeaders::from(&response);
    let temp_file = tempfile::NamedTempFile::new_in(&cache_path)?;
    let temp_path = temp_file.path().to_path_buf();
    {
        use futures::TryStreamExt;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e));
        let reader = StreamReader::new(stream);
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let copy_result = if is_zst {
            let mut decoder = async_compression::tokio::bufread::ZstdDecoder::new(reader);
            tokio::io::copy(&mut decoder, &mut file).await
        } else {
            let mut reader = reader;
            tokio::io::copy(&mut reader, &mut file).await
        };
        copy_result.map_err(|e| FetchRepoDataError::FailedToDownload(file_url.clone(), e))?;
        file.sync_all().await?;
    }

    let had_cache = state.is_some();
    temp_file.persist(&repo_data_path)?;

    let metadata = fs_err::metadata(&repo_data_path)?;
    let new_state = SubdirState {
        url: file_url,
        cache_headers,
        cache_last_modified: metadata.modified()?,
        cache_size: metadata.len(),
        has_zst: Some(has_zst),
    };
    new_state.to_path(&state_path)?;

    Ok(CachedRepoData {
        repo_data_path,
        cache_state: new_state,
        cache_result: if had_cache {
            CacheResult::CacheOutdated
        } else {
            CacheResult::CacheNotPresent
        },
    })
}

/// The modification time of the payload file, refreshed to "now" by
/// touching it.
fn filetime_now(path: &std::path::Path) -> Result<SystemTime, std::io::Error> {
    let file = std::fs::OpenOptions::new().append(true).open(path)?;
    file.set_times(std::fs::FileTimes::new().set_modified(SystemTime::now()))?;
    file.metadata()?.modified()
}

/// Issues a HEAD request for `repodata.json.zst` to determine whether the
/// compressed variant exists. Any failure counts as "not available".
async fn probe_zst(
    client: &reqwest_middleware::ClientWithMiddleware,
    subdir_url: &Url,
) -> bool {
    let url = subdir_url
        .join("repodata.json.zst")
        .expect("a fixed file name always joins");
    match client.head(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Sends the GET request, retrying retryable statuses (413, 429, 5xx) with
/// exponential backoff and honoring a `Retry-After` header.
async fn send_with_retries(
    client: &reqwest_middleware::ClientWithMiddleware,
    url: &Url,
    conditional_headers: Option<CacheHeaders>,
    max_retries: u32,
) -> Result<reqwest::Response, FetchRepoDataError> {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
    let request_start = SystemTime::now();
    let mut retries = 0;

    loop {
        let mut headers = header::HeaderMap::new();
        if let Some(cache_headers) = &conditional_headers {
            cache_headers.add_to_request(&mut headers);
        }
        let response = client.get(url.clone()).headers(headers).send().await?;

        let status = response.status();
        let retryable = status == StatusCode::PAYLOAD_TOO_LARGE
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error();
        if !retryable {
            return match status {
                status if status.is_success() || status == StatusCode::NOT_MODIFIED => Ok(response),
                StatusCode::NOT_FOUND => Err(FetchRepoDataError::NotFound { url: url.clone() }),
                status => Err(FetchRepoDataError::HttpStatus {
                    status,
                    url: url.clone(),
                }),
            };
        }

        match retry_policy.should_retry(request_start, retries) {
            RetryDecision::Retry { execute_after } => {
                let policy_wait = execute_after
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                // A Retry-After header overrides the backoff when longer.
                let server_wait = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or_default();
                let wait = policy_wait.max(server_wait);
                tracing::warn!("{url} returned {status}, retrying in {wait:?}");
                tokio::time::sleep(wait).await;
                retries += 1;
            }
            RetryDecision::DoNotRetry => {
                return Err(FetchRepoDataError::HttpStatus {
                    status,
                    url: url.clone(),
                })
            }
        }
    }
}
