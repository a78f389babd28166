//! The on-disk cache state kept next to a cached `repodata.json`.

use std::{path::Path, str::FromStr, time::SystemTime};

use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

/// The HTTP cache headers of the last successful response, used to issue
/// conditional requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheHeaders {
    /// The `ETag` of the cached payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// The `Last-Modified` timestamp of the cached payload.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mod")]
    pub last_modified: Option<String>,

    /// The `Cache-Control` header of the last response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

impl From<&reqwest::Response> for CacheHeaders {
    fn from(response: &reqwest::Response) -> Self {
        let header_string = |name| {
            response
                .headers()
                .get(name)
                .and_then(|value: &HeaderValue| value.to_str().ok())
                .map(ToOwned::to_owned)
        };
        Self {
            etag: header_string(header::ETAG),
            last_modified: header_string(header::LAST_MODIFIED),
            cache_control: header_string(header::CACHE_CONTROL),
        }
    }
}

impl CacheHeaders {
    /// Adds `If-None-Match` / `If-Modified-Since` to a request so the
    /// server can reply `304 Not Modified`.
    pub fn add_to_request(&self, headers: &mut HeaderMap) {
        if let Some(etag) = self
            .etag
            .as_deref()
            .and_then(|etag| HeaderValue::from_str(etag).ok())
        {
            headers.insert(header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = self
            .last_modified
            .as_deref()
            .and_then(|value| HeaderValue::from_str(value).ok())
        {
            headers.insert(header::IF_MODIFIED_SINCE, last_modified);
        }
    }
}

/// A value together with the moment it was determined, so it can expire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expiring<T> {
    /// The recorded value.
    pub value: T,
    /// When the value was last checked.
    pub last_checked: chrono::DateTime<chrono::Utc>,
}

impl<T> Expiring<T> {
    /// Returns the value if it was checked within `expiration`.
    pub fn value(&self, expiration: chrono::Duration) -> Option<&T> {
        if chrono::Utc::now().signed_duration_since(self.last_checked) >= expiration {
            None
        } else {
            Some(&self.value)
        }
    }
}

/// The `.state.json` file stored alongside a cached `repodata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdirState {
    /// The url the payload was downloaded from. This is the full file url,
    /// including the `.zst` suffix when the compressed variant was used.
    pub url: Url,

    /// The cache headers of the last response.
    #[serde(flatten)]
    pub cache_headers: CacheHeaders,

    /// The modification time of the cached payload on disk, in nanoseconds
    /// since the unix epoch.
    #[serde(
        rename = "mtime_ns",
        serialize_with = "system_time_to_nanos",
        deserialize_with = "system_time_from_nanos"
    )]
    pub cache_last_modified: SystemTime,

    /// The size of the cached payload in bytes.
    #[serde(rename = "size")]
    pub cache_size: u64,

    /// Whether the subdirectory offers a `repodata.json.zst`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_zst: Option<Expiring<bool>>,
}

impl SubdirState {
    /// Reads and parses a state file from disk.
    pub fn from_path(path: &Path) -> Result<SubdirState, std::io::Error> {
        let content = fs_err::read_to_string(path)?;
        Ok(Self::from_str(&content)?)
    }

    /// Writes the state file, pretty printed like the rest of the cache.
    pub fn to_path(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)?;
        crate::utils::atomic_write(path, json.as_bytes())
    }

    /// Returns true if the payload file on disk still matches this state:
    /// same size and same modification time.
    pub fn matches_payload(&self, payload: &Path) -> bool {
        let Ok(metadata) = payload.metadata() else {
            return false;
        };
        metadata.len() == self.cache_size
            && metadata
                .modified()
                .map_or(false, |modified| modified == self.cache_last_modified)
    }
}

impl FromStr for SubdirState {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

fn system_time_from_nanos<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<SystemTime, D::Error> {
    use serde::de::Error;
    SystemTime::UNIX_EPOCH
        .checked_add(std::time::Duration::from_nanos(Deserialize::deserialize(
            deserializer,
        )?))
        .ok_or_else(|| D::Error::custom("the time cannot be represented internally"))
}

fn system_time_to_nanos<S: Serializer>(time: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    use serde::ser::Error;
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|_| S::Error::custom("time predates the unix epoch"))?
        .as_nanos()
        .serialize(s)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::SubdirState;

    const STATE: &str = r#"{
        "url": "https://conda.anaconda.org/conda-forge/linux-64/repodata.json.zst",
        "etag": "W/\"2f8b1ff101d75e40adf28c3fcbcd330b\"",
        "mod": "Thu, 18 May 2023 13:28:44 GMT",
        "cache_control": "public, max-age=30",
        "mtime_ns": 1684418349941482000,
        "size": 38001429,
        "has_zst": {
            "value": true,
            "last_checked": "2023-05-18T13:59:07.112638Z"
        }
    }"#;

    #[test]
    fn test_parse_state() {
        let state = SubdirState::from_str(STATE).unwrap();
        assert_eq!(state.cache_size, 38001429);
        assert!(state.url.path().ends_with("repodata.json.zst"));
        assert_eq!(
            state.cache_headers.last_modified.as_deref(),
            Some("Thu, 18 May 2023 13:28:44 GMT")
        );
        assert!(state.has_zst.unwrap().value);
    }

    #[test]
    fn test_roundtrip() {
        let state = SubdirState::from_str(STATE).unwrap();
        let serialized = serde_json::to_string(&state).unwrap();
        let reparsed = SubdirState::from_str(&serialized).unwrap();
        assert_eq!(reparsed.cache_size, state.cache_size);
        assert_eq!(reparsed.cache_last_modified, state.cache_last_modified);
    }
}
