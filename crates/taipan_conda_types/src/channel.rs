use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::platform::{ParsePlatformError, Platform};

/// Configuration used when resolving a channel from a user supplied string.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelConfig {
    /// The base url against which bare channel names are resolved, e.g.
    /// `https://conda.anaconda.org`.
    pub channel_alias: Url,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_alias: Url::parse("https://conda.anaconda.org")
                .expect("the alias is a valid url"),
        }
    }
}

/// A conda channel: a named base url under which per-platform subdirectories
/// hold `repodata.json` indices and package archives.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// The name of the channel, e.g. `conda-forge`.
    pub name: String,

    /// The base url of the channel, always ending in a `/`.
    pub base_url: Url,

    /// The platforms explicitly selected for this channel
    /// (`channel[linux-64,noarch]`), or `None` to use the defaults.
    pub platforms: Option<Vec<Platform>>,
}

/// An error that occurred while resolving a channel from a string.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseChannelError {
    /// The platform selector could not be parsed.
    #[error(transparent)]
    InvalidPlatform(#[from] ParsePlatformError),

    /// The string looked like a url but did not parse as one.
    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    /// The channel string was empty.
    #[error("empty channel")]
    Empty,
}

/// Splits a trailing `[platform,…]` selector off a channel string.
fn split_platforms(s: &str) -> Result<(&str, Option<Vec<Platform>>), ParseChannelError> {
    match s.strip_suffix(']').and_then(|rest| rest.split_once('[')) {
        Some((channel, platforms)) => {
            let platforms = platforms
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(Platform::from_str)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((channel.trim(), Some(platforms)))
        }
        None => Ok((s, None)),
    }
}

fn has_url_scheme(s: &str) -> bool {
    s.split_once("://").map_or(false, |(scheme, _)| {
        !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphabetic() || c == '+')
    })
}

/// Adds a trailing slash so that `Url::join` treats the last component as a
/// directory.
fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url
}

impl Channel {
    /// Resolves a channel from a user supplied string: a bare name (resolved
    /// against the alias), a url, or a local directory path. A trailing
    /// `[platform,…]` selector restricts the subdirectories.
    pub fn from_str(str: &str, config: &ChannelConfig) -> Result<Self, ParseChannelError> {
        let (str, platforms) = split_platforms(str.trim())?;
        if str.is_empty() {
            return Err(ParseChannelError::Empty);
        }

        let base_url = if has_url_scheme(str) {
            Url::parse(str).map_err(|_| ParseChannelError::InvalidUrl(str.to_owned()))?
        } else if str.starts_with('/') || str.starts_with("./") || str.starts_with("../") {
            Url::from_directory_path(Path::new(str).to_path_buf())
                .map_err(|()| ParseChannelError::InvalidUrl(str.to_owned()))?
        } else {
            config
                .channel_alias
                .join(&format!("{}/", str.trim_matches('/')))
                .map_err(|_| ParseChannelError::InvalidUrl(str.to_owned()))?
        };
        let base_url = ensure_trailing_slash(base_url);

        let name = base_url
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|segment| !segment.is_empty())
            .next_back()
            .unwrap_or(str)
            .to_owned();

        Ok(Channel {
            name,
            base_url,
            platforms,
        })
    }

    /// The canonical name of the channel: its full base url without a
    /// trailing slash.
    pub fn canonical_name(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_owned()
    }

    /// Returns the url of the subdirectory for the given platform.
    pub fn platform_url(&self, platform: Platform) -> Url {
        self.base_url
            .join(&format!("{}/", platform.as_str()))
            .expect("platform names are valid url segments")
    }

    /// The platforms to index for this channel: the explicit selector when
    /// given, otherwise the provided platform plus `noarch`.
    pub fn platforms_or(&self, platform: Platform) -> Vec<Platform> {
        match &self.platforms {
            Some(platforms) => {
                let mut platforms = platforms.clone();
                if !platforms.contains(&Platform::NoArch) {
                    platforms.push(Platform::NoArch);
                }
                platforms
            }
            None => vec![platform, Platform::NoArch],
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_name())
    }
}
