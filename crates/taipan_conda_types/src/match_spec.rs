use std::{fmt, fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

use taipan_digest::{parse_digest_from_hex, Md5, Md5Hash, Sha256, Sha256Hash};

use crate::{
    package_record::{PackageRecord, RepoDataRecord},
    version_spec::{ParseVersionSpecError, VersionSpec},
};

/// Matches a string either exactly or against a glob pattern (`*` wildcards).
/// Used for build strings in match specs.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum StringMatcher {
    /// The string must match exactly.
    Exact(String),
    /// The string must match the glob.
    Glob(String),
}

impl StringMatcher {
    /// Returns true if `other` matches this matcher.
    pub fn matches(&self, other: &str) -> bool {
        match self {
            StringMatcher::Exact(str) => str == other,
            StringMatcher::Glob(pattern) => glob::Pattern::new(pattern)
                .map(|pattern| pattern.matches(other))
                .unwrap_or(false),
        }
    }
}

impl FromStr for StringMatcher {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.contains('*') {
            StringMatcher::Glob(s.to_owned())
        } else {
            StringMatcher::Exact(s.to_owned())
        })
    }
}

impl Display for StringMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StringMatcher::Exact(str) | StringMatcher::Glob(str) => write!(f, "{str}"),
        }
    }
}

/// A parsed package constraint.
///
/// The canonical string form is
/// `[channel[/subdir]::]name[ version[ build]][[key=value,…]]`, e.g.:
///
/// ```text
/// python
/// python >=3.9
/// conda-forge::python 3.9.* *_cpython
/// python[subdir=linux-64, sha256=aabb…]
/// foo=1.0=py38
/// ```
///
/// All fields other than `name` are optional; an empty spec matches
/// everything.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct MatchSpec {
    /// The name of the package.
    pub name: Option<String>,
    /// The version constraint.
    pub version: Option<VersionSpec>,
    /// The build string, matched exactly or as a glob.
    pub build: Option<StringMatcher>,
    /// The build number.
    pub build_number: Option<u64>,
    /// The filename of the package archive.
    pub file_name: Option<String>,
    /// The channel the package must come from.
    pub channel: Option<String>,
    /// The subdir of the channel.
    pub subdir: Option<String>,
    /// The URL of the package archive.
    pub url: Option<Url>,
    /// The expected MD5 digest of the archive.
    pub md5: Option<Md5Hash>,
    /// The expected SHA256 digest of the archive.
    pub sha256: Option<Sha256Hash>,
}

/// A type that can be tested against a [`MatchSpec`].
pub trait Matches<Spec> {
    /// Returns true if this value satisfies the spec.
    fn matches(&self, spec: &Spec) -> bool;
}

impl Matches<MatchSpec> for PackageRecord {
    fn matches(&self, spec: &MatchSpec) -> bool {
        if let Some(name) = &spec.name {
            if name != &self.name {
                return false;
            }
        }
        if let Some(version) = &spec.version {
            if !version.matches(&self.version) {
                return false;
            }
        }
        if let Some(build) = &spec.build {
            if !build.matches(&self.build) {
                return false;
            }
        }
        if let Some(build_number) = spec.build_number {
            if build_number != self.build_number {
                return false;
            }
        }
        if let Some(subdir) = &spec.subdir {
            if subdir != &self.subdir {
                return false;
            }
        }
        if let Some(md5) = &spec.md5 {
            if Some(md5) != self.md5.as_ref() {
                return false;
            }
        }
        if let Some(sha256) = &spec.sha256 {
            if Some(sha256) != self.sha256.as_ref() {
                return false;
            }
        }
        true
    }
}

impl Matches<MatchSpec> for RepoDataRecord {
    fn matches(&self, spec: &MatchSpec) -> bool {
        if !self.package_record.matches(spec) {
            return false;
        }
        if let Some(file_name) = &spec.file_name {
            if file_name != &self.file_name {
                return false;
            }
        }
        if let Some(url) = &spec.url {
            if url != &self.url {
                return false;
            }
        }
        if let Some(channel) = &spec.channel {
            // Channels in records are stored as urls; compare on the
            // trailing name as well so `conda-forge::` matches records from
            // `https://conda.anaconda.org/conda-forge`.
            if channel != &self.channel
                && self
                    .channel
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .map_or(true, |name| name != channel)
            {
                return false;
            }
        }
        true
    }
}

/// An error that occurred while parsing a match spec.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseMatchSpecError {
    /// The spec was empty.
    #[error("empty match spec")]
    Empty,

    /// A bracket section was not closed or contained no `key=value` pairs.
    #[error("invalid bracket section")]
    InvalidBracket,

    /// A bracket key is not recognized.
    #[error("unknown bracket key '{0}'")]
    UnknownBracketKey(String),

    /// The version constraint could not be parsed.
    #[error(transparent)]
    InvalidVersionSpec(#[from] ParseVersionSpecError),

    /// The build number is not an integer.
    #[error("invalid build number '{0}'")]
    InvalidBuildNumber(String),

    /// A digest value is not valid hex of the right width.
    #[error("invalid {0} digest '{1}'")]
    InvalidDigest(&'static str, String),

    /// The url bracket value could not be parsed.
    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    /// The package name contains invalid characters.
    #[error("invalid package name '{0}'")]
    InvalidPackageName(String),
}

/// Splits `channel::rest`, accounting for a possible `subdir` selector in
/// the channel part (`channel/subdir::name`).
fn split_channel(spec: &str) -> (Option<(&str, Option<&str>)>, &str) {
    match spec.split_once("::") {
        Some((channel, rest)) => match channel.split_once('/') {
            Some((channel, subdir)) => (Some((channel, Some(subdir))), rest),
            None => (Some((channel, None)), rest),
        },
        None => (None, spec),
    }
}

/// Splits a trailing `[key=value,…]` bracket section off the spec.
fn split_bracket(spec: &str) -> Result<(&str, Vec<(&str, &str)>), ParseMatchSpecError> {
    let Some(start) = spec.find('[') else {
        return Ok((spec, Vec::new()));
    };
    let rest = &spec[start..];
    let Some(end) = rest.rfind(']') else {
        return Err(ParseMatchSpecError::InvalidBracket);
    };

    let mut pairs = Vec::new();
    for pair in rest[1..end].split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or(ParseMatchSpecError::InvalidBracket)?;
        let value = value.trim().trim_matches('"').trim_matches('\'');
        pairs.push((key.trim(), value));
    }

    Ok((&spec[..start], pairs))
}

fn is_package_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl MatchSpec {
    fn apply_bracket(&mut self, key: &str, value: &str) -> Result<(), ParseMatchSpecError> {
        match key {
            "version" => self.version = Some(VersionSpec::from_str(value)?),
            "build" => self.build = Some(StringMatcher::from_str(value).expect("infallible")),
            "build_number" => {
                self.build_number = Some(value.parse().map_err(|_| {
                    ParseMatchSpecError::InvalidBuildNumber(value.to_owned())
                })?);
            }
            "fn" => self.file_name = Some(value.to_owned()),
            "channel" => self.channel = Some(value.to_owned()),
            "subdir" => self.subdir = Some(value.to_owned()),
            "url" => {
                self.url = Some(
                    Url::parse(value)
                        .map_err(|_| ParseMatchSpecError::InvalidUrl(value.to_owned()))?,
                );
            }
            "md5" => {
                self.md5 = Some(parse_digest_from_hex::<Md5>(value).ok_or_else(|| {
                    ParseMatchSpecError::InvalidDigest("md5", value.to_owned())
                })?);
            }
            "sha256" => {
                self.sha256 = Some(parse_digest_from_hex::<Sha256>(value).ok_or_else(|| {
                    ParseMatchSpecError::InvalidDigest("sha256", value.to_owned())
                })?);
            }
            key => return Err(ParseMatchSpecError::UnknownBracketKey(key.to_owned())),
        }
        Ok(())
    }
}

impl FromStr for MatchSpec {
    type Err = ParseMatchSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim();
        if spec.is_empty() {
            return Err(ParseMatchSpecError::Empty);
        }

        let mut result = MatchSpec::default();

        let (spec, brackets) = split_bracket(spec)?;
        let (channel, spec) = split_channel(spec);
        if let Some((channel, subdir)) = channel {
            result.channel = Some(channel.to_owned());
            result.subdir = subdir.map(ToOwned::to_owned);
        }

        // The name is the leading run up to the first operator or space.
        let spec = spec.trim();
        let name_end = spec
            .find(|c: char| c.is_whitespace() || matches!(c, '=' | '<' | '>' | '!' | '~'))
            .unwrap_or(spec.len());
        let (name, mut rest) = spec.split_at(name_end);
        if !is_package_name(name) {
            return Err(ParseMatchSpecError::InvalidPackageName(spec.to_owned()));
        }
        result.name = Some(name.to_owned());

        rest = rest.trim();
        if !rest.is_empty() {
            // Either `version build` separated by whitespace, or the
            // `=version=build` shorthand.
            if let Some((version, build)) = rest.split_once(char::is_whitespace) {
                result.version = Some(VersionSpec::from_str(version)?);
                result.build = Some(StringMatcher::from_str(build.trim()).expect("infallible"));
            } else if let Some(shorthand) = rest.strip_prefix('=').filter(|r| {
                !r.starts_with('=') && r.contains('=')
            }) {
                let (version, build) = shorthand
                    .split_once('=')
                    .expect("shorthand contains a separator");
                result.version = Some(VersionSpec::from_str(&format!("={version}"))?);
                result.build = Some(StringMatcher::from_str(build).expect("infallible"));
            } else {
                result.version = Some(VersionSpec::from_str(rest)?);
            }
        }

        // Bracket values take precedence over the shorthand fields.
        for (key, value) in brackets {
            result.apply_bracket(key, value)?;
        }

        Ok(result)
    }
}

impl Display for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(channel) = &self.channel {
            write!(f, "{channel}")?;
            if let Some(subdir) = &self.subdir {
                write!(f, "/{subdir}")?;
            }
            write!(f, "::")?;
        }
        match &self.name {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "*")?,
        }
        match (&self.version, &self.build) {
            (Some(version), Some(build)) => write!(f, " {version} {build}")?,
            (Some(version), None) => write!(f, " {version}")?,
            (None, Some(build)) => write!(f, " * {build}")?,
            (None, None) => {}
        }

        let mut brackets = Vec::new();
        if let Some(build_number) = self.build_number {
            brackets.push(format!("build_number={build_number}"));
        }
        if let Some(file_name) = &self.file_name {
            brackets.push(format!("fn=\"{file_name}\""));
        }
        if let Some(url) = &self.url {
            brackets.push(format!("url={url}"));
        }
        if self.channel.is_none() {
            if let Some(subdir) = &self.subdir {
                brackets.push(format!("subdir={subdir}"));
            }
        }
        if let Some(md5) = &self.md5 {
            brackets.push(format!("md5={}", hex::encode(md5)));
        }
        if let Some(sha256) = &self.sha256 {
            brackets.push(format!("sha256={}", hex::encode(sha256)));
        }
        if !brackets.is_empty() {
            write!(f, "[{}]", brackets.join(","))?;
        }
        Ok(())
    }
}

impl Serialize for MatchSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MatchSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use rstest::rstest;

    use super::{MatchSpec, Matches, StringMatcher};
    use crate::{package_record::PackageRecord, version_spec::VersionSpec};

    fn record(name: &str, version: &str, build: &str) -> PackageRecord {
        PackageRecord::new(
            name.to_owned(),
            version.parse().unwrap(),
            build.to_owned(),
        )
    }

    #[test]
    fn test_parse_name_only() {
        let spec = MatchSpec::from_str("python").unwrap();
        assert_eq!(spec.name.as_deref(), Some("python"));
        assert_eq!(spec.version, None);
    }

    #[test]
    fn test_parse_version_forms() {
        let spec = MatchSpec::from_str("python >=3.9").unwrap();
        assert_eq!(spec.version, Some(VersionSpec::from_str(">=3.9").unwrap()));

        let spec = MatchSpec::from_str("python>=3.9,<3.12").unwrap();
        assert_eq!(
            spec.version,
            Some(VersionSpec::from_str(">=3.9,<3.12").unwrap())
        );

        let spec = MatchSpec::from_str("python=3.9").unwrap();
        assert_eq!(spec.version, Some(VersionSpec::from_str("=3.9").unwrap()));
    }

    #[test]
    fn test_parse_shorthand_build() {
        let spec = MatchSpec::from_str("foo=1.0=py38").unwrap();
        assert_eq!(spec.name.as_deref(), Some("foo"));
        assert_eq!(spec.version, Some(VersionSpec::from_str("=1.0").unwrap()));
        assert_eq!(spec.build, Some(StringMatcher::Exact("py38".to_owned())));
    }

    #[test]
    fn test_parse_channel() {
        let spec = MatchSpec::from_str("conda-forge::python 3.9.* *_cpython").unwrap();
        assert_eq!(spec.channel.as_deref(), Some("conda-forge"));
        assert_eq!(spec.build, Some(StringMatcher::Glob("*_cpython".to_owned())));

        let spec = MatchSpec::from_str("conda-forge/linux-64::python").unwrap();
        assert_eq!(spec.subdir.as_deref(), Some("linux-64"));
    }

    #[test]
    fn test_parse_brackets() {
        let spec = MatchSpec::from_str(
            "foo[subdir=linux-64, build_number=3, md5=bf7f54dd0f25c3f06ecb82a07341841a]",
        )
        .unwrap();
        assert_eq!(spec.subdir.as_deref(), Some("linux-64"));
        assert_eq!(spec.build_number, Some(3));
        assert!(spec.md5.is_some());

        assert!(MatchSpec::from_str("foo[color=red]").is_err());
        assert!(MatchSpec::from_str("foo[md5=xyz]").is_err());
    }

    #[rstest]
    #[case("python", "python", "3.9.2", "h123_0", true)]
    #[case("python >=3.9", "python", "3.9.2", "h123_0", true)]
    #[case("python >=3.10", "python", "3.9.2", "h123_0", false)]
    #[case("numpy", "python", "3.9.2", "h123_0", false)]
    #[case("python 3.9.* h*", "python", "3.9.2", "h123_0", true)]
    #[case("python 3.9.* g*", "python", "3.9.2", "h123_0", false)]
    fn test_matches(
        #[case] spec: &str,
        #[case] name: &str,
        #[case] version: &str,
        #[case] build: &str,
        #[case] expected: bool,
    ) {
        let spec = MatchSpec::from_str(spec).unwrap();
        assert_eq!(record(name, version, build).matches(&spec), expected);
    }

    #[test]
    fn test_roundtrip() {
        for str in [
            "python",
            "python >=3.9",
            "conda-forge::python >=3.9",
            "conda-forge/linux-64::python 3.9.*",
            "foo ==1.0 py38[build_number=3]",
            "foo[md5=bf7f54dd0f25c3f06ecb82a07341841a]",
        ] {
            let spec = MatchSpec::from_str(str).unwrap();
            let rendered = spec.to_string();
            assert_eq!(
                MatchSpec::from_str(&rendered).unwrap(),
                spec,
                "{str} -> {rendered}"
            );
        }
    }
}
