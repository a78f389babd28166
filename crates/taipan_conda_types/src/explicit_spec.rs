use std::{path::Path, str::FromStr};

use thiserror::Error;
use url::Url;

use taipan_digest::{parse_digest_from_hex, Md5, Md5Hash, Sha256, Sha256Hash};

/// The checksum attached to an explicit package url.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PackageChecksum {
    /// An MD5 digest (a bare 32 character hex fragment).
    Md5(Md5Hash),
    /// A SHA256 digest (a `sha256:<hex>` fragment).
    Sha256(Sha256Hash),
}

/// A single explicit package: a direct archive url with an optional
/// checksum in the fragment, e.g.
/// `https://host/ch/linux-64/pkg-1.0-0.tar.bz2#sha256:abcd…`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExplicitSpec {
    /// The url of the package archive, without the checksum fragment.
    pub url: Url,
    /// The expected checksum of the archive, if given.
    pub checksum: Option<PackageChecksum>,
}

/// An error parsing an explicit spec or an explicit environment file.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseExplicitSpecError {
    /// The url could not be parsed.
    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    /// The checksum fragment is not a valid md5 or sha256 hex string.
    #[error("invalid checksum '{0}'")]
    InvalidChecksum(String),

    /// The environment file has no `@EXPLICIT` marker.
    #[error("not an explicit environment file (missing '@EXPLICIT')")]
    MissingExplicitMarker,
}

impl FromStr for ExplicitSpec {
    type Err = ParseExplicitSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut url =
            Url::parse(s).map_err(|_| ParseExplicitSpecError::InvalidUrl(s.to_owned()))?;

        let checksum = match url.fragment() {
            None | Some("") => None,
            Some(fragment) => Some(if let Some(hex) = fragment.strip_prefix("sha256:") {
                PackageChecksum::Sha256(parse_digest_from_hex::<Sha256>(hex).ok_or_else(
                    || ParseExplicitSpecError::InvalidChecksum(fragment.to_owned()),
                )?)
            } else {
                PackageChecksum::Md5(parse_digest_from_hex::<Md5>(fragment).ok_or_else(
                    || ParseExplicitSpecError::InvalidChecksum(fragment.to_owned()),
                )?)
            }),
        };
        url.set_fragment(None);

        Ok(ExplicitSpec { url, checksum })
    }
}

impl ExplicitSpec {
    /// The archive filename of the package, the final segment of the url.
    pub fn file_name(&self) -> Option<&str> {
        self.url
            .path_segments()
            .into_iter()
            .flatten()
            .next_back()
            .filter(|name| !name.is_empty())
    }
}

/// A parsed explicit environment file: a list of direct package urls,
/// marked with an `@EXPLICIT` line. Such files are produced by
/// `conda list --explicit` and are installed without invoking the solver.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExplicitEnvironmentSpec {
    /// The platform the file was exported for, from a `# platform:`
    /// comment, if present.
    pub platform: Option<String>,
    /// The packages to install, in file order.
    pub packages: Vec<ExplicitSpec>,
}

impl ExplicitEnvironmentSpec {
    /// Parses an explicit environment file from a string.
    pub fn from_str(content: &str) -> Result<Self, ParseExplicitSpecError> {
        let mut platform = None;
        let mut packages = Vec::new();
        let mut explicit = false;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                if let Some(value) = rest.trim().strip_prefix("platform:") {
                    platform = Some(value.trim().to_owned());
                }
                continue;
            }
            if line.eq_ignore_ascii_case("@explicit") {
                explicit = true;
                continue;
            }
            packages.push(ExplicitSpec::from_str(line)?);
        }

        if !explicit {
            return Err(ParseExplicitSpecError::MissingExplicitMarker);
        }
        Ok(ExplicitEnvironmentSpec { platform, packages })
    }

    /// Reads and parses an explicit environment file from disk.
    pub fn from_path(path: &Path) -> Result<Self, std::io::Error> {
        let content = fs_err::read_to_string(path)?;
        Self::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::{ExplicitEnvironmentSpec, ExplicitSpec, PackageChecksum, ParseExplicitSpecError};

    #[test]
    fn test_parse_with_sha256() {
        let spec = ExplicitSpec::from_str(
            "https://host/ch/linux-64/pkg-1.0-0.tar.bz2#sha256:7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c",
        )
        .unwrap();
        assert!(matches!(spec.checksum, Some(PackageChecksum::Sha256(_))));
        assert_eq!(spec.file_name(), Some("pkg-1.0-0.tar.bz2"));
        assert!(spec.url.fragment().is_none());
    }

    #[test]
    fn test_parse_with_md5() {
        let spec = ExplicitSpec::from_str(
            "https://host/ch/noarch/pkg-1.0-0.conda#bf7f54dd0f25c3f06ecb82a07341841a",
        )
        .unwrap();
        assert!(matches!(spec.checksum, Some(PackageChecksum::Md5(_))));
    }

    #[test]
    fn test_parse_without_checksum() {
        let spec =
            ExplicitSpec::from_str("https://host/ch/noarch/pkg-1.0-0.conda").unwrap();
        assert!(spec.checksum.is_none());
    }

    #[test]
    fn test_invalid_checksum() {
        assert!(matches!(
            ExplicitSpec::from_str("https://host/pkg.conda#nothex!"),
            Err(ParseExplicitSpecError::InvalidChecksum(_))
        ));
    }

    #[test]
    fn test_environment_file() {
        let env = ExplicitEnvironmentSpec::from_str(
            "# platform: linux-64\n\
             @EXPLICIT\n\
             https://host/ch/linux-64/a-1.0-0.tar.bz2\n\
             https://host/ch/linux-64/b-2.0-0.conda#bf7f54dd0f25c3f06ecb82a07341841a\n",
        )
        .unwrap();
        assert_eq!(env.platform.as_deref(), Some("linux-64"));
        assert_eq!(env.packages.len(), 2);

        assert!(matches!(
            ExplicitEnvironmentSpec::from_str("https://host/a.conda"),
            Err(ParseExplicitSpecError::MissingExplicitMarker)
        ));
    }
}
