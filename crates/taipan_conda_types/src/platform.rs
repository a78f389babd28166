use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// A platform supported by Conda. A platform is the combination of an
/// operating system and an architecture and corresponds to the name of a
/// channel subdirectory.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum Platform {
    #[serde(rename = "noarch")]
    NoArch,
    #[serde(rename = "linux-32")]
    Linux32,
    #[serde(rename = "linux-64")]
    Linux64,
    #[serde(rename = "linux-aarch64")]
    LinuxAarch64,
    #[serde(rename = "linux-ppc64le")]
    LinuxPpc64le,
    #[serde(rename = "osx-64")]
    Osx64,
    #[serde(rename = "osx-arm64")]
    OsxArm64,
    #[serde(rename = "win-32")]
    Win32,
    #[serde(rename = "win-64")]
    Win64,
    #[serde(rename = "win-arm64")]
    WinArm64,
}

impl Platform {
    /// Returns the platform for which the current binary was built.
    pub fn current() -> Platform {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        return Platform::Linux64;

        #[cfg(all(target_os = "linux", target_arch = "x86"))]
        return Platform::Linux32;

        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        return Platform::LinuxAarch64;

        #[cfg(all(target_os = "linux", target_arch = "powerpc64le"))]
        return Platform::LinuxPpc64le;

        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        return Platform::Osx64;

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        return Platform::OsxArm64;

        #[cfg(all(target_os = "windows", target_arch = "x86"))]
        return Platform::Win32;

        #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
        return Platform::Win64;

        #[cfg(all(target_os = "windows", target_arch = "aarch64"))]
        return Platform::WinArm64;
    }

    /// Returns a string representation of the platform, equal to the channel
    /// subdirectory name.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::NoArch => "noarch",
            Platform::Linux32 => "linux-32",
            Platform::Linux64 => "linux-64",
            Platform::LinuxAarch64 => "linux-aarch64",
            Platform::LinuxPpc64le => "linux-ppc64le",
            Platform::Osx64 => "osx-64",
            Platform::OsxArm64 => "osx-arm64",
            Platform::Win32 => "win-32",
            Platform::Win64 => "win-64",
            Platform::WinArm64 => "win-arm64",
        }
    }

    /// Returns true if the platform is a Windows based platform.
    pub fn is_windows(self) -> bool {
        matches!(self, Platform::Win32 | Platform::Win64 | Platform::WinArm64)
    }

    /// Returns true if the platform is a Unix based platform.
    pub fn is_unix(self) -> bool {
        self.is_linux() || self.is_osx()
    }

    /// Returns true if the platform is a Linux based platform.
    pub fn is_linux(self) -> bool {
        matches!(
            self,
            Platform::Linux32 | Platform::Linux64 | Platform::LinuxAarch64 | Platform::LinuxPpc64le
        )
    }

    /// Returns true if the platform is an macOS based platform.
    pub fn is_osx(self) -> bool {
        matches!(self, Platform::Osx64 | Platform::OsxArm64)
    }
}

/// An error that can occur when parsing a platform from a string.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("'{string}' is not a known platform")]
pub struct ParsePlatformError {
    /// The platform string that could not be parsed.
    pub string: String,
}

impl FromStr for Platform {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "noarch" => Platform::NoArch,
            "linux-32" => Platform::Linux32,
            "linux-64" => Platform::Linux64,
            "linux-aarch64" => Platform::LinuxAarch64,
            "linux-ppc64le" => Platform::LinuxPpc64le,
            "osx-64" => Platform::Osx64,
            "osx-arm64" => Platform::OsxArm64,
            "win-32" => Platform::Win32,
            "win-64" => Platform::Win64,
            "win-arm64" => Platform::WinArm64,
            string => {
                return Err(ParsePlatformError {
                    string: string.to_owned(),
                })
            }
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::Platform;

    #[test]
    fn test_parse_roundtrip() {
        for platform in [
            Platform::NoArch,
            Platform::Linux64,
            Platform::LinuxAarch64,
            Platform::Osx64,
            Platform::OsxArm64,
            Platform::Win64,
        ] {
            assert_eq!(Platform::from_str(platform.as_str()).unwrap(), platform);
        }

        assert!(Platform::from_str("atari-2600").is_err());
    }
}
