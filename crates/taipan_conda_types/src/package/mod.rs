//! Models for the metadata files inside a package archive's `info/`
//! directory: `paths.json`, `index.json` and `link.json`, plus the
//! deprecated `files` + `has_prefix` pair that very old packages use
//! instead of `paths.json`.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};

use taipan_digest::{serde::SerializableHash, Sha256, Sha256Hash};

use crate::{no_arch_type::NoArchType, version::Version};

/// The type of a path entry in `paths.json`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    /// The file can be hard linked from the package cache into a prefix.
    HardLink,
    /// The file is a symbolic link.
    SoftLink,
    /// An empty directory.
    Directory,
}

/// Whether a file with a prefix placeholder is treated as text or binary
/// during prefix replacement.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    /// The placeholder is replaced with a plain string substitution.
    Binary,
    /// The placeholder is replaced with a length-preserving, NUL padded
    /// substitution.
    Text,
}

/// A single entry in `paths.json`.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PathsEntry {
    /// The relative path of the file within the package (and the prefix).
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,

    /// How the file should be placed into a prefix.
    pub path_type: PathType,

    /// The placeholder prefix baked into the file at build time, if any.
    #[serde(default)]
    pub prefix_placeholder: Option<String>,

    /// Whether placeholder substitution is textual or binary.
    #[serde(default)]
    pub file_mode: Option<FileMode>,

    /// Whether this file must not be linked (always copied).
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_link: bool,

    /// The SHA256 digest of the file in the package.
    #[serde_as(as = "Option<SerializableHash<Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,

    /// The size of the file in bytes.
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The parsed `info/paths.json` file: the authoritative list of files in a
/// package and how to install them.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PathsJson {
    /// The version of the file format.
    pub paths_version: u64,

    /// All entries of the package.
    #[serde(default)]
    pub paths: Vec<PathsEntry>,
}

impl PathsJson {
    /// Reads the `info/paths.json` file from an extracted package directory.
    pub fn from_package_directory(package_dir: &Path) -> Result<Self, std::io::Error> {
        let content = fs_err::read(package_dir.join("info/paths.json"))?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Reconstructs the paths information from the deprecated `info/files`
    /// and `info/has_prefix` files. Used for very old packages that do not
    /// carry a `paths.json`.
    pub fn from_deprecated_package_directory(package_dir: &Path) -> Result<Self, std::io::Error> {
        let files = fs_err::read_to_string(package_dir.join("info/files"))?;

        // `has_prefix` lines are either `<placeholder> <mode> <path>` or
        // just `<path>`.
        let mut prefixes: std::collections::HashMap<PathBuf, (String, FileMode)> =
            std::collections::HashMap::new();
        match fs_err::read_to_string(package_dir.join("info/has_prefix")) {
            Ok(has_prefix) => {
                for line in has_prefix.lines().filter(|line| !line.trim().is_empty()) {
                    let parts: Vec<&str> = line.trim().splitn(3, ' ').collect();
                    match parts.as_slice() {
                        [placeholder, mode, path] => {
                            let mode = match *mode {
                                "binary" => FileMode::Binary,
                                _ => FileMode::Text,
                            };
                            prefixes.insert(
                                PathBuf::from(path.trim_matches('"')),
                                ((*placeholder).to_owned(), mode),
                            );
                        }
                        [path] => {
                            prefixes.insert(
                                PathBuf::from(path.trim_matches('"')),
                                (default_placeholder(), FileMode::Text),
                            );
                        }
                        _ => {}
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let paths = files
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let relative_path = PathBuf::from(line);
                let is_symlink = package_dir
                    .join(&relative_path)
                    .symlink_metadata()
                    .map(|metadata| metadata.file_type().is_symlink())
                    .unwrap_or(false);
                let (prefix_placeholder, file_mode) = match prefixes.remove(&relative_path) {
                    Some((placeholder, mode)) => (Some(placeholder), Some(mode)),
                    None => (None, None),
                };
                PathsEntry {
                    relative_path,
                    path_type: if is_symlink {
                        PathType::SoftLink
                    } else {
                        PathType::HardLink
                    },
                    prefix_placeholder,
                    file_mode,
                    no_link: false,
                    sha256: None,
                    size_in_bytes: None,
                }
            })
            .collect();

        Ok(PathsJson {
            paths_version: 1,
            paths,
        })
    }
}

/// The placeholder conda-build uses when `has_prefix` does not name one.
fn default_placeholder() -> String {
    "/opt/anaconda1anaconda2anaconda3".to_owned()
}

/// The parsed `info/index.json` file: the package's own description of
/// itself, used to cross-check extracted packages.
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct IndexJson {
    /// The lowercase name of the package.
    pub name: String,

    /// The version of the package.
    pub version: Version,

    /// The build string of the package.
    pub build: String,

    /// The build number of the package.
    #[serde(default)]
    pub build_number: u64,

    /// The subdirectory the package was built for.
    #[serde(default)]
    pub subdir: Option<String>,

    /// The dependencies of the package.
    #[serde(default)]
    pub depends: Vec<String>,

    /// The noarch kind of the package.
    #[serde(default, skip_serializing_if = "NoArchType::is_none")]
    pub noarch: NoArchType,
}

impl IndexJson {
    /// Reads the `info/index.json` file from an extracted package directory.
    pub fn from_package_directory(package_dir: &Path) -> Result<Self, std::io::Error> {
        let content = fs_err::read(package_dir.join("info/index.json"))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// The `noarch` section of `info/link.json`.
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct NoArchLinks {
    /// Python entry points in `command = module:function` form.
    #[serde(default)]
    pub entry_points: Vec<EntryPoint>,
}

/// A parsed python entry point, `<command> = <module>:<function>`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EntryPoint {
    /// The name of the executable to create.
    pub command: String,
    /// The python module containing the entry point.
    pub module: String,
    /// The function to call within the module.
    pub function: String,
}

impl FromStr for EntryPoint {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            || std::io::Error::new(ErrorKind::InvalidData, format!("invalid entry point '{s}'"));
        let (command, import) = s.split_once('=').ok_or_else(invalid)?;
        let (module, function) = import.split_once(':').ok_or_else(invalid)?;
        Ok(EntryPoint {
            command: command.trim().to_owned(),
            module: module.trim().to_owned(),
            function: function.trim().to_owned(),
        })
    }
}

impl Serialize for EntryPoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!(
            "{} = {}:{}",
            self.command, self.module, self.function
        ))
    }
}

impl<'de> Deserialize<'de> for EntryPoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}

/// The parsed `info/link.json` file, carried by `noarch: python` packages.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LinkJson {
    /// Links specific to noarch packages.
    #[serde(default)]
    pub noarch: NoArchLinks,

    /// The version of the file format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_metadata_version: Option<u64>,
}

impl LinkJson {
    /// Reads the `info/link.json` file from an extracted package directory.
    /// Returns `Ok(None)` when the package has none.
    pub fn from_package_directory(package_dir: &Path) -> Result<Option<Self>, std::io::Error> {
        match fs_err::read(package_dir.join("info/link.json")) {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::{EntryPoint, PathType, PathsJson};

    #[test]
    fn test_parse_paths_json() {
        let paths: PathsJson = serde_json::from_str(
            r#"{
                "paths_version": 1,
                "paths": [
                    {
                        "_path": "bin/foo",
                        "path_type": "hardlink",
                        "prefix_placeholder": "/build/placeholder",
                        "file_mode": "text",
                        "sha256": "7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c",
                        "size_in_bytes": 12
                    },
                    { "_path": "lib/libfoo.so", "path_type": "softlink" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(paths.paths.len(), 2);
        assert_eq!(paths.paths[0].path_type, PathType::HardLink);
        assert!(paths.paths[0].prefix_placeholder.is_some());
        assert_eq!(paths.paths[1].path_type, PathType::SoftLink);
        assert!(paths.paths[1].sha256.is_none());
    }

    #[test]
    fn test_entry_point() {
        let entry_point = EntryPoint::from_str("pip = pip._internal.cli.main:main").unwrap();
        assert_eq!(entry_point.command, "pip");
        assert_eq!(entry_point.module, "pip._internal.cli.main");
        assert_eq!(entry_point.function, "main");
        assert!(EntryPoint::from_str("nonsense").is_err());
    }
}
