//! The python interpreter details needed to link `noarch: python`
//! packages.

use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

use taipan_conda_types::{PackageRecord, Platform};

/// Information about the Python interpreter of an environment, needed to
/// link `noarch: python` packages: where `site-packages` lives, where
/// scripts go, and which executable runs them.
#[derive(Debug, Clone)]
pub struct PythonInfo {
    /// The platform the interpreter is installed for.
    pub platform: Platform,

    /// The `(major, minor)` version of the interpreter.
    pub short_version: (u64, u64),

    /// The prefix-relative path of the interpreter executable.
    pub path: PathBuf,

    /// The prefix-relative path of the site-packages directory.
    pub site_packages_path: PathBuf,

    /// The prefix-relative path of the scripts directory.
    pub bin_dir: PathBuf,
}

/// An error deriving [`PythonInfo`] from a record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PythonInfoError {
    /// The version of the python package has no major.minor prefix.
    #[error("invalid python version '{0}'")]
    InvalidVersion(String),
}

impl PythonInfo {
    /// Builds the info from the metadata of a python interpreter package.
    pub fn from_python_record(
        record: &PackageRecord,
        platform: Platform,
    ) -> Result<Self, PythonInfoError> {
        let (major, minor) = record
            .version
            .as_major_minor()
            .ok_or_else(|| PythonInfoError::InvalidVersion(record.version.to_string()))?;

        let path = if platform.is_windows() {
            PathBuf::from("python.exe")
        } else {
            PathBuf::from(format!("bin/python{major}.{minor}"))
        };

        // An interpreter may deviate from the default site-packages
        // location and report it in its record.
        let site_packages_path = record.python_site_packages_path.as_deref().map_or_else(
            || {
                if platform.is_windows() {
                    PathBuf::from("Lib/site-packages")
                } else {
                    PathBuf::from(format!("lib/python{major}.{minor}/site-packages"))
                }
            },
            PathBuf::from,
        );

        let bin_dir = if platform.is_windows() {
            PathBuf::from("Scripts")
        } else {
            PathBuf::from("bin")
        };

        Ok(Self {
            platform,
            short_version: (major, minor),
            path,
            site_packages_path,
            bin_dir,
        })
    }

    /// Constructs the shebang that runs a script with this interpreter.
    pub fn shebang(&self, target_prefix: &str) -> String {
        let target_path = Path::new(target_prefix).join(&self.path);
        let target_path = target_path.to_string_lossy().replace('\\', "/");

        // Shebang lines longer than 127 bytes or containing spaces do not
        // work; fall back to the sh trampoline trick.
        if target_path.len() > 127 - 2 || target_path.contains(' ') {
            format!("#!/bin/sh\n'''exec' \"{target_path}\" \"$0\" \"$@\" #'''")
        } else {
            format!("#!{target_path}")
        }
    }

    /// Maps a path inside a `noarch: python` package archive to its
    /// location in the prefix.
    pub fn get_python_noarch_target_path<'a>(&self, relative_path: &'a Path) -> Cow<'a, Path> {
        if let Ok(rest) = relative_path.strip_prefix("site-packages/") {
            self.site_packages_path.join(rest).into()
        } else if let Ok(rest) = relative_path.strip_prefix("python-scripts/") {
            self.bin_dir.join(rest).into()
        } else {
            relative_path.into()
        }
    }

    /// The path of the compiled bytecode file of a python source file.
    pub fn pyc_path(&self, py_path: &Path) -> PathBuf {
        let (major, minor) = self.short_version;
        let file_name = py_path
            .file_stem()
            .map(|stem| stem.to_string_lossy())
            .unwrap_or_default();
        let cache_name = format!("{file_name}.cpython-{major}{minor}.pyc");
        match py_path.parent() {
            Some(parent) => parent.join("__pycache__").join(cache_name),
            None => PathBuf::from("__pycache__").join(cache_name),
        }
    }

    /// Returns true if switching from `previous` to this interpreter
    /// requires relinking all `noarch: python` packages.
    pub fn is_relink_required(&self, previous: &PythonInfo) -> bool {
        self.short_version != previous.short_version
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use taipan_conda_types::{PackageRecord, Platform};

    use super::PythonInfo;

    fn info(version: &str) -> PythonInfo {
        let record = PackageRecord::new(
            "python".to_owned(),
            version.parse().unwrap(),
            "h0_0".to_owned(),
        );
        PythonInfo::from_python_record(&record, Platform::Linux64).unwrap()
    }

    #[test]
    fn test_paths() {
        let info = info("3.11.4");
        assert_eq!(info.path, Path::new("bin/python3.11"));
        assert_eq!(
            info.site_packages_path,
            Path::new("lib/python3.11/site-packages")
        );
    }

    #[test]
    fn test_noarch_target_path() {
        let info = info("3.11.4");
        assert_eq!(
            info.get_python_noarch_target_path(Path::new("site-packages/six.py")),
            Path::new("lib/python3.11/site-packages/six.py")
        );
        assert_eq!(
            info.get_python_noarch_target_path(Path::new("python-scripts/six-cli")),
            Path::new("bin/six-cli")
        );
        assert_eq!(
            info.get_python_noarch_target_path(Path::new("share/doc/six.rst")),
            Path::new("share/doc/six.rst")
        );
    }

    #[test]
    fn test_pyc_path() {
        let info = info("3.11.4");
        assert_eq!(
            info.pyc_path(Path::new("lib/python3.11/site-packages/six.py")),
            Path::new("lib/python3.11/site-packages/__pycache__/six.cpython-311.pyc")
        );
    }

    #[test]
    fn test_relink_required() {
        assert!(info("3.11.4").is_relink_required(&info("3.10.2")));
        assert!(!info("3.11.9").is_relink_required(&info("3.11.4")));
    }

    #[test]
    fn test_shebang() {
        assert_eq!(info("3.11.4").shebang("/opt/env"), "#!/opt/env/bin/python3.11");
        assert!(info("3.11.4")
            .shebang("/opt/path with spaces")
            .starts_with("#!/bin/sh"));
    }
}
