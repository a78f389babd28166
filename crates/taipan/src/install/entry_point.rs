//! Creation of python entry point scripts.

use std::path::{Path, PathBuf};

use taipan_conda_types::package::EntryPoint;

use crate::install::python::PythonInfo;

/// The python stub that imports and invokes an entry point.
pub fn python_entry_point_template(
    target_prefix: &str,
    entry_point: &EntryPoint,
    python_info: &PythonInfo,
) -> String {
    let shebang = python_info.shebang(target_prefix);
    let EntryPoint {
        module, function, ..
    } = entry_point;
    format!(
        "{shebang}\n\
         # -*- coding: utf-8 -*-\n\
         import re\n\
         import sys\n\n\
         from {module} import {function}\n\n\
         if __name__ == '__main__':\n\
         \x20   sys.argv[0] = re.sub(r'(-script\\.pyw?|\\.exe)?$', '', sys.argv[0])\n\
         \x20   sys.exit({function}())\n"
    )
}

/// Creates the entry point script for unix: an executable python file in
/// the bin directory. Returns the prefix-relative path of the script.
pub fn create_unix_python_entry_point(
    target_dir: &Path,
    target_prefix: &str,
    entry_point: &EntryPoint,
    python_info: &PythonInfo,
) -> Result<PathBuf, std::io::Error> {
    let relative_path = python_info.bin_dir.join(&entry_point.command);
    let script_path = target_dir.join(&relative_path);
    if let Some(parent) = script_path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    fs_err::write(
        &script_path,
        python_entry_point_template(target_prefix, entry_point, python_info),
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs_err::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(relative_path)
}

/// Creates the entry point files for windows: a `<command>-script.py` next
/// to a `.bat` trampoline that invokes it with the environment's python.
/// Returns the prefix-relative paths of both files.
pub fn create_windows_python_entry_point(
    target_dir: &Path,
    target_prefix: &str,
    entry_point: &EntryPoint,
    python_info: &PythonInfo,
) -> Result<[PathBuf; 2], std::io::Error> {
    let script_relative = python_info
        .bin_dir
        .join(format!("{}-script.py", entry_point.command));
    let script_path = target_dir.join(&script_relative);
    if let Some(parent) = script_path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    fs_err::write(
        &script_path,
        python_entry_point_template(target_prefix, entry_point, python_info),
    )?;

    let launcher_relative = python_info
        .bin_dir
        .join(format!("{}.bat", entry_point.command));
    let python = Path::new(target_prefix).join(&python_info.path);
    fs_err::write(
        target_dir.join(&launcher_relative),
        format!(
            "@echo off\r\n\"{}\" \"%~dp0{}-script.py\" %*\r\n",
            python.display(),
            entry_point.command
        ),
    )?;

    Ok([script_relative, launcher_relative])
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use taipan_conda_types::{package::EntryPoint, PackageRecord, Platform};

    use super::{create_unix_python_entry_point, python_entry_point_template};
    use crate::install::python::PythonInfo;

    fn python_info() -> PythonInfo {
        let record = PackageRecord::new(
            "python".to_owned(),
            "3.11.4".parse().unwrap(),
            "h0_0".to_owned(),
        );
        PythonInfo::from_python_record(&record, Platform::Linux64).unwrap()
    }

    #[test]
    fn test_template() {
        let entry_point = EntryPoint::from_str("pip = pip._internal.cli.main:main").unwrap();
        let script = python_entry_point_template("/opt/env", &entry_point, &python_info());
        assert!(script.starts_with("#!/opt/env/bin/python3.11\n"));
        assert!(script.contains("from pip._internal.cli.main import main"));
        assert!(script.contains("sys.exit(main())"));
    }

    #[test]
    fn test_create_unix_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let entry_point = EntryPoint::from_str("six-cli = six:main").unwrap();
        let relative = create_unix_python_entry_point(
            dir.path(),
            "/opt/env",
            &entry_point,
            &python_info(),
        )
        .unwrap();
        assert_eq!(relative, std::path::Path::new("bin/six-cli"));
        let script = std::fs::read_to_string(dir.path().join(relative)).unwrap();
        assert!(script.contains("from six import main"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("bin/six-cli"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
