//! Linking and unlinking packages in a prefix.
//!
//! [`link_package`] reads the metadata of an extracted package archive
//! (`info/paths.json`, with a fallback to the deprecated `files` +
//! `has_prefix` pair) and installs every file into the target prefix:
//! hard links from the cache where possible, copies where not, and patched
//! copies where a build-time prefix placeholder has to be replaced with
//! the real prefix. `noarch: python` packages additionally get their files
//! relocated into `site-packages`, entry point scripts generated, and
//! their bytecode queued for compilation.
//!
//! [`unlink_package`] reverses a link using the conda-meta record: all
//! recorded files are deleted (undeletable files are renamed into the
//! prefix's `.trash` folder for later cleanup) and emptied directories
//! are pruned.

pub mod entry_point;
pub mod link;
pub mod link_script;
pub mod pyc;
pub mod python;

use std::{
    collections::HashSet,
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use taipan_conda_types::{
    package::{self, IndexJson, LinkJson, PathsJson},
    prefix_record, Platform, PrefixRecord,
};

use self::{
    entry_point::{create_unix_python_entry_point, create_windows_python_entry_point},
    link::{link_file, LinkFileError, LinkMethod},
    python::PythonInfo,
};
use crate::context::CancellationFlag;

/// An error that might occur when installing or removing a package.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,

    /// The `paths.json` (or deprecated equivalents) could not be read.
    #[error("failed to read 'paths.json'")]
    FailedToReadPathsJson(#[source] std::io::Error),

    /// The `index.json` could not be read.
    #[error("failed to read 'index.json'")]
    FailedToReadIndexJson(#[source] std::io::Error),

    /// The `link.json` could not be read.
    #[error("failed to read 'link.json'")]
    FailedToReadLinkJson(#[source] std::io::Error),

    /// A file could not be linked.
    #[error("failed to link '{0}'")]
    FailedToLink(PathBuf, #[source] LinkFileError),

    /// The target prefix is not representable as UTF-8.
    #[error("target prefix is not UTF-8")]
    TargetPrefixIsNotUtf8,

    /// The target directory could not be created.
    #[error("failed to create target directory")]
    FailedToCreateTargetDirectory(#[source] std::io::Error),

    /// A noarch python package was installed without python information.
    #[error("cannot install a noarch python package without a python version")]
    MissingPythonInfo,

    /// A python entry point could not be created.
    #[error("failed to create python entry point")]
    FailedToCreatePythonEntryPoint(#[source] std::io::Error),
}

/// Options modifying [`link_package`].
#[derive(Debug, Default, Clone)]
pub struct InstallOptions {
    /// The prefix placeholder replacement value, when it differs from the
    /// directory files are placed in.
    pub target_prefix: Option<PathBuf>,

    /// Force hard links on or off. When unset, hard links are used when
    /// the cache and the prefix share a filesystem.
    pub allow_hard_links: Option<bool>,

    /// The platform the package is installed for.
    pub platform: Option<Platform>,

    /// The python of the environment, required for noarch python packages.
    pub python_info: Option<PythonInfo>,

    /// Polled between files while linking; when raised the link stops
    /// with [`InstallError::Cancelled`] and the files written so far are
    /// removed again.
    pub cancellation: Option<CancellationFlag>,
}

/// The result of linking a package: what was written and what remains to
/// be compiled.
#[derive(Debug)]
pub struct LinkedPackage {
    /// The installed files, in the order of the package's `paths.json`.
    pub paths: Vec<prefix_record::PathsEntry>,

    /// Prefix-relative python sources whose bytecode should be compiled.
    pub pyc_sources: Vec<PathBuf>,

    /// The dominant link method used for the package's files.
    pub link_type: prefix_record::LinkType,
}

/// Installs the files of the extracted package at `package_dir` into
/// `target_dir`. When linking fails partway, the files written so far are
/// removed again so a failed install never leaves fragments behind.
pub fn link_package(
    package_dir: &Path,
    target_dir: &Path,
    options: &InstallOptions,
) -> Result<LinkedPackage, InstallError> {
    let mut written = Vec::new();
    match link_package_inner(package_dir, target_dir, options, &mut written) {
        Ok(linked) => Ok(linked),
        Err(error) => {
            for relative_path in written.iter().rev() {
                let path = target_dir.join(relative_path);
                if let Err(e) = fs_err::remove_file(&path) {
                    if e.kind() != ErrorKind::NotFound {
                        tracing::warn!("failed to clean up partial link {}: {e}", path.display());
                    }
                }
            }
            Err(error)
        }
    }
}

/// The fallible core of [`link_package`]. Every file written to the
/// prefix is recorded in `written` so the caller can undo a partial link.
fn link_package_inner(
    package_dir: &Path,
    target_dir: &Path,
    options: &InstallOptions,
    written: &mut Vec<PathBuf>,
) -> Result<LinkedPackage, InstallError> {
    let target_prefix = options
        .target_prefix
        .as_deref()
        .unwrap_or(target_dir)
        .to_str()
        .ok_or(InstallError::TargetPrefixIsNotUtf8)?
        .to_owned();

    fs_err::create_dir_all(target_dir).map_err(InstallError::FailedToCreateTargetDirectory)?;

    let paths_json = read_paths_json(package_dir)?;
    let index_json =
        IndexJson::from_package_directory(package_dir).map_err(InstallError::FailedToReadIndexJson)?;

    let noarch = index_json.noarch;
    if noarch.is_python() && options.python_info.is_none() {
        return Err(InstallError::MissingPythonInfo);
    }

    let link_json = if noarch.is_python() {
        LinkJson::from_package_directory(package_dir)
            .map_err(InstallError::FailedToReadLinkJson)?
    } else {
        None
    };

    let allow_hard_links = options
        .allow_hard_links
        .unwrap_or_else(|| can_create_hardlinks(package_dir, target_dir));

    let mut paths = Vec::with_capacity(paths_json.paths.len());
    let mut pyc_sources = Vec::new();
    let mut hardlinked = 0usize;
    let mut copied = 0usize;

    for entry in &paths_json.paths {
        // Cancellation checkpoint between files.
        if options
            .cancellation
            .as_ref()
            .is_some_and(CancellationFlag::is_cancelled)
        {
            return Err(InstallError::Cancelled);
        }

        if entry.path_type == package::PathType::Directory {
            fs_err::create_dir_all(target_dir.join(&entry.relative_path))
                .map_err(InstallError::FailedToCreateTargetDirectory)?;
            paths.push(prefix_record::PathsEntry {
                relative_path: entry.relative_path.clone(),
                path_type: prefix_record::PathType::Directory,
                prefix_placeholder: None,
                file_mode: None,
                sha256: None,
                sha256_in_prefix: None,
                size_in_bytes: None,
            });
            continue;
        }

        let linked = link_file(
            noarch,
            entry,
            package_dir,
            target_dir,
            &target_prefix,
            allow_hard_links,
            options.python_info.as_ref(),
        )
        .map_err(|e| InstallError::FailedToLink(entry.relative_path.clone(), e))?;
        written.push(linked.relative_path.clone());

        match linked.method {
            LinkMethod::Hardlink => hardlinked += 1,
            LinkMethod::Copy | LinkMethod::Patched(_) => copied += 1,
            LinkMethod::Softlink => {}
        }

        // Queue python sources landing in site-packages for compilation
        // and pre-register their future bytecode files.
        if noarch.is_python() && linked.relative_path.extension().map_or(false, |e| e == "py") {
            if let Some(python_info) = options.python_info.as_ref() {
                let pyc = python_info.pyc_path(&linked.relative_path);
                pyc_sources.push(linked.relative_path.clone());
                paths.push(prefix_record::PathsEntry {
                    relative_path: pyc,
                    path_type: prefix_record::PathType::PycFile,
                    prefix_placeholder: None,
                    file_mode: None,
                    sha256: None,
                    sha256_in_prefix: None,
                    size_in_bytes: None,
                });
            }
        }

        paths.push(prefix_record::PathsEntry {
            relative_path: linked.relative_path,
            path_type: match entry.path_type {
                package::PathType::HardLink => prefix_record::PathType::HardLink,
                package::PathType::SoftLink => prefix_record::PathType::SoftLink,
                package::PathType::Directory => prefix_record::PathType::Directory,
            },
            prefix_placeholder: entry.prefix_placeholder.clone(),
            file_mode: entry.file_mode,
            sha256: entry.sha256,
            sha256_in_prefix: Some(linked.sha256),
            size_in_bytes: Some(linked.file_size),
        });
    }

    // Entry points of noarch python packages.
    if let Some(link_json) = link_json {
        let python_info = options
            .python_info
            .as_ref()
            .expect("checked above for noarch python packages");
        let platform = options.platform.unwrap_or_else(Platform::current);
        for entry_point in &link_json.noarch.entry_points {
            if platform.is_windows() {
                let [script, launcher] = create_windows_python_entry_point(
                    target_dir,
                    &target_prefix,
                    entry_point,
                    python_info,
                )
                .map_err(InstallError::FailedToCreatePythonEntryPoint)?;
                written.push(script.clone());
                written.push(launcher.clone());
                paths.push(entry_point_paths_entry(
                    script,
                    prefix_record::PathType::WindowsPythonEntryPointScript,
                ));
                paths.push(entry_point_paths_entry(
                    launcher,
                    prefix_record::PathType::WindowsPythonEntryPointExe,
                ));
            } else {
                let script = create_unix_python_entry_point(
                    target_dir,
                    &target_prefix,
                    entry_point,
                    python_info,
                )
                .map_err(InstallError::FailedToCreatePythonEntryPoint)?;
                written.push(script.clone());
                paths.push(entry_point_paths_entry(
                    script,
                    prefix_record::PathType::UnixPythonEntryPoint,
                ));
            }
        }
    }

    Ok(LinkedPackage {
        paths,
        pyc_sources,
        link_type: if copied == 0 && hardlinked > 0 {
            prefix_record::LinkType::HardLink
        } else {
            prefix_record::LinkType::Copy
        },
    })
}

fn entry_point_paths_entry(
    relative_path: PathBuf,
    path_type: prefix_record::PathType,
) -> prefix_record::PathsEntry {
    prefix_record::PathsEntry {
        relative_path,
        path_type,
        prefix_placeholder: None,
        file_mode: None,
        sha256: None,
        sha256_in_prefix: None,
        size_in_bytes: None,
    }
}

fn read_paths_json(package_dir: &Path) -> Result<PathsJson, InstallError> {
    match PathsJson::from_package_directory(package_dir) {
        Ok(paths) => Ok(paths),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            PathsJson::from_deprecated_package_directory(package_dir)
                .map_err(InstallError::FailedToReadPathsJson)
        }
        Err(e) => Err(InstallError::FailedToReadPathsJson(e)),
    }
}

/// Determines whether hard links work between the package cache and the
/// prefix by probing with a dummy link.
fn can_create_hardlinks(package_dir: &Path, target_dir: &Path) -> bool {
    let source = package_dir.join("info/index.json");
    let probe = target_dir.join(format!(".hardlink-probe-{}", std::process::id()));
    match std::fs::hard_link(&source, &probe) {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Errors that can occur while unlinking a package.
#[derive(Debug, thiserror::Error)]
pub enum UnlinkError {
    /// A directory could not be deleted.
    #[error("failed to delete empty directory: {0}")]
    FailedToDeleteDirectory(String, #[source] std::io::Error),

    /// A file could not be deleted.
    #[error("failed to delete file: {0}")]
    FailedToDeleteFile(String, #[source] std::io::Error),

    /// A directory could not be read.
    #[error("failed to read directory: {0}")]
    FailedToReadDirectory(String, #[source] std::io::Error),

    /// The trash directory could not be created.
    #[error("failed to create directory: {0}")]
    FailedToCreateDirectory(String, #[source] std::io::Error),

    /// A file could not be moved to the trash.
    #[error("failed to move file {0} to the trash")]
    FailedToMoveFile(String, #[source] std::io::Error),
}

/// Removes all files recorded for the package and prunes directories that
/// became empty. Files the OS refuses to delete (in use on windows) are
/// renamed into the prefix's `.trash` directory instead.
pub fn unlink_package(
    target_prefix: &Path,
    prefix_record: &PrefixRecord,
) -> Result<(), UnlinkError> {
    let is_python_noarch = prefix_record
        .repodata_record
        .package_record
        .noarch
        .is_python();

    let mut parent_dirs = HashSet::new();
    for entry in &prefix_record.paths_data.paths {
        let path = target_prefix.join(&entry.relative_path);
        match fs_err::remove_file(&path) {
            Ok(()) => {}
            // Already gone is as good as removed.
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                move_to_trash(target_prefix, &path)?;
            }
            Err(e) if e.kind() == ErrorKind::IsADirectory => {}
            Err(e) => {
                return Err(UnlinkError::FailedToDeleteFile(
                    entry.relative_path.to_string_lossy().to_string(),
                    e,
                ))
            }
        }
        if let Some(parent) = path.parent() {
            parent_dirs.insert(parent.to_path_buf());
        }
    }

    // Prune emptied directories bottom-up.
    let keep = HashSet::new();
    for directory in parent_dirs {
        recursively_remove_empty_directories(
            &directory,
            target_prefix,
            is_python_noarch,
            &keep,
        )?;
    }

    // Finally drop the conda-meta record itself.
    let conda_meta_path = target_prefix
        .join("conda-meta")
        .join(prefix_record.file_name());
    match fs_err::remove_file(&conda_meta_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UnlinkError::FailedToDeleteFile(
            conda_meta_path.to_string_lossy().to_string(),
            e,
        )),
    }
}

/// Removes a directory and its parents while they are empty, never
/// touching anything outside `target_prefix`. For noarch python packages a
/// directory whose only remaining entry is `__pycache__` also counts as
/// empty.
pub(crate) fn recursively_remove_empty_directories(
    directory_path: &Path,
    target_prefix: &Path,
    is_python_noarch: bool,
    keep_directories: &HashSet<PathBuf>,
) -> Result<(), UnlinkError> {
    if directory_path == target_prefix
        || keep_directories.contains(directory_path)
        || !directory_path.exists()
    {
        return Ok(());
    }
    debug_assert!(directory_path.starts_with(target_prefix));

    let mut read_dir = fs_err::read_dir(directory_path).map_err(|e| {
        UnlinkError::FailedToReadDirectory(directory_path.to_string_lossy().to_string(), e)
    })?;

    let removable = match read_dir.next().transpose().map_err(|e| {
        UnlinkError::FailedToReadDirectory(directory_path.to_string_lossy().to_string(), e)
    })? {
        None => true,
        Some(entry)
            if is_python_noarch
                && entry.file_name() == "__pycache__"
                && read_dir.next().is_none() =>
        {
            fs_err::remove_dir_all(entry.path()).map_err(|e| {
                UnlinkError::FailedToDeleteDirectory(
                    directory_path.to_string_lossy().to_string(),
                    e,
                )
            })?;
            true
        }
        Some(_) => false,
    };

    if removable {
        fs_err::remove_dir(directory_path).map_err(|e| {
            UnlinkError::FailedToDeleteDirectory(directory_path.to_string_lossy().to_string(), e)
        })?;
        if let Some(parent) = directory_path.parent() {
            recursively_remove_empty_directories(
                parent,
                target_prefix,
                is_python_noarch,
                keep_directories,
            )?;
        }
    }

    Ok(())
}

fn move_to_trash(target_prefix: &Path, path: &Path) -> Result<(), UnlinkError> {
    let trash_dir = target_prefix.join(".trash");
    fs_err::create_dir_all(&trash_dir).map_err(|e| {
        UnlinkError::FailedToCreateDirectory(trash_dir.to_string_lossy().to_string(), e)
    })?;

    let mut trash_name = OsString::new();
    if let Some(file_name) = path.file_name() {
        trash_name.push(file_name);
        trash_name.push(".");
    }
    trash_name.push(format!("{}.trash", uuid::Uuid::new_v4().simple()));

    let trash_path = trash_dir.join(trash_name);
    fs_err::rename(path, &trash_path).map_err(|e| {
        UnlinkError::FailedToMoveFile(path.to_string_lossy().to_string(), e)
    })
}

/// Deletes the files in the prefix's trash folder that are no longer in
/// use. Called at the start of a transaction; files that still resist
/// deletion are left for the next run.
pub fn empty_trash(target_prefix: &Path) -> Result<(), UnlinkError> {
    let trash_dir = target_prefix.join(".trash");
    let read_dir = match fs_err::read_dir(&trash_dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(UnlinkError::FailedToReadDirectory(
                trash_dir.to_string_lossy().to_string(),
                e,
            ))
        }
    };

    let mut files_left = false;
    for entry in read_dir {
        let entry = entry.map_err(|e| {
            UnlinkError::FailedToReadDirectory(trash_dir.to_string_lossy().to_string(), e)
        })?;
        match fs_err::remove_file(entry.path()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => files_left = true,
            Err(e) => {
                return Err(UnlinkError::FailedToDeleteFile(
                    entry.path().to_string_lossy().to_string(),
                    e,
                ))
            }
        }
    }

    if !files_left {
        let _ = fs_err::remove_dir(&trash_dir);
    }
    Ok(())
}
