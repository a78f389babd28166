//! Linking a single file from an extracted package into a prefix.

use std::{
    io::{ErrorKind, Read, Seek, Write},
    path::{Path, PathBuf},
};

use memmap2::Mmap;

use taipan_conda_types::package::{FileMode, PathType, PathsEntry};
use taipan_conda_types::NoArchType;
use taipan_digest::{HashingWriter, Sha256, Sha256Hash};

use crate::install::python::PythonInfo;

/// How a file ended up in the prefix.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum LinkMethod {
    /// A hard link into the package cache.
    Hardlink,
    /// A symbolic link.
    Softlink,
    /// A plain copy.
    Copy,
    /// A copy with the prefix placeholder patched.
    Patched(FileMode),
}

impl std::fmt::Display for LinkMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkMethod::Hardlink => write!(f, "hardlink"),
            LinkMethod::Softlink => write!(f, "softlink"),
            LinkMethod::Copy => write!(f, "copy"),
            LinkMethod::Patched(FileMode::Binary) => write!(f, "binary patched"),
            LinkMethod::Patched(FileMode::Text) => write!(f, "text patched"),
        }
    }
}

/// Errors linking a single file.
#[derive(Debug, thiserror::Error)]
pub enum LinkFileError {
    /// An io error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The parent directory could not be created.
    #[error("failed to create parent directory")]
    FailedToCreateParentDirectory(#[source] std::io::Error),

    /// The source file could not be opened.
    #[error("could not open source file for reading")]
    FailedToOpenSourceFile(#[source] std::io::Error),

    /// The link syscall failed.
    #[error("failed to {0} file to destination")]
    FailedToLink(LinkMethod, #[source] std::io::Error),

    /// The target of a symlink could not be read.
    #[error("could not read symlink target")]
    FailedToReadSymlink(#[source] std::io::Error),

    /// The new prefix does not fit into the binary placeholder.
    #[error("the target prefix is longer than the placeholder in a binary file")]
    PrefixTooLong,

    /// A noarch python file was linked without python information.
    #[error("cannot install noarch python files without a python version")]
    MissingPythonInfo,
}

/// The outcome of linking one file.
pub struct LinkedFile {
    /// True if a file already existed at the destination and was replaced.
    pub clobbered: bool,

    /// The SHA256 of the file as written to the prefix.
    pub sha256: Sha256Hash,

    /// The size of the written file in bytes.
    pub file_size: u64,

    /// The prefix-relative path of the written file. Differs from the
    /// entry's path for noarch python packages.
    pub relative_path: PathBuf,

    /// How the file was linked.
    pub method: LinkMethod,
}

/// Installs a single file described by a `paths.json` entry from the
/// extracted `package_dir` into `target_dir`, substituting the prefix
/// placeholder with `target_prefix` where necessary.
pub fn link_file(
    noarch_type: NoArchType,
    entry: &PathsEntry,
    package_dir: &Path,
    target_dir: &Path,
    target_prefix: &str,
    allow_hard_links: bool,
    target_python: Option<&PythonInfo>,
) -> Result<LinkedFile, LinkFileError> {
    let source_path = package_dir.join(&entry.relative_path);

    let destination_relative_path = if noarch_type.is_python() {
        match target_python {
            Some(python_info) => python_info.get_python_noarch_target_path(&entry.relative_path),
            None => return Err(LinkFileError::MissingPythonInfo),
        }
    } else {
        entry.relative_path.as_path().into()
    };
    let destination_path = target_dir.join(&destination_relative_path);

    if let Some(parent) = destination_path.parent() {
        fs_err::create_dir_all(parent).map_err(LinkFileError::FailedToCreateParentDirectory)?;
    }

    // An existing file at the destination means two packages carry the
    // same path; the later one wins and the caller is told.
    let clobbered = destination_path.is_file();

    let mut sha256 = None;
    let mut file_size = entry.size_in_bytes;

    let method = if let (Some(placeholder), Some(file_mode)) =
        (entry.prefix_placeholder.as_deref(), entry.file_mode)
    {
        let source = map_or_read_source_file(&source_path)?;
        let destination = fs_err::File::create(&destination_path)?;
        let mut writer = HashingWriter::<_, Sha256>::new(destination);

        copy_and_replace_placeholder(
            source.as_ref(),
            &mut writer,
            placeholder,
            target_prefix,
            file_mode,
        )?;

        let (mut file, digest) = writer.finalize();
        sha256 = Some(digest);
        file_size = file.stream_position().ok();
        drop(file);

        // The patched copy keeps the permissions of the original.
        let metadata = fs_err::symlink_metadata(&source_path)?;
        fs_err::set_permissions(&destination_path, metadata.permissions())?;

        LinkMethod::Patched(file_mode)
    } else if entry.path_type == PathType::HardLink && allow_hard_links && !entry.no_link {
        match hardlink_to_destination(&source_path, &destination_path) {
            Ok(()) => LinkMethod::Hardlink,
            // Hard links fail across devices; fall back to copying.
            Err(LinkFileError::FailedToLink(_, source_error))
                if source_error.kind() == ErrorKind::CrossesDevices
                    || source_error.raw_os_error() == Some(libc_exdev()) =>
            {
                copy_to_destination(&source_path, &destination_path)?;
                LinkMethod::Copy
            }
            Err(e) => return Err(e),
        }
    } else if entry.path_type == PathType::SoftLink {
        symlink_to_destination(&source_path, &destination_path)?;
        LinkMethod::Softlink
    } else {
        copy_to_destination(&source_path, &destination_path)?;
        LinkMethod::Copy
    };

    let sha256 = match (sha256, entry.sha256) {
        (Some(digest), _) => digest,
        (None, Some(digest)) => digest,
        (None, None) => taipan_digest::compute_file_digest::<Sha256>(&destination_path)?,
    };

    let file_size = match (file_size, entry.size_in_bytes) {
        (Some(size), _) | (None, Some(size)) => size,
        (None, None) => fs_err::symlink_metadata(&destination_path)?.len(),
    };

    Ok(LinkedFile {
        clobbered,
        sha256,
        file_size,
        relative_path: destination_relative_path.into_owned(),
        method,
    })
}

const fn libc_exdev() -> i32 {
    // EXDEV is 18 on every unix libc we care about and unused on windows.
    18
}

/// Either a memory mapped file or its contents read to memory. Mapping can
/// fail on some filesystems, in which case the file is read instead.
enum MmapOrBytes {
    Mmap(Mmap),
    Bytes(Vec<u8>),
}

impl AsRef<[u8]> for MmapOrBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            MmapOrBytes::Mmap(mmap) => mmap.as_ref(),
            MmapOrBytes::Bytes(bytes) => bytes.as_slice(),
        }
    }
}

fn map_or_read_source_file(source_path: &Path) -> Result<MmapOrBytes, LinkFileError> {
    let mut file =
        std::fs::File::open(source_path).map_err(LinkFileError::FailedToOpenSourceFile)?;

    match unsafe { Mmap::map(&file) } {
        Ok(mmap) => Ok(MmapOrBytes::Mmap(mmap)),
        Err(e) => {
            tracing::warn!(
                "failed to memory map {}: {e}; reading it instead",
                source_path.display()
            );
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            Ok(MmapOrBytes::Bytes(bytes))
        }
    }
}

fn hardlink_to_destination(
    source_path: &Path,
    destination_path: &Path,
) -> Result<(), LinkFileError> {
    loop {
        match fs_err::hard_link(source_path, destination_path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                fs_err::remove_file(destination_path)?;
            }
            Err(e) => return Err(LinkFileError::FailedToLink(LinkMethod::Hardlink, e)),
        }
    }
}

fn symlink_to_destination(
    source_path: &Path,
    destination_path: &Path,
) -> Result<(), LinkFileError> {
    let linked_path = source_path
        .read_link()
        .map_err(LinkFileError::FailedToReadSymlink)?;

    loop {
        match symlink(&linked_path, destination_path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                fs_err::remove_file(destination_path)?;
            }
            Err(e) => return Err(LinkFileError::FailedToLink(LinkMethod::Softlink, e)),
        }
    }
}

fn copy_to_destination(source_path: &Path, destination_path: &Path) -> Result<(), LinkFileError> {
    loop {
        match fs_err::copy(source_path, destination_path) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                fs_err::remove_file(destination_path)?;
            }
            Err(e) => return Err(LinkFileError::FailedToLink(LinkMethod::Copy, e)),
        }
    }
}

fn symlink(source_path: &Path, destination_path: &Path) -> std::io::Result<()> {
    #[cfg(windows)]
    return std::os::windows::fs::symlink_file(source_path, destination_path);
    #[cfg(unix)]
    return std::os::unix::fs::symlink(source_path, destination_path);
}

/// Copies `source_bytes` to `destination`, replacing the placeholder
/// prefix with the target prefix. Text files get a plain substitution;
/// binary files get a length-preserving, NUL padded rewrite of each
/// C-string containing the placeholder.
pub fn copy_and_replace_placeholder(
    source_bytes: &[u8],
    destination: impl Write,
    prefix_placeholder: &str,
    target_prefix: &str,
    file_mode: FileMode,
) -> Result<(), LinkFileError> {
    match file_mode {
        FileMode::Text => copy_and_replace_textual_placeholder(
            source_bytes,
            destination,
            prefix_placeholder,
            target_prefix,
        ),
        FileMode::Binary => copy_and_replace_cstring_placeholder(
            source_bytes,
            destination,
            prefix_placeholder,
            target_prefix,
        ),
    }
}

fn copy_and_replace_textual_placeholder(
    mut source_bytes: &[u8],
    mut destination: impl Write,
    prefix_placeholder: &str,
    target_prefix: &str,
) -> Result<(), LinkFileError> {
    let old_prefix = prefix_placeholder.as_bytes();
    let new_prefix = target_prefix.as_bytes();

    loop {
        match memchr::memmem::find(source_bytes, old_prefix) {
            Some(index) => {
                destination.write_all(&source_bytes[..index])?;
                destination.write_all(new_prefix)?;
                source_bytes = &source_bytes[index + old_prefix.len()..];
            }
            None => {
                destination.write_all(source_bytes)?;
                return Ok(());
            }
        }
    }
}

fn copy_and_replace_cstring_placeholder(
    mut source_bytes: &[u8],
    mut destination: impl Write,
    prefix_placeholder: &str,
    target_prefix: &str,
) -> Result<(), LinkFileError> {
    let old_prefix = prefix_placeholder.as_bytes();
    let new_prefix = target_prefix.as_bytes();

    // A binary rewrite cannot grow the string: the suffix after the prefix
    // would not fit within the original NUL terminated storage.
    if new_prefix.len() > old_prefix.len() {
        return Err(LinkFileError::PrefixTooLong);
    }
    let padding = vec![b'\0'; old_prefix.len() - new_prefix.len()];

    loop {
        match memchr::memmem::find(source_bytes, old_prefix) {
            Some(index) => {
                // The rewritten region spans to the NUL terminator of the
                // string the placeholder sits in.
                let mut end = index + old_prefix.len();
                while end < source_bytes.len() && source_bytes[end] != b'\0' {
                    end += 1;
                }
                let suffix = &source_bytes[index + old_prefix.len()..end];

                destination.write_all(&source_bytes[..index])?;
                destination.write_all(new_prefix)?;
                destination.write_all(suffix)?;
                destination.write_all(&padding)?;

                source_bytes = &source_bytes[end..];
            }
            None => {
                destination.write_all(source_bytes)?;
                return Ok(());
            }
        }
    }
}
