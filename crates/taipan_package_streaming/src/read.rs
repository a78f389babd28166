//! Extraction for readers implementing [`std::io::Read`].

use std::ffi::OsStr;
use std::{io::Read, path::Path};

use zip::read::read_zipfile_from_stream;

use super::{CancellationCheck, ExtractError};

/// Returns the `.tar.bz2` stream as a decompressed [`tar::Archive`].
pub fn stream_tar_bz2(reader: impl Read) -> tar::Archive<impl Read + Sized> {
    tar::Archive::new(bzip2::read::BzDecoder::new(reader))
}

/// Returns a `.tar.zst` stream as a decompressed [`tar::Archive`].
pub(crate) fn stream_tar_zst(
    reader: impl Read,
) -> Result<tar::Archive<impl Read + Sized>, ExtractError> {
    Ok(tar::Archive::new(zstd::stream::read::Decoder::new(reader)?))
}

/// Unpacks a tar archive entry by entry, polling the cancellation hook
/// between entries.
fn unpack_entries<R: Read>(
    mut archive: tar::Archive<R>,
    destination: &Path,
    cancelled: CancellationCheck<'_>,
) -> Result<(), ExtractError> {
    for entry in archive.entries()? {
        if cancelled() {
            return Err(ExtractError::Cancelled);
        }
        entry?.unpack_in(destination)?;
    }
    Ok(())
}

/// Extracts the contents of a `.tar.bz2` package archive.
pub fn extract_tar_bz2(
    reader: impl Read,
    destination: &Path,
    cancelled: CancellationCheck<'_>,
) -> Result<(), ExtractError> {
    std::fs::create_dir_all(destination).map_err(ExtractError::CouldNotCreateDestination)?;
    unpack_entries(stream_tar_bz2(reader), destination, cancelled)
}

/// Extracts the contents of a `.conda` package archive: the inner
/// `info-…tar.zst` and `pkg-…tar.zst` entries are unpacked into the same
/// destination.
pub fn extract_conda(
    mut reader: impl Read,
    destination: &Path,
    cancelled: CancellationCheck<'_>,
) -> Result<(), ExtractError> {
    std::fs::create_dir_all(destination).map_err(ExtractError::CouldNotCreateDestination)?;

    while let Some(file) = read_zipfile_from_stream(&mut reader)? {
        if cancelled() {
            return Err(ExtractError::Cancelled);
        }
        if file
            .mangled_name()
            .file_name()
            .map(OsStr::to_string_lossy)
            .map_or(false, |file_name| file_name.ends_with(".tar.zst"))
        {
            unpack_entries(stream_tar_zst(file)?, destination, cancelled)?;
        }
    }

    Ok(())
}
