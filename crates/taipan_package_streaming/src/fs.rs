//! Extraction of archives on the local filesystem.

use std::fs::File;
use std::path::Path;

use super::{ArchiveType, CancellationCheck, ExtractError};

/// Extracts the archive at the given path into the destination directory,
/// dispatching on the archive extension. The cancellation hook is polled
/// between entries.
pub fn extract(
    archive: &Path,
    destination: &Path,
    cancelled: CancellationCheck<'_>,
) -> Result<(), ExtractError> {
    let archive_type = archive
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(ArchiveType::try_from_file_name)
        .ok_or_else(|| {
            ExtractError::UnsupportedArchiveType(archive.display().to_string())
        })?;

    let reader = File::open(archive)?;
    match archive_type {
        ArchiveType::TarBz2 => crate::read::extract_tar_bz2(reader, destination, cancelled),
        ArchiveType::Conda => crate::read::extract_conda(reader, destination, cancelled),
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::extract;
    use crate::ExtractError;

    /// Builds a small `.tar.bz2` archive on disk.
    fn write_archive(dir: &std::path::Path) -> (std::path::PathBuf, &'static [u8]) {
        let mut builder = tar::Builder::new(bzip2::write::BzEncoder::new(
            Vec::new(),
            bzip2::Compression::fast(),
        ));
        let content: &'static [u8] = b"hello from the archive";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "info/test.txt", content)
            .unwrap();
        let encoder = builder.into_inner().unwrap();
        let bytes = encoder.finish().unwrap();

        let archive_path = dir.join("foo-1.0-0.tar.bz2");
        let mut file = std::fs::File::create(&archive_path).unwrap();
        file.write_all(&bytes).unwrap();
        (archive_path, content)
    }

    #[test]
    fn test_extract_tar_bz2() {
        let dir = tempfile::tempdir().unwrap();
        let (archive_path, content) = write_archive(dir.path());

        let destination = dir.path().join("extracted");
        extract(&archive_path, &destination, &|| false).unwrap();
        assert_eq!(
            std::fs::read(destination.join("info/test.txt")).unwrap(),
            content
        );
    }

    #[test]
    fn test_cancellation_stops_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let (archive_path, _) = write_archive(dir.path());

        let destination = dir.path().join("extracted");
        assert_matches!(
            extract(&archive_path, &destination, &|| true),
            Err(ExtractError::Cancelled)
        );
        assert!(!destination.join("info/test.txt").exists());
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo-1.0-0.zip");
        std::fs::write(&path, b"junk").unwrap();
        assert!(extract(&path, &dir.path().join("out"), &|| false).is_err());
    }
}
