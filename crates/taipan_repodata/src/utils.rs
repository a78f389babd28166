use std::path::Path;

use url::Url;

/// Derives a stable filesystem name for the cache files of a subdir url.
pub(crate) fn url_to_cache_key(url: &Url) -> String {
    let digest = taipan_digest::compute_bytes_digest::<taipan_digest::Sha256>(
        url.as_str().trim_end_matches('/').as_bytes(),
    );
    // 16 hex characters are plenty to keep distinct subdirs apart.
    hex::encode(&digest[..8])
}

/// Adds a trailing slash so `Url::join` keeps the final path segment.
pub(crate) fn normalize_subdir_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url
}

/// Writes `content` through a temporary sibling and an atomic rename.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(directory)?;
    file.write_all(content)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
