//! The multi-directory package cache.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use taipan_conda_types::RepoDataRecord;
use taipan_package_streaming::{ArchiveIdentifier, CancellationCheck};

use crate::validation::{validate_extracted_dir, validate_tarball, REPODATA_RECORD_FILE};

/// Serializes appends to the `urls.txt` files across the whole process.
static URLS_TXT_MUTEX: Mutex<()> = Mutex::new(());

/// Errors of cache mutations.
#[derive(Debug, thiserror::Error)]
pub enum PackageCacheError {
    /// No cache directory passed the write test.
    #[error("none of the package cache directories is writable")]
    NoWritableCache,

    /// Extraction of an archive failed.
    #[error("failed to extract '{0}'")]
    ExtractError(PathBuf, #[source] taipan_package_streaming::ExtractError),

    /// An io error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// The key under which a package is stored in a cache directory:
/// `<name>-<version>-<build>`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct CacheKey {
    dir_name: String,
    file_name: String,
}

impl CacheKey {
    /// Derives the cache key of a record.
    pub fn from_record(record: &RepoDataRecord) -> Self {
        let dir_name = ArchiveIdentifier::try_from_file_name(&record.file_name)
            .map(|identifier| identifier.to_directory_name())
            .unwrap_or_else(|| record.package_record.dist_str());
        Self {
            dir_name,
            file_name: record.file_name.clone(),
        }
    }

    /// The directory name of the extracted tree.
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    /// The file name of the tarball.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct QueryCacheEntry {
    tarball_valid: Option<bool>,
    extracted_valid: Option<bool>,
}

/// An ordered list of package cache directories.
///
/// Each directory stores downloaded tarballs next to their extracted
/// trees. Queries walk the directories in order; validation results are
/// memoized per `(directory, package)` until invalidated with
/// [`MultiPackageCache::clear_query_cache`]. The first directory that
/// passes a write test is the target for new downloads and extractions.
pub struct MultiPackageCache {
    caches: Vec<PathBuf>,
    query_cache: Mutex<HashMap<(usize, String), QueryCacheEntry>>,
}

impl MultiPackageCache {
    /// Creates a cache over the given directories, in preference order.
    pub fn new<I>(paths: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
    {
        Self {
            caches: paths.into_iter().map(Into::into).collect(),
            query_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The configured cache directories.
    pub fn paths(&self) -> &[PathBuf] {
        &self.caches
    }

    /// Returns the path of a validated tarball for the record in any of
    /// the caches, or `None`.
    pub fn get_tarball_path(&self, record: &RepoDataRecord) -> Option<PathBuf> {
        let key = CacheKey::from_record(record);
        for (index, cache) in self.caches.iter().enumerate() {
            let path = cache.join(key.file_name());
            let valid = self.memoized(index, key.file_name(), |entry| &mut entry.tarball_valid, || {
                match validate_tarball(&path, record) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!("rejecting cached tarball {}: {e}", path.display());
                        false
                    }
                }
            });
            if valid {
                return Some(path);
            }
        }
        None
    }

    /// Returns the path of a validated extracted tree for the record, or
    /// `None`. With `check_only_writable` the search is restricted to the
    /// first writable cache directory.
    pub fn get_extracted_dir_path(
        &self,
        record: &RepoDataRecord,
        check_only_writable: bool,
    ) -> Option<PathBuf> {
        let key = CacheKey::from_record(record);
        let writable = if check_only_writable {
            let writable = self.first_writable_path();
            writable.as_ref()?;
            writable
        } else {
            None
        };

        for (index, cache) in self.caches.iter().enumerate() {
            if let Some(writable) = &writable {
                if cache != writable {
                    continue;
                }
            }
            let path = cache.join(key.dir_name());
            let valid =
                self.memoized(index, key.dir_name(), |entry| &mut entry.extracted_valid, || {
                    match validate_extracted_dir(&path, record) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::debug!(
                                "rejecting extracted directory {}: {e}",
                                path.display()
                            );
                            false
                        }
                    }
                });
            if valid {
                return Some(path);
            }
        }
        None
    }

    /// Returns the first cache directory that passes a write test,
    /// creating it if necessary.
    pub fn first_writable_path(&self) -> Option<PathBuf> {
        self.caches
            .iter()
            .find(|cache| is_writable(cache))
            .cloned()
    }

    /// Forgets the memoized validation results of the record, in every
    /// cache directory.
    pub fn clear_query_cache(&self, record: &RepoDataRecord) {
        let key = CacheKey::from_record(record);
        let mut query_cache = self.query_cache.lock();
        for index in 0..self.caches.len() {
            query_cache.remove(&(index, key.file_name().to_owned()));
            query_cache.remove(&(index, key.dir_name().to_owned()));
        }
    }

    /// Extracts a validated tarball and stamps the tree with the record.
    /// The tree lands next to the tarball when that cache directory is
    /// writable, otherwise in the first writable cache. The extraction
    /// happens in a temporary sibling directory that is renamed into
    /// place, so readers never observe a partial tree; the cancellation
    /// hook is polled between archive entries. Returns the final
    /// directory.
    pub fn extract_into_cache(
        &self,
        tarball: &Path,
        record: &RepoDataRecord,
        cancelled: CancellationCheck<'_>,
    ) -> Result<PathBuf, PackageCacheError> {
        let cache = tarball
            .parent()
            .filter(|parent| self.caches.iter().any(|cache| cache == parent) && is_writable(parent))
            .map(Path::to_path_buf)
            .or_else(|| self.first_writable_path())
            .ok_or(PackageCacheError::NoWritableCache)?;
        let key = CacheKey::from_record(record);
        let final_dir = cache.join(key.dir_name());

        let temp_dir = tempfile::Builder::new()
            .prefix(&format!(".{}-", key.dir_name()))
            .tempdir_in(&cache)?;

        taipan_package_streaming::fs::extract(tarball, temp_dir.path(), cancelled)
            .map_err(|e| PackageCacheError::ExtractError(tarball.to_path_buf(), e))?;

        // Stamp the tree with the record; readers treat a tree without it
        // as invalid.
        let record_path = temp_dir.path().join(REPODATA_RECORD_FILE);
        if let Some(parent) = record_path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(record).map_err(std::io::Error::from)?;
        let mut file = fs_err::File::create(&record_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        // Replace any previous (necessarily invalid) tree.
        if final_dir.exists() {
            fs_err::remove_dir_all(&final_dir)?;
        }
        let temp_path = temp_dir.keep();
        fs_err::rename(&temp_path, &final_dir)?;

        self.clear_query_cache(record);
        Ok(final_dir)
    }

    /// Appends the source url of a freshly extracted package to the
    /// `urls.txt` of the given cache directory. Appends from concurrent
    /// tasks are serialized process-wide.
    pub fn append_url(&self, cache: &Path, url: &url::Url) -> Result<(), PackageCacheError> {
        let _guard = URLS_TXT_MUTEX.lock();
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(cache.join("urls.txt"))?;
        writeln!(file, "{url}")?;
        Ok(())
    }

    fn memoized(
        &self,
        cache_index: usize,
        key: &str,
        slot: impl Fn(&mut QueryCacheEntry) -> &mut Option<bool>,
        compute: impl FnOnce() -> bool,
    ) -> bool {
        let mut query_cache = self.query_cache.lock();
        let entry = query_cache
            .entry((cache_index, key.to_owned()))
            .or_default();
        if let Some(value) = *slot(entry) {
            return value;
        }
        drop(query_cache);

        let value = compute();

        let mut query_cache = self.query_cache.lock();
        let entry = query_cache
            .entry((cache_index, key.to_owned()))
            .or_default();
        *slot(entry) = Some(value);
        value
    }
}

/// A directory is writable if a probe file can be created in it. The
/// directory is created when missing.
fn is_writable(cache: &Path) -> bool {
    if fs_err::create_dir_all(cache).is_err() {
        return false;
    }
    tempfile::Builder::new()
        .prefix(".writable-check")
        .tempfile_in(cache)
        .is_ok()
}

#[cfg(test)]
mod test {
    use url::Url;

    use taipan_conda_types::{PackageRecord, RepoDataRecord};
    use taipan_digest::{compute_bytes_digest, Sha256};

    use super::MultiPackageCache;

    fn record_for(content: &[u8]) -> RepoDataRecord {
        let mut package_record = PackageRecord::new(
            "bar".to_owned(),
            "2.0".parse().unwrap(),
            "0".to_owned(),
        );
        package_record.subdir = "linux-64".to_owned();
        package_record.size = Some(content.len() as u64);
        package_record.sha256 = Some(compute_bytes_digest::<Sha256>(content));
        RepoDataRecord {
            package_record,
            file_name: "bar-2.0-0.tar.bz2".to_owned(),
            url: Url::parse("https://conda.example.com/channel/linux-64/bar-2.0-0.tar.bz2")
                .unwrap(),
            channel: "https://conda.example.com/channel".to_owned(),
        }
    }

    fn write_tarball(dir: &std::path::Path) -> (std::path::PathBuf, RepoDataRecord) {
        // A tiny but real tar.bz2 so extraction works.
        let mut builder = tar::Builder::new(bzip2::write::BzEncoder::new(
            Vec::new(),
            bzip2::Compression::fast(),
        ));
        let content = b"{}";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "info/index.json", content.as_slice())
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let path = dir.join("bar-2.0-0.tar.bz2");
        std::fs::write(&path, &bytes).unwrap();
        (path, record_for(&bytes))
    }

    #[test]
    fn test_tarball_lookup_prefers_first_cache() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let (tarball, record) = write_tarball(second.path());

        let cache = MultiPackageCache::new([first.path(), second.path()]);
        assert_eq!(cache.get_tarball_path(&record), Some(tarball));
        assert_eq!(
            cache.first_writable_path().as_deref(),
            Some(first.path())
        );
    }

    #[test]
    fn test_corrupt_tarball_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (tarball, record) = write_tarball(dir.path());
        std::fs::write(&tarball, b"corrupted").unwrap();

        let cache = MultiPackageCache::new([dir.path()]);
        assert_eq!(cache.get_tarball_path(&record), None);
    }

    #[test]
    fn test_extract_into_cache_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let (tarball, record) = write_tarball(dir.path());

        let cache = MultiPackageCache::new([dir.path()]);
        assert_eq!(cache.get_extracted_dir_path(&record, false), None);

        let extracted = cache
            .extract_into_cache(&tarball, &record, &|| false)
            .unwrap();
        assert!(extracted.join("info/repodata_record.json").is_file());
        assert_eq!(
            cache.get_extracted_dir_path(&record, false),
            Some(extracted)
        );
    }

    #[test]
    fn test_query_cache_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let (tarball, record) = write_tarball(dir.path());

        let cache = MultiPackageCache::new([dir.path()]);
        assert!(cache.get_tarball_path(&record).is_some());

        // Corrupt the tarball behind the cache's back: the memoized result
        // still says valid until the query cache is cleared.
        std::fs::write(&tarball, b"corrupted").unwrap();
        assert!(cache.get_tarball_path(&record).is_some());
        cache.clear_query_cache(&record);
        assert_eq!(cache.get_tarball_path(&record), None);
    }

    #[test]
    fn test_append_url() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MultiPackageCache::new([dir.path()]);
        let url = Url::parse("https://conda.example.com/channel/linux-64/bar-2.0-0.tar.bz2")
            .unwrap();
        cache.append_url(dir.path(), &url).unwrap();
        cache.append_url(dir.path(), &url).unwrap();

        let content = std::fs::read_to_string(dir.path().join("urls.txt")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().all(|line| line == url.as_str()));
    }
}
