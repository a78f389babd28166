#![deny(missing_docs)]

//! `taipan_cache` manages the on-disk caches of downloaded package
//! archives and their extracted trees.
//!
//! A [`MultiPackageCache`] spans an ordered list of directories; lookups
//! validate what they find (checksums for tarballs, the stamped
//! `info/repodata_record.json` for extracted trees) and memoize the
//! results, and the first writable directory receives new downloads and
//! extractions.

mod package_cache;
pub mod validation;

pub use package_cache::{CacheKey, MultiPackageCache, PackageCacheError};
