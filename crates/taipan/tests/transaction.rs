//! End to end tests of the fetch pipeline and transaction execution,
//! driven through real (tiny) package archives in temporary caches.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use assert_matches::assert_matches;
use url::Url;

use taipan::{
    driver::UserRequest, execute_transaction, explicit::records_from_explicit_specs,
    fetch::fetch_packages, Context, ExecuteTransactionError, FetchPackagesError, Transaction,
};
use taipan_cache::MultiPackageCache;
use taipan_conda_types::{
    ExplicitSpec, History, PackageRecord, PrefixData, RepoDataRecord,
};
use taipan_digest::{compute_bytes_digest, Sha256};

/// Builds a real `.tar.bz2` package archive holding the given files plus
/// the usual `info/` metadata.
fn make_archive(name: &str, version: &str, files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(bzip2::write::BzEncoder::new(
        Vec::new(),
        bzip2::Compression::fast(),
    ));

    let mut append = |path: &str, content: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content).unwrap();
    };

    let index_json = format!(
        r#"{{"name": "{name}", "version": "{version}", "build": "0", "build_number": 0, "subdir": "linux-64"}}"#
    );
    append("info/index.json", index_json.as_bytes());

    let paths: Vec<String> = files
        .iter()
        .map(|(path, content)| {
            format!(
                r#"{{"_path": "{path}", "path_type": "hardlink", "sha256": "{}", "size_in_bytes": {}}}"#,
                hex::encode(compute_bytes_digest::<Sha256>(content.as_bytes())),
                content.len()
            )
        })
        .collect();
    let paths_json = format!(
        r#"{{"paths_version": 1, "paths": [{}]}}"#,
        paths.join(", ")
    );
    append("info/paths.json", paths_json.as_bytes());

    for (path, content) in files {
        append(path, content.as_bytes());
    }

    builder.into_inner().unwrap().finish().unwrap()
}

/// A record matching an archive produced by [`make_archive`].
fn record_for_archive(name: &str, version: &str, archive: &[u8], base_url: &str) -> RepoDataRecord {
    let mut package_record = PackageRecord::new(
        name.to_owned(),
        version.parse().unwrap(),
        "0".to_owned(),
    );
    package_record.subdir = "linux-64".to_owned();
    package_record.size = Some(archive.len() as u64);
    package_record.sha256 = Some(compute_bytes_digest::<Sha256>(archive));
    let file_name = format!("{name}-{version}-0.tar.bz2");
    RepoDataRecord {
        url: Url::parse(&format!("{base_url}/linux-64/{file_name}")).unwrap(),
        file_name,
        channel: base_url.to_owned(),
        package_record,
    }
}

fn context(cache_root: &Path) -> Context {
    Context::from_cache_root(cache_root.to_path_buf())
}

fn client() -> reqwest_middleware::ClientWithMiddleware {
    reqwest_middleware::ClientWithMiddleware::from(reqwest::Client::new())
}

/// Places an archive as a tarball into a cache directory.
fn seed_cache(cache_dir: &Path, record: &RepoDataRecord, archive: &[u8]) {
    std::fs::create_dir_all(cache_dir).unwrap();
    std::fs::write(cache_dir.join(&record.file_name), archive).unwrap();
}

fn conda_meta_names(prefix: &Path) -> Vec<String> {
    PrefixData::from_prefix(prefix)
        .unwrap()
        .records()
        .map(|record| record.repodata_record.package_record.name.clone())
        .collect()
}

/// Scenario S3: installing a single dependency-free package produces its
/// files and a conda-meta record.
#[tokio::test]
async fn test_install_single_package() {
    let root = tempfile::tempdir().unwrap();
    let prefix = root.path().join("env");
    let ctx = context(&root.path().join("cache"));
    let cache = MultiPackageCache::new(ctx.package_cache_dirs.clone());

    let archive = make_archive("foo", "1.0", &[("bin/foo", "#!/bin/sh\necho foo\n")]);
    // The url is never fetched: the tarball is pre-seeded.
    let record = record_for_archive("foo", "1.0", &archive, "https://localhost:1/channel");
    seed_cache(&ctx.package_cache_dirs[0], &record, &archive);

    let transaction = Transaction::from_current_and_desired(
        Vec::new(),
        vec![record],
        &HashSet::new(),
        ctx.platform,
    )
    .unwrap();

    execute_transaction(
        &ctx,
        &prefix,
        &transaction,
        &cache,
        &client(),
        UserRequest {
            cmd: "taipan install foo=1.0".to_owned(),
            update_specs: vec!["foo=1.0".to_owned()],
            remove_specs: Vec::new(),
        },
    )
    .await
    .unwrap();

    assert!(prefix.join("bin/foo").is_file());
    assert!(prefix.join("conda-meta/foo-1.0-0.json").is_file());

    let record = taipan_conda_types::PrefixRecord::from_path(
        prefix.join("conda-meta/foo-1.0-0.json"),
    )
    .unwrap();
    assert_eq!(record.repodata_record.package_record.name, "foo");
    assert_eq!(record.files, vec![PathBuf::from("bin/foo")]);

    // The history records the request and the linked dist.
    let history = History::from_prefix(&prefix).parse().unwrap();
    assert_eq!(history.revisions.len(), 1);
    assert!(history.revisions[0].link_dists.contains("foo-1.0-0"));
}

/// Scenario S4: a tarball pre-placed in the second cache is extracted in
/// place without any network traffic.
#[tokio::test]
async fn test_cached_tarball_is_extracted_without_network() {
    let root = tempfile::tempdir().unwrap();
    let first_cache = root.path().join("cache-a");
    let second_cache = root.path().join("cache-b");
    let mut ctx = context(root.path());
    ctx.package_cache_dirs = vec![first_cache.clone(), second_cache.clone()];
    let cache = MultiPackageCache::new(ctx.package_cache_dirs.clone());

    let archive = make_archive("bar", "2.0", &[("share/bar.txt", "data")]);
    let record = record_for_archive("bar", "2.0", &archive, "https://localhost:1/channel");
    seed_cache(&second_cache, &record, &archive);

    assert_eq!(cache.get_extracted_dir_path(&record, false), None);

    // The record's url points at a closed port: any network attempt would
    // fail the pipeline.
    fetch_packages(std::slice::from_ref(&record), &cache, &client(), &ctx)
        .await
        .unwrap();

    let extracted = cache
        .get_extracted_dir_path(&record, false)
        .expect("the package is extracted now");
    // Extraction went into the cache that already held the tarball.
    assert!(extracted.starts_with(&second_cache));
    assert!(extracted.join("info/repodata_record.json").is_file());
}

/// Scenario S5: when linking the second package fails halfway, the first
/// package and the partial files of the second are removed again.
#[tokio::test]
async fn test_failed_link_rolls_back() {
    let root = tempfile::tempdir().unwrap();
    let prefix = root.path().join("env");
    let ctx = context(&root.path().join("cache"));
    let cache = MultiPackageCache::new(ctx.package_cache_dirs.clone());

    let archive_a = make_archive("aaa", "1.0", &[("share/a.txt", "a")]);
    let record_a = record_for_archive("aaa", "1.0", &archive_a, "https://localhost:1/channel");
    seed_cache(&ctx.package_cache_dirs[0], &record_a, &archive_a);

    // Package b declares a file that is missing from the archive, so the
    // link step fails after some files have been written.
    let mut builder = tar::Builder::new(bzip2::write::BzEncoder::new(
        Vec::new(),
        bzip2::Compression::fast(),
    ));
    let mut append = |path: &str, content: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content).unwrap();
    };
    append(
        "info/index.json",
        br#"{"name": "bbb", "version": "1.0", "build": "0", "build_number": 0, "subdir": "linux-64"}"#,
    );
    append(
        "info/paths.json",
        br#"{"paths_version": 1, "paths": [
            {"_path": "share/b1.txt", "path_type": "hardlink"},
            {"_path": "share/b2.txt", "path_type": "hardlink"},
            {"_path": "share/missing.txt", "path_type": "hardlink"}
        ]}"#,
    );
    append("share/b1.txt", b"b1");
    append("share/b2.txt", b"b2");
    let archive_b = builder.into_inner().unwrap().finish().unwrap();
    let record_b = record_for_archive("bbb", "1.0", &archive_b, "https://localhost:1/channel");
    seed_cache(&ctx.package_cache_dirs[0], &record_b, &archive_b);

    let transaction = Transaction::from_current_and_desired(
        Vec::new(),
        vec![record_a, record_b],
        &HashSet::new(),
        ctx.platform,
    )
    .unwrap();

    let error = execute_transaction(
        &ctx,
        &prefix,
        &transaction,
        &cache,
        &client(),
        UserRequest::default(),
    )
    .await
    .unwrap_err();

    assert_matches!(error, ExecuteTransactionError::RolledBack(_));
    assert!(error.prefix_unchanged());

    // The prefix is back to its pre-transaction state.
    assert!(conda_meta_names(&prefix).is_empty());
    assert!(!prefix.join("share/a.txt").exists());
    assert!(!prefix.join("share/b1.txt").exists());
    assert!(!prefix.join("share/b2.txt").exists());

    // No history entry was recorded for the failed transaction.
    assert!(History::from_prefix(&prefix).parse().unwrap().revisions.is_empty());
}

/// Scenario S6: an explicit url whose sha256 does not match the download
/// aborts before any link step, and the bad tarball is not kept.
#[tokio::test]
async fn test_explicit_checksum_mismatch_aborts() {
    let mut server = mockito::Server::new_async().await;
    let archive = make_archive("pkg", "1.0", &[("share/pkg.txt", "data")]);
    server
        .mock("GET", "/ch/linux-64/pkg-1.0-0.tar.bz2")
        .with_status(200)
        .with_body(&archive)
        .create_async()
        .await;

    let root = tempfile::tempdir().unwrap();
    let prefix = root.path().join("env");
    let ctx = context(&root.path().join("cache"));
    let cache = MultiPackageCache::new(ctx.package_cache_dirs.clone());

    // The fragment advertises a digest that cannot match the body.
    let spec = ExplicitSpec::from_str(&format!(
        "{}/ch/linux-64/pkg-1.0-0.tar.bz2#sha256:{}",
        server.url(),
        "00".repeat(32)
    ))
    .unwrap();
    let records = records_from_explicit_specs(&[spec]).unwrap();

    let transaction = Transaction::from_current_and_desired(
        Vec::new(),
        records,
        &HashSet::new(),
        ctx.platform,
    )
    .unwrap();

    let error = execute_transaction(
        &ctx,
        &prefix,
        &transaction,
        &cache,
        &client(),
        UserRequest::default(),
    )
    .await
    .unwrap_err();

    assert_matches!(
        error,
        ExecuteTransactionError::Fetch(FetchPackagesError::ChecksumMismatch { .. })
    );

    // Nothing was linked and the bad tarball was discarded.
    assert!(conda_meta_names(&prefix).is_empty());
    assert!(!ctx.package_cache_dirs[0]
        .join("pkg-1.0-0.tar.bz2")
        .exists());
}

/// An interruption before the first step triggers a clean, empty rollback
/// and leaves the prefix untouched.
#[tokio::test]
async fn test_cancellation_before_first_step() {
    let root = tempfile::tempdir().unwrap();
    let prefix = root.path().join("env");
    let ctx = context(&root.path().join("cache"));
    let cache = MultiPackageCache::new(ctx.package_cache_dirs.clone());

    let archive = make_archive("foo", "1.0", &[("bin/foo", "x")]);
    let record = record_for_archive("foo", "1.0", &archive, "https://localhost:1/channel");
    seed_cache(&ctx.package_cache_dirs[0], &record, &archive);

    let transaction = Transaction::from_current_and_desired(
        Vec::new(),
        vec![record],
        &HashSet::new(),
        ctx.platform,
    )
    .unwrap();

    ctx.cancellation.cancel();
    let error = execute_transaction(
        &ctx,
        &prefix,
        &transaction,
        &cache,
        &client(),
        UserRequest::default(),
    )
    .await
    .unwrap_err();

    assert_matches!(error, ExecuteTransactionError::Fetch(FetchPackagesError::Cancelled));
    assert!(conda_meta_names(&prefix).is_empty());
}

/// Removing and relinking through a change operation keeps the conda-meta
/// ledger consistent.
#[tokio::test]
async fn test_change_operation_updates_record() {
    let root = tempfile::tempdir().unwrap();
    let prefix = root.path().join("env");
    let ctx = context(&root.path().join("cache"));
    let cache = MultiPackageCache::new(ctx.package_cache_dirs.clone());

    let v1 = make_archive("foo", "1.0", &[("share/foo.txt", "one")]);
    let record_v1 = record_for_archive("foo", "1.0", &v1, "https://localhost:1/channel");
    seed_cache(&ctx.package_cache_dirs[0], &record_v1, &v1);

    let transaction = Transaction::from_current_and_desired(
        Vec::new(),
        vec![record_v1.clone()],
        &HashSet::new(),
        ctx.platform,
    )
    .unwrap();
    execute_transaction(&ctx, &prefix, &transaction, &cache, &client(), UserRequest::default())
        .await
        .unwrap();

    let v2 = make_archive("foo", "2.0", &[("share/foo.txt", "two")]);
    let record_v2 = record_for_archive("foo", "2.0", &v2, "https://localhost:1/channel");
    seed_cache(&ctx.package_cache_dirs[0], &record_v2, &v2);

    let installed = PrefixData::from_prefix(&prefix)
        .unwrap()
        .records()
        .cloned()
        .collect();
    let transaction = Transaction::from_current_and_desired(
        installed,
        vec![record_v2],
        &HashSet::new(),
        ctx.platform,
    )
    .unwrap();
    execute_transaction(&ctx, &prefix, &transaction, &cache, &client(), UserRequest::default())
        .await
        .unwrap();

    assert_eq!(conda_meta_names(&prefix), vec!["foo"]);
    assert!(prefix.join("conda-meta/foo-2.0-0.json").is_file());
    assert!(!prefix.join("conda-meta/foo-1.0-0.json").exists());
    assert_eq!(
        std::fs::read_to_string(prefix.join("share/foo.txt")).unwrap(),
        "two"
    );
}
