use std::time::Duration;

use assert_matches::assert_matches;
use url::Url;

use taipan_repodata::{
    fetch_repo_data, CacheAction, CacheResult, FetchRepoDataError, FetchRepoDataOptions,
};

const FAKE_REPO_DATA: &str = r#"{
    "packages.conda": {
        "asttokens-2.2.1-pyhd8ed1ab_0.conda": {
            "build": "pyhd8ed1ab_0",
            "build_number": 0,
            "depends": ["python >=3.5", "six"],
            "md5": "bf7f54dd0f25c3f06ecb82a07341841a",
            "name": "asttokens",
            "noarch": "python",
            "sha256": "7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c",
            "size": 27831,
            "subdir": "noarch",
            "timestamp": 1670264089059,
            "version": "2.2.1"
        }
    }
}"#;

fn client() -> reqwest_middleware::ClientWithMiddleware {
    reqwest_middleware::ClientWithMiddleware::from(reqwest::Client::new())
}

fn options() -> FetchRepoDataOptions {
    FetchRepoDataOptions {
        // The probe for the zst variant would hit the mock server with a
        // HEAD request it does not expect.
        zst_enabled: false,
        ..FetchRepoDataOptions::default()
    }
}

#[tokio::test]
async fn test_fetch_and_cache() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/channel/noarch/repodata.json")
        .with_status(200)
        .with_body(FAKE_REPO_DATA)
        .expect(1)
        .create_async()
        .await;

    let cache_dir = tempfile::tempdir().unwrap();
    let subdir_url = Url::parse(&format!("{}/channel/noarch/", server.url())).unwrap();

    let result = fetch_repo_data(
        subdir_url.clone(),
        client(),
        cache_dir.path().to_path_buf(),
        options(),
    )
    .await
    .unwrap();

    assert_matches!(result.cache_result, CacheResult::CacheNotPresent);
    assert_eq!(
        std::fs::read_to_string(&result.repo_data_path).unwrap(),
        FAKE_REPO_DATA
    );

    // A second fetch within the TTL does not hit the server at all.
    let result = fetch_repo_data(
        subdir_url,
        client(),
        cache_dir.path().to_path_buf(),
        options(),
    )
    .await
    .unwrap();
    assert_matches!(result.cache_result, CacheResult::CacheHit);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_not_modified_revalidation() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("GET", "/channel/noarch/repodata.json")
        .with_status(200)
        .with_header("etag", "\"abc123\"")
        .with_body(FAKE_REPO_DATA)
        .expect(1)
        .create_async()
        .await;

    let cache_dir = tempfile::tempdir().unwrap();
    let subdir_url = Url::parse(&format!("{}/channel/noarch/", server.url())).unwrap();

    // Expire the cache immediately so the second call revalidates.
    let mut opts = options();
    opts.local_repodata_ttl = Duration::ZERO;

    fetch_repo_data(
        subdir_url.clone(),
        client(),
        cache_dir.path().to_path_buf(),
        opts.clone(),
    )
    .await
    .unwrap();
    first.assert_async().await;

    let revalidation = server
        .mock("GET", "/channel/noarch/repodata.json")
        .match_header("if-none-match", "\"abc123\"")
        .with_status(304)
        .expect(1)
        .create_async()
        .await;

    let result = fetch_repo_data(
        subdir_url,
        client(),
        cache_dir.path().to_path_buf(),
        opts,
    )
    .await
    .unwrap();
    assert_matches!(result.cache_result, CacheResult::CacheHitAfterFetch);
    assert_eq!(
        std::fs::read_to_string(&result.repo_data_path).unwrap(),
        FAKE_REPO_DATA
    );
    revalidation.assert_async().await;
}

#[tokio::test]
async fn test_retry_on_server_error() {
    let mut server = mockito::Server::new_async().await;
    // The initial request plus exactly one retry.
    let failure = server
        .mock("GET", "/channel/noarch/repodata.json")
        .with_status(503)
        .expect(2)
        .create_async()
        .await;

    let cache_dir = tempfile::tempdir().unwrap();
    let subdir_url = Url::parse(&format!("{}/channel/noarch/", server.url())).unwrap();

    fetch_repo_data(
        subdir_url,
        client(),
        cache_dir.path().to_path_buf(),
        FetchRepoDataOptions {
            zst_enabled: false,
            max_retries: 1,
            ..FetchRepoDataOptions::default()
        },
    )
    .await
    .unwrap_err();

    failure.assert_async().await;
}

#[tokio::test]
async fn test_not_found_is_fatal() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/channel/noarch/repodata.json")
        .with_status(404)
        .create_async()
        .await;

    let cache_dir = tempfile::tempdir().unwrap();
    let subdir_url = Url::parse(&format!("{}/channel/noarch/", server.url())).unwrap();

    let error = fetch_repo_data(
        subdir_url,
        client(),
        cache_dir.path().to_path_buf(),
        options(),
    )
    .await
    .unwrap_err();
    assert_matches!(error, FetchRepoDataError::NotFound { .. });
}

#[tokio::test]
async fn test_use_cache_only_without_cache() {
    let cache_dir = tempfile::tempdir().unwrap();
    let error = fetch_repo_data(
        Url::parse("https://localhost:1/channel/noarch/").unwrap(),
        client(),
        cache_dir.path().to_path_buf(),
        FetchRepoDataOptions {
            cache_action: CacheAction::ForceCacheOnly,
            ..options()
        },
    )
    .await
    .unwrap_err();
    assert_matches!(error, FetchRepoDataError::NoCacheAvailable);
}
