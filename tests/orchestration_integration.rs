//! Integration tests for download orchestration against a real filesystem.

mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{FakeCapability, write_urls_file};
use tempfile::TempDir;
use tubeflow_core::video::{
    DestinationPolicy, DownloadErrorKind, DownloadService, RetryPolicy, STAGING_DIR_NAME,
    ShardOverrides, VideoError,
};

fn service(capability: FakeCapability) -> (DownloadService, Arc<FakeCapability>) {
    let capability = Arc::new(capability);
    (DownloadService::new(capability.clone()), capability)
}

fn staging_entries(root: &std::path::Path) -> usize {
    std::fs::read_dir(root.join(STAGING_DIR_NAME)).map_or(0, Iterator::count)
}

// ==================== Channel-sharded downloads ====================

#[tokio::test]
async fn test_sharded_download_lands_in_letter_and_channel_dirs() {
    let root = TempDir::new().unwrap();
    let (service, _) = service(FakeCapability::new("Zephyr"));

    let video = service
        .download_to_channel_sharded_dir(
            "https://youtu.be/clip",
            720,
            root.path(),
            &ShardOverrides::default(),
            RetryPolicy::no_retry(),
        )
        .await
        .unwrap();

    let expected_dir = root.path().join("z").join("Zephyr");
    assert_eq!(video.download_dir, expected_dir);
    assert_eq!(video.output_path, expected_dir.join("clip.mkv"));
    assert!(video.output_path.is_file());
    assert_eq!(staging_entries(root.path()), 0);
}

#[tokio::test]
async fn test_sharded_download_without_letters_goes_to_unknown() {
    let root = TempDir::new().unwrap();
    let (service, _) = service(FakeCapability::new("1234"));

    let video = service
        .download_to_channel_sharded_dir(
            "https://youtu.be/n",
            720,
            root.path(),
            &ShardOverrides::default(),
            RetryPolicy::no_retry(),
        )
        .await
        .unwrap();

    assert_eq!(video.download_dir, root.path().join("unknown").join("1234"));
}

#[tokio::test]
async fn test_failed_sharded_download_leaves_no_staging_behind() {
    let root = TempDir::new().unwrap();
    let (service, capability) = service(FakeCapability::new("Zephyr").failing("https://youtu.be/x"));

    let error = service
        .download_to_channel_sharded_dir(
            "https://youtu.be/x",
            720,
            root.path(),
            &ShardOverrides::default(),
            RetryPolicy::new(1, Duration::from_millis(1)),
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind(), Some(DownloadErrorKind::NotFound));
    assert_eq!(capability.calls(), 2);
    assert_eq!(staging_entries(root.path()), 0);
    let leftovers: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .filter(|name| name != STAGING_DIR_NAME)
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

// ==================== Batches ====================

#[tokio::test]
async fn test_batch_reports_every_url_exactly_once() {
    let media = TempDir::new().unwrap();
    let urls_file = write_urls_file(
        media.path(),
        &[
            "https://youtu.be/a",
            "",
            "https://youtu.be/gone",
            "  https://youtu.be/b  ",
        ],
    );
    let (service, capability) = service(FakeCapability::new("Zephyr").failing("https://youtu.be/gone"));
    let policy = DestinationPolicy::Flat {
        destination: media.path().to_path_buf(),
    };

    let outcome = service
        .batch(&urls_file, 1080, &policy, 2, RetryPolicy::no_retry())
        .await;

    assert_eq!(outcome.total(), 3);
    assert_eq!(outcome.videos.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(capability.calls(), 3);
    assert!(media.path().join("a.mkv").is_file());
    assert!(media.path().join("b.mkv").is_file());
}

#[tokio::test]
async fn test_sharded_batch_uses_channel_dirs() {
    let root = TempDir::new().unwrap();
    let lists = TempDir::new().unwrap();
    let urls_file = write_urls_file(lists.path(), &["https://youtu.be/a", "https://youtu.be/b"]);
    let (service, _) = service(FakeCapability::new("test"));
    let policy = DestinationPolicy::ChannelSharded {
        root: root.path().to_path_buf(),
        overrides: ShardOverrides::default(),
    };

    let outcome = service
        .batch(&urls_file, 480, &policy, 3, RetryPolicy::no_retry())
        .await;

    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    let channel_dir = root.path().join("t").join("test");
    assert!(channel_dir.join("a.mkv").is_file());
    assert!(channel_dir.join("b.mkv").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sharded_batch_shares_staging_dir() {
    let root = TempDir::new().unwrap();
    let lists = TempDir::new().unwrap();
    let urls: Vec<String> = (0..40).map(|i| format!("https://youtu.be/v{i}")).collect();
    let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    let urls_file = write_urls_file(lists.path(), &url_refs);
    let (service, _) = service(FakeCapability::new("Zephyr"));
    let policy = DestinationPolicy::ChannelSharded {
        root: root.path().to_path_buf(),
        overrides: ShardOverrides::default(),
    };

    let outcome = service
        .batch(&urls_file, 720, &policy, 8, RetryPolicy::no_retry())
        .await;

    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert_eq!(outcome.videos.len(), 40);
    let channel_dir = root.path().join("z").join("Zephyr");
    assert_eq!(std::fs::read_dir(&channel_dir).unwrap().count(), 40);
    assert_eq!(staging_entries(root.path()), 0);
}

#[tokio::test]
async fn test_batch_with_missing_urls_file() {
    let media = TempDir::new().unwrap();
    let (service, capability) = service(FakeCapability::new("Zephyr"));
    let missing = media.path().join("nope.txt");
    let policy = DestinationPolicy::Flat {
        destination: media.path().to_path_buf(),
    };

    let outcome = service
        .batch(&missing, 1080, &policy, 3, RetryPolicy::no_retry())
        .await;

    assert!(outcome.videos.is_empty());
    assert!(matches!(outcome.errors.as_slice(), [VideoError::PathNotFound { path }] if *path == missing));
    assert_eq!(capability.calls(), 0);
}

// ==================== Retry timing ====================

#[tokio::test(start_paused = true)]
async fn test_flaky_capability_recovers_within_budget() {
    let media = TempDir::new().unwrap();
    let (service, capability) = service(FakeCapability::new("Zephyr").flaky(2));
    let started = tokio::time::Instant::now();

    let video = service
        .download_one(
            "https://youtu.be/c",
            1080,
            media.path(),
            RetryPolicy::new(3, Duration::from_secs(3)),
        )
        .await
        .unwrap();

    assert_eq!(capability.calls(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(6));
    assert_eq!(video.download_dir, media.path());
}

#[tokio::test(start_paused = true)]
async fn test_missing_destination_fails_without_calls_or_sleeps() {
    let (service, capability) = service(FakeCapability::new("Zephyr"));
    let started = tokio::time::Instant::now();

    let error = service
        .download_one(
            "https://youtu.be/c",
            1080,
            std::path::Path::new("/definitely/not/here"),
            RetryPolicy::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, VideoError::PathNotFound { .. }));
    assert_eq!(capability.calls(), 0);
    assert_eq!(started.elapsed(), Duration::ZERO);
}
