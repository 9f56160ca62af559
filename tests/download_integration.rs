//! Integration tests for the downloader.
//!
//! These tests drive the full registry + HTTP executor flow against mock
//! HTTP servers.

#![allow(clippy::unwrap_used)]

mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use resumable_downloader::download::{final_file_name, temp_file_name};
use resumable_downloader::{
    DownloadError, DownloadInfo, DownloadRequest, Downloader, DownloaderConfig, ErrorKind,
    HttpTransferExecutor, InfoSubscription, SubmitError, TransferExecutor, TransferUpdater,
};
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Match, Mock, Request, ResponseTemplate};

/// Matches requests that carry no `Range` header.
struct NoRangeHeader;

impl Match for NoRangeHeader {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("range")
    }
}

fn downloader(root: &std::path::Path) -> Downloader {
    let config = DownloaderConfig::builder(root).build().unwrap();
    Downloader::new(config).unwrap()
}

/// Collects events until the first terminal one.
async fn until_terminal(subscription: &mut InfoSubscription) -> Vec<DownloadInfo> {
    let mut events = Vec::new();
    loop {
        let info = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
            .await
            .expect("timed out waiting for download events")
            .unwrap();
        let terminal = info.is_terminal();
        events.push(info);
        if terminal {
            return events;
        }
    }
}

fn labels(events: &[DownloadInfo]) -> Vec<&'static str> {
    let mut labels: Vec<&'static str> = events.iter().map(DownloadInfo::label).collect();
    labels.dedup();
    labels
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_publishes_hashed_final_file() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    let content = vec![7u8; 64 * 1024];
    Mock::given(method("GET"))
        .and(path("/a.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let url = format!("{}/a.zip", mock_server.uri());
    let mut events = downloader.subscribe(Some(url.clone()));

    let request = DownloadRequest::builder()
        .prefer_breakpoint(Some(true))
        .build(&url);
    let file = downloader.download(request).await.unwrap();

    assert_eq!(file, temp_dir.path().join(final_file_name(&url)));
    assert!(file.to_string_lossy().ends_with(".zip"));
    assert_eq!(std::fs::read(&file).unwrap(), content);
    assert!(!temp_dir.path().join(temp_file_name(&url)).exists());
    assert!(downloader.get_active_info(&url).is_none());
    assert!(!downloader.has_task(&url));

    let events = until_terminal(&mut events).await;
    assert_eq!(labels(&events), vec!["initialized", "progress", "success"]);
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|info| match info {
            DownloadInfo::Progress(progress) => Some(progress.percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(percents.iter().filter(|&&p| p == 100).count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_breakpoint_resume_appends_remaining_bytes() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/resume.bin"))
        .and(header("range", "bytes=5-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"56789".to_vec()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let url = format!("{}/resume.bin", mock_server.uri());
    std::fs::write(temp_dir.path().join(temp_file_name(&url)), b"01234").unwrap();

    let request = DownloadRequest::builder()
        .prefer_breakpoint(Some(true))
        .build(&url);
    let file = downloader.download(request).await.unwrap();

    assert_eq!(std::fs::read(file).unwrap(), b"0123456789");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_range_not_satisfiable_restarts_from_zero() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/stale.bin"))
        .and(header("range", "bytes=10-"))
        .respond_with(ResponseTemplate::new(416))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stale.bin"))
        .and(NoRangeHeader)
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let url = format!("{}/stale.bin", mock_server.uri());
    std::fs::write(temp_dir.path().join(temp_file_name(&url)), b"XXXXXXXXXX").unwrap();

    let request = DownloadRequest::builder()
        .prefer_breakpoint(Some(true))
        .build(&url);
    let file = downloader.download(request).await.unwrap();

    assert_eq!(std::fs::read(file).unwrap(), b"hello world");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_range_ignored_by_server_rewrites_from_zero() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/ignored.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let url = format!("{}/ignored.bin", mock_server.uri());
    std::fs::write(temp_dir.path().join(temp_file_name(&url)), b"ZZZZZZZZZZ").unwrap();

    let request = DownloadRequest::builder()
        .prefer_breakpoint(Some(true))
        .build(&url);
    let file = downloader.download(request).await.unwrap();

    assert_eq!(std::fs::read(file).unwrap(), b"abc");
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(
        requests[0].headers.get("range").and_then(|v| v.to_str().ok()),
        Some("bytes=10-")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_range_error_status_is_http_error() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/broken.bin"))
        .and(header("range", "bytes=4-"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let url = format!("{}/broken.bin", mock_server.uri());
    let temp = temp_dir.path().join(temp_file_name(&url));
    std::fs::write(&temp, b"0123").unwrap();

    let request = DownloadRequest::builder()
        .prefer_breakpoint(Some(true))
        .build(&url);
    let error = downloader.download(request).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::HttpStatus(500));
    assert!(temp.exists());
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_error_status_fails_and_discards_temp() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/missing.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let url = format!("{}/missing.pdf", mock_server.uri());

    let error = downloader.download(DownloadRequest::new(&url)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::HttpStatus(404));
    assert!(!error.is_cancelled());
    assert!(!temp_dir.path().join(temp_file_name(&url)).exists());
    assert!(downloader.dir("").final_file(&url).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_share_one_transfer() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/shared.iso"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"iso".to_vec())
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let url = format!("{}/shared.iso", mock_server.uri());
    let mut events = downloader.subscribe(Some(url.clone()));

    assert!(downloader.add_task(DownloadRequest::new(&url)));
    assert!(downloader.add_task(DownloadRequest::new(&url)));
    let (first, second) = tokio::join!(
        downloader.download(DownloadRequest::new(&url)),
        downloader.download(DownloadRequest::new(&url)),
    );
    assert_eq!(first.unwrap(), second.unwrap());

    let events = until_terminal(&mut events).await;
    let initialized = events
        .iter()
        .filter(|info| matches!(info, DownloadInfo::Initialized { .. }))
        .count();
    assert_eq!(initialized, 1);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_during_cancellation_starts_after_cancelled_attempt() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/retry.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"second attempt".to_vec())
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let url = format!("{}/retry.bin", mock_server.uri());
    let mut events = downloader.subscribe(Some(url.clone()));

    assert!(downloader.add_task(DownloadRequest::new(&url)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    downloader.cancel_task(&url);
    assert!(downloader.add_task(DownloadRequest::new(&url)));

    let first = until_terminal(&mut events).await;
    assert_eq!(labels(&first), vec!["initialized", "cancelling", "error"]);
    match first.last() {
        Some(DownloadInfo::Error { error, .. }) => assert!(error.is_cancelled()),
        other => panic!("expected cancellation error, got {other:?}"),
    }

    let second = until_terminal(&mut events).await;
    assert_eq!(second.first().map(DownloadInfo::label), Some("initialized"));
    let file = match second.last() {
        Some(DownloadInfo::Success { file, .. }) => file.clone(),
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(std::fs::read(file).unwrap(), b"second attempt");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_unknown_url_emits_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let downloader = downloader(temp_dir.path());
    let mut events = downloader.subscribe(None);

    downloader.cancel_task("https://example.invalid/unknown.bin");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_none());
}

/// Executor that refuses all work.
struct ClosedExecutor;

impl TransferExecutor for ClosedExecutor {
    fn submit(
        &self,
        _request: DownloadRequest,
        _file: PathBuf,
        _updater: Arc<dyn TransferUpdater>,
    ) -> Result<(), SubmitError> {
        Err(SubmitError::Shutdown)
    }

    fn cancel(&self, _url: &str) {}
}

#[test]
fn test_custom_executor_rejection_surfaces_as_submit_failed() {
    let temp_dir = TempDir::new().unwrap();
    let config = DownloaderConfig::builder(temp_dir.path()).build().unwrap();
    let downloader = Downloader::with_executor(config, Arc::new(ClosedExecutor)).unwrap();

    let error =
        tokio_test::block_on(downloader.download(DownloadRequest::new("https://x/a.zip")))
            .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::SubmitFailed);
    assert!(!downloader.has_task("https://x/a.zip"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_executor_rejects_new_downloads() {
    let temp_dir = TempDir::new().unwrap();
    let config = DownloaderConfig::builder(temp_dir.path()).build().unwrap();
    let executor = Arc::new(HttpTransferExecutor::new(Default::default()).unwrap());
    executor.shutdown();
    let downloader = Downloader::with_executor(config, executor).unwrap();

    let error = downloader
        .download(DownloadRequest::new("https://x/a.zip"))
        .await
        .unwrap_err();
    assert!(matches!(&*error, DownloadError::SubmitFailed { .. }));
}
