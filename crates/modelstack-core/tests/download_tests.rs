//! Download behavior against a mock asset server

use modelstack_core::{DownloadOutcome, DownloadTask, Downloader, InstallError, RetryPolicy, file_sha256};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ASSET_LEN: usize = 1000;

fn asset_body() -> Vec<u8> {
    (0..ASSET_LEN).map(|i| (i % 251) as u8).collect()
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10))
}

fn downloader() -> Downloader {
    Downloader::new(policy()).unwrap()
}

fn task_for(server: &MockServer, dir: &std::path::Path) -> DownloadTask {
    DownloadTask::new(
        format!("{}/asset", server.uri()),
        dir.join("asset.bin"),
        "test asset",
    )
}

async fn mount_head(server: &MockServer) {
    Mock::given(method("HEAD"))
        .and(path("/asset"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

#[tokio::test]
async fn fresh_download_lands_at_the_destination() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_head(&server).await;
    Mock::given(method("GET"))
        .and(path("/asset"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(asset_body()))
        .expect(1)
        .mount(&server)
        .await;

    let task = task_for(&server, dir.path());
    let outcome = downloader().fetch(&task).await.unwrap();

    assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: ASSET_LEN as u64 });
    assert_eq!(std::fs::read(&task.dest).unwrap(), asset_body());
    assert!(!task.partial_path().exists());
}

#[tokio::test]
async fn completed_download_performs_zero_network_io() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let task = task_for(&server, dir.path());
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(&task.dest, asset_body()).unwrap();

    let outcome = downloader().fetch(&task).await.unwrap();

    assert_eq!(outcome, DownloadOutcome::Cached);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_transfer_resumes_and_matches_a_single_shot_copy() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let full = asset_body();
    let cut = 400usize;

    mount_head(&server).await;
    // Only the ranged request is mocked: a restart from zero would miss.
    Mock::given(method("GET"))
        .and(path("/asset"))
        .and(header("Range", format!("bytes={cut}-")))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes {cut}-{}/{}", ASSET_LEN - 1, ASSET_LEN),
                )
                .set_body_bytes(full[cut..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    // Checksum over the complete file proves byte-identity with an
    // uninterrupted transfer.
    let reference = dir.path().join("reference.bin");
    std::fs::write(&reference, &full).unwrap();
    let expected_sum = file_sha256(&reference).unwrap();

    let task = task_for(&server, dir.path()).with_sha256(expected_sum.clone());
    std::fs::write(task.partial_path(), &full[..cut]).unwrap();

    let outcome = downloader().fetch(&task).await.unwrap();

    assert_eq!(
        outcome,
        DownloadOutcome::Downloaded {
            bytes: (ASSET_LEN - cut) as u64
        }
    );
    assert_eq!(file_sha256(&task.dest).unwrap(), expected_sum);
    assert!(!task.partial_path().exists());
}

#[tokio::test]
async fn range_refusal_restarts_from_zero_and_still_converges() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let full = asset_body();

    mount_head(&server).await;
    // The server answers every GET with a full 200 payload, ranges or not.
    Mock::given(method("GET"))
        .and(path("/asset"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(full.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let task = task_for(&server, dir.path());
    std::fs::write(task.partial_path(), &full[..250]).unwrap();

    let outcome = downloader().fetch(&task).await.unwrap();

    // The stale partial was discarded, so the whole asset was fetched.
    assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: ASSET_LEN as u64 });
    assert_eq!(std::fs::read(&task.dest).unwrap(), full);
}

#[tokio::test]
async fn short_transfers_exhaust_the_retry_budget_with_a_network_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let truncated = asset_body()[..500].to_vec();

    mount_head(&server).await;
    Mock::given(method("GET"))
        .and(path("/asset"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(truncated))
        .mount(&server)
        .await;

    let task = task_for(&server, dir.path()).with_expected_len(ASSET_LEN as u64);
    let err = downloader().fetch(&task).await.unwrap_err();

    assert!(matches!(err, InstallError::Network(_)));
    assert_eq!(err.exit_code(), 3);
    // The short partial stays behind for a future resume.
    assert!(task.partial_path().exists());
    assert!(!task.dest.exists());
}

#[tokio::test]
async fn checksum_mismatch_discards_the_partial_before_failing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_head(&server).await;
    Mock::given(method("GET"))
        .and(path("/asset"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(asset_body()))
        .mount(&server)
        .await;

    let task = task_for(&server, dir.path()).with_sha256("00".repeat(32));
    let err = downloader().fetch(&task).await.unwrap_err();

    assert!(matches!(err, InstallError::Network(_)));
    // A corrupt partial is useless for resuming; it must not linger.
    assert!(!task.partial_path().exists());
    assert!(!task.dest.exists());
}

#[tokio::test]
async fn unexpected_status_is_a_network_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    mount_head(&server).await;
    Mock::given(method("GET"))
        .and(path("/asset"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let task = task_for(&server, dir.path());
    let err = downloader().fetch(&task).await.unwrap_err();
    assert!(matches!(err, InstallError::Network(_)));
}
