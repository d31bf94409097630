//! Resumable asset downloads
//!
//! Large artifacts are streamed into a `<dest>.part` file and promoted to
//! their final path only after verification, so a crash never corrupts a
//! completed artifact and an interrupted transfer resumes from where it
//! stopped via HTTP range requests.

use crate::error::{InstallError, Result};
use crate::retry::RetryPolicy;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Flush the partial file after this many buffered bytes.
const FLUSH_INTERVAL: u64 = 8 * 1024 * 1024;

/// Progress log interval when the total size is unknown.
const UNKNOWN_TOTAL_LOG_INTERVAL: u64 = 64 * 1024 * 1024;

/// One asset to place at a final path.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub dest: PathBuf,
    /// Expected final size in bytes, when known up front.
    pub expected_len: Option<u64>,
    /// Expected SHA-256 of the final file, hex encoded.
    pub sha256: Option<String>,
    /// Human label used in log lines.
    pub label: String,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            expected_len: None,
            sha256: None,
            label: label.into(),
        }
    }

    pub fn with_expected_len(mut self, len: u64) -> Self {
        self.expected_len = Some(len);
        self
    }

    pub fn with_sha256(mut self, sum: impl Into<String>) -> Self {
        self.sha256 = Some(sum.into());
        self
    }

    /// In-flight path for this task; only ever one per destination.
    pub fn partial_path(&self) -> PathBuf {
        let mut os = self.dest.clone().into_os_string();
        os.push(".part");
        PathBuf::from(os)
    }
}

/// Result of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The destination already satisfied the task; no network I/O happened.
    Cached,
    /// Bytes were transferred this run (resumed transfers count only the
    /// newly fetched bytes).
    Downloaded { bytes: u64 },
}

#[derive(Debug, Clone, Copy)]
struct RemoteMetadata {
    len: Option<u64>,
    accept_ranges: bool,
}

/// Streaming downloader with resume, verification and bounded retries.
pub struct Downloader {
    client: reqwest::Client,
    retry: RetryPolicy,
    show_progress: bool,
}

impl Downloader {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("modelstack/0.1")
            .build()?;
        Ok(Self {
            client,
            retry,
            show_progress: false,
        })
    }

    /// Enable the interactive progress bar (off by default; log lines are
    /// always emitted at a bounded cadence).
    pub fn with_progress(mut self, on: bool) -> Self {
        self.show_progress = on;
        self
    }

    /// Whether the destination already satisfies the task, judged purely
    /// from local state. Never touches the network.
    pub fn is_cached(&self, task: &DownloadTask) -> Result<bool> {
        let Ok(meta) = std::fs::metadata(&task.dest) else {
            return Ok(false);
        };
        if meta.len() == 0 {
            return Ok(false);
        }
        if let Some(sum) = &task.sha256 {
            return Ok(file_sha256(&task.dest)?.eq_ignore_ascii_case(sum));
        }
        if let Some(len) = task.expected_len {
            return Ok(meta.len() == len);
        }
        Ok(true)
    }

    /// Fetch the task, resuming any partial file, verifying the result and
    /// atomically renaming it into place. A completed task is a no-op.
    pub async fn fetch(&self, task: &DownloadTask) -> Result<DownloadOutcome> {
        if self.is_cached(task)? {
            info!("{} already complete; skipping", task.label);
            return Ok(DownloadOutcome::Cached);
        }
        if let Some(parent) = task.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.demote_incomplete_dest(task)?;

        let remote = self.remote_metadata(&task.url).await;
        if let Some(meta) = remote {
            debug!(
                "{}: remote size {:?}, range support {}",
                task.label, meta.len, meta.accept_ranges
            );
        }

        info!("starting {}: {}", task.label, task.url);
        let bytes = self
            .retry
            .run(|attempt| {
                if attempt > 0 {
                    warn!("{}: retrying (attempt {})", task.label, attempt + 1);
                }
                self.attempt_transfer(task, remote)
            })
            .await
            .map_err(|err| {
                InstallError::Network(format!(
                    "{} failed after {} attempts: {err}",
                    task.label, self.retry.max_attempts
                ))
            })?;
        Ok(DownloadOutcome::Downloaded { bytes })
    }

    /// An existing destination that failed the cache check is demoted to
    /// the partial path so it can be resumed instead of re-fetched.
    fn demote_incomplete_dest(&self, task: &DownloadTask) -> Result<()> {
        let Ok(dest_meta) = std::fs::metadata(&task.dest) else {
            return Ok(());
        };
        let partial = task.partial_path();
        match std::fs::metadata(&partial) {
            Ok(part_meta) if dest_meta.len() <= part_meta.len() => {
                std::fs::remove_file(&task.dest)?;
            }
            Ok(_) => {
                std::fs::remove_file(&partial)?;
                std::fs::rename(&task.dest, &partial)?;
            }
            Err(_) => {
                std::fs::rename(&task.dest, &partial)?;
            }
        }
        Ok(())
    }

    async fn remote_metadata(&self, url: &str) -> Option<RemoteMetadata> {
        let resp = self.client.head(url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        // A zero Content-Length on a HEAD response means the server did
        // not report a usable size, not that the asset is empty.
        let len = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .filter(|len: &u64| *len > 0);
        let accept_ranges = resp
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        Some(RemoteMetadata { len, accept_ranges })
    }

    /// One transfer attempt: resume into the partial, verify, promote.
    /// Returns the bytes fetched during this attempt.
    async fn attempt_transfer(
        &self,
        task: &DownloadTask,
        remote: Option<RemoteMetadata>,
    ) -> Result<u64> {
        let partial = task.partial_path();
        let remote_len = remote.and_then(|r| r.len);

        let mut offset = tokio::fs::metadata(&partial)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if let Some(total) = remote_len {
            if offset > total {
                warn!("{}: partial larger than remote; discarding", task.label);
                tokio::fs::remove_file(&partial).await.ok();
                offset = 0;
            }
        }

        let mut request = self.client.get(&task.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let resp = request.send().await?;
        let status = resp.status();

        let mut resuming = offset > 0;
        match status {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                if resuming {
                    info!("{}: server ignored the range request; restarting from zero", task.label);
                    tokio::fs::remove_file(&partial).await.ok();
                    offset = 0;
                    resuming = false;
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // The partial already holds every byte the server has.
                self.finalize(task, remote_len).await?;
                return Ok(0);
            }
            other => {
                return Err(InstallError::Network(format!(
                    "{}: unexpected HTTP status {other}",
                    task.label
                )));
            }
        }

        let total = match (status, resp.content_length()) {
            (StatusCode::PARTIAL_CONTENT, Some(len)) => Some(offset + len),
            (_, Some(len)) => Some(len),
            _ => remote_len,
        };

        let mut open = tokio::fs::OpenOptions::new();
        open.create(true);
        if resuming {
            open.append(true);
        } else {
            open.write(true).truncate(true);
        }
        let mut file = open.open(&partial).await?;

        let bar = match (self.show_progress, total) {
            (true, Some(total)) => {
                let pb = ProgressBar::new(total);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                        .unwrap()
                        .progress_chars("#>-"),
                );
                pb.set_position(offset);
                Some(pb)
            }
            _ => None,
        };

        let mut written = offset;
        let mut unflushed = 0u64;
        let mut last_pct = total.map(|t| offset * 100 / t.max(1)).unwrap_or(0);
        let mut last_logged = offset;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            unflushed += chunk.len() as u64;
            if unflushed >= FLUSH_INTERVAL {
                file.flush().await?;
                unflushed = 0;
            }
            if let Some(pb) = &bar {
                pb.set_position(written);
            }
            // Progress lands in the log at a bounded cadence, never per chunk.
            match total {
                Some(total) => {
                    let pct = written * 100 / total.max(1);
                    if pct >= last_pct + 5 || (pct == 100 && last_pct != 100) {
                        info!(
                            "  {pct}% ({}MB/{}MB)",
                            written / (1024 * 1024),
                            total / (1024 * 1024)
                        );
                        last_pct = pct;
                    }
                }
                None => {
                    if written - last_logged >= UNKNOWN_TOTAL_LOG_INTERVAL {
                        info!("  {}MB transferred", written / (1024 * 1024));
                        last_logged = written;
                    }
                }
            }
        }
        file.flush().await?;
        drop(file);
        if let Some(pb) = bar {
            pb.finish_and_clear();
        }

        // The size learned from this response outranks the HEAD estimate.
        self.finalize(task, total).await?;
        Ok(written - offset)
    }

    /// Verify the completed partial and promote it to the destination.
    ///
    /// A short partial is kept for a future resume; an overlong partial or
    /// a checksum mismatch is discarded so the retry starts clean.
    async fn finalize(&self, task: &DownloadTask, learned_len: Option<u64>) -> Result<()> {
        let partial = task.partial_path();
        let actual = tokio::fs::metadata(&partial).await?.len();

        if let Some(expected) = task.expected_len.or(learned_len) {
            if actual < expected {
                return Err(InstallError::Network(format!(
                    "{} incomplete ({actual} of {expected} bytes)",
                    task.label
                )));
            }
            if actual > expected {
                tokio::fs::remove_file(&partial).await.ok();
                return Err(InstallError::Network(format!(
                    "{} produced {actual} bytes, expected {expected}",
                    task.label
                )));
            }
        }
        if let Some(expected_sum) = &task.sha256 {
            let computed = file_sha256(&partial)?;
            if !computed.eq_ignore_ascii_case(expected_sum) {
                tokio::fs::remove_file(&partial).await.ok();
                return Err(InstallError::Network(format!(
                    "{} checksum mismatch: expected {expected_sum}, computed {computed}",
                    task.label
                )));
            }
        }

        tokio::fs::rename(&partial, &task.dest).await?;
        info!("saved {}", task.dest.display());
        Ok(())
    }
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_in(dir: &Path) -> DownloadTask {
        DownloadTask::new("http://unused.invalid/asset", dir.join("asset.bin"), "asset")
    }

    #[test]
    fn partial_path_appends_suffix() {
        let task = DownloadTask::new("http://x/y", "/tmp/a/model.gguf", "model");
        assert_eq!(task.partial_path(), PathBuf::from("/tmp/a/model.gguf.part"));
    }

    #[test]
    fn cache_check_rejects_empty_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(RetryPolicy::default()).unwrap();
        let task = task_in(dir.path());
        assert!(!downloader.is_cached(&task).unwrap());
        std::fs::write(&task.dest, b"").unwrap();
        assert!(!downloader.is_cached(&task).unwrap());
    }

    #[test]
    fn cache_check_honors_expected_length() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(RetryPolicy::default()).unwrap();
        let task = task_in(dir.path()).with_expected_len(4);
        std::fs::write(&task.dest, b"abcd").unwrap();
        assert!(downloader.is_cached(&task).unwrap());
        let short = task_in(dir.path()).with_expected_len(9);
        assert!(!downloader.is_cached(&short).unwrap());
    }

    #[test]
    fn cache_check_prefers_checksum_over_length() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(RetryPolicy::default()).unwrap();
        std::fs::write(dir.path().join("asset.bin"), b"abcd").unwrap();
        let sum = file_sha256(&dir.path().join("asset.bin")).unwrap();
        let good = task_in(dir.path()).with_sha256(sum);
        assert!(downloader.is_cached(&good).unwrap());
        let bad = task_in(dir.path()).with_sha256("00".repeat(32));
        assert!(!downloader.is_cached(&bad).unwrap());
    }

    #[test]
    fn incomplete_destination_is_demoted_to_partial() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(RetryPolicy::default()).unwrap();
        let task = task_in(dir.path()).with_expected_len(100);
        std::fs::write(&task.dest, b"half").unwrap();
        downloader.demote_incomplete_dest(&task).unwrap();
        assert!(!task.dest.exists());
        assert_eq!(std::fs::read(task.partial_path()).unwrap(), b"half");
    }

    #[test]
    fn demotion_keeps_the_larger_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(RetryPolicy::default()).unwrap();
        let task = task_in(dir.path()).with_expected_len(100);
        std::fs::write(&task.dest, b"larger-candidate").unwrap();
        std::fs::write(task.partial_path(), b"tiny").unwrap();
        downloader.demote_incomplete_dest(&task).unwrap();
        assert_eq!(
            std::fs::read(task.partial_path()).unwrap(),
            b"larger-candidate"
        );
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
