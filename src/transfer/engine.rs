//! Transfer state machine

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, info_span, warn, Instrument};

use super::archive::{name_difference, ArchiveUnpacker, Unpacker};
use super::config::{TransferConfig, CHUNK_SIZE, PARTIAL_SUFFIX};
use super::lock::TargetLock;
use super::progress::{ByteProgress, TransferObserver};
use super::request::{append_to_file_name, Credential, SourceLocator, TransferRequest};
use super::retry::format_retry;
use super::{TransferError, TransferResult, TransferState};
use crate::metrics::{record_redirect, record_retry_backoff, TransferMetrics};
use crate::shared_resources::global_transfer_client;
use crate::shutdown::{cancelled, get_global_shutdown, SharedShutdown};

/// Longest server message kept in error values
const MAX_ERROR_BODY: usize = 512;

/// Supplies fresh credentials after the server rejected the current ones
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Re-authenticate and return the credential to attach from now on
    async fn refresh(&self) -> TransferResult<Credential>;
}

/// How a successful transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Bytes were fetched and placed
    Downloaded,
    /// Target existed and the policy was `Skip`
    Skipped,
}

impl TransferStatus {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Downloaded => "downloaded",
            TransferStatus::Skipped => "skipped",
        }
    }
}

/// Result of a successful transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Final path of the product
    pub path: PathBuf,
    /// Downloaded or skipped
    pub status: TransferStatus,
    /// Bytes streamed by the successful attempt
    pub bytes: u64,
    /// Redirect hops of the successful attempt
    pub redirects: u32,
    /// Retries spent on transient failures
    pub retries: u32,
    /// Where a pre-existing target was moved under the `Backup` policy
    pub backup: Option<PathBuf>,
}

impl TransferOutcome {
    fn skipped(path: PathBuf) -> Self {
        Self {
            path,
            status: TransferStatus::Skipped,
            bytes: 0,
            redirects: 0,
            retries: 0,
            backup: None,
        }
    }
}

enum Plan {
    Skip,
    Proceed { backup: Option<PathBuf> },
}

/// In-flight file removed on drop unless committed
struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    async fn commit(mut self, dest: &Path) -> TransferResult<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Executes [`TransferRequest`]s
pub struct TransferEngine {
    client: Arc<Client>,
    config: TransferConfig,
    unpacker: Arc<dyn Unpacker>,
    shutdown: Option<SharedShutdown>,
    observer: Option<Arc<dyn TransferObserver>>,
}

impl TransferEngine {
    /// Engine on the shared transfer client, watching the global shutdown handle
    pub fn new(config: TransferConfig) -> Self {
        Self {
            client: global_transfer_client(),
            config,
            unpacker: Arc::new(ArchiveUnpacker),
            shutdown: get_global_shutdown(),
            observer: None,
        }
    }

    /// Use a specific HTTP client; it must not follow redirects itself
    pub fn with_client(mut self, client: Arc<Client>) -> Self {
        self.client = client;
        self
    }

    /// Replace the archive unpacker
    pub fn with_unpacker(mut self, unpacker: Arc<dyn Unpacker>) -> Self {
        self.unpacker = unpacker;
        self
    }

    /// Cancel transfers when `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Mirror progress to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Engine configuration
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Run one transfer to completion, cancellation or failure.
    ///
    /// `refresher` is consulted once per auth failure, up to
    /// `max_reauthentications` times.
    pub async fn execute(
        &self,
        request: TransferRequest,
        refresher: Option<&dyn CredentialRefresher>,
    ) -> TransferResult<TransferOutcome> {
        let target = request.target_path().to_path_buf();
        let metrics = TransferMetrics::start(request.label(), target.display().to_string());
        let span = info_span!(
            "transfer",
            target = %target.display(),
            provider = %request.label(),
            correlation_id = %metrics.correlation_id(),
        );

        let work = with_deadline(self.config.deadline, self.run(request, refresher));
        let result = async {
            tokio::select! {
                biased;
                _ = cancelled(self.shutdown.as_deref()) => {
                    Err(TransferError::Cancelled("shutdown requested".to_string()))
                }
                result = work => result,
            }
        }
        .instrument(span)
        .await;

        match &result {
            Ok(outcome) => {
                metrics.record_bytes(outcome.bytes);
                metrics.record_success(outcome.status.as_str());
            }
            Err(err) => {
                self.transition(&target, TransferState::Failed);
                metrics.record_failure(err.kind().as_str(), &err.to_string());
            }
        }
        if let Some(observer) = &self.observer {
            observer.on_finish(&target, result.is_ok());
        }
        result
    }

    async fn run(
        &self,
        mut request: TransferRequest,
        refresher: Option<&dyn CredentialRefresher>,
    ) -> TransferResult<TransferOutcome> {
        let target = request.target_path().to_path_buf();
        let mut lock = TargetLock::open(&target)?;
        let _guard = lock.try_acquire()?;

        let mut retries = 0u32;
        let mut reauthentications = 0u32;
        let mut backup = None;

        loop {
            self.transition(&target, TransferState::Planning);
            match plan(&request)? {
                Plan::Skip => return Ok(TransferOutcome::skipped(target)),
                Plan::Proceed { backup: moved } => {
                    if moved.is_some() {
                        backup = moved;
                    }
                }
            }

            let err = match self.attempt(&request).await {
                Ok(mut outcome) => {
                    outcome.retries = retries;
                    outcome.backup = backup;
                    if retries > 0 {
                        info!("Transfer succeeded after {} retries", retries);
                    }
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            if err.needs_reauthentication() && reauthentications < self.config.max_reauthentications {
                if let Some(refresher) = refresher {
                    warn!("{} - re-authenticating and restarting", err);
                    let credential = refresher.refresh().await?;
                    request.source_mut().replace_credential(credential);
                    reauthentications += 1;
                    continue;
                }
            }

            if err.is_retryable() {
                if retries < self.config.max_retries {
                    let backoff = self.config.backoff(retries);
                    retries += 1;
                    if let Some(class) = err.failure_class() {
                        warn!(
                            "{}",
                            format_retry(
                                retries,
                                self.config.max_retries,
                                class,
                                backoff,
                                &target.display().to_string()
                            )
                        );
                    }
                    debug!(error = %err, "Transient failure");
                    record_retry_backoff(request.label(), backoff, retries);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                if let Some(class) = err.failure_class() {
                    warn!("{}", class.suggestion());
                }
                return Err(TransferError::RetriesExhausted {
                    attempts: retries + 1,
                    source: Box::new(err),
                });
            }

            return Err(err);
        }
    }

    async fn attempt(&self, request: &TransferRequest) -> TransferResult<TransferOutcome> {
        let target = request.target_path();

        self.transition(target, TransferState::Requesting);
        let (response, redirects) = self.follow_redirects(request).await?;

        self.transition(target, TransferState::Streaming);
        let download_path = request.download_path();
        let bytes = self.stream_to_file(request, response, &download_path).await?;

        let path = match request.compression() {
            Some(_) => {
                self.transition(target, TransferState::Decompressing);
                self.unpack_and_reconcile(request, &download_path).await?
            }
            None => download_path,
        };

        self.transition(target, TransferState::Done);
        Ok(TransferOutcome {
            path,
            status: TransferStatus::Downloaded,
            bytes,
            redirects,
            retries: 0,
            backup: None,
        })
    }

    fn build(&self, source: &SourceLocator, url: Url) -> RequestBuilder {
        let mut builder = source.credential().apply(self.client.get(url));
        for (name, value) in source.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    /// Send the request, following up to `max_redirects` hops by hand
    async fn follow_redirects(&self, request: &TransferRequest) -> TransferResult<(Response, u32)> {
        let source = request.source();
        let first = source.url().to_string();
        let mut url = Url::parse(&first).map_err(|e| TransferError::InvalidRequest {
            url: first.clone(),
            message: e.to_string(),
        })?;
        let mut hops = 0u32;

        loop {
            let response = self
                .build(source, url.clone())
                .send()
                .await
                .map_err(|e| TransferError::from_reqwest(url.as_str(), e))?;
            let status = response.status();

            if is_redirect(status) {
                if hops >= self.config.max_redirects {
                    return Err(TransferError::RedirectLoop {
                        url: first,
                        hops: hops + 1,
                    });
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| TransferError::PermanentClient {
                        status: status.as_u16(),
                        url: url.to_string(),
                        message: "redirect without Location header".to_string(),
                    })?;
                let next = url.join(location).map_err(|e| TransferError::InvalidRequest {
                    url: location.to_string(),
                    message: e.to_string(),
                })?;

                hops += 1;
                self.transition(request.target_path(), TransferState::Redirecting);
                debug!(hop = hops, status = status.as_u16(), to = %next, "Following redirect");
                record_redirect(request.label());
                url = next;
                continue;
            }

            if status.is_success() {
                return Ok((response, hops));
            }

            let mut body = response.text().await.unwrap_or_default();
            body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
            return Err(TransferError::from_status(status, url.as_str(), body));
        }
    }

    /// Stream the body into `<dest>.part`, verify it, then rename to `dest`
    async fn stream_to_file(
        &self,
        request: &TransferRequest,
        response: Response,
        dest: &Path,
    ) -> TransferResult<u64> {
        let target = request.target_path();
        let url = response.url().to_string();
        let part = PartFile::new(append_to_file_name(dest, &format!(".{PARTIAL_SUFFIX}")));

        let file = tokio::fs::File::create(&part.path).await?;
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
        let mut hasher = request.expected_sha256().map(|_| Sha256::new());
        let mut progress = ByteProgress::new(response.content_length());
        if let Some(observer) = &self.observer {
            observer.on_start(target, progress.total);
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::from_reqwest(&url, e))?;
            writer.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            progress.update(chunk.len() as u64);
            if let Some(observer) = &self.observer {
                observer.on_bytes(target, chunk.len() as u64);
            }
            if progress.should_emit_update() {
                info!("Progress: {}", progress.format());
                progress.mark_emitted();
            }
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        self.transition(target, TransferState::Verifying);
        if let Some(expected) = progress.total {
            if progress.bytes < expected {
                return Err(TransferError::Transient {
                    status: None,
                    class: super::retry::FailureClass::NetworkGeneric,
                    url,
                    message: format!("body truncated at {} of {} bytes", progress.bytes, expected),
                });
            }
        }
        if let Some(expected) = request.expected_size() {
            if progress.bytes != expected {
                return Err(TransferError::VerificationMismatch {
                    what: "size",
                    expected: expected.to_string(),
                    actual: progress.bytes.to_string(),
                    archive: None,
                });
            }
        }
        if let (Some(expected), Some(hasher)) = (request.expected_sha256(), hasher) {
            let actual = format!("{:x}", hasher.finalize());
            if actual != expected {
                return Err(TransferError::VerificationMismatch {
                    what: "sha256",
                    expected: expected.to_string(),
                    actual,
                    archive: None,
                });
            }
        }

        if request.compression().is_none() {
            remove_existing(dest).await?;
        }
        part.commit(dest).await?;
        debug!(bytes = progress.bytes, path = %dest.display(), "Body written");
        Ok(progress.bytes)
    }

    /// Unpack next to the target, check the produced name, move it into place
    async fn unpack_and_reconcile(
        &self,
        request: &TransferRequest,
        archive: &Path,
    ) -> TransferResult<PathBuf> {
        let target = request.target_path().to_path_buf();
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let staging = tempfile::Builder::new()
            .prefix(".unpack-")
            .tempdir_in(&parent)?;

        let unpacker = self.unpacker.clone();
        let source = archive.to_path_buf();
        let dest = staging.path().to_path_buf();
        let produced = tokio::task::spawn_blocking(move || unpacker.unpack(&source, &dest))
            .await
            .map_err(|e| TransferError::Unpack {
                archive: archive.to_path_buf(),
                message: e.to_string(),
            })?
            .map_err(|e| TransferError::Unpack {
                archive: archive.to_path_buf(),
                message: e.to_string(),
            })?;

        let produced_name = produced
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let expected = request.expected_name().unwrap_or_default();
        let difference = name_difference(&expected, &produced_name);
        if difference > self.config.name_tolerance {
            warn!(
                expected = %expected,
                found = %produced_name,
                archive = %archive.display(),
                "Unpacked product name does not match, keeping archive"
            );
            return Err(TransferError::VerificationMismatch {
                what: "name",
                expected,
                actual: produced_name,
                archive: Some(archive.to_path_buf()),
            });
        }
        if difference > 0 {
            warn!("Renaming unpacked '{}' to '{}'", produced_name, expected);
        }

        remove_existing(&target).await?;
        tokio::fs::rename(&produced, &target).await?;
        tokio::fs::remove_file(archive).await?;
        drop(staging);
        Ok(target)
    }

    fn transition(&self, target: &Path, state: TransferState) {
        debug!(state = %state, target = %target.display(), "Transfer state");
        if let Some(observer) = &self.observer {
            observer.on_state(target, state);
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn plan(request: &TransferRequest) -> TransferResult<Plan> {
    let target = request.target_path();
    if std::fs::symlink_metadata(target).is_err() {
        return Ok(Plan::Proceed { backup: None });
    }

    match request.exists_policy() {
        super::ExistsPolicy::Skip => {
            info!("{} exists, skipping", target.display());
            Ok(Plan::Skip)
        }
        super::ExistsPolicy::Error => Err(TransferError::TargetExists(target.to_path_buf())),
        super::ExistsPolicy::Overwrite => {
            debug!("{} exists, will overwrite", target.display());
            Ok(Plan::Proceed { backup: None })
        }
        super::ExistsPolicy::Backup => {
            let backup = backup_path(target);
            std::fs::rename(target, &backup)?;
            info!("Moved existing {} to {}", target.display(), backup.display());
            Ok(Plan::Proceed {
                backup: Some(backup),
            })
        }
    }
}

/// First free `<name>.bak`, `<name>.bak.1`, ...
pub fn backup_path(target: &Path) -> PathBuf {
    let first = append_to_file_name(target, ".bak");
    if std::fs::symlink_metadata(&first).is_err() {
        return first;
    }
    (1u32..)
        .map(|n| append_to_file_name(target, &format!(".bak.{n}")))
        .find(|candidate| std::fs::symlink_metadata(candidate).is_err())
        .unwrap_or(first)
}

async fn remove_existing(path: &Path) -> TransferResult<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
        Ok(_) => tokio::fs::remove_file(path).await?,
        Err(_) => {}
    }
    Ok(())
}

async fn with_deadline<T, F>(deadline: Option<Duration>, work: F) -> TransferResult<T>
where
    F: Future<Output = TransferResult<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Cancelled(format!(
                "deadline of {:.1}s exceeded",
                limit.as_secs_f64()
            ))),
        },
        None => work.await,
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}
