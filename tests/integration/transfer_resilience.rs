//! Transfer engine behavior against stub servers: redirects, retries,
//! re-authentication, existing-target policies and unpacking

use async_trait::async_trait;
use httpmock::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use satellite_data_downloader::transfer::{
    Credential, CredentialRefresher, ExistsPolicy, SourceLocator, TransferEngine, TransferError,
    TransferRequest, TransferStatus,
};
use satellite_data_downloader::shutdown::ShutdownCoordinator;
use satellite_data_downloader::ErrorKind;

use crate::common::{fast_config, zip_bytes};

/// Mocks `/{prefix}0 -> /{prefix}1 -> ... -> /{prefix}{hops-1} -> /file`
fn redirect_chain<'a>(server: &'a MockServer, prefix: &str, hops: u32) -> Vec<httpmock::Mock<'a>> {
    (0..hops)
        .map(|i| {
            let next = if i + 1 == hops {
                "/file".to_string()
            } else {
                format!("/{prefix}{}", i + 1)
            };
            server.mock(|when, then| {
                when.method(GET).path(format!("/{prefix}{i}"));
                then.status(302).header("Location", next.as_str());
            })
        })
        .collect()
}

fn engine() -> TransferEngine {
    TransferEngine::new(fast_config())
}

#[tokio::test]
async fn test_five_redirects_then_success() {
    let server = MockServer::start();
    let _chain = redirect_chain(&server, "hop", 5);
    let file = server.mock(|when, then| {
        when.method(GET).path("/file");
        then.status(200).body("payload");
    });

    let dir = TempDir::new().unwrap();
    let request = TransferRequest::new(dir.path().join("product.bin"), SourceLocator::new(server.url("/hop0")));
    let outcome = engine().execute(request, None).await.unwrap();

    file.assert();
    assert_eq!(outcome.redirects, 5);
    assert_eq!(outcome.status, TransferStatus::Downloaded);
    assert_eq!(std::fs::read_to_string(dir.path().join("product.bin")).unwrap(), "payload");
}

#[tokio::test]
async fn test_six_redirects_is_a_loop() {
    let server = MockServer::start();
    let _chain = redirect_chain(&server, "loop", 6);
    let file = server.mock(|when, then| {
        when.method(GET).path("/file");
        then.status(200).body("payload");
    });

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("product.bin");
    let request = TransferRequest::new(&target, SourceLocator::new(server.url("/loop0")));
    let err = engine().execute(request, None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RedirectLoop);
    assert_eq!(file.hits(), 0);
    assert!(!target.exists());
}

#[tokio::test]
async fn test_server_errors_are_retried_with_backoff() {
    let server = MockServer::start();
    let flaky = server.mock(|when, then| {
        when.method(GET).path("/flaky");
        then.status(503).body("maintenance");
    });

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("product.bin");
    let request = TransferRequest::new(&target, SourceLocator::new(server.url("/flaky")));
    let err = engine().execute(request, None).await.unwrap_err();

    // initial attempt + max_retries (2)
    assert_eq!(flaky.hits(), 3);
    assert_eq!(err.kind(), ErrorKind::TransientServerError);
    assert!(matches!(err, TransferError::RetriesExhausted { attempts: 3, .. }));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start();
    let gone = server.mock(|when, then| {
        when.method(GET).path("/gone");
        then.status(400).body("bad product id");
    });

    let dir = TempDir::new().unwrap();
    let request = TransferRequest::new(dir.path().join("x"), SourceLocator::new(server.url("/gone")));
    let err = engine().execute(request, None).await.unwrap_err();

    assert_eq!(gone.hits(), 1);
    assert_eq!(err.kind(), ErrorKind::PermanentClientError);
    assert!(err.to_string().contains("bad product id"));
}

struct CountingRefresher {
    calls: AtomicU32,
}

#[async_trait]
impl CredentialRefresher for CountingRefresher {
    async fn refresh(&self) -> Result<Credential, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::Bearer("fresh".to_string()))
    }
}

#[tokio::test]
async fn test_auth_failure_refreshes_once_and_restarts() {
    let server = MockServer::start();
    let stale = server.mock(|when, then| {
        when.method(GET).path("/protected").header("Authorization", "Bearer stale");
        then.status(401).body("token expired");
    });
    let fresh = server.mock(|when, then| {
        when.method(GET).path("/protected").header("Authorization", "Bearer fresh");
        then.status(200).body("granted");
    });

    let dir = TempDir::new().unwrap();
    let request = TransferRequest::new(
        dir.path().join("product.bin"),
        SourceLocator::new(server.url("/protected")).with_credential(Credential::Bearer("stale".to_string())),
    );
    let refresher = CountingRefresher { calls: AtomicU32::new(0) };
    let outcome = engine().execute(request, Some(&refresher)).await.unwrap();

    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(stale.hits(), 1);
    assert_eq!(fresh.hits(), 1);
    assert_eq!(outcome.bytes, "granted".len() as u64);
}

#[tokio::test]
async fn test_auth_failure_after_refresh_is_surfaced() {
    let server = MockServer::start();
    let denied = server.mock(|when, then| {
        when.method(GET).path("/denied");
        then.status(403).body("forbidden");
    });

    let dir = TempDir::new().unwrap();
    let request = TransferRequest::new(dir.path().join("x"), SourceLocator::new(server.url("/denied")));
    let refresher = CountingRefresher { calls: AtomicU32::new(0) };
    let err = engine().execute(request, Some(&refresher)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthenticationError);
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(denied.hits(), 2);
}

#[tokio::test]
async fn test_exists_policies() {
    let server = MockServer::start();
    let body = server.mock(|when, then| {
        when.method(GET).path("/product");
        then.status(200).body("new content");
    });
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("product.bin");
    let request = |policy| {
        TransferRequest::new(&target, SourceLocator::new(server.url("/product"))).with_exists_policy(policy)
    };

    std::fs::write(&target, "old content").unwrap();

    let skipped = engine().execute(request(ExistsPolicy::Skip), None).await.unwrap();
    assert_eq!(skipped.status, TransferStatus::Skipped);
    assert_eq!(body.hits(), 0);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "old content");

    let err = engine().execute(request(ExistsPolicy::Error), None).await.unwrap_err();
    assert!(matches!(err, TransferError::TargetExists(_)));
    assert_eq!(body.hits(), 0);

    let replaced = engine().execute(request(ExistsPolicy::Overwrite), None).await.unwrap();
    assert_eq!(replaced.status, TransferStatus::Downloaded);
    assert_eq!(body.hits(), 1);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "new content");

    let backed_up = engine().execute(request(ExistsPolicy::Backup), None).await.unwrap();
    assert_eq!(body.hits(), 2);
    let backup = backed_up.backup.expect("previous file moved aside");
    assert_eq!(std::fs::read_to_string(backup).unwrap(), "new content");
}

#[tokio::test]
async fn test_zip_is_unpacked_into_target() {
    let server = MockServer::start();
    let archive = zip_bytes(&[
        ("S2A_MSIL1C_TEST.SAFE/manifest.safe", b"<xml/>"),
        ("S2A_MSIL1C_TEST.SAFE/GRANULE/B01.jp2", b"band"),
    ]);
    server.mock(|when, then| {
        when.method(GET).path("/archive");
        then.status(200).body(archive.clone());
    });

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("S2A_MSIL1C_TEST.SAFE");
    let request = TransferRequest::new(&target, SourceLocator::new(server.url("/archive"))).with_compression(".zip");
    let outcome = engine().execute(request, None).await.unwrap();

    assert_eq!(outcome.path, target);
    assert!(target.join("manifest.safe").is_file());
    assert!(target.join("GRANULE/B01.jp2").is_file());
    assert!(!dir.path().join("S2A_MSIL1C_TEST.SAFE.zip").exists());
}

#[tokio::test]
async fn test_small_name_drift_is_renamed() {
    let server = MockServer::start();
    // One character differs from the expected product name
    let archive = zip_bytes(&[("LC08_L1TP_114066_20230721_02_T2/MTL.txt", b"meta")]);
    server.mock(|when, then| {
        when.method(GET).path("/drift");
        then.status(200).body(archive.clone());
    });

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("LC08_L1TP_114066_20230721_02_T1");
    let request = TransferRequest::new(&target, SourceLocator::new(server.url("/drift"))).with_compression(".zip");
    let outcome = engine().execute(request, None).await.unwrap();

    assert_eq!(outcome.path, target);
    assert!(target.join("MTL.txt").is_file());
}

#[tokio::test]
async fn test_unexpected_product_keeps_archive() {
    let server = MockServer::start();
    let archive = zip_bytes(&[("SOMETHING_ELSE/file.txt", b"x")]);
    server.mock(|when, then| {
        when.method(GET).path("/wrong");
        then.status(200).body(archive.clone());
    });

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("S2B_MSIL2A_EXPECTED");
    let request = TransferRequest::new(&target, SourceLocator::new(server.url("/wrong"))).with_compression(".zip");
    let err = engine().execute(request, None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::VerificationMismatch);
    assert!(!target.exists());
    assert!(dir.path().join("S2B_MSIL2A_EXPECTED.zip").is_file());
}

#[tokio::test]
async fn test_shutdown_mid_transfer_leaves_no_files() {
    let server = MockServer::start();
    let slow = server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200)
            .body(vec![7u8; 64 * 1024])
            .delay(std::time::Duration::from_millis(500));
    });

    let shutdown = ShutdownCoordinator::shared();
    let engine = engine().with_shutdown(shutdown.clone());
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("product.bin");
    let request = TransferRequest::new(&target, SourceLocator::new(server.url("/slow")));

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        shutdown.request_shutdown();
    });
    let started = std::time::Instant::now();
    let err = engine.execute(request, None).await.unwrap_err();
    trigger.await.unwrap();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < std::time::Duration::from_millis(450));
    assert!(slow.hits() <= 1);
    assert!(!target.exists());
    assert!(!dir.path().join("product.bin.part").exists());
}
