mod helpers;

use pinshare::tofu::{ExpectedFingerprint, TlsProbe, TrustStatus, TrustVerifier};
use pinshare::{ServerIdentity, TransferClient, TrustError, TrustStore};
use tempfile::TempDir;

use helpers::{saved_files, start_server};

fn verifier(dir: &TempDir) -> TrustVerifier {
    TrustVerifier::new(
        TrustStore::new(dir.path().join("trusted")),
        TlsProbe::new().unwrap(),
    )
}

#[tokio::test]
async fn test_check_reports_presented_fingerprint() {
    let server = start_server().await;
    let client_dir = tempfile::tempdir().unwrap();
    let verifier = verifier(&client_dir);

    let presented = verifier.check(&server.identity).await.unwrap();
    assert_eq!(presented, server.fingerprint);

    let status = verifier.status(&server.identity).await.unwrap();
    assert_eq!(
        status,
        TrustStatus::Untrusted {
            presented: server.fingerprint.clone()
        }
    );
    assert!(!verifier.is_trusted(&server.identity).await);
}

#[tokio::test]
async fn test_trust_then_upload() {
    let server = start_server().await;
    let client_dir = tempfile::tempdir().unwrap();
    let verifier = verifier(&client_dir);

    let record = verifier
        .trust(&server.identity, &|_: &str| true)
        .await
        .unwrap();
    assert_eq!(record.fingerprint, server.fingerprint);
    assert!(verifier.is_trusted(&server.identity).await);

    let a = client_dir.path().join("a.txt");
    let b = client_dir.path().join("b.txt");
    std::fs::write(&a, "alpha").unwrap();
    std::fs::write(&b, "bravo").unwrap();

    let client = TransferClient::new(verifier);
    let receipt = client.upload(&server.identity, &[a, b]).await.unwrap();
    assert_eq!(receipt.files, 2);
    assert_eq!(receipt.bytes, 10);
    assert!(receipt.message.starts_with("Files uploaded successfully"));

    let files = saved_files(&server.upload_dir);
    assert_eq!(files.len(), 2);
    assert!(files.iter().any(|f| f.ends_with("a.txt")));
    assert!(files.iter().any(|f| f.ends_with("b.txt")));
}

#[tokio::test]
async fn test_expected_fingerprint_confirms_non_interactively() {
    let server = start_server().await;
    let client_dir = tempfile::tempdir().unwrap();
    let verifier = verifier(&client_dir);

    let wrong = ExpectedFingerprint::new(&"0".repeat(64));
    let err = verifier.trust(&server.identity, &wrong).await.unwrap_err();
    assert!(matches!(err, TrustError::NotConfirmed { .. }));
    assert!(verifier.store().lookup(&server.identity).unwrap().is_none());

    let right = ExpectedFingerprint::new(&server.fingerprint.to_uppercase());
    verifier.trust(&server.identity, &right).await.unwrap();
    assert!(verifier.is_trusted(&server.identity).await);
}

#[tokio::test]
async fn test_second_trust_is_already_trusted() {
    let server = start_server().await;
    let client_dir = tempfile::tempdir().unwrap();
    let verifier = verifier(&client_dir);

    verifier
        .trust(&server.identity, &|_: &str| true)
        .await
        .unwrap();
    let err = verifier
        .trust(&server.identity, &|_: &str| true)
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::AlreadyTrusted { .. }));
}

#[tokio::test]
async fn test_changed_certificate_blocks_upload() {
    let first = start_server().await;
    let second = start_server().await;
    let client_dir = tempfile::tempdir().unwrap();
    let verifier = verifier(&client_dir);

    // Pretend the second server used to present the first one's certificate
    verifier
        .store()
        .save(&second.identity, first.certificate.clone())
        .unwrap();

    let status = verifier.status(&second.identity).await.unwrap();
    assert!(matches!(status, TrustStatus::Changed { .. }));
    assert!(!verifier.is_trusted(&second.identity).await);

    let file = client_dir.path().join("secret.txt");
    std::fs::write(&file, "secret").unwrap();

    let client = TransferClient::new(verifier);
    let err = client.upload(&second.identity, &[file]).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrustError>(),
        Some(TrustError::FingerprintMismatch { .. })
    ));
    assert!(!second.upload_dir.exists() || saved_files(&second.upload_dir).is_empty());
}

#[tokio::test]
async fn test_unreachable_server() {
    let client_dir = tempfile::tempdir().unwrap();
    let verifier = verifier(&client_dir);

    // Bind then drop to find a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let identity = ServerIdentity::new("127.0.0.1", port);

    let err = verifier.check(&identity).await.unwrap_err();
    assert!(matches!(err, TrustError::Unreachable { .. }));
    assert!(!verifier.is_trusted(&identity).await);
}
