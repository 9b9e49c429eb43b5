#![allow(clippy::unwrap_used)]

mod common;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;

use common::{FakeSpawner, RecordingPidSignaler, Script, TestPki, BUNDLE_FILE, KEY_FILE, SVID_FILE};
use spiffe_helper::config::{CommandConfig, JwtSvidEncoding, JwtSvidTarget};
use spiffe_helper::{
    AudienceKey, ChannelSource, JwtBundleUpdate, JwtSvidUpdate, RotationController,
    RotationError, Signal, SourceError,
};

#[tokio::test]
async fn writes_x509_files_and_exits_without_starting_the_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::x509_config(dir.path());
    config.daemon_mode = false;
    config.command = Some(CommandConfig::new("/bin/never-run", vec![]));

    let spawner = FakeSpawner::new([Script::Hang; 0]);
    let (tx, source) = ChannelSource::new();
    tx.send_x509(TestPki::new(1).update()).await.unwrap();

    let termination = RotationController::builder(Arc::new(config), source)
        .spawner(spawner.clone())
        .build()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(termination.exit_code(), 0);
    assert_eq!(spawner.spawned(), 0);

    let mut written: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    written.sort();
    assert_eq!(written, vec![SVID_FILE, BUNDLE_FILE, KEY_FILE]);
}

#[tokio::test]
async fn exit_when_ready_waits_for_every_jwt_target() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::x509_config(dir.path());
    config.x509 = None;
    config.exit_when_ready = true;
    config.jwt_bundle_file_name = Some("bundle.json".into());
    config.jwt_svids = vec![
        JwtSvidTarget {
            audience: AudienceKey::new("db", vec![]),
            file_name: "db.token".into(),
            encoding: JwtSvidEncoding::Raw,
        },
        JwtSvidTarget {
            audience: AudienceKey::new("cache", vec!["queue".into()]),
            file_name: "cache.token".into(),
            encoding: JwtSvidEncoding::Base64,
        },
    ];
    let config = Arc::new(config);

    let (tx, source) = ChannelSource::new();
    let controller = RotationController::builder(Arc::clone(&config), source).build();
    let health = controller.health();
    let run = tokio::spawn(controller.run(CancellationToken::new()));

    tx.send_jwt_svid(JwtSvidUpdate {
        audience: AudienceKey::new("db", vec![]),
        token: "db-token".into(),
    })
    .await
    .unwrap();
    let mut bundles = BTreeMap::new();
    bundles.insert("example.org".to_owned(), br#"{"keys":[]}"#.to_vec());
    tx.send_jwt_bundle(JwtBundleUpdate { bundles }).await.unwrap();

    common::eventually(|| dir.path().join("bundle.json").exists()).await;
    assert!(!run.is_finished());

    tx.send_jwt_svid(JwtSvidUpdate {
        audience: AudienceKey::new("cache", vec!["queue".into()]),
        token: "cache-token".into(),
    })
    .await
    .unwrap();

    let termination = run.await.unwrap().unwrap();
    assert_eq!(termination.exit_code(), 0);
    assert!(health.is_ready());

    assert_eq!(fs::read_to_string(dir.path().join("db.token")).unwrap(), "db-token");
    assert_eq!(
        fs::read_to_string(dir.path().join("cache.token")).unwrap(),
        STANDARD.encode("cache-token")
    );
    let bundle: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.path().join("bundle.json")).unwrap()).unwrap();
    assert_eq!(bundle["example.org"], STANDARD.encode(br#"{"keys":[]}"#));
}

#[tokio::test]
async fn stream_error_before_first_write_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::x509_config(dir.path());
    config.daemon_mode = false;

    let (tx, source) = ChannelSource::new();
    tx.fail_x509(SourceError::Unavailable("agent down".into()))
        .await
        .unwrap();

    let err = RotationController::builder(Arc::new(config), source)
        .build()
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RotationError::Source(SourceError::Unavailable(_))));
    assert!(!dir.path().join(SVID_FILE).exists());
}

#[tokio::test]
async fn closed_source_before_completion_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::x509_config(dir.path());
    config.daemon_mode = false;

    let (tx, source) = ChannelSource::new();
    drop(tx);

    let err = RotationController::builder(Arc::new(config), source)
        .build()
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RotationError::SourceClosed { stream: "x509" }));
}

#[tokio::test]
async fn write_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::x509_config(&dir.path().join("missing"));
    config.daemon_mode = false;

    let (tx, source) = ChannelSource::new();
    tx.send_x509(TestPki::new(10).update()).await.unwrap();

    let err = RotationController::builder(Arc::new(config), source)
        .build()
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RotationError::Write(_)));
}

#[tokio::test]
async fn cancellation_before_completion_reports_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::x509_config(dir.path());
    config.daemon_mode = false;

    let (_tx, source) = ChannelSource::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = RotationController::builder(Arc::new(config), source)
        .build()
        .run(cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, RotationError::Cancelled));
}

#[tokio::test]
async fn pid_file_process_is_signaled_after_write() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::x509_config(dir.path());
    config.daemon_mode = false;
    config.renew_signal = Some(Signal::Usr1);
    config.pid_file_name = Some(dir.path().join("app.pid"));

    let signaler = RecordingPidSignaler::new(4321);
    let (tx, source) = ChannelSource::new();
    tx.send_x509(TestPki::new(20).update()).await.unwrap();

    RotationController::builder(Arc::new(config), source)
        .pid_signaler(signaler.clone())
        .build()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(signaler.sent(), vec![(4321, Signal::Usr1)]);
}
