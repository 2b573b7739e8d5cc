mod common;

use common::DuplexSpawner;
use elevate_contracts::{Action, ActionRequest};
use elevate_core::HelperManifest;
use elevate_core::helper::{
    HelperLauncher, HelperState, LaunchError, LauncherConfig, ProcessSpawner, SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;

fn test_manifest() -> Arc<HelperManifest> {
    Arc::new(HelperManifest::from_toml(common::MANIFEST).unwrap())
}

fn process_manifest(executable: &str, args: &[&str]) -> Arc<HelperManifest> {
    let args: Vec<String> = args.iter().map(|arg| format!("{arg:?}")).collect();
    let raw = format!(
        r#"
id = "org.test.process"
executable = "{executable}"
args = [{}]

[[actions]]
name = "org.test.noop"
policy = "yes"
"#,
        args.join(", ")
    );
    Arc::new(HelperManifest::from_toml(&raw).unwrap())
}

fn quick_config() -> LauncherConfig {
    LauncherConfig {
        handshake_timeout: Duration::from_millis(300),
        default_idle_timeout: Duration::from_millis(200),
        shutdown_grace: Duration::from_millis(100),
        reap_interval: Duration::from_millis(50),
    }
}

fn duplex_launcher() -> (Arc<HelperLauncher>, Arc<DuplexSpawner>) {
    let spawner = Arc::new(DuplexSpawner::default());
    let launcher = Arc::new(HelperLauncher::new(spawner.clone(), quick_config()));
    (launcher, spawner)
}

#[tokio::test]
async fn test_concurrent_acquires_share_one_spawn() {
    let (launcher, spawner) = duplex_launcher();
    let manifest = test_manifest();

    let leases = futures::future::join_all(
        (0..6).map(|_| launcher.acquire(manifest.clone())),
    )
    .await;

    let leases: Vec<_> = leases.into_iter().map(Result::unwrap).collect();
    assert_eq!(spawner.spawns(), 1);
    assert_eq!(launcher.spawn_count(), 1);
    assert!(leases
        .iter()
        .all(|lease| Arc::ptr_eq(lease.session(), leases[0].session())));
    assert_eq!(leases[0].session().in_flight(), 6);

    for lease in leases {
        launcher.release(lease);
    }
    let session = launcher.session(common::HELPER_ID).unwrap();
    assert_eq!(session.in_flight(), 0);
    assert!(session.idle_for().is_some());
}

#[tokio::test]
async fn test_session_announces_actions_and_dispatches() {
    let (launcher, _spawner) = duplex_launcher();

    let lease = launcher.acquire(test_manifest()).await.unwrap();
    assert!(lease.session().actions().iter().any(|name| name == "org.example.read"));

    let mut dispatched = lease.dispatch(ActionRequest::new(Action::new("org.example.read")));
    match dispatched.next_event().await {
        Some(SessionEvent::Reply(reply)) => assert!(reply.succeeded()),
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_status_reports_ready_helper() {
    let (launcher, _spawner) = duplex_launcher();

    let lease = launcher.acquire(test_manifest()).await.unwrap();
    let status = launcher.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].helper_id, common::HELPER_ID);
    assert_eq!(status[0].state, HelperState::Ready);
    assert_eq!(status[0].in_flight, 1);
    drop(lease);
}

#[tokio::test]
async fn test_reap_idle_removes_expired_sessions_only() {
    let (launcher, spawner) = duplex_launcher();
    let manifest = test_manifest();

    let lease = launcher.acquire(manifest.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(launcher.reap_idle().await, 0, "leased sessions are never idle");

    drop(lease);
    assert_eq!(launcher.reap_idle().await, 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(launcher.reap_idle().await, 1);
    assert!(launcher.status().is_empty());

    let _lease = launcher.acquire(manifest).await.unwrap();
    assert_eq!(spawner.spawns(), 2);
}

#[tokio::test]
async fn test_shutdown_refuses_new_acquires() {
    let (launcher, _spawner) = duplex_launcher();
    let manifest = test_manifest();

    let lease = launcher.acquire(manifest.clone()).await.unwrap();
    let session = lease.session().clone();
    drop(lease);

    launcher.shutdown().await;
    assert!(!session.is_alive());
    assert!(launcher.status().is_empty());
    assert_eq!(
        launcher.acquire(manifest).await.err(),
        Some(LaunchError::ShuttingDown)
    );
}

#[tokio::test]
async fn test_missing_executable_is_not_retried() {
    let launcher = HelperLauncher::new(Arc::new(ProcessSpawner), quick_config());

    let err = launcher
        .acquire(process_manifest("/nonexistent/elevate-helper", &[]))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, LaunchError::Spawn { .. }), "{err:?}");
    assert_eq!(launcher.spawn_count(), 1);
}

#[tokio::test]
async fn test_helper_exiting_before_handshake_is_retried_once() {
    let launcher = HelperLauncher::new(Arc::new(ProcessSpawner), quick_config());

    let err = launcher
        .acquire(process_manifest("/bin/sh", &["-c", "exit 0"]))
        .await
        .err()
        .unwrap();

    assert!(err.is_transient(), "{err:?}");
    assert_eq!(launcher.spawn_count(), 2);
    assert!(launcher.status().is_empty());
}

#[tokio::test]
async fn test_silent_helper_times_out_handshake() {
    let launcher = HelperLauncher::new(Arc::new(ProcessSpawner), quick_config());

    let err = launcher
        .acquire(process_manifest("/bin/sleep", &["10"]))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, LaunchError::HandshakeTimeout { .. }), "{err:?}");
    assert_eq!(launcher.spawn_count(), 2);
}

#[tokio::test]
async fn test_protocol_violation_is_not_retried() {
    let launcher = HelperLauncher::new(Arc::new(ProcessSpawner), quick_config());

    // cat echoes our own handshake request back.
    let err = launcher
        .acquire(process_manifest("/bin/cat", &[]))
        .await
        .err()
        .unwrap();

    assert!(
        matches!(err, LaunchError::Handshake { transient: false, .. }),
        "{err:?}"
    );
    assert_eq!(launcher.spawn_count(), 1);
}
