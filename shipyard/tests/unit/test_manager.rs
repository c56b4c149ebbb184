//! Deployment lifecycle tests

use std::sync::Arc;
use std::time::Duration;

use shipyard::deploy::bundle::{Bundle, BundleFile, DeployMode};
use shipyard::deploy::fsm::DeploymentStatus;
use shipyard::deploy::manager::ManagerOptions;
use shipyard::deploy::probe::ProbeOptions;
use shipyard::deploy::process::{SubprocessLauncher, SubprocessOptions};
use shipyard::deploy::stager::EntryRules;
use shipyard::deploy::tunnel::LocalTunnel;
use shipyard::errors::ShipyardError;
use tokio_test::{assert_err, assert_ok};

use crate::support::{
    eventually, fast_options, harness, harness_with, python_bundle, BrokenTunnel, FakeLauncher, Harness,
    GREETING,
};

// ============================== HAPPY PATH ====================================== //

#[tokio::test]
async fn test_deploy_serves_bundle_behind_public_url() {
    let launcher = Arc::new(FakeLauncher::default());
    let h = harness(launcher.clone());

    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();
    assert_eq!(deployed.status, DeploymentStatus::Running);
    assert_eq!(deployed.public_url, format!("http://127.0.0.1:{}", deployed.port));

    let body = reqwest::get(&deployed.public_url)
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, GREETING);

    let record = h.manager.status(&deployed.id).unwrap();
    assert_eq!(record.status, DeploymentStatus::Running);
    assert_eq!(record.mode, DeployMode::Subprocess);
    assert_eq!(record.public_url.as_deref(), Some(deployed.public_url.as_str()));
    assert_eq!(record.bundle_digest, python_bundle().digest());
    assert!(record.work_dir.join("utils/helpers.py").is_file());
    assert!(h.ports.is_leased(deployed.port));

    h.manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_concurrent_deploys_get_distinct_ports_and_ids() {
    let h = harness(Arc::new(FakeLauncher::default()));

    let (a, b) = tokio::join!(
        h.manager.deploy(python_bundle(), None),
        h.manager.deploy(python_bundle(), Some(DeployMode::Container)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.id, b.id);
    assert_ne!(a.port, b.port);
    assert_ne!(
        h.manager.status(&a.id).unwrap().work_dir,
        h.manager.status(&b.id).unwrap().work_dir
    );

    let list = h.manager.list();
    assert_eq!(list.len(), 2);
    assert!(list.iter().all(|r| r.status == DeploymentStatus::Running));

    h.manager.shutdown(Duration::from_secs(1)).await;
}

// =============================== TEARDOWN ======================================= //

#[tokio::test]
async fn test_undeploy_releases_everything() {
    let launcher = Arc::new(FakeLauncher::default());
    let h = harness(launcher.clone());

    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();
    let work_dir = h.manager.status(&deployed.id).unwrap().work_dir;

    let stopped = h.manager.undeploy(&deployed.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);

    assert!(matches!(
        h.manager.status(&deployed.id),
        Err(ShipyardError::NotFound(_))
    ));
    assert!(!work_dir.exists());
    assert!(!h.ports.is_leased(deployed.port));
    assert!(launcher.apps()[0].is_stopped());
    assert!(reqwest::get(&deployed.public_url).await.is_err());
}

#[tokio::test]
async fn test_second_undeploy_is_not_found() {
    let h = harness(Arc::new(FakeLauncher::default()));
    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();

    assert_ok!(h.manager.undeploy(&deployed.id).await);
    assert_err!(h.manager.status(&deployed.id));
    assert!(matches!(
        h.manager.undeploy(&deployed.id).await,
        Err(ShipyardError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.undeploy("no-such-id").await,
        Err(ShipyardError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_teardowns_collapse_to_one() {
    let launcher = Arc::new(FakeLauncher::default());
    let h = harness(launcher.clone());
    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();

    let (a, b) = tokio::join!(
        h.manager.teardown(&deployed.id),
        h.manager.teardown(&deployed.id),
    );
    assert!(a.is_ok());
    assert!(b.is_ok() || matches!(b, Err(ShipyardError::NotFound(_))));
    assert!(h.manager.list().is_empty());
    assert_eq!(h.ports.leased_count(), 0);
}

#[tokio::test]
async fn test_released_port_can_be_reused() {
    let h = harness(Arc::new(FakeLauncher::default()));
    let first = h.manager.deploy(python_bundle(), None).await.unwrap();
    h.manager.undeploy(&first.id).await.unwrap();

    let second = h.manager.deploy(python_bundle(), None).await.unwrap();
    assert_eq!(h.manager.list().len(), 1);
    assert_eq!(h.ports.leased_count(), 1);
    assert!(h.ports.is_leased(second.port));

    h.manager.shutdown(Duration::from_secs(1)).await;
}

// =========================== PROVISIONING FAILURES =============================== //

#[tokio::test]
async fn test_bundle_without_entry_is_rejected() {
    let launcher = Arc::new(FakeLauncher::default());
    let h = harness(launcher.clone());
    let bundle = Bundle::new(vec![BundleFile::new("notes.txt", "no code here")]);

    let err = h.manager.deploy(bundle, None).await.unwrap_err();
    assert!(matches!(err, ShipyardError::BundleInvalid(_)));
    assert_eq!(h.staged_dirs(), 0);
    assert!(h.manager.list().is_empty());
    assert!(launcher.apps().is_empty());
    assert_eq!(h.ports.leased_count(), 0);
}

#[tokio::test]
async fn test_tunnel_failure_tears_down_launched_unit() {
    let launcher = Arc::new(FakeLauncher::default());
    let h = harness_with(fast_options(), launcher.clone(), Arc::new(BrokenTunnel));

    let err = h.manager.deploy(python_bundle(), None).await.unwrap_err();
    assert!(matches!(err, ShipyardError::TunnelUnavailable(_)));
    assert!(h.manager.list().is_empty());
    assert_eq!(h.staged_dirs(), 0);
    assert_eq!(h.ports.leased_count(), 0);
    assert!(launcher.apps()[0].is_stopped());
}

fn script_harness(install_command: &[&str], readiness_timeout: Duration) -> Harness {
    let options = ManagerOptions {
        readiness: ProbeOptions {
            timeout: readiness_timeout,
            interval: Duration::from_millis(50),
            ..Default::default()
        },
        entry_rules: EntryRules {
            preferred_stems: vec!["app".to_string()],
            extension: "sh".to_string(),
        },
        ..fast_options()
    };
    let launcher = SubprocessLauncher::new(SubprocessOptions {
        install_command: install_command.iter().map(|s| s.to_string()).collect(),
        install_timeout: Duration::from_secs(10),
        run_command: vec!["sh".to_string(), "{entry}".to_string()],
        ..Default::default()
    });
    harness_with(options, Arc::new(launcher), Arc::new(LocalTunnel::default()))
}

#[cfg(unix)]
#[tokio::test]
async fn test_crash_is_reported_as_crash_not_timeout() {
    let h = script_harness(&["true"], Duration::from_secs(20));
    let bundle = Bundle::new(vec![BundleFile::new(
        "app.sh",
        "echo starting up\necho boom >&2\nexit 3\n",
    )]);

    let started = std::time::Instant::now();
    let err = h.manager.deploy(bundle, None).await.unwrap_err();
    match err {
        ShipyardError::CrashedEarly { logs } => assert!(logs.contains("boom"), "logs: {logs}"),
        other => panic!("expected crash, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(h.manager.list().is_empty());
    assert_eq!(h.staged_dirs(), 0);
    assert_eq!(h.ports.leased_count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_dependency_failure_leaves_no_record() {
    let h = script_harness(
        &["sh", "-c", "echo no such package >&2; exit 1"],
        Duration::from_secs(5),
    );
    let bundle = Bundle::new(vec![
        BundleFile::new("app.sh", "exec sleep 30\n"),
        BundleFile::new("requirements.txt", "not-a-real-package==0.0\n"),
    ]);

    let err = h.manager.deploy(bundle, None).await.unwrap_err();
    match err {
        ShipyardError::DependencyInstallFailed { logs, .. } => {
            assert!(logs.contains("no such package"))
        }
        other => panic!("expected install failure, got {other:?}"),
    }
    assert!(h.manager.list().is_empty());
    assert_eq!(h.staged_dirs(), 0);
    assert_eq!(h.ports.leased_count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_silent_unit_times_out_and_is_stopped() {
    let h = script_harness(&["true"], Duration::from_millis(500));
    let bundle = Bundle::new(vec![BundleFile::new(
        "app.sh",
        "echo never listening\nexec sleep 30\n",
    )]);

    let err = h.manager.deploy(bundle, None).await.unwrap_err();
    match err {
        ShipyardError::ReadinessTimeout { logs, .. } => {
            assert!(logs.contains("never listening"), "logs: {logs}")
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(h.manager.list().is_empty());
    assert_eq!(h.ports.leased_count(), 0);
}

// ================================ OPERATIONS ==================================== //

#[tokio::test]
async fn test_logs() {
    let h = harness(Arc::new(FakeLauncher::default()));
    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();

    let logs = h.manager.logs(&deployed.id, 10).await.unwrap();
    assert!(logs.contains(&deployed.port.to_string()));

    assert!(matches!(
        h.manager.logs("missing", 10).await,
        Err(ShipyardError::NotFound(_))
    ));

    h.manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_tears_down_everything_and_refuses_new_work() {
    let launcher = Arc::new(FakeLauncher::default());
    let h = harness(launcher.clone());
    h.manager.deploy(python_bundle(), None).await.unwrap();
    h.manager.deploy(python_bundle(), None).await.unwrap();

    h.manager.shutdown(Duration::from_secs(1)).await;

    assert!(h.manager.list().is_empty());
    assert_eq!(h.ports.leased_count(), 0);
    assert_eq!(h.staged_dirs(), 0);
    assert!(launcher.apps().iter().all(|app| app.is_stopped()));
    assert!(matches!(
        h.manager.deploy(python_bundle(), None).await,
        Err(ShipyardError::ShuttingDown)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_aborts_deploy_stuck_in_readiness() {
    let h = script_harness(&["true"], Duration::from_secs(30));
    let bundle = Bundle::new(vec![BundleFile::new("app.sh", "exec sleep 30\n")]);

    let manager = h.manager.clone();
    let pending = tokio::spawn(async move { manager.deploy(bundle, None).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.manager.shutdown(Duration::from_secs(5)).await;
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ShipyardError::ShuttingDown)));
    assert!(h.manager.list().is_empty());
    assert_eq!(h.ports.leased_count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_undeploy_during_readiness_cancels_deploy() {
    let h = script_harness(&["true"], Duration::from_secs(30));
    let bundle = Bundle::new(vec![BundleFile::new("app.sh", "exec sleep 30\n")]);

    let manager = h.manager.clone();
    let pending = tokio::spawn(async move { manager.deploy(bundle, None).await });

    let manager = h.manager.clone();
    let launched = eventually(Duration::from_secs(5), || {
        manager
            .list()
            .first()
            .is_some_and(|r| r.status == DeploymentStatus::Provisioning && r.runtime.is_some())
    })
    .await;
    assert!(launched);

    let id = h.manager.list()[0].id.clone();
    let stopped = h.manager.undeploy(&id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);

    let result = pending.await.unwrap();
    match result {
        Err(ShipyardError::Cancelled(cancelled)) => assert_eq!(cancelled, id),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(h.manager.list().is_empty());
    assert_eq!(h.staged_dirs(), 0);
    assert_eq!(h.ports.leased_count(), 0);
}
