//! Health monitor tests

use std::sync::Arc;
use std::time::Duration;

use shipyard::deploy::fsm::DeploymentStatus;
use shipyard::deploy::manager::ManagerOptions;
use shipyard::deploy::tunnel::LocalTunnel;
use shipyard::errors::ShipyardError;
use shipyard::workers::health::{self, Tick};

use crate::support::{eventually, fast_options, harness, harness_with, python_bundle, FakeLauncher};

fn manual_options(max_restarts: u32) -> ManagerOptions {
    ManagerOptions {
        health: health::Options {
            // Long enough that the background monitor never ticks during a test
            interval: Duration::from_secs(3600),
            max_restarts,
        },
        ..fast_options()
    }
}

#[tokio::test]
async fn test_dead_unit_is_restarted() {
    let launcher = Arc::new(FakeLauncher::restartable());
    let h = harness(launcher.clone());
    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();

    let app = launcher.apps()[0].clone();
    app.kill().await;

    let manager = h.manager.clone();
    let id = deployed.id.clone();
    let recovered = eventually(Duration::from_secs(3), || {
        manager
            .status(&id)
            .map(|r| r.status == DeploymentStatus::Running && r.restart_count == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(recovered);
    assert_eq!(app.restarts(), 1);

    let body = reqwest::get(&deployed.public_url)
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, crate::support::GREETING);

    h.manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unrecoverable_unit_is_torn_down() {
    let launcher = Arc::new(FakeLauncher::default());
    let h = harness(launcher.clone());
    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();

    launcher.apps()[0].kill().await;

    // max_restarts = 2 at 100ms per tick
    let manager = h.manager.clone();
    let id = deployed.id.clone();
    let gone = eventually(Duration::from_secs(3), || {
        matches!(manager.status(&id), Err(ShipyardError::NotFound(_)))
    })
    .await;
    assert!(gone);
    assert_eq!(h.ports.leased_count(), 0);
    assert_eq!(h.staged_dirs(), 0);
}

#[tokio::test]
async fn test_restart_bound_is_reached_in_bound_plus_one_ticks() {
    let launcher = Arc::new(FakeLauncher::default());
    let h = harness_with(manual_options(2), launcher.clone(), Arc::new(LocalTunnel::default()));
    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();
    let options = h.manager.options().health.clone();

    assert_eq!(
        health::check(&options, &deployed.id, &h.manager).await,
        Tick::Healthy
    );

    launcher.apps()[0].kill().await;

    assert_eq!(
        health::check(&options, &deployed.id, &h.manager).await,
        Tick::RestartFailed
    );
    let record = h.manager.status(&deployed.id).unwrap();
    assert_eq!(record.status, DeploymentStatus::Degraded);
    assert_eq!(record.restart_count, 1);
    assert!(record.last_error.is_some());

    assert_eq!(
        health::check(&options, &deployed.id, &h.manager).await,
        Tick::RestartFailed
    );
    assert_eq!(h.manager.status(&deployed.id).unwrap().restart_count, 2);

    assert_eq!(
        health::check(&options, &deployed.id, &h.manager).await,
        Tick::TornDown
    );
    assert!(matches!(
        h.manager.status(&deployed.id),
        Err(ShipyardError::NotFound(_))
    ));
    assert_eq!(
        health::check(&options, &deployed.id, &h.manager).await,
        Tick::Gone
    );

    h.manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_monitor_never_restarts_after_undeploy() {
    let launcher = Arc::new(FakeLauncher::restartable());
    let h = harness_with(manual_options(3), launcher.clone(), Arc::new(LocalTunnel::default()));
    let deployed = h.manager.deploy(python_bundle(), None).await.unwrap();
    let options = h.manager.options().health.clone();

    h.manager.undeploy(&deployed.id).await.unwrap();

    assert_eq!(
        health::check(&options, &deployed.id, &h.manager).await,
        Tick::Gone
    );
    assert_eq!(launcher.apps()[0].restarts(), 0);

    h.manager.shutdown(Duration::from_secs(1)).await;
}
