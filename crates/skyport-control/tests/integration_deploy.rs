//! Integration tests for deploy, release and retention.

mod common;

use std::sync::Arc;

use common::{fixtures::RequestBuilder, TestControl};
use skyport_control::backend::InjectedFailure;
use skyport_control::config::MemoryConfig;
use skyport_control::{
    AppName, ControlError, DeploymentFilter, DeploymentStore, FileStore, PersistedState,
};

fn weights(control: &TestControl) -> Vec<(String, u8)> {
    let snapshot = control.backend.snapshot().unwrap();
    assert_eq!(snapshot.listeners.len(), 1, "{:?}", snapshot.listeners);
    snapshot.listeners[0]
        .default_action
        .iter()
        .map(|t| (t.id.clone(), t.weight))
        .collect()
}

#[tokio::test]
async fn blue_green_release_shifts_all_traffic() {
    let control = TestControl::new();

    let blue = control
        .manager
        .deploy(RequestBuilder::new("web").with_image("web:1").build())
        .await
        .unwrap();
    assert_eq!(blue.state, PersistedState::Deployed);
    let blue_tg = blue.data.resources.target_group.clone().unwrap();

    let first = control.manager.release(&blue.data.id).await.unwrap();
    assert!(first.url.starts_with("http://web-lb-"), "{}", first.url);
    assert_eq!(weights(&control), vec![(blue_tg.clone(), 100)]);

    let green = control
        .manager
        .deploy(RequestBuilder::new("web").with_image("web:2").build())
        .await
        .unwrap();
    let green_tg = green.data.resources.target_group.clone().unwrap();
    assert_ne!(blue_tg, green_tg);

    let second = control.manager.release(&green.data.id).await.unwrap();

    // Same load balancer, same listener, rewritten weights.
    assert_eq!(second.url, first.url);
    assert_eq!(second.listener, first.listener);
    assert_eq!(weights(&control), vec![(blue_tg, 0), (green_tg, 100)]);

    let blue = control.manager.get(&blue.data.id).await.unwrap();
    assert_eq!(blue.state, PersistedState::Deployed);
    assert!(blue.data.release.is_none());

    let released = control
        .store
        .get_released(&AppName::new("web"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(released.data.id, green.data.id);
}

#[tokio::test]
async fn release_after_destroying_the_release_keeps_the_listener() {
    let control = TestControl::new();
    let mut ids = Vec::new();
    for image in ["web:1", "web:2"] {
        let record = control
            .manager
            .deploy(RequestBuilder::new("web").with_image(image).build())
            .await
            .unwrap();
        control.manager.release(&record.data.id).await.unwrap();
        ids.push(record);
    }
    let (blue, green) = (&ids[0], &ids[1]);
    let blue_tg = blue.data.resources.target_group.clone().unwrap();
    let before = control.backend.snapshot().unwrap();

    control.manager.destroy(&green.data.id).await.unwrap();
    assert_eq!(weights(&control), vec![(blue_tg.clone(), 100)]);

    let next = control
        .manager
        .deploy(RequestBuilder::new("web").with_image("web:3").build())
        .await
        .unwrap();
    let next_tg = next.data.resources.target_group.clone().unwrap();
    let release = control.manager.release(&next.data.id).await.unwrap();

    let snapshot = control.backend.snapshot().unwrap();
    assert_eq!(snapshot.load_balancers, before.load_balancers);
    assert_eq!(weights(&control), vec![(blue_tg, 0), (next_tg, 100)]);
    assert_eq!(release.listener.as_deref(), Some(before.listeners[0].id.as_str()));
}

#[tokio::test]
async fn release_after_destroying_everything_reuses_the_load_balancer() {
    let control = TestControl::new();
    let first = control
        .manager
        .deploy(RequestBuilder::new("web").build())
        .await
        .unwrap();
    let url = control.manager.release(&first.data.id).await.unwrap().url;
    control.manager.destroy(&first.data.id).await.unwrap();
    assert!(control.backend.snapshot().unwrap().listeners.is_empty());

    let second = control
        .manager
        .deploy(RequestBuilder::new("web").build())
        .await
        .unwrap();
    let release = control.manager.release(&second.data.id).await.unwrap();

    assert_eq!(release.url, url);
    assert_eq!(control.backend.snapshot().unwrap().load_balancers.len(), 1);
    assert_eq!(
        weights(&control),
        vec![(second.data.resources.target_group.clone().unwrap(), 100)]
    );
}

#[tokio::test]
async fn deployments_share_environment_per_app() {
    let control = TestControl::new();

    let first = control
        .manager
        .deploy(RequestBuilder::new("api").build())
        .await
        .unwrap();
    let second = control
        .manager
        .deploy(RequestBuilder::new("api").with_env("FEATURE", "on").build())
        .await
        .unwrap();

    let a = &first.data.resources;
    let b = &second.data.resources;
    assert_ne!(a.service, b.service);
    assert_eq!(a.cluster, b.cluster);
    assert_eq!(a.log_group.as_deref(), Some("/skyport/api"));
    assert_eq!(a.log_group, b.log_group);
    assert_eq!(a.security_group, b.security_group);

    let snapshot = control.backend.snapshot().unwrap();
    assert_eq!(snapshot.clusters, vec!["apps".to_owned()]);
    assert_eq!(snapshot.services.len(), 2);
    assert_eq!(control.backend.calls_of("create_service").unwrap().len(), 2);
}

#[tokio::test]
async fn role_propagation_delay_is_retried() {
    let control = TestControl::with_memory(MemoryConfig {
        role_visibility_attempts: 3,
        health_polls: 2,
        ..MemoryConfig::default()
    });

    let record = control
        .manager
        .deploy(RequestBuilder::new("web").build())
        .await
        .unwrap();

    assert_eq!(record.state, PersistedState::Deployed);
    assert_eq!(control.backend.calls_of("create_service").unwrap().len(), 4);
}

#[tokio::test]
async fn failed_operation_marks_deployment_failed() {
    let control = TestControl::new();
    control.backend.fail_next_operation("TASKS_FAILED").unwrap();

    let err = control
        .manager
        .deploy(RequestBuilder::new("web").build())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Phase { .. }), "{err}");
    assert!(err.to_string().contains("TASKS_FAILED"), "{err}");

    let records = control
        .manager
        .list(&DeploymentFilter::new().with_state(PersistedState::Failed))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let failed = &records[0];
    assert!(failed.data.resources.service.is_some());
    assert!(failed.data.error.as_deref().unwrap().contains("TASKS_FAILED"));

    assert!(matches!(
        control.manager.release(&failed.data.id).await,
        Err(ControlError::InvalidStateTransition { from: "failed", .. })
    ));

    // Whatever the failed deployment created can still be removed.
    let report = control.manager.destroy(&failed.data.id).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    let snapshot = control.backend.snapshot().unwrap();
    assert!(snapshot.services.is_empty());
    assert!(snapshot.clusters.is_empty());
}

#[tokio::test]
async fn rejected_create_keeps_partial_resources() {
    let control = TestControl::new();
    control
        .backend
        .inject(
            "create_service",
            InjectedFailure::Fatal("quota exceeded".to_owned()),
            1,
        )
        .unwrap();

    let err = control
        .manager
        .deploy(RequestBuilder::new("web").build())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("quota exceeded"), "{err}");

    let records = control.manager.list(&DeploymentFilter::new()).await.unwrap();
    assert_eq!(records[0].state, PersistedState::Failed);
    let refs = &records[0].data.resources;
    assert!(refs.service.is_none());
    assert!(refs.cluster.is_some());
    assert!(refs.security_group.is_some());
}

#[tokio::test]
async fn prune_keeps_newest_and_released() {
    let control = TestControl::new();

    let mut ids = Vec::new();
    for version in 1..=4 {
        let record = control
            .manager
            .deploy(
                RequestBuilder::new("web")
                    .with_image(&format!("web:{version}"))
                    .build(),
            )
            .await
            .unwrap();
        ids.push(record.data.id);
    }
    let (oldest, newest) = (ids[0].clone(), ids[3].clone());
    control.manager.release(&oldest).await.unwrap();

    let report = control
        .manager
        .prune(&AppName::new("web"), 1)
        .await
        .unwrap();

    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.destroyed.len(), 2);
    assert!(report.destroyed.contains(&ids[1]));
    assert!(report.destroyed.contains(&ids[2]));
    assert!(report.kept.contains(&oldest));
    assert!(report.kept.contains(&newest));

    let live = control
        .manager
        .list(&DeploymentFilter::new().with_app(AppName::new("web")))
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.state != PersistedState::Destroyed)
        .count();
    assert_eq!(live, 2);
    assert_eq!(control.backend.snapshot().unwrap().services.len(), 2);

    // Pruning again finds nothing to do.
    let again = control
        .manager
        .prune(&AppName::new("web"), 1)
        .await
        .unwrap();
    assert!(again.destroyed.is_empty());
}

#[tokio::test]
async fn records_survive_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DeploymentStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let control = TestControl::with_store(MemoryConfig::default(), store);

    let record = control
        .manager
        .deploy(RequestBuilder::new("web").build())
        .await
        .unwrap();
    let release = control.manager.release(&record.data.id).await.unwrap();

    // A later invocation opens the same directory.
    let reopened: Arc<dyn DeploymentStore> =
        Arc::new(FileStore::open(dir.path()).await.unwrap());
    let later = TestControl::from_parts(control.backend.clone(), reopened, control.config.clone());

    let status = later.manager.status(&record.data.id).await.unwrap();
    assert_eq!(status.record.state, PersistedState::Released);
    assert_eq!(status.record.data.release.unwrap().url, release.url);
    assert!(status.live.unwrap().running);

    let report = later.manager.destroy(&record.data.id).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    let status = control.manager.status(&record.data.id).await.unwrap();
    assert_eq!(status.record.state, PersistedState::Destroyed);
    assert!(status.live.is_none());
}

#[tokio::test]
async fn unknown_deployment_is_reported() {
    let control = TestControl::new();
    let id = skyport_control::DeploymentId::new("01HZZZZZZZZZZZZZZZZZZZZZZZ");

    assert!(matches!(
        control.manager.release(&id).await,
        Err(ControlError::DeploymentNotFound(_))
    ));
    assert!(matches!(
        control.manager.destroy(&id).await,
        Err(ControlError::DeploymentNotFound(_))
    ));
}
