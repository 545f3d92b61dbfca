//! Nomad adapter against a fake Nomad HTTP API.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::fixtures::{fast_config, RequestBuilder};
use serde_json::{json, Value};
use skyport_control::backend::create_backend;
use skyport_control::config::Platform;
use skyport_control::installer::PlatformInstaller;
use skyport_control::provisioner::ProvisionOutcome;
use skyport_control::{
    ControlConfig, DeploymentManager, Installer, MemoryStore, PersistedState,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeNomad {
    seq: u32,
    jobs: HashMap<String, Value>,
    /// Evaluation id to polls answered so far.
    evaluations: HashMap<String, u32>,
    registrations: Vec<String>,
    fail_placement: bool,
}

type Shared = Arc<Mutex<FakeNomad>>;

fn register(nomad: &Shared, body: &Value) -> Response {
    let mut nomad = nomad.lock().unwrap();
    let Some(id) = body["Job"]["ID"].as_str().map(str::to_owned) else {
        return (StatusCode::BAD_REQUEST, "job has no ID").into_response();
    };
    let mut job = body["Job"].clone();
    job["Status"] = json!("running");

    nomad.seq += 1;
    let eval = format!("eval-{}", nomad.seq);
    nomad.evaluations.insert(eval.clone(), 0);
    nomad.registrations.push(id.clone());
    nomad.jobs.insert(id, job);
    Json(json!({ "EvalID": eval })).into_response()
}

async fn create_job(State(nomad): State<Shared>, Json(body): Json<Value>) -> Response {
    register(&nomad, &body)
}

async fn update_job(
    State(nomad): State<Shared>,
    Path(_name): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    register(&nomad, &body)
}

async fn read_job(State(nomad): State<Shared>, Path(name): Path<String>) -> Response {
    match nomad.lock().unwrap().jobs.get(&name) {
        Some(job) => Json(job.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "job not found").into_response(),
    }
}

async fn delete_job(State(nomad): State<Shared>, Path(name): Path<String>) -> Response {
    match nomad.lock().unwrap().jobs.remove(&name) {
        Some(_) => Json(json!({ "EvalID": "" })).into_response(),
        None => (StatusCode::NOT_FOUND, "job not found").into_response(),
    }
}

async fn read_evaluation(State(nomad): State<Shared>, Path(id): Path<String>) -> Response {
    let mut nomad = nomad.lock().unwrap();
    let failing = nomad.fail_placement;
    let Some(polls) = nomad.evaluations.get_mut(&id) else {
        return (StatusCode::NOT_FOUND, "eval not found").into_response();
    };
    *polls += 1;
    if *polls < 2 {
        return Json(json!({ "Status": "pending" })).into_response();
    }
    if failing {
        return Json(json!({
            "Status": "complete",
            "FailedTGAllocs": { "web": { "NodesEvaluated": 3 } },
        }))
        .into_response();
    }
    Json(json!({ "Status": "complete" })).into_response()
}

async fn job_allocations(State(nomad): State<Shared>, Path(name): Path<String>) -> Response {
    if !nomad.lock().unwrap().jobs.contains_key(&name) {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    }
    Json(json!([
        { "ID": "alloc-old", "ClientStatus": "complete" },
        { "ID": "alloc-1", "ClientStatus": "running" },
    ]))
    .into_response()
}

async fn read_allocation(Path(id): Path<String>) -> Response {
    if id != "alloc-1" {
        return (StatusCode::NOT_FOUND, "allocation not found").into_response();
    }
    Json(json!({
        "AllocatedResources": {
            "Shared": {
                "Ports": [{ "Label": "http", "Value": 23456, "HostIP": "10.0.0.5" }],
            },
        },
    }))
    .into_response()
}

async fn serve_nomad() -> (String, Shared) {
    let nomad: Shared = Arc::default();
    let app = Router::new()
        .route("/v1/jobs", post(create_job))
        .route(
            "/v1/job/{name}",
            get(read_job).post(update_job).delete(delete_job),
        )
        .route("/v1/job/{name}/allocations", get(job_allocations))
        .route("/v1/evaluation/{id}", get(read_evaluation))
        .route("/v1/allocation/{id}", get(read_allocation))
        .with_state(nomad.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), nomad)
}

fn nomad_config(address: &str) -> ControlConfig {
    let mut config = fast_config();
    config.platform = Platform::Nomad;
    config.nomad.address = address.to_owned();
    config
}

fn manager(config: &ControlConfig) -> DeploymentManager {
    DeploymentManager::new(
        Arc::new(MemoryStore::new()),
        create_backend(config).unwrap(),
        config,
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn deploy_release_destroy_through_nomad() {
    let (address, nomad) = serve_nomad().await;
    let config = nomad_config(&address);
    let manager = manager(&config);

    let record = manager
        .deploy(RequestBuilder::new("web").with_port(8080).build())
        .await
        .unwrap();
    assert_eq!(record.state, PersistedState::Deployed);
    assert_eq!(record.data.platform, "nomad");
    assert_eq!(
        record.data.public_endpoint.as_deref(),
        Some("http://10.0.0.5:23456")
    );
    assert!(record.data.resources.target_group.is_none());

    let job = nomad.lock().unwrap().jobs[&record.data.spec.name].clone();
    assert_eq!(job["Meta"]["skyport_port"], "8080");
    assert_eq!(job["TaskGroups"][0]["Tasks"][0]["Config"]["image"], "nginx:1.27");

    let release = manager.release(&record.data.id).await.unwrap();
    assert_eq!(release.url, "http://10.0.0.5:23456");
    assert!(release.listener.is_none());

    let status = manager.status(&record.data.id).await.unwrap();
    let live = status.live.unwrap();
    assert!(live.running);
    assert_eq!(live.port, 8080);

    let report = manager.destroy(&record.data.id).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(nomad.lock().unwrap().jobs.is_empty());
}

#[tokio::test]
async fn failed_placement_fails_the_deployment() {
    let (address, nomad) = serve_nomad().await;
    nomad.lock().unwrap().fail_placement = true;
    let config = nomad_config(&address);
    let manager = manager(&config);

    let err = manager
        .deploy(RequestBuilder::new("web").build())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("placement failed"), "{err}");
    let records = manager
        .list(&skyport_control::DeploymentFilter::new())
        .await
        .unwrap();
    assert_eq!(records[0].state, PersistedState::Failed);
    assert!(records[0].data.resources.service.is_some());
}

#[tokio::test]
async fn installer_updates_job_in_place() {
    let (address, nomad) = serve_nomad().await;
    let mut config = nomad_config(&address);
    config.install.health_path = None;

    let installer =
        PlatformInstaller::new(create_backend(&config).unwrap(), &config, CancellationToken::new());
    let installed = installer.install().await.unwrap();
    assert_eq!(installed.outcome, ProvisionOutcome::Created);
    assert!(installed.resources.cluster.is_none());

    let unchanged = installer.upgrade().await.unwrap();
    assert_eq!(unchanged.outcome, ProvisionOutcome::Unchanged);

    config.install.image = "ghcr.io/skyport-dev/skyport-server:1.1".to_owned();
    let upgraded =
        PlatformInstaller::new(create_backend(&config).unwrap(), &config, CancellationToken::new())
            .upgrade()
            .await
            .unwrap();
    assert_eq!(upgraded.outcome, ProvisionOutcome::Updated);
    assert_eq!(
        nomad.lock().unwrap().registrations,
        vec!["skyport-server".to_owned(), "skyport-server".to_owned()]
    );

    config.install.cpu = 1024;
    config.install.memory_mb = 4096;
    let resized =
        PlatformInstaller::new(create_backend(&config).unwrap(), &config, CancellationToken::new())
            .upgrade()
            .await
            .unwrap();
    assert_eq!(resized.outcome, ProvisionOutcome::Updated);
    assert_eq!(nomad.lock().unwrap().registrations.len(), 3);
    let resources = nomad.lock().unwrap().jobs["skyport-server"]["TaskGroups"][0]["Tasks"][0]
        ["Resources"]
        .clone();
    assert_eq!(resources, json!({ "CPU": 1024, "MemoryMB": 4096 }));

    let report = installer.uninstall().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(nomad.lock().unwrap().jobs.is_empty());
}
