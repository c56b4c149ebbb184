//! HTTP API tests

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use shipyard::server::serve::router;
use shipyard::server::state::ServerState;

use crate::support::{harness, FakeLauncher, Harness};

fn app() -> (Harness, Router) {
    let h = harness(Arc::new(FakeLauncher::default()));
    let router = router(Arc::new(ServerState::new(h.manager.clone())));
    (h, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (_h, router) = app();
    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["deployments"], 0);
    assert_eq!(body["tunnel_provider"], "local");
}

#[tokio::test]
async fn test_deploy_list_status_undeploy() {
    let (h, router) = app();

    let (status, deployed) = send(
        &router,
        post_json(
            "/deployments",
            json!({ "files": [{ "path": "app.py", "content": "print('hi')" }] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(deployed["status"], "running");
    let id = deployed["id"].as_str().unwrap().to_string();

    let (status, list) = send(&router, get("/deployments")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);
    assert_eq!(list["deployments"][0]["id"], id.as_str());

    let (status, record) = send(&router, get(&format!("/deployments/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["public_url"], deployed["public_url"]);
    assert_eq!(record["mode"], "subprocess");

    let (status, logs) = send(&router, get(&format!("/deployments/{id}/logs?tail=5"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs["id"], id.as_str());

    let delete = Request::delete(format!("/deployments/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, stopped) = send(&router, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "stopped");

    let (status, err) = send(&router, get(&format!("/deployments/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "not_found");

    h.manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_invalid_bundle_is_bad_request() {
    let (h, router) = app();

    let (status, err) = send(
        &router,
        post_json(
            "/deployments",
            json!({ "files": [{ "path": "README.md", "content": "docs" }] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "bundle_invalid");
    assert_eq!(h.staged_dirs(), 0);
}

#[tokio::test]
async fn test_malformed_json_gets_error_body() {
    let (h, router) = app();
    let request = Request::post("/deployments")
        .header("content-type", "application/json")
        .body(Body::from("{\"files\": [{\"path\": "))
        .unwrap();

    let (status, err) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "bundle_invalid");
    assert!(err["message"].as_str().is_some_and(|m| !m.is_empty()));
    assert_eq!(h.staged_dirs(), 0);
}

#[tokio::test]
async fn test_garbage_zip_upload_is_bad_request() {
    let (_h, router) = app();
    let request = Request::post("/deployments/zip?mode=subprocess")
        .header("content-type", "application/zip")
        .body(Body::from("not a zip"))
        .unwrap();

    let (status, err) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "bundle_invalid");
}

#[tokio::test]
async fn test_unknown_deployment_routes_are_not_found() {
    let (_h, router) = app();

    let (status, _) = send(&router, get("/deployments/nope/logs")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let delete = Request::delete("/deployments/nope")
        .body(Body::empty())
        .unwrap();
    let (status, err) = send(&router, delete).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "not_found");
}
