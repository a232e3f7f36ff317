//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "JSON-RPC control client integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use axum::routing::post;
use axum::{Json, Router};
use failover_control::{
    resolve_worker_handle, ControlError, ControlService, HttpControlService, WorkerHandle,
    WorkerStatus,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

async fn rpc(Json(request): Json<Value>) -> Json<Value> {
    let id = request["id"].clone();
    let uuid = request["params"][0].as_str().unwrap_or_default().to_owned();
    let reply = match request["method"].as_str().unwrap_or_default() {
        "list_agents" => json!({"result": [{"uuid": "a-1", "name": "listener"}, {"uuid": "a-2"}]}),
        "agent_vip_identity" if uuid == "a-2" => json!({"result": "platform.historian"}),
        "agent_vip_identity" => json!({"result": null}),
        "agent_status" => json!({"result": [4321, null]}),
        "start_agent" => json!({"result": null}),
        _ => json!({"error": {"code": -32601, "message": "method not found"}}),
    };
    let mut reply = reply;
    reply["jsonrpc"] = json!("2.0");
    reply["id"] = id;
    Json(reply)
}

async fn spawn_control_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/control", post(rpc));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}/control", addr)
}

#[tokio::test]
async fn resolves_and_queries_worker_over_http() {
    let endpoint = spawn_control_endpoint().await;
    let service = HttpControlService::new(&endpoint).unwrap();

    let handle = resolve_worker_handle(&service, "platform.historian")
        .await
        .unwrap()
        .expect("worker resolved");
    assert_eq!(handle, WorkerHandle::new("a-2"));

    let status = service.agent_status(&handle).await.unwrap();
    assert_eq!(status, WorkerStatus::running(4321));
    service.start_agent(&handle).await.unwrap();
}

#[tokio::test]
async fn error_objects_become_remote_errors() {
    let endpoint = spawn_control_endpoint().await;
    let service = HttpControlService::new(&endpoint).unwrap();

    let err = service
        .stop_agent(&WorkerHandle::new("a-2"))
        .await
        .unwrap_err();
    match err {
        ControlError::Remote { command, code, .. } => {
            assert_eq!(command, "stop_agent");
            assert_eq!(code, -32601);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let service = HttpControlService::new(&format!("http://127.0.0.1:{port}/control")).unwrap();
    let err = service.list_agents().await.unwrap_err();
    assert!(matches!(err, ControlError::Transport { .. }));
}
