use super::*;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use prometheus::{Registry, TextEncoder};
use serde_json::Value;

const MASTER_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";
const DEVICE_KEY: &str = "qcKEimuwHrdjqoaK3EkoOM5UR89lKAi2M1UbjbdNUNs=";

#[derive(Clone)]
struct Dps {
    /// Number of 202 answers before the operation completes.
    pending_polls: u32,
    polls: Arc<AtomicU32>,
    assigned: bool,
}

async fn register(
    State(_dps): State<Dps>,
    Path((scope, device_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::Json<Value>,
) -> impl IntoResponse {
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or_default();
    if !auth.starts_with("SharedAccessSignature sr=") || !auth.ends_with("&skn=registration") || scope != "0ne000" {
        return (StatusCode::UNAUTHORIZED, String::new());
    }
    assert_eq!(body["registrationId"], device_id);
    assert_eq!(body["payload"]["modelId"], "dtmi:example:thermo;1");
    (StatusCode::ACCEPTED, r#"{"operationId":"op-1","status":"assigning"}"#.to_owned())
}

async fn operation(State(dps): State<Dps>, Path((_, _, op)): Path<(String, String, String)>) -> impl IntoResponse {
    assert_eq!(op, "op-1");
    let seen = dps.polls.fetch_add(1, Ordering::SeqCst);
    if seen < dps.pending_polls {
        return (StatusCode::ACCEPTED, [("retry-after", "0")], String::from(r#"{"status":"assigning"}"#));
    }
    let body = if dps.assigned {
        r#"{"status":"assigned","registrationState":{"assignedHub":"hub-1.azure-devices.net","status":"assigned"}}"#
    } else {
        r#"{"status":"failed","registrationState":{"status":"failed"}}"#
    };
    (StatusCode::OK, [("retry-after", "0")], String::from(body))
}

async fn start_dps(dps: Dps) -> String {
    let app = Router::new()
        .route("/{scope}/registrations/{id}/register", put(register))
        .route("/{scope}/registrations/{id}/operations/{op}", get(operation))
        .with_state(dps);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn dps(pending_polls: u32, assigned: bool) -> Dps {
    Dps { pending_polls, polls: Arc::new(AtomicU32::new(0)), assigned }
}

fn fixtures(base: &str) -> (Target, DeviceModel, DeviceLabels) {
    let target = Target {
        id: "app".into(),
        provisioning_url: base.into(),
        id_scope: "0ne000".into(),
        master_key: MASTER_KEY.into(),
        ..Target::default()
    };
    let model = DeviceModel {
        id: "thermo".into(),
        name: "thermo".into(),
        capability_model: vec![serde_json::json!({"@id": "dtmi:example:thermo;1"})],
    };
    (target, model, DeviceLabels::new("sim", "app", "thermo"))
}

fn provisioner(max_attempts: u32) -> (Provisioner, Registry) {
    let registry = Registry::new();
    let metrics = Arc::new(SimMetrics::new(&registry).unwrap());
    (Provisioner::new(Duration::from_secs(5), max_attempts, metrics).unwrap(), registry)
}

#[tokio::test]
async fn provision_polls_until_assigned() {
    let state = dps(2, true);
    let polls = state.polls.clone();
    let base = start_dps(state).await;
    let (target, model, labels) = fixtures(&base);
    let (provisioner, registry) = provisioner(5);

    let request = ProvisionRequest { device_id: "sim-app-thermo-1", target: &target, model: &model, labels: &labels };
    let conn = provisioner.provision(&request).await.unwrap();

    assert_eq!(conn, format!("HostName=hub-1.azure-devices.net;DeviceId=sim-app-thermo-1;SharedAccessKey={DEVICE_KEY}"));
    assert_eq!(polls.load(Ordering::SeqCst), 3);
    let text = TextEncoder::new().encode_to_string(&registry.gather()).unwrap();
    assert!(text.contains(r#"devsim_provisioning_success_total{model="thermo",sim="sim",target="app"} 1"#));
}

#[tokio::test]
async fn provision_gives_up_after_max_attempts() {
    let base = start_dps(dps(10, true)).await;
    let (target, model, labels) = fixtures(&base);
    let (provisioner, registry) = provisioner(2);

    let request = ProvisionRequest { device_id: "d1", target: &target, model: &model, labels: &labels };
    assert!(matches!(provisioner.provision(&request).await, Err(ProvisionError::AttemptsExhausted(2))));
    let text = TextEncoder::new().encode_to_string(&registry.gather()).unwrap();
    assert!(text.contains(r#"devsim_provisioning_failure_total{model="thermo",sim="sim",target="app"} 1"#));
}

#[tokio::test]
async fn unassigned_registration_is_an_error() {
    let base = start_dps(dps(0, false)).await;
    let (target, model, labels) = fixtures(&base);
    let (provisioner, _registry) = provisioner(3);

    let request = ProvisionRequest { device_id: "d1", target: &target, model: &model, labels: &labels };
    assert!(matches!(provisioner.provision(&request).await, Err(ProvisionError::NotAssigned(s)) if s == "failed"));
}

#[tokio::test]
async fn rejected_register_surfaces_status() {
    let base = start_dps(dps(0, true)).await;
    let (mut target, model, labels) = fixtures(&base);
    target.id_scope = "wrong".into();
    let (provisioner, _registry) = provisioner(3);

    let request = ProvisionRequest { device_id: "d1", target: &target, model: &model, labels: &labels };
    assert!(matches!(provisioner.provision(&request).await, Err(ProvisionError::Status { status: 401, .. })));
}

#[tokio::test]
async fn bad_master_key_fails_before_any_request() {
    let (mut target, model, labels) = fixtures("http://127.0.0.1:1");
    target.master_key = "%%%".into();
    let (provisioner, _registry) = provisioner(3);

    let request = ProvisionRequest { device_id: "d1", target: &target, model: &model, labels: &labels };
    assert!(matches!(provisioner.provision(&request).await, Err(ProvisionError::Key(_))));
}

#[test]
fn retry_after_defaults_to_three_seconds() {
    let mut headers = reqwest::header::HeaderMap::new();
    assert_eq!(retry_after(&headers), Duration::from_secs(3));
    headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
    assert_eq!(retry_after(&headers), Duration::from_secs(7));
    headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
    assert_eq!(retry_after(&headers), Duration::from_secs(3));
}
