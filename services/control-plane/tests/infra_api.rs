//! `/infra` API integration tests.
//!
//! Serves the real router on an ephemeral port, backed by the in-memory
//! store and a fake provider.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{encode, EncodingKey, Header};
use nave_control_plane::{api, config::Config, state::AppState, store::MemoryStore};
use nave_gcp::{Endpoints, GcpClient, ResourceDefaults, ResourceOrchestrator, StaticTokenSource};
use nave_reconcile::ConfigHash;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OPERATOR_SECRET: &str = "operator-test-secret";

struct Harness {
    base_url: String,
    client: reqwest::Client,
    store: Arc<MemoryStore>,
    operator_token: String,
}

impl Harness {
    async fn start(provider: Option<&MockServer>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,nave_control_plane=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let config = Config {
            public_base_url: "http://cp.test".to_string(),
            operator_secret: Some(OPERATOR_SECRET.to_string()),
            ..Config::default()
        };

        let gcp = provider.map(|server| {
            let client = GcpClient::new(
                Arc::new(StaticTokenSource::new("test-token")),
                Endpoints::rooted_at(&server.uri()),
            )
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
            Arc::new(ResourceOrchestrator::new(
                client,
                ResourceDefaults::new("host", "us-east1", "us-east1-b"),
            ))
        });

        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(&config, store.clone(), gcp);
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            store,
            operator_token: operator_token(OPERATOR_SECRET),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn operator_post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(&self.operator_token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn operator_get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(&self.operator_token)
            .send()
            .await
            .unwrap()
    }

    async fn agent_get(&self, path: &str, token: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("X-Agent-Token", token)
            .send()
            .await
            .unwrap()
    }

    async fn agent_post(&self, path: &str, token: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("X-Agent-Token", token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Bootstrap an agent through the API; returns `(agent_id, token)`.
    async fn bootstrap_agent(&self, name: &str) -> (String, String) {
        let resp = self
            .operator_post("/infra/agents/bootstrap", json!({ "name": name }))
            .await;
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        (
            body["agent_id"].as_str().unwrap().to_string(),
            body["token"].as_str().unwrap().to_string(),
        )
    }
}

fn operator_token(secret: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    encode(
        &Header::default(),
        &json!({ "sub": "ops@nave.dev", "exp": exp }),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn compute(project: &str) -> String {
    format!("/compute/v1/projects/{project}")
}

async fn mount_json(server: &MockServer, http_method: &str, at: String, body: Value) {
    Mock::given(method(http_method))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_quota(server: &MockServer, project: &str, usage: f64, limit: f64) {
    mount_json(
        server,
        "GET",
        format!("{}/regions/us-east1", compute(project)),
        json!({ "quotas": [{ "metric": "IN_USE_ADDRESSES", "usage": usage, "limit": limit }] }),
    )
    .await;
}

/// Firewall present, address and instance creation succeed, in `project`.
async fn mount_exit_node(server: &MockServer, project: &str, vm: &str, ip: &str) {
    let base = compute(project);
    mount_json(
        server,
        "GET",
        format!("{base}/global/firewalls/nave-wireguard"),
        json!({ "name": "nave-wireguard" }),
    )
    .await;

    Mock::given(method("POST"))
        .and(path(format!("{base}/regions/us-east1/addresses")))
        .and(body_partial_json(json!({ "name": format!("{vm}-ip") })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "op-addr" })))
        .expect(1)
        .mount(server)
        .await;
    mount_json(
        server,
        "GET",
        format!("{base}/regions/us-east1/operations/op-addr"),
        json!({ "status": "DONE" }),
    )
    .await;
    mount_json(
        server,
        "GET",
        format!("{base}/regions/us-east1/addresses/{vm}-ip"),
        json!({ "name": format!("{vm}-ip"), "address": ip }),
    )
    .await;

    Mock::given(method("POST"))
        .and(path(format!("{base}/zones/us-east1-b/instances")))
        .and(body_partial_json(json!({
            "name": vm,
            "canIpForward": true,
            "tags": { "items": ["nave-exit"] },
            "networkInterfaces": [{ "accessConfigs": [{ "natIP": ip }] }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "op-vm" })))
        .expect(1)
        .mount(server)
        .await;
    mount_json(
        server,
        "GET",
        format!("{base}/zones/us-east1-b/operations/op-vm"),
        json!({ "status": "DONE" }),
    )
    .await;
    mount_json(
        server,
        "GET",
        format!("{base}/zones/us-east1-b/instances/{vm}"),
        json!({
            "name": vm,
            "status": "RUNNING",
            "networkInterfaces": [{ "accessConfigs": [{ "natIP": ip }] }]
        }),
    )
    .await;
}

#[tokio::test]
async fn test_provision_selects_project_with_headroom() {
    let provider = MockServer::start().await;
    mount_quota(&provider, "p1", 8.0, 8.0).await;
    mount_quota(&provider, "p2", 1.0, 8.0).await;
    mount_exit_node(&provider, "p2", "exit-1", "34.10.0.7").await;

    let h = Harness::start(Some(&provider)).await;
    h.store.insert_profile(7).await;

    let resp = h
        .operator_post("/infra/projects/register", json!({ "projects": ["p1", "p2"] }))
        .await;
    assert_eq!(resp.status(), 200);

    let resp = h
        .operator_post("/infra/provision", json!({ "name": "exit-1", "profile_id": 7 }))
        .await;
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["project_id"], "p2");
    assert_eq!(body["vm_name"], "exit-1");
    assert_eq!(body["address_name"], "exit-1-ip");
    assert_eq!(body["instance"]["status"], "RUNNING");
    let agent_id = body["agent_id"].as_str().unwrap().to_string();
    let token = body["token"].as_str().unwrap().to_string();

    let projects: Value = h.operator_get("/infra/projects").await.json().await.unwrap();
    let items = projects["items"].as_array().unwrap();
    assert_eq!(items[0]["project_id"], "p1");
    assert_eq!(items[0]["active"], false);
    assert_eq!(items[1]["project_id"], "p2");
    assert_eq!(items[1]["active"], true);

    let resp = h
        .agent_get(&format!("/infra/agents/{agent_id}/desired"), &token)
        .await;
    assert_eq!(resp.status(), 200);
    let desired: Value = resp.json().await.unwrap();
    assert_eq!(desired["agent_id"], agent_id.as_str());
    assert_eq!(desired["desired_json"], json!({}));

    let resp = h
        .agent_get(&format!("/infra/agents/{agent_id}/desired"), "nvt_garbage")
        .await;
    assert_eq!(resp.status(), 401);

    let record: Value = h
        .operator_get(&format!("/infra/agents/{agent_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(record["lifecycle"]["state"], "provisioned");
    assert_eq!(record["public_ip"], "34.10.0.7");
    assert!(!record["last_seen_at"].is_null(), "desired fetch marks the agent seen");

    let network = h.store.profile_network(7).await.unwrap();
    assert_eq!(network["agent_id"], agent_id.as_str());
    assert_eq!(network["public_ip"], "34.10.0.7");
    assert_eq!(network["project_id"], "p2");
}

#[tokio::test]
async fn test_provision_with_every_project_full_is_retryable() {
    let provider = MockServer::start().await;
    mount_quota(&provider, "p1", 8.0, 8.0).await;

    let h = Harness::start(Some(&provider)).await;
    h.operator_post("/infra/projects/register", json!({ "projects": ["p1"] }))
        .await;

    let resp = h
        .operator_post("/infra/provision", json!({ "name": "exit-1" }))
        .await;
    assert_eq!(resp.status(), 503);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/problem+json"
    );
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "resource_exhausted");
    assert_eq!(problem["retryable"], true);
}

#[tokio::test]
async fn test_provision_failure_names_the_step() {
    let provider = MockServer::start().await;
    mount_quota(&provider, "p1", 0.0, 8.0).await;
    Mock::given(method("GET"))
        .and(path(format!("{}/global/firewalls/nave-wireguard", compute("p1"))))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": 403, "message": "Required 'compute.firewalls.get' permission", "status": "PERMISSION_DENIED" }
        })))
        .mount(&provider)
        .await;

    let h = Harness::start(Some(&provider)).await;
    h.operator_post("/infra/projects/register", json!({ "projects": ["p1"] }))
        .await;

    let resp = h
        .operator_post("/infra/provision", json!({ "name": "exit-1" }))
        .await;
    assert_eq!(resp.status(), 502);
    let problem: Value = resp.json().await.unwrap();
    let detail = problem["detail"].as_str().unwrap();
    assert!(detail.contains("ensure_firewall_rule"), "{detail}");
    assert!(detail.contains("compute.firewalls.get"), "{detail}");

    // The agent record stays behind for manual cleanup.
    assert_eq!(h.store.agent_count().await, 1);
}

#[tokio::test]
async fn test_unreadable_quota_reports_provider_error() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/regions/us-east1", compute("p1"))))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": 403, "message": "Compute Engine API has not been used in project p1", "status": "PERMISSION_DENIED" }
        })))
        .mount(&provider)
        .await;

    let h = Harness::start(Some(&provider)).await;
    let resp = h
        .operator_post("/infra/projects/register", json!({ "projects": ["p1"] }))
        .await;
    assert_eq!(resp.status(), 200);

    let resp = h
        .operator_post("/infra/provision", json!({ "name": "exit-1" }))
        .await;
    assert_eq!(resp.status(), 502);
    let problem: Value = resp.json().await.unwrap();
    let detail = problem["detail"].as_str().unwrap();
    assert!(detail.contains("check_quota failed for p1"), "{detail}");
    assert!(detail.contains("has not been used"), "{detail}");
}

#[tokio::test]
async fn test_invalid_name_is_rejected_before_any_provider_call() {
    let provider = MockServer::start().await;
    let h = Harness::start(Some(&provider)).await;

    let resp = h
        .operator_post("/infra/provision", json!({ "name": "Invalid_Name!" }))
        .await;
    assert_eq!(resp.status(), 400);
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "invalid_request");

    assert!(provider.received_requests().await.unwrap().is_empty());
    assert_eq!(h.store.agent_count().await, 0);
}

#[tokio::test]
async fn test_provision_without_cloud_credentials() {
    let h = Harness::start(None).await;
    let resp = h
        .operator_post("/infra/provision", json!({ "name": "exit-1" }))
        .await;
    assert_eq!(resp.status(), 503);
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "not_configured");
}

#[tokio::test]
async fn test_operator_endpoints_require_session_token() {
    let h = Harness::start(None).await;

    let resp = h
        .client
        .post(h.url("/infra/agents/bootstrap"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = h
        .client
        .get(h.url("/infra/projects"))
        .bearer_auth(operator_token("some-other-secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_agent_converges_on_desired_config() {
    let h = Harness::start(None).await;
    let (agent_id, token) = h.bootstrap_agent("manual-exit").await;

    let resp = h
        .agent_post(
            "/infra/agents/register",
            &token,
            json!({ "vm_name": "manual-exit", "public_ip": "1.2.3.4" }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["agent_id"], agent_id.as_str());

    let wg_conf = "[Interface]\nPrivateKey = abc\nListenPort = 51820\n";
    let resp = h
        .operator_post(
            &format!("/infra/agents/{agent_id}/desired"),
            json!({ "wg_conf": wg_conf }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["desired_json"]["wg_conf"], wg_conf);

    let desired: Value = h
        .agent_get(&format!("/infra/agents/{agent_id}/desired"), &token)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(desired["desired_json"]["wg_conf"], wg_conf);

    let hash = ConfigHash::of(wg_conf).unwrap();
    let resp = h
        .agent_post(
            &format!("/infra/agents/{agent_id}/status"),
            &token,
            json!({ "status_json": { "ts": 1_700_000_000.5, "wg_conf_hash": hash.as_str(), "applied": true } }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap()["ok"], true);

    let status: Value = h
        .agent_get(&format!("/infra/agents/{agent_id}/status"), &token)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(status["vm_name"], "manual-exit");
    assert_eq!(status["public_ip"], "1.2.3.4");
    assert_eq!(status["status_json"]["applied"], true);
    assert!(status["last_seen_at"].is_string());

    let record: Value = h
        .operator_get(&format!("/infra/agents/{agent_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(record["lifecycle"]["state"], "converged");

    h.operator_post(
        &format!("/infra/agents/{agent_id}/desired"),
        json!({ "wg_conf": "[Interface]\nPrivateKey = rotated\n" }),
    )
    .await;
    let record: Value = h
        .operator_get(&format!("/infra/agents/{agent_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(record["lifecycle"]["state"], "registered");
}

#[tokio::test]
async fn test_desired_fetch_marks_agent_seen() {
    let h = Harness::start(None).await;
    let (agent_id, token) = h.bootstrap_agent("exit-seen").await;

    let before: Value = h
        .operator_get(&format!("/infra/agents/{agent_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert!(before["last_seen_at"].is_null());

    let resp = h
        .agent_get(&format!("/infra/agents/{agent_id}/desired"), &token)
        .await;
    assert_eq!(resp.status(), 200);

    let after: Value = h
        .operator_get(&format!("/infra/agents/{agent_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert!(!after["last_seen_at"].is_null());
}

#[tokio::test]
async fn test_agent_token_only_opens_its_own_record() {
    let h = Harness::start(None).await;
    let (first_id, first_token) = h.bootstrap_agent("exit-a").await;
    let (second_id, _) = h.bootstrap_agent("exit-b").await;

    let resp = h
        .agent_get(&format!("/infra/agents/{second_id}/desired"), &first_token)
        .await;
    assert_eq!(resp.status(), 401);

    let resp = h
        .agent_post(
            &format!("/infra/agents/{second_id}/status"),
            &first_token,
            json!({ "status_json": { "ts": 1.0 } }),
        )
        .await;
    assert_eq!(resp.status(), 401);

    let resp = h
        .agent_get(&format!("/infra/agents/{first_id}/status"), &first_token)
        .await;
    assert_eq!(resp.status(), 200);

    let resp = h
        .client
        .get(h.url(&format!("/infra/agents/{first_id}/desired")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = Harness::start(None).await;
    for endpoint in ["/healthz", "/readyz", "/livez"] {
        let resp = h.client.get(h.url(endpoint)).send().await.unwrap();
        assert_eq!(resp.status(), 200, "{endpoint}");
    }
    let ready: Value = h.client.get(h.url("/readyz")).send().await.unwrap().json().await.unwrap();
    assert_eq!(ready["components"]["store"]["status"], "ok");

    let resp = h.client.get(h.url("/healthz")).send().await.unwrap();
    let generated = resp.headers()["x-request-id"].to_str().unwrap();
    assert!(generated.starts_with("req_"), "{generated}");

    let resp = h
        .client
        .get(h.url("/healthz"))
        .header("x-request-id", "req-from-caller")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "req-from-caller");
}

#[tokio::test]
async fn test_agent_binary_download() {
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("nave-node-agent");
    std::fs::write(&binary, b"\x7fELF-agent").unwrap();

    let config = Config {
        agent_binary: Some(binary),
        ..Config::default()
    };
    let state = AppState::new(&config, Arc::new(MemoryStore::new()), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::create_router(state)).await.unwrap();
    });

    let resp = reqwest::get(format!("http://{addr}/infra/agent")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(&resp.bytes().await.unwrap()[..], b"\x7fELF-agent");

    let h = Harness::start(None).await;
    let resp = h.client.get(h.url("/infra/agent")).send().await.unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_unreadable_agent_binary_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        agent_binary: Some(dir.path().join("not-there")),
        ..Config::default()
    };
    let state = AppState::new(&config, Arc::new(MemoryStore::new()), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::create_router(state)).await.unwrap();
    });

    let resp = reqwest::get(format!("http://{addr}/infra/agent")).await.unwrap();
    assert_eq!(resp.status(), 503);
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "agent_binary_unavailable");
}
