//! Reconciler cycles against a mocked control plane.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nave_id::AgentId;
use nave_node_agent::config::Config;
use nave_node_agent::error::AgentError;
use nave_node_agent::reconciler::{AgentState, CycleOutcome, Reconciler};
use nave_node_agent::wireguard::{Interface, WgQuick};
use nave_reconcile::ConfigHash;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "agent-token";
const WG_CONF: &str = "[Interface]\nPrivateKey = abc\nAddress = 10.8.0.1/24\n";

#[derive(Default)]
struct FakeInterface {
    applied: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakeInterface {
    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interface for FakeInterface {
    async fn apply(&self, config: &str) -> Result<(), AgentError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::Apply("wg-quick up wg0 failed: boom".into()));
        }
        self.applied.lock().unwrap().push(config.to_string());
        Ok(())
    }
}

fn config(server: &MockServer, agent_id: Option<AgentId>) -> Config {
    Config {
        api_base: server.uri(),
        agent_token: TOKEN.to_string(),
        agent_id,
        vm_name: Some("exit-1".into()),
        public_ip: Some("34.10.0.7".into()),
        wg_config_path: PathBuf::from("/tmp/unused/wg0.conf"),
        wg_interface: "wg0".into(),
        poll_interval: Duration::from_millis(10),
        log_level: "debug".into(),
    }
}

async fn mount_register(server: &MockServer, agent_id: AgentId) {
    Mock::given(method("POST"))
        .and(path("/infra/agents/register"))
        .and(header("x-agent-token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "agent_id": agent_id })))
        .mount(server)
        .await;
}

async fn mount_desired(server: &MockServer, agent_id: AgentId, wg_conf: Option<&str>) {
    let desired_json = match wg_conf {
        Some(conf) => json!({ "wg_conf": conf }),
        None => json!({}),
    };
    Mock::given(method("GET"))
        .and(path(format!("/infra/agents/{agent_id}/desired")))
        .and(header("x-agent-token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "agent_id": agent_id,
            "desired_json": desired_json,
        })))
        .mount(server)
        .await;
}

async fn mount_status(server: &MockServer, agent_id: AgentId) {
    Mock::given(method("POST"))
        .and(path(format!("/infra/agents/{agent_id}/status")))
        .and(header("x-agent-token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(server)
        .await;
}

async fn reported_statuses(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path().ends_with("/status"))
        .map(|r| r.body_json::<Value>().unwrap()["status_json"].clone())
        .collect()
}

async fn count_requests(server: &MockServer, suffix: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().ends_with(suffix))
        .count()
}

#[tokio::test]
async fn test_applies_once_and_reports_hash() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    mount_register(&server, agent_id).await;
    mount_desired(&server, agent_id, Some(WG_CONF)).await;
    mount_status(&server, agent_id).await;

    let interface = Arc::new(FakeInterface::default());
    let mut reconciler = Reconciler::new(&config(&server, None), interface.clone()).unwrap();
    assert_eq!(reconciler.state(), AgentState::Unregistered);

    let hash = ConfigHash::of(WG_CONF).unwrap();
    assert_eq!(reconciler.run_once().await, CycleOutcome::Applied(hash.clone()));
    assert_eq!(reconciler.agent_id(), Some(agent_id));
    assert_eq!(reconciler.state(), AgentState::Idle);

    assert_eq!(reconciler.run_once().await, CycleOutcome::Unchanged);
    assert_eq!(interface.applied(), vec![WG_CONF.to_string()]);
    assert_eq!(reconciler.last_hash(), Some(&hash));

    // Registration happens once.
    assert_eq!(count_requests(&server, "/register").await, 1);

    let register = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path().ends_with("/register"))
        .unwrap();
    let body: Value = register.body_json().unwrap();
    assert_eq!(body["vm_name"], "exit-1");
    assert_eq!(body["public_ip"], "34.10.0.7");

    let statuses = reported_statuses(&server).await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0]["wg_conf_hash"], hash.as_str());
    assert_eq!(statuses[0]["applied"], true);
    assert!(statuses[0]["ts"].is_f64());
    assert_eq!(statuses[1]["wg_conf_hash"], hash.as_str());
    assert_eq!(statuses[1]["applied"], false);
}

#[tokio::test]
async fn test_new_desired_config_is_applied() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    mount_register(&server, agent_id).await;
    mount_desired(&server, agent_id, Some(WG_CONF)).await;
    mount_status(&server, agent_id).await;

    let interface = Arc::new(FakeInterface::default());
    let mut reconciler = Reconciler::new(&config(&server, None), interface.clone()).unwrap();
    assert!(matches!(reconciler.run_once().await, CycleOutcome::Applied(_)));

    let updated = format!("{WG_CONF}ListenPort = 51820\n");
    server.reset().await;
    mount_desired(&server, agent_id, Some(updated.as_str())).await;
    mount_status(&server, agent_id).await;

    assert_eq!(
        reconciler.run_once().await,
        CycleOutcome::Applied(ConfigHash::of(&updated).unwrap())
    );
    assert_eq!(interface.applied(), vec![WG_CONF.to_string(), updated]);
}

#[tokio::test]
async fn test_empty_desired_config_is_not_applied() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    mount_register(&server, agent_id).await;
    mount_desired(&server, agent_id, None).await;
    mount_status(&server, agent_id).await;

    let interface = Arc::new(FakeInterface::default());
    let mut reconciler = Reconciler::new(&config(&server, None), interface.clone()).unwrap();

    assert_eq!(reconciler.run_once().await, CycleOutcome::Unchanged);
    assert!(interface.applied().is_empty());

    let statuses = reported_statuses(&server).await;
    assert_eq!(statuses[0]["wg_conf_hash"], "");
    assert_eq!(statuses[0]["applied"], false);
}

#[tokio::test]
async fn test_failed_register_without_id_retries_next_cycle() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    Mock::given(method("POST"))
        .and(path("/infra/agents/register"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let interface = Arc::new(FakeInterface::default());
    let mut reconciler = Reconciler::new(&config(&server, None), interface.clone()).unwrap();

    assert_eq!(reconciler.run_once().await, CycleOutcome::Unregistered);
    assert_eq!(reconciler.state(), AgentState::Unregistered);
    assert_eq!(count_requests(&server, "/desired").await, 0);

    server.reset().await;
    mount_register(&server, agent_id).await;
    mount_desired(&server, agent_id, Some(WG_CONF)).await;
    mount_status(&server, agent_id).await;

    assert!(matches!(reconciler.run_once().await, CycleOutcome::Applied(_)));
    assert_eq!(reconciler.agent_id(), Some(agent_id));
}

#[tokio::test]
async fn test_failed_register_with_known_id_continues() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    Mock::given(method("POST"))
        .and(path("/infra/agents/register"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_desired(&server, agent_id, Some(WG_CONF)).await;
    mount_status(&server, agent_id).await;

    let interface = Arc::new(FakeInterface::default());
    let mut reconciler =
        Reconciler::new(&config(&server, Some(agent_id)), interface.clone()).unwrap();

    assert!(matches!(reconciler.run_once().await, CycleOutcome::Applied(_)));
    assert_eq!(reconciler.run_once().await, CycleOutcome::Unchanged);
    assert_eq!(count_requests(&server, "/register").await, 1);
}

#[tokio::test]
async fn test_apply_failure_reports_error_and_retries() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    mount_register(&server, agent_id).await;
    mount_desired(&server, agent_id, Some(WG_CONF)).await;
    mount_status(&server, agent_id).await;

    let interface = Arc::new(FakeInterface::default());
    interface.fail.store(true, Ordering::SeqCst);
    let mut reconciler = Reconciler::new(&config(&server, None), interface.clone()).unwrap();

    let CycleOutcome::Failed(message) = reconciler.run_once().await else {
        panic!("expected a failed cycle");
    };
    assert!(message.contains("boom"));
    assert_eq!(reconciler.last_hash(), None);
    assert_eq!(reconciler.state(), AgentState::Idle);

    let statuses = reported_statuses(&server).await;
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0]["error"].as_str().unwrap().contains("boom"));
    assert!(statuses[0].get("applied").is_none());

    interface.fail.store(false, Ordering::SeqCst);
    assert!(matches!(reconciler.run_once().await, CycleOutcome::Applied(_)));
    assert_eq!(interface.applied().len(), 1);
}

#[tokio::test]
async fn test_rejected_token_is_reported_not_fatal() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    mount_register(&server, agent_id).await;
    Mock::given(method("GET"))
        .and(path(format!("/infra/agents/{agent_id}/desired")))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "code": "invalid_agent_token",
            "message": "Missing or invalid agent token",
        })))
        .mount(&server)
        .await;
    mount_status(&server, agent_id).await;

    let interface = Arc::new(FakeInterface::default());
    let mut reconciler = Reconciler::new(&config(&server, None), interface.clone()).unwrap();

    let CycleOutcome::Failed(message) = reconciler.run_once().await else {
        panic!("expected a failed cycle");
    };
    assert!(message.contains("401"));
    assert!(interface.applied().is_empty());
    assert_eq!(reported_statuses(&server).await.len(), 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    mount_register(&server, agent_id).await;
    mount_desired(&server, agent_id, Some(WG_CONF)).await;
    mount_status(&server, agent_id).await;

    let interface = Arc::new(FakeInterface::default());
    let reconciler = Reconciler::new(&config(&server, None), interface.clone()).unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(reconciler.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(interface.applied(), vec![WG_CONF.to_string()]);
    assert!(count_requests(&server, "/desired").await >= 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_wg_quick_interface_end_to_end() {
    let server = MockServer::start().await;
    let agent_id = AgentId::new();
    mount_register(&server, agent_id).await;
    mount_desired(&server, agent_id, Some(WG_CONF)).await;
    mount_status(&server, agent_id).await;

    let dir = tempfile::tempdir().unwrap();
    let conf_path = dir.path().join("wg0.conf");
    let interface = Arc::new(WgQuick::new(&conf_path, "wg0").with_program("true"));
    let mut reconciler = Reconciler::new(&config(&server, None), interface).unwrap();

    assert!(matches!(reconciler.run_once().await, CycleOutcome::Applied(_)));
    assert_eq!(std::fs::read_to_string(&conf_path).unwrap(), WG_CONF);
}
