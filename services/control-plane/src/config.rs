use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use nave_gcp::ResourceDefaults;

use crate::db::DbConfig;

/// Which record store backs the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local; records are lost on restart.
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreBackend,
    pub database: DbConfig,
    /// Base URL nodes use to reach this control plane.
    pub public_base_url: String,
    /// HS256 secret for operator session tokens; admin endpoints are closed
    /// when unset.
    pub operator_secret: Option<String>,
    pub gcp: GcpSettings,
    /// Agent executable served at `/infra/agent`.
    pub agent_binary: Option<PathBuf>,
}

/// Cloud settings.
#[derive(Debug, Clone)]
pub struct GcpSettings {
    /// Base64 service-account key; cloud operations fail with a
    /// configuration error when unset.
    pub service_account_key_b64: Option<String>,
    pub defaults: ResourceDefaults,
    pub billing_account: Option<String>,
    pub folder_name: String,
    pub quota_metric: String,
}

impl Default for GcpSettings {
    fn default() -> Self {
        Self {
            service_account_key_b64: None,
            defaults: ResourceDefaults::default(),
            billing_account: None,
            folder_name: "navegador-ele".to_string(),
            quota_metric: "IN_USE_ADDRESSES".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            dev_mode: false,
            store: StoreBackend::Postgres,
            database: DbConfig::default(),
            public_base_url: "http://127.0.0.1:8080".to_string(),
            operator_secret: None,
            gcp: GcpSettings::default(),
            agent_binary: None,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("NAVE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("NAVE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("NAVE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store = match std::env::var("NAVE_STORE")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => bail!("NAVE_STORE must be 'postgres' or 'memory', got '{other}'"),
        };

        let database = DbConfig::from_env();

        let public_base_url = std::env::var("NAVE_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let mut defaults = ResourceDefaults::new(
            &non_empty_var("NAVE_GCP_PROJECT_ID").unwrap_or_else(|| "politicomap".to_string()),
            &non_empty_var("NAVE_GCP_REGION").unwrap_or_else(|| "northamerica-south1".to_string()),
            &non_empty_var("NAVE_GCP_ZONE").unwrap_or_else(|| "northamerica-south1-a".to_string()),
        );
        if let Some(machine_type) = non_empty_var("NAVE_GCP_MACHINE_TYPE") {
            defaults.machine_type = machine_type;
        }
        if let Some(email) = non_empty_var("NAVE_GCP_INSTANCE_SA_EMAIL") {
            defaults.instance_service_account = email;
        }

        let gcp = GcpSettings {
            service_account_key_b64: non_empty_var("GCP_SA_KEY_B64"),
            defaults,
            billing_account: non_empty_var("NAVE_GCP_BILLING_ACCOUNT"),
            folder_name: non_empty_var("NAVE_GCP_FOLDER_NAME")
                .unwrap_or_else(|| "navegador-ele".to_string()),
            quota_metric: non_empty_var("NAVE_QUOTA_METRIC")
                .unwrap_or_else(|| "IN_USE_ADDRESSES".to_string()),
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            store,
            database,
            public_base_url,
            operator_secret: non_empty_var("NAVE_OPERATOR_SECRET"),
            gcp,
            agent_binary: non_empty_var("NAVE_AGENT_BINARY").map(PathBuf::from),
        })
    }
}
