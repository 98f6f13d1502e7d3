//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use nave_id::AgentId;
use nave_reconcile::DEFAULT_POLL_INTERVAL;

use crate::error::AgentError;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane base URL, without a trailing slash.
    pub api_base: String,

    /// Bootstrap token issued with this agent's record.
    pub agent_token: String,

    /// Known agent id. Unset until the first registration answers.
    pub agent_id: Option<AgentId>,

    pub vm_name: Option<String>,
    pub public_ip: Option<String>,

    /// Where the WireGuard config is written.
    pub wg_config_path: PathBuf,

    /// Interface cycled with wg-quick.
    pub wg_interface: String,

    /// Sleep between reconciliation cycles.
    pub poll_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let agent_token = var("NAVE_AGENT_TOKEN").ok_or_else(|| {
            AgentError::Configuration("NAVE_AGENT_TOKEN must be set".to_string())
        })?;

        let api_base = var("NAVE_API_BASE")
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let agent_id = var("NAVE_AGENT_ID")
            .map(|raw| {
                AgentId::parse(&raw).map_err(|e| {
                    AgentError::Configuration(format!("NAVE_AGENT_ID is not a valid agent id: {e}"))
                })
            })
            .transpose()?;

        let poll_interval = match var("NAVE_POLL_INTERVAL_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(AgentError::Configuration(format!(
                        "NAVE_POLL_INTERVAL_SECS must be a positive integer, got {raw:?}"
                    )))
                }
            },
            None => DEFAULT_POLL_INTERVAL,
        };

        Ok(Self {
            api_base,
            agent_token,
            agent_id,
            vm_name: var("NAVE_VM_NAME"),
            public_ip: var("NAVE_PUBLIC_IP"),
            wg_config_path: var("NAVE_WG_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/etc/wireguard/wg0.conf")),
            wg_interface: var("NAVE_WG_INTERFACE").unwrap_or_else(|| "wg0".to_string()),
            poll_interval,
            log_level: var("NAVE_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, AgentError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_missing_token_is_fatal() {
        assert!(matches!(load(&[]), Err(AgentError::Configuration(_))));
        assert!(matches!(
            load(&[("NAVE_AGENT_TOKEN", "  ")]),
            Err(AgentError::Configuration(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("NAVE_AGENT_TOKEN", "tok")]).unwrap();
        assert_eq!(config.api_base, "http://127.0.0.1:8080");
        assert_eq!(config.agent_id, None);
        assert_eq!(config.wg_config_path, PathBuf::from("/etc/wireguard/wg0.conf"));
        assert_eq!(config.wg_interface, "wg0");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let id = AgentId::new();
        let config = load(&[
            ("NAVE_AGENT_TOKEN", "tok"),
            ("NAVE_API_BASE", "https://cp.example.com/"),
            ("NAVE_AGENT_ID", &id.to_string()),
            ("NAVE_VM_NAME", "exit-1"),
            ("NAVE_POLL_INTERVAL_SECS", "3"),
        ])
        .unwrap();
        assert_eq!(config.api_base, "https://cp.example.com");
        assert_eq!(config.agent_id, Some(id));
        assert_eq!(config.vm_name.as_deref(), Some("exit-1"));
        assert_eq!(config.poll_interval, Duration::from_secs(3));
    }

    #[rstest]
    #[case("NAVE_AGENT_ID", "nope")]
    #[case("NAVE_AGENT_ID", "nod_01J00000000000000000000000")]
    #[case("NAVE_POLL_INTERVAL_SECS", "0")]
    #[case("NAVE_POLL_INTERVAL_SECS", "soon")]
    fn test_rejects_malformed_values(#[case] key: &str, #[case] value: &str) {
        assert!(matches!(
            load(&[("NAVE_AGENT_TOKEN", "tok"), (key, value)]),
            Err(AgentError::Configuration(_))
        ));
    }
}
