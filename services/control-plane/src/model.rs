//! Records held by the control plane.
//!
//! An [`AgentRecord`] is the control plane's view of one exit-node agent.
//! Its progress is an explicit [`AgentLifecycle`]:
//!
//! ```text
//! bootstrapped ──attach──▶ provisioned ──register──▶ registered ◀──▶ converged
//!      │                                                 ▲
//!      └───────────────────register / status─────────────┘
//! ```
//!
//! A record is `converged` exactly when the last status report carries the
//! hash of the current desired configuration. Status never exists without a
//! registration.

use chrono::{DateTime, Utc};
use nave_id::AgentId;
use nave_reconcile::ConfigHash;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Cloud resources attached to an agent by provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceAttachment {
    pub vm_name: String,
    #[serde(default)]
    pub address_name: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    /// Raw instance descriptor returned by the provider.
    #[serde(default)]
    pub instance: Value,
}

/// What the agent said about itself when it registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(default)]
    pub vm_name: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Last status blob reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub report: Value,
    pub reported_at: DateTime<Utc>,
}

impl AgentStatus {
    pub fn new(report: Value, reported_at: DateTime<Utc>) -> Self {
        Self {
            report,
            reported_at,
        }
    }

    /// Hash of the configuration the agent says it has applied.
    pub fn applied_hash(&self) -> Option<ConfigHash> {
        self.report
            .get("wg_conf_hash")
            .and_then(Value::as_str)
            .and_then(ConfigHash::from_reported)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentLifecycle {
    /// Token issued, nothing attached.
    Bootstrapped,
    Provisioned {
        instance: InstanceAttachment,
    },
    Registered {
        #[serde(default)]
        instance: Option<InstanceAttachment>,
        registration: Registration,
        #[serde(default)]
        status: Option<AgentStatus>,
    },
    Converged {
        #[serde(default)]
        instance: Option<InstanceAttachment>,
        registration: Registration,
        status: AgentStatus,
        applied_hash: ConfigHash,
    },
}

impl AgentLifecycle {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bootstrapped => "bootstrapped",
            Self::Provisioned { .. } => "provisioned",
            Self::Registered { .. } => "registered",
            Self::Converged { .. } => "converged",
        }
    }

    pub fn instance(&self) -> Option<&InstanceAttachment> {
        match self {
            Self::Bootstrapped => None,
            Self::Provisioned { instance } => Some(instance),
            Self::Registered { instance, .. } | Self::Converged { instance, .. } => {
                instance.as_ref()
            }
        }
    }

    pub fn registration(&self) -> Option<&Registration> {
        match self {
            Self::Bootstrapped | Self::Provisioned { .. } => None,
            Self::Registered { registration, .. } | Self::Converged { registration, .. } => {
                Some(registration)
            }
        }
    }

    pub fn status(&self) -> Option<&AgentStatus> {
        match self {
            Self::Registered { status, .. } => status.as_ref(),
            Self::Converged { status, .. } => Some(status),
            _ => None,
        }
    }

    /// Attach provisioned cloud resources.
    pub fn attach_instance(self, attachment: InstanceAttachment) -> Self {
        match self {
            Self::Bootstrapped | Self::Provisioned { .. } => Self::Provisioned {
                instance: attachment,
            },
            Self::Registered {
                registration,
                status,
                ..
            } => Self::Registered {
                instance: Some(attachment),
                registration,
                status,
            },
            Self::Converged {
                registration,
                status,
                applied_hash,
                ..
            } => Self::Converged {
                instance: Some(attachment),
                registration,
                status,
                applied_hash,
            },
        }
    }

    /// Record a (re-)registration. Convergence survives re-registration.
    pub fn register(self, registration: Registration) -> Self {
        match self {
            Self::Bootstrapped => Self::Registered {
                instance: None,
                registration,
                status: None,
            },
            Self::Provisioned { instance } => Self::Registered {
                instance: Some(instance),
                registration,
                status: None,
            },
            Self::Registered {
                instance, status, ..
            } => Self::Registered {
                instance,
                registration,
                status,
            },
            Self::Converged {
                instance,
                status,
                applied_hash,
                ..
            } => Self::Converged {
                instance,
                registration,
                status,
                applied_hash,
            },
        }
    }

    /// Record a status report and judge convergence against `desired`.
    ///
    /// An agent that reports before registering is registered implicitly,
    /// with no name or IP.
    pub fn record_status(self, status: AgentStatus, desired: Option<&ConfigHash>) -> Self {
        let reported_at = status.reported_at;
        let (instance, registration) = match self {
            Self::Bootstrapped => (None, None),
            Self::Provisioned { instance } => (Some(instance), None),
            Self::Registered {
                instance,
                registration,
                ..
            }
            | Self::Converged {
                instance,
                registration,
                ..
            } => (instance, Some(registration)),
        };
        let registration = registration.unwrap_or(Registration {
            vm_name: None,
            public_ip: None,
            registered_at: reported_at,
        });
        Self::judge(instance, registration, status, desired)
    }

    /// Re-judge convergence after the desired configuration changed.
    pub fn with_desired(self, desired: Option<&ConfigHash>) -> Self {
        match self {
            Self::Registered {
                instance,
                registration,
                status: Some(status),
            }
            | Self::Converged {
                instance,
                registration,
                status,
                ..
            } => Self::judge(instance, registration, status, desired),
            other => other,
        }
    }

    fn judge(
        instance: Option<InstanceAttachment>,
        registration: Registration,
        status: AgentStatus,
        desired: Option<&ConfigHash>,
    ) -> Self {
        match (status.applied_hash(), desired) {
            (Some(applied), Some(desired)) if &applied == desired => Self::Converged {
                instance,
                registration,
                status,
                applied_hash: applied,
            },
            _ => Self::Registered {
                instance,
                registration,
                status: Some(status),
            },
        }
    }
}

/// Control-plane view of one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub id: AgentId,
    /// SHA-256 of the bootstrap token; the token itself is never stored.
    pub token_hash: String,
    pub profile_id: Option<i64>,
    /// Name given at bootstrap, if any.
    pub name: Option<String>,
    /// Desired-configuration blob, `{}` until set.
    pub desired: Value,
    pub lifecycle: AgentLifecycle,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    /// A fresh, bootstrapped record.
    pub fn bootstrap(token_hash: String, profile_id: Option<i64>, name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            token_hash,
            profile_id,
            name,
            desired: json!({}),
            lifecycle: AgentLifecycle::Bootstrapped,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Desired WireGuard configuration text, empty when unset.
    pub fn desired_wg_conf(&self) -> &str {
        self.desired
            .get("wg_conf")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn desired_hash(&self) -> Option<ConfigHash> {
        ConfigHash::of(self.desired_wg_conf())
    }

    /// VM name, preferring what the agent registered with.
    pub fn vm_name(&self) -> Option<&str> {
        self.lifecycle
            .registration()
            .and_then(|r| r.vm_name.as_deref())
            .or_else(|| self.lifecycle.instance().map(|i| i.vm_name.as_str()))
            .or(self.name.as_deref())
    }

    /// Public IP, preferring what the agent registered with.
    pub fn public_ip(&self) -> Option<&str> {
        self.lifecycle
            .registration()
            .and_then(|r| r.public_ip.as_deref())
            .or_else(|| {
                self.lifecycle
                    .instance()
                    .and_then(|i| i.public_ip.as_deref())
            })
    }

    /// Last status blob, `{}` when none was reported.
    pub fn status_json(&self) -> Value {
        self.lifecycle
            .status()
            .map(|s| s.report.clone())
            .unwrap_or_else(|| json!({}))
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = Some(now);
        self.updated_at = now;
    }

    pub fn attach_instance(&mut self, attachment: InstanceAttachment) {
        self.lifecycle = self.take_lifecycle().attach_instance(attachment);
        self.updated_at = Utc::now();
    }

    pub fn register(&mut self, vm_name: Option<String>, public_ip: Option<String>) {
        let now = Utc::now();
        let registration = Registration {
            vm_name,
            public_ip,
            registered_at: now,
        };
        self.lifecycle = self.take_lifecycle().register(registration);
        self.touch(now);
    }

    pub fn set_desired_wg_conf(&mut self, wg_conf: &str) {
        self.desired = json!({ "wg_conf": wg_conf });
        let desired = self.desired_hash();
        self.lifecycle = self.take_lifecycle().with_desired(desired.as_ref());
        self.updated_at = Utc::now();
    }

    pub fn record_status(&mut self, report: Value) {
        let now = Utc::now();
        let desired = self.desired_hash();
        self.lifecycle = self
            .take_lifecycle()
            .record_status(AgentStatus::new(report, now), desired.as_ref());
        self.touch(now);
    }

    fn take_lifecycle(&mut self) -> AgentLifecycle {
        std::mem::replace(&mut self.lifecycle, AgentLifecycle::Bootstrapped)
    }
}

/// A cloud project in the quota pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    /// Derived from the last live quota check.
    pub active: bool,
    pub ip_usage: Option<f64>,
    pub ip_limit: Option<f64>,
    pub registered_at: DateTime<Utc>,
    pub checked_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment() -> InstanceAttachment {
        InstanceAttachment {
            vm_name: "exit-1".into(),
            address_name: Some("exit-1-ip".into()),
            public_ip: Some("34.10.0.7".into()),
            project_id: Some("p2".into()),
            zone: Some("us-east1-b".into()),
            instance: json!({"name": "exit-1"}),
        }
    }

    fn applied(conf: &str) -> Value {
        json!({
            "ts": 1_700_000_000.5,
            "wg_conf_hash": ConfigHash::of(conf).unwrap().as_str(),
            "applied": true
        })
    }

    #[test]
    fn test_bootstrapped_record_is_empty() {
        let record = AgentRecord::bootstrap("h".into(), Some(7), None);
        assert_eq!(record.lifecycle.name(), "bootstrapped");
        assert_eq!(record.desired, json!({}));
        assert_eq!(record.desired_wg_conf(), "");
        assert_eq!(record.desired_hash(), None);
        assert_eq!(record.status_json(), json!({}));
        assert!(record.last_seen_at.is_none());
    }

    #[test]
    fn test_full_lifecycle() {
        let mut record = AgentRecord::bootstrap("h".into(), None, None);

        record.attach_instance(attachment());
        assert_eq!(record.lifecycle.name(), "provisioned");
        assert_eq!(record.vm_name(), Some("exit-1"));
        assert_eq!(record.public_ip(), Some("34.10.0.7"));

        record.register(Some("exit-1".into()), Some("34.10.0.7".into()));
        assert_eq!(record.lifecycle.name(), "registered");
        assert!(record.lifecycle.instance().is_some());
        assert!(record.last_seen_at.is_some());

        record.set_desired_wg_conf("confA");
        record.record_status(applied("confA"));
        assert_eq!(record.lifecycle.name(), "converged");

        record.set_desired_wg_conf("confB");
        assert_eq!(record.lifecycle.name(), "registered");
        assert_eq!(record.status_json(), applied("confA"));

        record.record_status(applied("confB"));
        assert_eq!(record.lifecycle.name(), "converged");
    }

    #[test]
    fn test_reregistration_keeps_convergence() {
        let mut record = AgentRecord::bootstrap("h".into(), None, None);
        record.register(None, None);
        record.set_desired_wg_conf("confA");
        record.record_status(applied("confA"));

        record.register(Some("exit-1".into()), Some("1.2.3.4".into()));
        assert_eq!(record.lifecycle.name(), "converged");
        assert_eq!(record.public_ip(), Some("1.2.3.4"));
    }

    #[test]
    fn test_status_before_register_registers_implicitly() {
        let mut record = AgentRecord::bootstrap("h".into(), None, None);
        record.record_status(json!({"ts": 1.0, "error": "wg-quick failed"}));
        assert_eq!(record.lifecycle.name(), "registered");
        assert!(record.lifecycle.registration().is_some());
        assert!(record.lifecycle.status().is_some());
    }

    #[test]
    fn test_error_status_is_not_converged() {
        let mut record = AgentRecord::bootstrap("h".into(), None, None);
        record.set_desired_wg_conf("confA");
        record.record_status(applied("confA"));
        record.record_status(json!({"ts": 2.0, "error": "boom"}));
        assert_eq!(record.lifecycle.name(), "registered");
    }

    #[test]
    fn test_empty_desired_never_converges() {
        let mut record = AgentRecord::bootstrap("h".into(), None, None);
        record.record_status(json!({"ts": 1.0, "wg_conf_hash": "", "applied": false}));
        assert_eq!(record.lifecycle.name(), "registered");
    }

    #[test]
    fn test_lifecycle_serializes_with_state_tag() {
        let lifecycle = AgentLifecycle::Provisioned {
            instance: attachment(),
        };
        let value = serde_json::to_value(&lifecycle).unwrap();
        assert_eq!(value["state"], "provisioned");
        let back: AgentLifecycle = serde_json::from_value(value).unwrap();
        assert_eq!(back, lifecycle);
    }
}
