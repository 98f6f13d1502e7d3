//! Node startup script rendering.

use nave_id::AgentId;

const TEMPLATE: &str = include_str!("startup-script.sh");

/// Values baked into a node's startup script.
#[derive(Debug, Clone)]
pub struct StartupScript<'a> {
    pub api_base: &'a str,
    pub agent_id: &'a AgentId,
    pub agent_token: &'a str,
    pub vm_name: &'a str,
}

impl StartupScript<'_> {
    /// Render the boot script: install WireGuard, enable forwarding and NAT,
    /// fetch the agent and run it as an always-restart service.
    pub fn render(&self) -> String {
        TEMPLATE
            .replace("{{API_BASE}}", &shell_quote(self.api_base))
            .replace("{{AGENT_ID}}", &shell_quote(&self.agent_id.to_string()))
            .replace("{{AGENT_TOKEN}}", &shell_quote(self.agent_token))
            .replace("{{VM_NAME}}", &shell_quote(self.vm_name))
    }
}

/// Escape a value for use inside single quotes.
fn shell_quote(value: &str) -> String {
    value.replace('\'', r"'\''")
}
