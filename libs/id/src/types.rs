//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// Identifies one agent record (one provisioned or bootstrapped exit node).
    AgentId,
    "agt"
);

define_id!(
    /// Correlates log lines and problem documents for a single HTTP request.
    RequestId,
    "req"
);
