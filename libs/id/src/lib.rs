//! # nave-id
//!
//! Typed identifiers for records owned by the nave control plane.
//!
//! Every ID renders as `{prefix}_{ulid}`, for example
//! `agt_01HV4Z2WQXKJNM8GPQY6VBKC3D`. Parsing is strict: the prefix must
//! match the type and the remainder must be a valid ULID, so an agent ID
//! can never be confused with a request ID on the wire.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
