//! Agent bootstrap tokens.
//!
//! Token format: `nvt_<32 random bytes, URL-safe base64>`. Only the SHA-256
//! hash is stored; the plaintext is returned once, at issue time.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const AGENT_TOKEN_PREFIX: &str = "nvt_";

/// Token bytes (32 bytes = 256 bits of entropy).
const TOKEN_BYTES: usize = 32;

/// Generate a new agent bootstrap token.
pub fn generate_agent_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    format!("{AGENT_TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token for storage using SHA-256, as lowercase hex.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
