//! Agent token handling.
//!
//! Only the SHA-256 digest of an agent token is ever stored. Presented
//! tokens are hashed and compared against the digest in constant time.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// A plaintext agent token as presented by a caller.
///
/// `Debug` never prints the value.
#[derive(Clone)]
pub struct AgentToken(String);

impl AgentToken {
    /// Wraps a presented token, rejecting blank values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the token is empty or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::InvalidInput("agent token cannot be empty".into()));
        }
        Ok(Self(value))
    }

    /// Returns the digest that would be stored for this token.
    #[must_use]
    pub fn digest(&self) -> TokenDigest {
        TokenDigest::of(self.0.as_bytes())
    }
}

impl fmt::Debug for AgentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentToken([REDACTED])")
    }
}

/// Hex-encoded SHA-256 digest of an agent token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenDigest(String);

impl TokenDigest {
    fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Returns true if `token` hashes to this digest.
    #[must_use]
    pub fn verify(&self, token: &AgentToken) -> bool {
        constant_time_eq(self.0.as_bytes(), token.digest().0.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }

    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_verifies_same_token() {
        let token = AgentToken::new("s3cret-agent").expect("token");
        let digest = token.digest();
        assert!(digest.verify(&token));
        assert!(!digest.verify(&AgentToken::new("other").expect("token")));
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = AgentToken::new("abc").expect("token").digest();
        assert_eq!(
            digest.0,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_debug_hides_token() {
        let token = AgentToken::new("hunter2").expect("token");
        assert!(!format!("{token:?}").contains("hunter2"));
    }

    #[test]
    fn test_blank_token_rejected() {
        assert!(AgentToken::new("").is_err());
    }

    #[test]
    fn test_constant_time_eq_lengths() {
        assert!(constant_time_eq(b"ab", b"ab"));
        assert!(!constant_time_eq(b"ab", b"abc"));
    }
}
