//! Security Layer
//!
//! Shared-secret authentication of inbound requests. The token travels in
//! the `actor-token` header and is compared in constant time.

use crate::{Result, TransportError};

/// Verifies the `actor-token` header against the configured secret
#[derive(Debug, Clone, Default)]
pub struct TokenVerifier {
    token: Option<String>,
}

impl TokenVerifier {
    /// No token configured means every request is accepted
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn verify(&self, presented: Option<&str>) -> Result<()> {
        let Some(expected) = &self.token else {
            return Ok(());
        };
        match presented {
            Some(presented) if constant_time_eq(expected.as_bytes(), presented.as_bytes()) => {
                Ok(())
            }
            Some(_) => Err(TransportError::security("token mismatch")),
            None => Err(TransportError::security("token required")),
        }
    }
}

/// Compare without leaking the position of the first difference
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret1"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_verifier() {
        let open = TokenVerifier::new(None);
        assert!(open.verify(None).is_ok());
        assert!(!TokenVerifier::new(Some(String::new())).is_enabled());

        let verifier = TokenVerifier::new(Some("s3cret".to_string()));
        assert!(verifier.verify(Some("s3cret")).is_ok());
        assert!(verifier.verify(Some("guess")).is_err());
        let err = verifier.verify(None).unwrap_err();
        assert_eq!(err.category(), "security");
    }
}
