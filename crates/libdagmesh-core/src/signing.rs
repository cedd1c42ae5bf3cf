//! Ed25519 node identity and message signing
//!
//! A node's peer id is its Ed25519 verifying key. Signatures are detached:
//! they cover the serialized message body, so a verifier only needs the
//! sender's peer id and the exact bytes that went over the wire.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ids::PeerId;

/// Ed25519 key pair identifying a node
#[derive(Clone)]
pub struct NodeKeypair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("peer_id", &hex::encode(self.peer_id()))
            .finish()
    }
}

impl NodeKeypair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from a 32-byte seed (hex-encoded)
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, SigningError> {
        let seed_bytes =
            hex::decode(seed_hex).map_err(|e| SigningError::KeyParseError(e.to_string()))?;

        if seed_bytes.len() != 32 {
            return Err(SigningError::KeyParseError(format!(
                "Seed must be 32 bytes, got {}",
                seed_bytes.len()
            )));
        }

        let mut seed_array = [0u8; 32];
        seed_array.copy_from_slice(&seed_bytes);

        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed_array),
        })
    }

    /// Get the seed as hex (for storage)
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Peer id derived from the verifying key
    pub fn peer_id(&self) -> PeerId {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// How strictly inbound message signatures are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationPolicy {
    /// No signature verification
    Off,
    /// Log invalid signatures but accept the message
    Warn,
    /// Reject messages whose signature does not verify
    #[default]
    Require,
}

impl VerificationPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(VerificationPolicy::Off),
            "warn" => Some(VerificationPolicy::Warn),
            "require" => Some(VerificationPolicy::Require),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationPolicy::Off => "off",
            VerificationPolicy::Warn => "warn",
            VerificationPolicy::Require => "require",
        }
    }
}

/// Errors that can occur during signing or verification
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("key parse error: {0}")]
    KeyParseError(String),

    #[error("signature parse error: {0}")]
    SignatureParseError(String),
}

/// Verify a detached signature over `message` made by `peer_id`
pub fn verify_signature(peer_id: &PeerId, message: &[u8], signature: &[u8]) -> Result<(), SigningError> {
    let verifying_key =
        VerifyingKey::from_bytes(peer_id).map_err(|e| SigningError::KeyParseError(e.to_string()))?;

    if signature.len() != 64 {
        return Err(SigningError::SignatureParseError(format!(
            "Signature must be 64 bytes, got {}",
            signature.len()
        )));
    }

    let mut sig_array = [0u8; 64];
    sig_array.copy_from_slice(signature);
    let sig = Signature::from_bytes(&sig_array);

    verifying_key
        .verify(message, &sig)
        .map_err(|_| SigningError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_seed() {
        let keypair1 = NodeKeypair::generate();
        let seed = keypair1.seed_hex();
        assert_eq!(seed.len(), 64);

        let keypair2 = NodeKeypair::from_seed_hex(&seed).unwrap();
        assert_eq!(keypair1.peer_id(), keypair2.peer_id());
    }

    #[test]
    fn test_bad_seed_rejected() {
        assert!(matches!(
            NodeKeypair::from_seed_hex("abcd"),
            Err(SigningError::KeyParseError(_))
        ));
        assert!(NodeKeypair::from_seed_hex("not hex").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = NodeKeypair::generate();
        let signature = keypair.sign(b"hello");
        assert_eq!(signature.len(), 64);
        assert!(verify_signature(&keypair.peer_id(), b"hello", &signature).is_ok());
    }

    #[test]
    fn test_tampered_message_rejected() {
        let keypair = NodeKeypair::generate();
        let signature = keypair.sign(b"hello");
        let result = verify_signature(&keypair.peer_id(), b"hellp", &signature);
        assert!(matches!(result, Err(SigningError::InvalidSignature)));
    }

    #[test]
    fn test_wrong_peer_rejected() {
        let keypair1 = NodeKeypair::generate();
        let keypair2 = NodeKeypair::generate();
        let signature = keypair1.sign(b"hello");
        let result = verify_signature(&keypair2.peer_id(), b"hello", &signature);
        assert!(matches!(result, Err(SigningError::InvalidSignature)));
    }

    #[test]
    fn test_short_signature_rejected() {
        let keypair = NodeKeypair::generate();
        let result = verify_signature(&keypair.peer_id(), b"hello", &[0u8; 10]);
        assert!(matches!(result, Err(SigningError::SignatureParseError(_))));
    }

    #[test]
    fn test_verification_policy_parse() {
        assert_eq!(VerificationPolicy::parse("off"), Some(VerificationPolicy::Off));
        assert_eq!(VerificationPolicy::parse("WARN"), Some(VerificationPolicy::Warn));
        assert_eq!(VerificationPolicy::parse("require"), Some(VerificationPolicy::Require));
        assert_eq!(VerificationPolicy::parse("invalid"), None);
        assert_eq!(VerificationPolicy::default().as_str(), "require");
    }
}
