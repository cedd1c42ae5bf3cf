use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// 256-bit commit identifier (content-addressed BLAKE2b-256)
pub type Cid = [u8; 32];

/// 128-bit document identifier (content-derived)
pub type DocId = [u8; 16];

/// 256-bit peer identifier (ed25519 public key)
pub type PeerId = [u8; 32];

/// 64-bit document key fingerprint carried by sealed payloads
pub type KeyId = [u8; 8];

/// Prefix of the textual document id form
pub const DOC_ID_PREFIX: &str = "bae-";

#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid document id '{0}'")]
    InvalidDocId(String),
}

/// Derive a document id from its collection and the canonical encoding of
/// its initial fields.
///
/// SHA-256 over `collection || 0x00 || fields`, truncated to 16 bytes and
/// stamped with the RFC 4122 name-based version and variant bits.
pub fn derive_doc_id(collection: &str, canonical_fields: &[u8]) -> DocId {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_fields);
    let digest = hasher.finalize();

    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id[6] = (id[6] & 0x0f) | 0x50;
    id[8] = (id[8] & 0x3f) | 0x80;
    id
}

/// Render a document id as `bae-<uuid>`
pub fn doc_id_to_string(id: &DocId) -> String {
    format!("{}{}", DOC_ID_PREFIX, Uuid::from_bytes(*id))
}

/// Parse a `bae-<uuid>` document id
pub fn parse_doc_id(s: &str) -> Result<DocId, IdParseError> {
    let raw = s
        .strip_prefix(DOC_ID_PREFIX)
        .ok_or_else(|| IdParseError::InvalidDocId(s.to_string()))?;
    let uuid = Uuid::parse_str(raw).map_err(|_| IdParseError::InvalidDocId(s.to_string()))?;
    Ok(*uuid.as_bytes())
}

/// Generate a counter nonce for update deltas. Zero is reserved for creates.
pub fn generate_nonce() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

/// Convert a fixed-size byte array to lowercase hex string
pub fn id_to_hex<const N: usize>(id: &[u8; N]) -> String {
    hex::encode(id)
}

/// Abbreviated hex form used in log fields
pub fn short_hex<const N: usize>(id: &[u8; N]) -> String {
    hex::encode(&id[..N.min(6)])
}

/// Parse a hex string into a fixed-size byte array
pub fn hex_to_id<const N: usize>(hex_str: &str) -> Result<[u8; N], IdParseError> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != N {
        return Err(IdParseError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Parse a commit id from hex string
pub fn parse_cid(hex_str: &str) -> Result<Cid, IdParseError> {
    hex_to_id::<32>(hex_str)
}

/// Parse a peer id from hex string
pub fn parse_peer_id(hex_str: &str) -> Result<PeerId, IdParseError> {
    hex_to_id::<32>(hex_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_is_content_derived() {
        let a = derive_doc_id("Users", b"fields-a");
        let b = derive_doc_id("Users", b"fields-a");
        let c = derive_doc_id("Users", b"fields-b");
        let d = derive_doc_id("Books", b"fields-a");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_doc_id_string_roundtrip() {
        let id = derive_doc_id("Users", b"{}");
        let s = doc_id_to_string(&id);
        assert!(s.starts_with("bae-"));
        assert_eq!(Uuid::from_bytes(id).get_version_num(), 5);
        assert_eq!(parse_doc_id(&s).unwrap(), id);
    }

    #[test]
    fn test_parse_doc_id_rejects_missing_prefix() {
        let id = derive_doc_id("Users", b"{}");
        let bare = Uuid::from_bytes(id).to_string();
        assert!(matches!(parse_doc_id(&bare), Err(IdParseError::InvalidDocId(_))));
    }

    #[test]
    fn test_hex_roundtrip() {
        let id: Cid = [7u8; 32];
        let hex_str = id_to_hex(&id);
        assert_eq!(hex_str.len(), 64);
        assert_eq!(parse_cid(&hex_str).unwrap(), id);
    }

    #[test]
    fn test_hex_to_id_wrong_length() {
        let result: Result<[u8; 16], _> = hex_to_id("0011");
        assert!(matches!(
            result,
            Err(IdParseError::InvalidLength { expected: 16, actual: 2 })
        ));
    }

    #[test]
    fn test_nonce_never_zero() {
        for _ in 0..1000 {
            assert_ne!(generate_nonce(), 0);
        }
    }
}
