//! Per-document encryption keys
//!
//! Documents in an encrypted collection carry sealed field payloads. Every
//! node derives its own AES-256 key per document from its master secret
//! with HKDF-SHA256 and seals its writes with it. Each sealed payload names
//! its key by a [`KeyId`] fingerprint, so a document with branches from
//! several writers needs one key per writer. Keys are handed to peers on
//! request. A node missing a key stores and relays sealed commits but
//! cannot materialize the document.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoding::{from_cbor, to_cbor};
use crate::error::MeshError;
use crate::types::commit::{FieldDelta, FieldPayload};
use crate::types::ids::{id_to_hex, DocId, KeyId};

const NONCE_LEN: usize = 12;

/// Source of document keys consulted by the assembler
pub trait KeyStore: Send + Sync {
    fn key_for(&self, doc_id: &DocId, key_id: &KeyId) -> Option<DocKey>;

    fn insert(&self, doc_id: DocId, key: DocKey);
}

/// Symmetric key for one document
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocKey(pub [u8; 32]);

impl std::fmt::Debug for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocKey({})", id_to_hex(&self.id()))
    }
}

impl DocKey {
    /// Fingerprint naming this key in sealed payloads
    pub fn id(&self) -> KeyId {
        let mut hasher = Sha256::new();
        hasher.update(b"dagmesh-key-id");
        hasher.update(self.0);
        let digest = hasher.finalize();
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        id
    }

    /// Encrypt with a random nonce. Returns nonce || ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, MeshError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.0).map_err(|e| MeshError::Crypto(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| MeshError::Crypto(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt nonce || ciphertext
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, MeshError> {
        if data.len() < NONCE_LEN {
            return Err(MeshError::Crypto(
                "ciphertext too short (missing nonce)".to_string(),
            ));
        }
        let cipher =
            Aes256Gcm::new_from_slice(&self.0).map_err(|e| MeshError::Crypto(e.to_string()))?;
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|e| MeshError::Crypto(e.to_string()))
    }
}

/// Node-local key store with a master secret for deriving this node's own
/// document keys
pub struct Keyring {
    master: [u8; 32],
    keys: RwLock<HashMap<DocId, BTreeMap<KeyId, DocKey>>>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("keys", &self.len())
            .finish()
    }
}

impl Keyring {
    /// Keyring with a fresh random master secret
    pub fn generate() -> Self {
        let mut master = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master);
        Self::new(master)
    }

    pub fn new(master: [u8; 32]) -> Self {
        Self {
            master,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// This node's key for a document. Derivation is deterministic, so
    /// calling this twice for the same document yields the same key.
    pub fn create_key(&self, doc_id: &DocId) -> DocKey {
        let hk = Hkdf::<Sha256>::new(None, &self.master);
        let info = format!("dagmesh-doc-{}", id_to_hex(doc_id));
        let mut okm = [0u8; 32];
        hk.expand(info.as_bytes(), &mut okm)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        let key = DocKey(okm);
        self.insert(*doc_id, key);
        key
    }

    /// Whether any key for the document is held
    pub fn holds(&self, doc_id: &DocId) -> bool {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(doc_id)
            .is_some_and(|keys| !keys.is_empty())
    }

    /// Master secret, for persisting next to the node key
    pub fn master_hex(&self) -> String {
        id_to_hex(&self.master)
    }

    /// Number of held keys across all documents
    pub fn len(&self) -> usize {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All held keys, for persisting in the node's metadata
    pub fn export(&self) -> Vec<(DocId, DocKey)> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<(DocId, DocKey)> = keys
            .iter()
            .flat_map(|(doc, held)| held.values().map(move |k| (*doc, *k)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id().cmp(&b.1.id())));
        out
    }

    pub fn import(&self, entries: Vec<(DocId, DocKey)>) {
        for (doc_id, key) in entries {
            self.insert(doc_id, key);
        }
    }
}

impl KeyStore for Keyring {
    fn key_for(&self, doc_id: &DocId, key_id: &KeyId) -> Option<DocKey> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(doc_id)
            .and_then(|held| held.get(key_id))
            .copied()
    }

    fn insert(&self, doc_id: DocId, key: DocKey) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(doc_id)
            .or_default()
            .insert(key.id(), key);
    }
}

/// Seal a field delta for storage in an encrypted collection
pub fn seal_delta(key: &DocKey, delta: &FieldDelta) -> Result<FieldPayload, MeshError> {
    let plaintext = to_cbor(delta)?;
    Ok(FieldPayload::Sealed {
        key_id: key.id(),
        data: key.seal(&plaintext)?,
    })
}

/// Recover the delta of a field payload. Plain payloads need no key.
pub fn open_payload(
    keys: &dyn KeyStore,
    doc_id: &DocId,
    payload: &FieldPayload,
) -> Result<FieldDelta, MeshError> {
    match payload {
        FieldPayload::Plain(delta) => Ok(delta.clone()),
        FieldPayload::Sealed { key_id, data } => {
            let key = keys.key_for(doc_id, key_id).ok_or_else(|| {
                MeshError::Unauthorized(format!("no key {} for sealed payload", id_to_hex(key_id)))
            })?;
            from_cbor(&key.open(data)?)
        }
    }
}
