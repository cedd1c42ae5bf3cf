//! CBOR encoding for stored commits and wire frames

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MeshError;

pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, MeshError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| MeshError::Cbor(e.to_string()))?;
    Ok(buf)
}

pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MeshError> {
    ciborium::from_reader(bytes).map_err(|e| MeshError::Cbor(e.to_string()))
}
