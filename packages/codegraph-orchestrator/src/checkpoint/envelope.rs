//! On-disk checkpoint format
//!
//! ```text
//! "CGCK" | header_len: u32 LE | header (bincode) | payload
//! ```
//!
//! The header carries the SHA-256 of the payload; it can be read without
//! touching the payload.

use crate::dag::CacheKey;
use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const MAGIC: &[u8; 4] = b"CGCK";
pub const FORMAT_VERSION: u32 = 1;
pub const PREAMBLE_LEN: usize = 8;
pub const MAX_HEADER_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub version: u32,
    pub stage: StageId,
    pub repo_id: String,
    pub snapshot_id: String,
    pub job_id: Uuid,
    /// sha256(payload), hex
    pub checksum: String,
    pub payload_len: u64,
    pub created_at: DateTime<Utc>,
}

impl CheckpointHeader {
    pub fn new(key: &CacheKey, job_id: Uuid, payload: &[u8]) -> Self {
        Self {
            version: FORMAT_VERSION,
            stage: key.stage.clone(),
            repo_id: key.repo_id.clone(),
            snapshot_id: key.snapshot_id.clone(),
            job_id,
            checksum: payload_checksum(payload),
            payload_len: payload.len() as u64,
            created_at: Utc::now(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.stage.clone(), &self.repo_id, &self.snapshot_id)
    }
}

pub fn payload_checksum(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

fn corrupt(key: &str, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::CorruptCheckpoint {
        cache_key: key.to_string(),
        reason: reason.into(),
    }
}

pub fn encode(header: &CheckpointHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let header_bytes = bincode::serialize(header)?;
    let mut out = Vec::with_capacity(PREAMBLE_LEN + header_bytes.len() + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Header length from the 8-byte preamble
pub fn header_len(key: &str, preamble: &[u8]) -> Result<usize> {
    if preamble.len() < PREAMBLE_LEN || &preamble[..4] != MAGIC {
        return Err(corrupt(key, "bad magic"));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&preamble[4..8]);
    let len = u32::from_le_bytes(len);
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(corrupt(key, format!("implausible header length {}", len)));
    }
    Ok(len as usize)
}

pub fn decode_header(key: &str, header_bytes: &[u8]) -> Result<CheckpointHeader> {
    let header: CheckpointHeader = bincode::deserialize(header_bytes)
        .map_err(|e| corrupt(key, format!("unreadable header: {}", e)))?;
    if header.version != FORMAT_VERSION {
        return Err(corrupt(
            key,
            format!("unsupported format version {}", header.version),
        ));
    }
    Ok(header)
}

/// Decode a whole file and verify it belongs to `key` and matches its checksum.
pub fn decode(key: &CacheKey, bytes: &[u8]) -> Result<(CheckpointHeader, Vec<u8>)> {
    let key_str = key.to_string();
    let len = header_len(&key_str, bytes)?;
    let payload_start = PREAMBLE_LEN + len;
    if bytes.len() < payload_start {
        return Err(corrupt(&key_str, "truncated header"));
    }

    let header = decode_header(&key_str, &bytes[PREAMBLE_LEN..payload_start])?;
    if header.cache_key() != *key {
        return Err(corrupt(
            &key_str,
            format!("file belongs to {}", header.cache_key()),
        ));
    }

    let payload = &bytes[payload_start..];
    if payload.len() as u64 != header.payload_len {
        return Err(corrupt(
            &key_str,
            format!(
                "payload length {} != recorded {}",
                payload.len(),
                header.payload_len
            ),
        ));
    }
    if payload_checksum(payload) != header.checksum {
        return Err(corrupt(&key_str, "checksum mismatch"));
    }

    Ok((header, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new(StageId::IR, "repo", "snap")
    }

    #[test]
    fn test_encode_decode() {
        let payload = b"stage output".to_vec();
        let header = CheckpointHeader::new(&key(), Uuid::new_v4(), &payload);
        let bytes = encode(&header, &payload).unwrap();

        let (decoded, body) = decode(&key(), &bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_flipped_payload_byte_detected() {
        let payload = vec![7u8; 64];
        let header = CheckpointHeader::new(&key(), Uuid::new_v4(), &payload);
        let mut bytes = encode(&header, &payload).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = decode(&key(), &bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_truncated_payload_detected() {
        let payload = vec![1u8; 32];
        let header = CheckpointHeader::new(&key(), Uuid::new_v4(), &payload);
        let bytes = encode(&header, &payload).unwrap();

        assert!(decode(&key(), &bytes[..bytes.len() - 5]).is_err());
        assert!(decode(&key(), &bytes[..3]).is_err());
    }

    #[test]
    fn test_key_mismatch_detected() {
        let payload = b"x".to_vec();
        let header = CheckpointHeader::new(&key(), Uuid::new_v4(), &payload);
        let bytes = encode(&header, &payload).unwrap();

        let other = CacheKey::new(StageId::CHUNKS, "repo", "snap");
        assert!(decode(&other, &bytes).is_err());
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            payload_checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
