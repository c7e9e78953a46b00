//! Snapshot envelope for persisted cache and queue state.
//!
//! Wire format (bincode `standard()` envelope, so integers are varints):
//! ```text
//! ┌─────────┬─────────────┬────────────────┬──────────┬───────────────────────────┐
//! │ version │ kind        │ household_id   │ checksum │ payload                   │
//! │ u8      │ variant idx │ len(16) + 16 B │ varint   │ varint len + LZ4(bincode) │
//! └─────────┴─────────────┴────────────────┴──────────┴───────────────────────────┘
//! ```
//!
//! `kind` goes on the wire as its 0-based serde variant index. The `repr`
//! values of [`SnapshotKind`] only feed the checksum.
//!
//! The checksum covers kind, household and compressed payload, so a torn or
//! foreign value is rejected instead of silently loading garbage.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StoreError;

/// Current envelope format version.
pub const FORMAT_VERSION: u8 = 1;

/// Which logical snapshot an envelope holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SnapshotKind {
    Cache = 1,
    Queue = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u8,
    kind: SnapshotKind,
    household_id: Uuid,
    checksum: u32,
    payload: Vec<u8>,
}

/// FNV-1a style fold over the envelope fields.
fn checksum(kind: SnapshotKind, household_id: &Uuid, payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    hash ^= kind as u32;
    hash = hash.wrapping_mul(0x0100_0193);
    for byte in household_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    for chunk in payload.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Encode `value` as a checksummed, compressed snapshot.
pub fn encode<T: Serialize>(
    kind: SnapshotKind,
    household_id: Uuid,
    value: &T,
) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let payload = lz4_flex::compress_prepend_size(&raw);
    let envelope = Envelope {
        version: FORMAT_VERSION,
        kind,
        household_id,
        checksum: checksum(kind, &household_id, &payload),
        payload,
    };
    bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a snapshot written by [`encode`], verifying kind, scope and checksum.
pub fn decode<T: DeserializeOwned>(
    kind: SnapshotKind,
    household_id: Uuid,
    bytes: &[u8],
) -> Result<T, StoreError> {
    let (envelope, _): (Envelope, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;

    if envelope.version != FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion(envelope.version));
    }
    if envelope.kind != kind
        || envelope.checksum != checksum(envelope.kind, &envelope.household_id, &envelope.payload)
    {
        return Err(StoreError::ChecksumMismatch { kind });
    }
    if envelope.household_id != household_id {
        return Err(StoreError::WrongScope {
            expected: household_id,
            found: envelope.household_id,
        });
    }

    let raw = lz4_flex::decompress_size_prepended(&envelope.payload)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let household = Uuid::new_v4();
        let value = vec!["Milk".to_string(), "Bread".to_string()];

        let bytes = encode(SnapshotKind::Cache, household, &value).unwrap();
        let decoded: Vec<String> = decode(SnapshotKind::Cache, household, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_snapshot_rejects_wrong_kind() {
        let household = Uuid::new_v4();
        let bytes = encode(SnapshotKind::Cache, household, &42u32).unwrap();
        let result: Result<u32, _> = decode(SnapshotKind::Queue, household, &bytes);
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_snapshot_rejects_foreign_household() {
        let bytes = encode(SnapshotKind::Queue, Uuid::new_v4(), &1u8).unwrap();
        let result: Result<u8, _> = decode(SnapshotKind::Queue, Uuid::new_v4(), &bytes);
        assert!(matches!(result, Err(StoreError::WrongScope { .. })));
    }

    #[test]
    fn test_snapshot_detects_corrupted_payload() {
        let household = Uuid::new_v4();
        let value = "x".repeat(256);
        let bytes = encode(SnapshotKind::Cache, household, &value).unwrap();

        // Re-wrap the envelope with a flipped payload byte but the old checksum.
        let (mut envelope, _): (Envelope, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        let last = envelope.payload.len() - 1;
        envelope.payload[last] ^= 0xFF;
        let tampered =
            bincode::serde::encode_to_vec(&envelope, bincode::config::standard()).unwrap();

        let result: Result<String, _> = decode(SnapshotKind::Cache, household, &tampered);
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_snapshot_garbage_bytes() {
        let result: Result<u8, _> = decode(SnapshotKind::Cache, Uuid::new_v4(), &[0xFF, 0xFE]);
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_compresses_repetitive_state() {
        let household = Uuid::new_v4();
        let value: Vec<String> = (0..200).map(|_| "Toilet paper".to_string()).collect();
        let raw = bincode::serde::encode_to_vec(&value, bincode::config::standard()).unwrap();
        let bytes = encode(SnapshotKind::Cache, household, &value).unwrap();
        assert!(bytes.len() < raw.len() / 2);
    }

    #[test]
    fn test_envelope_header_layout() {
        let household = Uuid::new_v4();
        let cache = encode(SnapshotKind::Cache, household, &1u8).unwrap();
        let queue = encode(SnapshotKind::Queue, household, &1u8).unwrap();

        assert_eq!(cache[0], FORMAT_VERSION);
        assert_eq!(cache[1], 0);
        assert_eq!(queue[1], 1);
        assert_eq!(cache[2], 16);
        assert_eq!(&cache[3..19], household.as_bytes());
    }
}
