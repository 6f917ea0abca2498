//! Save/restore blob: magic + count header, then `(key, size, bytes)`
//! tuples for every serializable value. The format is versioned solely by
//! its magic.

use thiserror::Error;
use vsmc_types::{SmcKey, SmcResult, MAX_VALUE_SIZE};

use crate::store::Keystore;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SMC1";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot truncated")]
    Truncated,
    #[error("bad snapshot magic")]
    BadMagic,
    #[error("oversized value for key {key} ({size} bytes)")]
    OversizedValue { key: SmcKey, size: u8 },
    #[error("stored size {found} for key {key} does not match the live key ({expected})")]
    SizeMismatch {
        key: SmcKey,
        found: u8,
        expected: u8,
    },
    #[error("restoring key {key} failed with result {code:#04x}")]
    WriteRejected { key: SmcKey, code: u8 },
}

impl Keystore {
    /// Serialize every persistent value. Never fails; values whose read hook
    /// errors are skipped with a warning.
    pub fn store_snapshot(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&SNAPSHOT_MAGIC);
        blob.extend_from_slice(&0u32.to_be_bytes());

        let mut count = 0u32;
        let mut scratch = [0u8; MAX_VALUE_SIZE];
        for (key, value) in self.serializable_entries() {
            let size = value.meta().size as usize;
            match value.read(&mut scratch[..size]) {
                SmcResult::Success => {
                    blob.extend_from_slice(&key.to_wire());
                    blob.push(size as u8);
                    blob.extend_from_slice(&scratch[..size]);
                    count += 1;
                }
                other => {
                    tracing::warn!(
                        target: "kstore",
                        key = %key,
                        code = other.code(),
                        "value refused serialization"
                    );
                }
            }
        }
        blob[4..8].copy_from_slice(&count.to_be_bytes());
        tracing::debug!(target: "kstore", count, bytes = blob.len(), "snapshot stored");
        blob
    }

    /// Restore values from a blob produced by [`Keystore::store_snapshot`].
    /// Unknown keys are skipped with a warning; malformed blobs are
    /// rejected without applying anything past the fault.
    pub fn load_snapshot(&self, blob: &[u8]) -> Result<(), SnapshotError> {
        let header = blob.get(..8).ok_or(SnapshotError::Truncated)?;
        if header[..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let count = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        let mut cursor = 8usize;
        for _ in 0..count {
            let tuple = blob.get(cursor..cursor + 5).ok_or(SnapshotError::Truncated)?;
            let key = SmcKey::from_wire([tuple[0], tuple[1], tuple[2], tuple[3]]);
            let size = tuple[4];
            if size as usize > MAX_VALUE_SIZE {
                return Err(SnapshotError::OversizedValue { key, size });
            }
            cursor += 5;
            let data = blob
                .get(cursor..cursor + size as usize)
                .ok_or(SnapshotError::Truncated)?;
            cursor += size as usize;

            let Some(value) = self.backing_of(key).filter(|v| v.serializable()) else {
                tracing::warn!(target: "kstore", key = %key, "snapshot carries an unknown key");
                continue;
            };
            let expected = value.meta().size;
            if size != expected {
                return Err(SnapshotError::SizeMismatch {
                    key,
                    found: size,
                    expected,
                });
            }
            match value.write(data) {
                SmcResult::Success => {}
                other => {
                    return Err(SnapshotError::WriteRejected {
                        key,
                        code: other.code(),
                    })
                }
            }
        }
        tracing::debug!(target: "kstore", count, "snapshot restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vsmc_types::{KeyAttributes, SmcKeyType};

    use super::*;
    use crate::store::{KeyDef, KeystoreCallbacks, KeystoreConfig};

    fn store_with_persisted() -> Keystore {
        let def = KeyDef::new(
            SmcKey::from_chars(*b"TEST"),
            SmcKeyType::UI16,
            KeyAttributes::READ | KeyAttributes::WRITE,
            &[0, 0],
        )
        .serialized();
        Keystore::new(KeystoreConfig::default(), KeystoreCallbacks::default(), vec![def]).unwrap()
    }

    #[test]
    fn blob_round_trips_persistent_values() {
        let key = SmcKey::from_chars(*b"TEST");
        let store = store_with_persisted();
        store.write(key, &[0x03, 0xe8]).unwrap();
        let blob = store.store_snapshot();
        assert_eq!(&blob[..4], b"SMC1");

        let fresh = store_with_persisted();
        fresh.load_snapshot(&blob).unwrap();
        assert_eq!(fresh.read(key).unwrap().bytes(), &[0x03, 0xe8]);
    }

    #[test]
    fn malformed_blobs_are_rejected() {
        let store = store_with_persisted();
        assert!(matches!(
            store.load_snapshot(b"SMC"),
            Err(SnapshotError::Truncated)
        ));
        assert!(matches!(
            store.load_snapshot(b"NOPE\x00\x00\x00\x00"),
            Err(SnapshotError::BadMagic)
        ));

        let mut blob = store.store_snapshot();
        blob.truncate(blob.len() - 1);
        assert!(matches!(
            store.load_snapshot(&blob),
            Err(SnapshotError::Truncated)
        ));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let mut blob = Vec::new();
        blob.extend_from_slice(b"SMC1");
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(b"GONE");
        blob.push(1);
        blob.push(0xff);

        let store = store_with_persisted();
        store.load_snapshot(&blob).unwrap();
    }
}
