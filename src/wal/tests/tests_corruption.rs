//! Corruption handling: header damage is fatal, tail damage is repaired.
//!
//! Corruption is simulated by editing the bytes held by `MemStorage`
//! directly.

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use crate::storage::{MemStorage, Storage};
    use crate::wal::tests::helpers::*;
    use crate::wal::{WAL_HEADER_SIZE, Wal, WalError, WalHeader, WalRecord};

    fn open_result(storage: &MemStorage, path: &Path) -> Result<Wal<WalRecord>, WalError> {
        Wal::open(
            Arc::new(storage.clone()),
            path,
            WalHeader::DEFAULT_MAX_RECORD_SIZE,
            true,
        )
    }

    /// # Scenario
    /// A flipped byte inside the header makes the header CRC mismatch.
    ///
    /// # Starting environment
    /// Freshly created WAL.
    ///
    /// # Actions
    /// 1. Overwrite byte 2 (inside the magic) with `0x99`.
    /// 2. Reopen.
    ///
    /// # Expected behavior
    /// `Wal::open()` fails with `InvalidHeader`.
    #[test]
    fn corrupted_header_is_fatal() {
        let (storage, path) = mem_fixture();
        drop(open_wal(&storage, &path));

        let mut bytes = storage.read_all(&path).unwrap();
        bytes[2] = 0x99;
        storage.write_all(&path, &bytes).unwrap();

        let err = open_result(&storage, &path).unwrap_err();
        assert!(matches!(err, WalError::InvalidHeader(_)));
        assert!(err.to_string().contains("header checksum mismatch"));
    }

    /// # Scenario
    /// A file shorter than the header (crash during creation) is
    /// reinitialised rather than rejected.
    #[test]
    fn short_header_is_reinitialised() {
        let (storage, path) = mem_fixture();
        storage.write_all(&path, b"TWA").unwrap();

        let wal = open_wal(&storage, &path);
        assert!(replay_all(&wal).is_empty());
        assert_eq!(storage.len(&path).unwrap(), WAL_HEADER_SIZE as u64);
    }

    /// # Scenario
    /// A crash mid-append leaves a half-written final record.
    ///
    /// # Starting environment
    /// WAL with three good records.
    ///
    /// # Actions
    /// 1. Chop the last 3 bytes off the file.
    /// 2. Reopen and replay.
    /// 3. Append one more record, reopen, replay.
    ///
    /// # Expected behavior
    /// The first two records survive; the torn one is dropped and the file
    /// is cut back so the new append follows the good prefix.
    #[test]
    fn truncated_tail_is_dropped() {
        let (storage, path) = mem_fixture();
        {
            let wal = open_wal(&storage, &path);
            wal.append(&put("a", "1")).unwrap();
            wal.append(&put("b", "2")).unwrap();
            wal.append(&put("c", "3")).unwrap();
        }
        let mut bytes = storage.read_all(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        storage.write_all(&path, &bytes).unwrap();

        {
            let wal = open_wal(&storage, &path);
            assert_eq!(replay_all(&wal), vec![put("a", "1"), put("b", "2")]);
            wal.append(&del("a")).unwrap();
        }

        let wal = open_wal(&storage, &path);
        assert_eq!(
            replay_all(&wal),
            vec![put("a", "1"), put("b", "2"), del("a")]
        );
        assert!(!storage.exists(&path.with_file_name("wal.log.tmp")));
    }

    /// # Scenario
    /// A record whose payload was damaged fails its CRC; it and everything
    /// after it are dropped.
    ///
    /// # Actions
    /// 1. Append two records.
    /// 2. Flip a byte in the first record's payload.
    /// 3. Reopen.
    ///
    /// # Expected behavior
    /// Replay is empty and the file is back to header-only.
    #[test]
    fn checksum_failure_drops_rest_of_log() {
        let (storage, path) = mem_fixture();
        {
            let wal = open_wal(&storage, &path);
            wal.append(&put("first", "1")).unwrap();
            wal.append(&put("second", "2")).unwrap();
        }
        let mut bytes = storage.read_all(&path).unwrap();
        bytes[WAL_HEADER_SIZE + 6] ^= 0xFF;
        storage.write_all(&path, &bytes).unwrap();

        let wal = open_wal(&storage, &path);
        assert!(replay_all(&wal).is_empty());
        assert_eq!(storage.len(&path).unwrap(), WAL_HEADER_SIZE as u64);
    }

    /// # Scenario
    /// A length prefix overwritten with `0xFFFFFFFF` exceeds the record
    /// limit and is treated as the start of the torn tail.
    #[test]
    fn huge_length_prefix_is_tail() {
        let (storage, path) = mem_fixture();
        {
            let wal = open_wal(&storage, &path);
            wal.append(&put("keep", "me")).unwrap();
            wal.append(&put("lose", "me")).unwrap();
        }
        // header + [len][payload][crc] of the first record
        let payload = crate::encoding::encode_to_vec(&put("keep", "me")).unwrap();
        let keep_len = WAL_HEADER_SIZE + 4 + payload.len() + 4;

        let mut bytes = storage.read_all(&path).unwrap();
        bytes[keep_len..keep_len + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        storage.write_all(&path, &bytes).unwrap();

        let wal = open_wal(&storage, &path);
        assert_eq!(replay_all(&wal), vec![put("keep", "me")]);
        assert_eq!(storage.len(&path).unwrap(), keep_len as u64);
    }

    /// # Scenario
    /// A CRC-valid record whose payload carries an unknown tag does not
    /// decode; it is treated like any other torn record.
    #[test]
    fn undecodable_record_is_tail() {
        let (storage, path) = mem_fixture();
        drop(open_wal(&storage, &path));

        let payload = [7u8, 0, 0, 0, 0];
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        let mut h = crc32fast::Hasher::new();
        h.update(&frame);
        frame.extend_from_slice(&h.finalize().to_le_bytes());

        let mut bytes = storage.read_all(&path).unwrap();
        bytes.extend_from_slice(&frame);
        storage.write_all(&path, &bytes).unwrap();

        let wal = open_wal(&storage, &path);
        assert!(replay_all(&wal).is_empty());
    }

    /// # Scenario
    /// A replay iterator over damaged bytes reports the damage once and
    /// stops.
    #[test]
    fn replay_iter_reports_error_once() {
        let (storage, path) = mem_fixture();
        let wal = open_wal(&storage, &path);
        wal.append(&put("a", "1")).unwrap();

        // Damage the log behind the open handle's back.
        let mut bytes = storage.read_all(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        storage.write_all(&path, &bytes).unwrap();

        let mut it = wal.replay_iter().unwrap();
        assert!(matches!(it.next(), Some(Err(WalError::ChecksumMismatch(_)))));
        assert!(it.next().is_none());
    }
}
