#[cfg(test)]
mod tests {
    use crate::engine::Entry;
    use crate::memtable::Memtable;

    #[test]
    fn test_put_and_get() {
        let mut memtable = Memtable::new();
        memtable.put(b"key1".to_vec(), b"value1".to_vec());

        assert_eq!(
            memtable.get(b"key1"),
            Some(&Entry::Value(b"value1".to_vec()))
        );
        assert_eq!(memtable.get(b"key2"), None);
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_last_write_wins() {
        let mut memtable = Memtable::new();
        memtable.put(b"key".to_vec(), b"initial".to_vec());
        memtable.put(b"key".to_vec(), b"value".to_vec());

        assert_eq!(memtable.get(b"key"), Some(&Entry::Value(b"value".to_vec())));
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_delete_installs_tombstone() {
        let mut memtable = Memtable::new();
        memtable.put(b"key".to_vec(), b"v".to_vec());
        memtable.delete(b"key".to_vec());
        assert_eq!(memtable.get(b"key"), Some(&Entry::Tombstone));
    }

    #[test]
    fn test_delete_absent_key() {
        let mut memtable = Memtable::new();
        memtable.delete(b"ghost".to_vec());
        assert_eq!(memtable.get(b"ghost"), Some(&Entry::Tombstone));
        assert!(!memtable.is_empty());
    }

    #[test]
    fn test_put_after_delete_revives() {
        let mut memtable = Memtable::new();
        memtable.delete(b"k".to_vec());
        memtable.put(b"k".to_vec(), b"back".to_vec());
        assert_eq!(memtable.get(b"k"), Some(&Entry::Value(b"back".to_vec())));
    }

    #[test]
    fn test_empty_key_and_value() {
        let mut memtable = Memtable::new();
        memtable.put(Vec::new(), Vec::new());
        assert_eq!(memtable.get(b""), Some(&Entry::Value(Vec::new())));
    }

    #[test]
    fn test_approximate_size_tracks_overwrites() {
        let mut memtable = Memtable::new();
        assert_eq!(memtable.approximate_size(), 0);

        memtable.put(b"k".to_vec(), vec![0u8; 100]);
        let with_big = memtable.approximate_size();
        assert!(with_big >= 101);

        memtable.put(b"k".to_vec(), vec![0u8; 10]);
        assert_eq!(memtable.approximate_size(), with_big - 90);

        memtable.delete(b"k".to_vec());
        assert_eq!(memtable.approximate_size(), with_big - 100);

        memtable.clear();
        assert_eq!(memtable.approximate_size(), 0);
        assert!(memtable.is_empty());
    }
}
