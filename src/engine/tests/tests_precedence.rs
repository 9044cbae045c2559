//! Precedence between layers: memtable over tablets, newer tablet over
//! older tablet, tombstones shadowing values below them.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;

    /// # Scenario
    /// A memtable value hides the tablet value for the same key.
    ///
    /// # Starting environment
    /// Tablet holding `"k"` = `"old"`.
    ///
    /// # Actions
    /// 1. Put `"k"` = `"new"`.
    ///
    /// # Expected behavior
    /// Get and find both report `"new"` only.
    #[test]
    fn memtable_over_tablet__value_shadows() {
        let (_storage, engine) = mem_engine();
        push_pairs(&engine, "t.tab", &[kv("k", "old")]);
        engine.put(b"k".to_vec(), b"new".to_vec()).unwrap();

        assert_eq!(engine.get(b"k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(collect_find(&engine, None), vec![kv("k", "new")]);
    }

    /// # Scenario
    /// A memtable tombstone hides a tablet value.
    #[test]
    fn memtable_over_tablet__tombstone_hides_value() {
        let (_storage, engine) = mem_engine();
        push_pairs(&engine, "t.tab", &[kv("a", "1"), kv("b", "2"), kv("c", "3")]);
        engine.delete(b"b".to_vec()).unwrap();

        assert_eq!(engine.get(b"b").unwrap(), None);
        assert_eq!(collect_find(&engine, None), vec![kv("a", "1"), kv("c", "3")]);
    }

    /// # Scenario
    /// Overwriting every key of a pushed tablet via put.
    ///
    /// # Starting environment
    /// Tablet with 100 keys, values `old_i`.
    ///
    /// # Actions
    /// 1. Put every key with value `new_i`.
    /// 2. Find from the start.
    ///
    /// # Expected behavior
    /// Every original key appears once, with only the new value.
    #[test]
    fn memtable_over_tablet__overwrite_every_key() {
        let (_storage, engine) = mem_engine();
        push_pairs(&engine, "t.tab", &numbered("key", "old", 100));
        for (k, v) in numbered("key", "new", 100) {
            engine.put(k, v).unwrap();
        }
        assert_eq!(collect_find(&engine, None), numbered("key", "new", 100));
    }

    /// # Scenario
    /// Two tablets holding the same key: the later push wins.
    #[test]
    fn tablet_over_tablet__newest_push_wins() {
        let (_storage, engine) = mem_engine();
        push_pairs(&engine, "first.tab", &[kv("a", "first"), kv("k", "first")]);
        push_pairs(&engine, "second.tab", &[kv("k", "second"), kv("z", "second")]);

        assert_eq!(engine.get(b"k").unwrap(), Some(b"second".to_vec()));
        assert_eq!(
            collect_find(&engine, None),
            vec![kv("a", "first"), kv("k", "second"), kv("z", "second")]
        );
    }

    /// # Scenario
    /// A tombstone in a newer tablet hides the value in an older one.
    #[test]
    fn tablet_over_tablet__tombstone_hides_older_value() {
        let (storage, engine) = mem_engine();
        push_pairs(&engine, "base.tab", &[kv("a", "1"), kv("b", "2")]);

        let path = db_dir().join("deletes.tab");
        write_tablet(&storage, &path, &[(b"a", None)]);
        engine.push_tablet(&path).unwrap();

        assert_eq!(engine.get(b"a").unwrap(), None);
        assert_eq!(collect_find(&engine, None), vec![kv("b", "2")]);
    }

    /// # Scenario
    /// A memtable value revives a key tombstoned by a tablet.
    #[test]
    fn memtable_over_tablet__put_revives_tombstoned_key() {
        let (storage, engine) = mem_engine();
        let path = db_dir().join("deletes.tab");
        write_tablet(&storage, &path, &[(b"a", None)]);
        engine.push_tablet(&path).unwrap();

        engine.put(b"a".to_vec(), b"back".to_vec()).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"back".to_vec()));
    }

    /// # Scenario
    /// Two non-overlapping tablets merge into their sorted union.
    #[test]
    fn tablets__disjoint_union_in_order() {
        let (_storage, engine) = mem_engine();
        let evens: Vec<_> = (0..50).map(|i| kv(&format!("k{:03}", i * 2), "even")).collect();
        let odds: Vec<_> = (0..50).map(|i| kv(&format!("k{:03}", i * 2 + 1), "odd")).collect();
        push_pairs(&engine, "evens.tab", &evens);
        push_pairs(&engine, "odds.tab", &odds);

        let mut expected: Vec<_> = evens.into_iter().chain(odds).collect();
        expected.sort();
        assert_eq!(collect_find(&engine, None), expected);
    }
}
