pub mod helpers;

use std::io::Write;
use std::path::Path;

use super::Storage;

/// Behaviour every backend must share, run against both implementations.
pub(super) fn exercise_backend(storage: &dyn Storage, root: &Path) {
    let dir = root.join("db");
    storage.create_dir_all(&dir).unwrap();
    assert!(storage.exists(&dir));

    let a = dir.join("a.bin");
    let mut w = storage.create(&a).unwrap();
    w.write_all(b"hello ").unwrap();
    w.sync().unwrap();
    drop(w);

    let mut w = storage.append(&a).unwrap();
    w.write_all(b"world").unwrap();
    w.sync().unwrap();
    drop(w);

    assert_eq!(&*storage.open(&a).unwrap(), b"hello world");
    assert_eq!(storage.len(&a).unwrap(), 11);

    // create truncates
    let mut w = storage.create(&a).unwrap();
    w.write_all(b"x").unwrap();
    w.sync().unwrap();
    drop(w);
    assert_eq!(&*storage.open(&a).unwrap(), b"x");

    let b = dir.join("b.bin");
    storage.create(&b).unwrap().sync().unwrap();
    assert_eq!(storage.open(&b).unwrap().len(), 0);

    assert_eq!(storage.list(&dir).unwrap(), vec!["a.bin", "b.bin"]);

    // rename replaces the destination
    storage.rename(&a, &b).unwrap();
    assert!(!storage.exists(&a));
    assert_eq!(&*storage.open(&b).unwrap(), b"x");
    assert_eq!(storage.list(&dir).unwrap(), vec!["b.bin"]);

    storage.remove(&b).unwrap();
    assert!(!storage.exists(&b));
    assert!(storage.list(&dir).unwrap().is_empty());

    let missing = dir.join("missing");
    assert_eq!(
        storage.open(&missing).unwrap_err().kind(),
        std::io::ErrorKind::NotFound
    );
    assert!(storage.remove(&missing).is_err());
    assert!(storage.len(&missing).is_err());
}
