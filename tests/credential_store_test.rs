// Integration tests for the encrypted credential store

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use usagebar::credentials::{CredentialEvent, CredentialStore, SecretCodec};

fn open(dir: &TempDir, machine: &str) -> CredentialStore {
    CredentialStore::open(
        dir.path().join("credentials.enc"),
        SecretCodec::from_identifier(machine),
    )
}

/// set() followed by a "restart" (fresh store instance) returns the same pair.
#[test]
fn test_round_trip_across_restart() {
    let dir = TempDir::new().unwrap();

    let pairs = [
        ("sk-ant-sid01-abc", "263e9fcb-52b9-4372-8842-000000000001"),
        ("k", "o"),
        ("sk with spaces inside", "org/with/slashes"),
        ("sk-ünïcødé-🔑", "org-ü"),
    ];

    for (key, org) in pairs {
        open(&dir, "machine-a").set(key, org).unwrap();

        let restarted = open(&dir, "machine-a");
        let record = restarted.get().expect("record lost across restart");
        assert_eq!(record.session_key, key);
        assert_eq!(record.organization_id, org);
    }
}

/// A file copied to another machine reads as absent, not as an error.
#[test]
fn test_foreign_machine_reads_as_absent() {
    let dir = TempDir::new().unwrap();
    open(&dir, "machine-a").set("sk-1", "org-1").unwrap();

    let elsewhere = open(&dir, "machine-b");
    assert!(elsewhere.get().is_none());
    assert!(!elsewhere.has_credentials());

    // The first machine can still read it
    assert!(open(&dir, "machine-a").get().is_some());
}

/// Flipping bytes in the stored blob reads as absent.
#[test]
fn test_tampered_file_reads_as_absent() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, "machine-a");
    store.set("sk-1", "org-1").unwrap();

    let mut raw = fs::read_to_string(store.path()).unwrap().into_bytes();
    let middle = raw.len() / 2;
    raw[middle] = if raw[middle] == b'A' { b'B' } else { b'A' };
    fs::write(store.path(), raw).unwrap();

    assert!(open(&dir, "machine-a").get().is_none());

    // Truncated file too
    fs::write(store.path(), "AAAA").unwrap();
    assert!(open(&dir, "machine-a").get().is_none());
}

/// Concurrent readers only ever observe one of the complete records.
#[test]
fn test_concurrent_reader_never_sees_torn_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("credentials.enc");
    let writer_store = CredentialStore::open(&path, SecretCodec::from_identifier("machine-a"));
    writer_store.set("sk-old", "org-old").unwrap();

    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 0..200 {
                let (key, org) = if i % 2 == 0 {
                    ("sk-new", "org-new")
                } else {
                    ("sk-old", "org-old")
                };
                writer_store.set(key, org).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let reader = {
        let path = path.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) || reads == 0 {
                // Fresh instance so every read goes to disk
                let store = CredentialStore::open(&path, SecretCodec::from_identifier("machine-a"));
                let record = store.get().expect("reader observed a missing or torn record");
                let pair = (record.session_key.as_str(), record.organization_id.as_str());
                assert!(
                    pair == ("sk-old", "org-old") || pair == ("sk-new", "org-new"),
                    "mixed record: {:?}",
                    pair
                );
                reads += 1;
            }
            reads
        })
    };

    writer.join().unwrap();
    assert!(reader.join().unwrap() > 0);
}

/// Two writers racing on one store serialize; the survivor is one complete record.
#[test]
fn test_concurrent_writers_serialize() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(&dir, "machine-a"));

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..25 {
                    store
                        .set(&format!("sk-{}", n), &format!("org-{}", n))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let record = open(&dir, "machine-a").get().unwrap();
    let n = record.session_key.trim_start_matches("sk-");
    assert_eq!(record.organization_id, format!("org-{}", n));

    let leftovers = fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 1);
}

#[test]
fn test_clear_then_restart() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, "machine-a");
    let mut events = store.subscribe();

    store.set("sk-1", "org-1").unwrap();
    store.clear().unwrap();
    store.clear().unwrap();

    assert!(open(&dir, "machine-a").get().is_none());
    assert_eq!(events.try_recv().unwrap(), CredentialEvent::Saved);
    assert_eq!(events.try_recv().unwrap(), CredentialEvent::Cleared);
    assert_eq!(events.try_recv().unwrap(), CredentialEvent::Cleared);
}
