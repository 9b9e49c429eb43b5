#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use sha2::{Digest, Sha256};

use spiffe_helper::writer::write_atomic;
use spiffe_helper::WriteTarget;

const PAYLOAD_LEN: usize = 256 * 1024;
const ROUNDS: u8 = 40;

fn payload(round: u8) -> Vec<u8> {
    (0..PAYLOAD_LEN)
        .map(|i| round.wrapping_add((i % 251) as u8))
        .collect()
}

#[test]
fn concurrent_readers_never_see_partial_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("svid.pem");

    let mut expected = HashSet::new();
    let first = payload(0);
    expected.insert(Sha256::digest(&first).to_vec());
    write_atomic(&WriteTarget::new(&path, first, 0o644)).unwrap();

    let payloads: Vec<Vec<u8>> = (1..=ROUNDS).map(payload).collect();
    for p in &payloads {
        expected.insert(Sha256::digest(p).to_vec());
    }

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = Arc::clone(&done);
        let path = path.clone();
        thread::spawn(move || {
            let mut observed = Vec::new();
            while !done.load(Ordering::SeqCst) {
                let contents = fs::read(&path).unwrap();
                observed.push(Sha256::digest(&contents).to_vec());
            }
            observed
        })
    };

    for p in payloads {
        write_atomic(&WriteTarget::new(&path, p, 0o644)).unwrap();
    }
    done.store(true, Ordering::SeqCst);

    let observed = reader.join().unwrap();
    assert!(!observed.is_empty());
    for hash in &observed {
        assert!(expected.contains(hash), "reader observed a torn write");
    }

    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("svid.pem")]);
}

#[test]
fn rewriting_identical_contents_is_a_no_op_for_readers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundle.pem");
    let contents = payload(7);

    write_atomic(&WriteTarget::new(&path, contents.clone(), 0o644)).unwrap();
    write_atomic(&WriteTarget::new(&path, contents.clone(), 0o644)).unwrap();

    assert_eq!(fs::read(&path).unwrap(), contents);
}

#[test]
fn failed_write_leaves_destination_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("key.pem");

    let err = write_atomic(&WriteTarget::new(&path, b"secret".to_vec(), 0o600)).unwrap_err();

    assert_eq!(err.path(), Some(path.as_path()));
    assert!(!path.exists());
}
