//! Snapshot stream handling: magic and version checks, cluster tags,
//! shebang directives, and the no-garbage law for loaded images.

use std::sync::Arc;

use broth_vm::error::{GcReason, SnapshotError};
use broth_vm::isolate::Isolate;
use broth_vm::object::ObjectStore;
use broth_vm::util::test_helpers::build_test_image;

fn leb(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

#[test]
fn minimal_image_loads_and_publishes_roots() {
    let image = build_test_image(vec![]);
    let mut isolate = Isolate::new(Arc::new(image)).expect("image loads");

    let interpreter = isolate.interpreter();
    let nil = interpreter.nil_obj();
    let false_obj = interpreter.false_obj();
    let true_obj = interpreter.true_obj();
    assert!(nil.is_heap_object());
    assert!(false_obj.is_heap_object());
    assert!(true_obj.is_heap_object());
    assert!(nil != false_obj && nil != true_obj && false_obj != true_obj);

    let store = ObjectStore::cast(interpreter.object_store());
    assert!(store.dispatch_message().is_string());
    assert!(store.dispatch_message().is_canonical());
    assert!(store.message_loop().is_heap_object());
}

#[test]
fn loaded_snapshots_contain_no_garbage() {
    let image = build_test_image(vec![]);
    let mut isolate = Isolate::new(Arc::new(image)).expect("image loads");

    let before = isolate.heap().size();
    isolate.heap().collect_all(GcReason::Primitive);
    let after = isolate.heap().size();
    assert_eq!(before, after);
}

#[test]
fn wrong_magic_is_reported_with_its_offset() {
    let mut image = build_test_image(vec![]);
    image[0] = 0x00;
    match Isolate::new(Arc::new(image)) {
        Err(SnapshotError::WrongMagic { found, offset }) => {
            assert_eq!(found, 0x1900);
            assert_eq!(offset, 0);
        }
        other => panic!("expected wrong magic, got {:?}", other.err()),
    }
}

#[test]
fn wrong_version_is_reported_with_its_offset() {
    let mut image = build_test_image(vec![]);
    image[2] = 5;
    match Isolate::new(Arc::new(image)) {
        Err(SnapshotError::WrongVersion { found, offset }) => {
            assert_eq!(found, 5);
            assert_eq!(offset, 2);
        }
        other => panic!("expected wrong version, got {:?}", other.err()),
    }
}

#[test]
fn unknown_cluster_tags_are_rejected() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x1984_u16.to_le_bytes());
    leb(&mut bytes, 0); // version
    leb(&mut bytes, 1); // one cluster
    leb(&mut bytes, 0); // zero nodes
    let tag_offset = bytes.len();
    bytes.push(0x75); // sleb128 -11: below the reserved range
    match Isolate::new(Arc::new(bytes)) {
        Err(SnapshotError::UnknownClusterFormat { format, offset }) => {
            assert_eq!(format, -11);
            assert_eq!(offset, tag_offset);
        }
        other => panic!("expected unknown cluster, got {:?}", other.err()),
    }
}

#[test]
fn truncated_streams_are_rejected() {
    let image = build_test_image(vec![]);
    // Cut inside the header, after the magic and version.
    let truncated = image[..5].to_vec();
    assert!(matches!(
        Isolate::new(Arc::new(truncated)),
        Err(SnapshotError::Truncated { .. })
    ));
}

#[test]
fn shebang_lines_are_skipped() {
    let image = build_test_image(vec![]);
    let mut with_shebang = b"#!/usr/bin/env broth\n".to_vec();
    with_shebang.extend_from_slice(&image);
    assert!(Isolate::new(Arc::new(with_shebang)).is_ok());
}
