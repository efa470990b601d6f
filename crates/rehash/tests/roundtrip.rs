//! Cross-protocol round-trips through the rehash bridge

use std::path::Path;

use strata_core::{Digest, HashProtocol, ObjectInfo, ObjectType, StorageConfig};
use strata_rehash::{read_rehashed_digest, rehash_digest};
use strata_storage::tree::{self, TreeEntry};
use strata_storage::Storage;

fn storages(root: &Path) -> (Storage, Storage) {
    let native = Storage::create(&StorageConfig::new(root)).unwrap();
    let compatible = Storage::create(
        &StorageConfig::new(root).with_protocol(HashProtocol::Compatible),
    )
    .unwrap();
    (native, compatible)
}

#[test]
fn blob_roundtrip_restores_original_digest() {
    let dir = tempfile::tempdir().unwrap();
    let (native, compatible) = storages(dir.path());

    let digest = native.store_blob(b"payload", false).unwrap();
    let info = ObjectInfo::new(digest.clone(), ObjectType::File);

    let there = rehash_digest(&[info], &native, &compatible, None).unwrap();
    assert_eq!(there.len(), 1);
    assert_eq!(
        there[0].digest,
        Digest::file(HashProtocol::Compatible, b"payload")
    );

    let back = rehash_digest(&there, &compatible, &native, None).unwrap();
    assert_eq!(back[0].digest, digest);
}

#[test]
fn tree_with_file_and_symlink_roundtrips_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let (native, compatible) = storages(dir.path());

    // directory with one file `foo` containing "foo" and a symlink `bar -> baz`
    let foo = native.store_blob(b"foo", false).unwrap();
    let baz = native.store_blob(b"baz", false).unwrap();
    let entries = vec![
        TreeEntry::new("foo", ObjectType::File, foo.hash(), foo.size()),
        TreeEntry::new("bar", ObjectType::Symlink, baz.hash(), baz.size()),
    ];
    let encoded = tree::encode(HashProtocol::Native, &entries).unwrap();
    let g = native.store_tree(&encoded).unwrap();

    let info = ObjectInfo::new(g.clone(), ObjectType::Tree);
    let there = rehash_digest(&[info], &native, &compatible, None).unwrap();
    assert_eq!(there[0].object_type, ObjectType::Tree);
    // the compatible tree is present and satisfiable on the target side
    assert!(compatible.tree_path(&there[0].digest).unwrap().is_some());

    let back = rehash_digest(&there, &compatible, &native, None).unwrap();
    assert_eq!(back[0].digest, g);
    assert_eq!(back[0].digest.hash(), g.hash());
}

#[test]
fn second_rehash_is_served_from_the_mapping_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (native, compatible) = storages(dir.path());

    let digest = native.store_blob(b"memoized", false).unwrap();
    let info = ObjectInfo::new(digest.clone(), ObjectType::File);

    let first = rehash_digest(std::slice::from_ref(&info), &native, &compatible, None).unwrap();
    // the mapping is persisted
    let cached = read_rehashed_digest(&digest, native.config(), compatible.config(), false)
        .unwrap()
        .unwrap();
    assert_eq!(cached.digest, first[0].digest);

    // a second call is answered from the mapping alone
    let second = rehash_digest(std::slice::from_ref(&info), &native, &compatible, None).unwrap();
    assert_eq!(second[0].digest, first[0].digest);
}

#[test]
fn same_protocol_rehash_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (native, _compatible) = storages(dir.path());
    let other_native = Storage::create(&StorageConfig::new(dir.path().join("other"))).unwrap();

    let digest = native.store_blob(b"x", false).unwrap();
    let info = ObjectInfo::new(digest, ObjectType::File);
    assert!(rehash_digest(&[info], &native, &other_native, None).is_err());
}

#[test]
fn executable_bit_survives_rehashing() {
    let dir = tempfile::tempdir().unwrap();
    let (native, compatible) = storages(dir.path());

    let exe = native.store_blob(b"#!/bin/sh\n", true).unwrap();
    let info = ObjectInfo::new(exe, ObjectType::Executable);

    let there = rehash_digest(&[info], &native, &compatible, None).unwrap();
    assert_eq!(there[0].object_type, ObjectType::Executable);
    assert!(compatible
        .blob_path(&there[0].digest, true)
        .unwrap()
        .is_some());
}
