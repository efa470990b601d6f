//! Execution-API surface of the strata storage core
//!
//! The storage core neither speaks nor depends on any wire protocol; it
//! consumes and exposes the [`ExecutionApi`] capability. This crate holds
//! the trait, the blob container types, the [`LocalApi`] adapter over a
//! local [`strata_storage::Storage`], and the [`ApiBundle`] pairing a
//! local endpoint with an optional remote one.

mod api;
mod blob;
mod bundle;
mod local;

pub use api::ExecutionApi;
pub use blob::{ArtifactBlob, BlobData};
pub use bundle::ApiBundle;
pub use local::LocalApi;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use strata_core::{Digest, HashProtocol, ObjectInfo, ObjectType, StorageConfig};
    use strata_storage::Storage;

    fn local_api(root: &std::path::Path) -> LocalApi {
        let config = StorageConfig::new(root);
        LocalApi::new(Arc::new(Storage::create(&config).unwrap()))
    }

    fn info(digest: Digest, kind: ObjectType) -> ObjectInfo {
        ObjectInfo::new(digest, kind)
    }

    #[test]
    fn upload_verifies_declared_digest() {
        let dir = tempfile::tempdir().unwrap();
        let api = local_api(dir.path());

        let good = Digest::file(HashProtocol::Native, b"payload");
        api.upload(
            vec![ArtifactBlob::from_bytes(good.clone(), b"payload".to_vec(), false)],
            false,
        )
        .unwrap();
        assert!(api.is_available(&good));

        let lying = Digest::file(HashProtocol::Native, b"other-content");
        let result = api.upload(
            vec![ArtifactBlob::from_bytes(lying.clone(), b"payload".to_vec(), false)],
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_reports_unknown_digests() {
        let dir = tempfile::tempdir().unwrap();
        let api = local_api(dir.path());

        let present = Digest::file(HashProtocol::Native, b"here");
        api.upload(
            vec![ArtifactBlob::from_bytes(present.clone(), b"here".to_vec(), false)],
            false,
        )
        .unwrap();
        let absent = Digest::file(HashProtocol::Native, b"gone");

        let missing = api.missing(&[present, absent.clone()]).unwrap();
        assert_eq!(missing, vec![absent]);
    }

    #[test]
    fn upload_tree_builds_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let api = local_api(dir.path());

        let a = Digest::file(HashProtocol::Native, b"a");
        let b = Digest::file(HashProtocol::Native, b"b");
        api.upload(
            vec![
                ArtifactBlob::from_bytes(a.clone(), b"a".to_vec(), false),
                ArtifactBlob::from_bytes(b.clone(), b"b".to_vec(), false),
            ],
            false,
        )
        .unwrap();

        let root = api
            .upload_tree(&[
                (PathBuf::from("a.txt"), info(a, ObjectType::File)),
                (PathBuf::from("sub/b.txt"), info(b, ObjectType::File)),
            ])
            .unwrap();
        assert!(root.is_tree());

        let leaves = api
            .storage()
            .read_tree_recursive(&root, std::path::Path::new(""))
            .unwrap()
            .unwrap();
        assert_eq!(leaves.len(), 2);
    }

    #[test]
    fn upload_tree_rejects_absent_children() {
        let dir = tempfile::tempdir().unwrap();
        let api = local_api(dir.path());
        let ghost = Digest::file(HashProtocol::Native, b"ghost");
        assert!(api
            .upload_tree(&[(PathBuf::from("f"), info(ghost, ObjectType::File))])
            .is_err());
    }

    #[test]
    fn retrieve_to_paths_materializes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let api = local_api(dir.path());

        let content = Digest::file(HashProtocol::Native, b"data");
        api.upload(
            vec![ArtifactBlob::from_bytes(content.clone(), b"data".to_vec(), false)],
            false,
        )
        .unwrap();
        let root = api
            .upload_tree(&[(PathBuf::from("nested/file.bin"), info(content, ObjectType::File))])
            .unwrap();

        let out = dir.path().join("out");
        api.retrieve_to_paths(
            &[info(root, ObjectType::Tree)],
            std::slice::from_ref(&out),
        )
        .unwrap();
        assert_eq!(std::fs::read(out.join("nested/file.bin")).unwrap(), b"data");
    }

    #[test]
    fn retrieve_to_writers_streams_blob_and_raw_tree() {
        let dir = tempfile::tempdir().unwrap();
        let api = local_api(dir.path());

        let blob = Digest::file(HashProtocol::Native, b"stream-me");
        api.upload(
            vec![ArtifactBlob::from_bytes(blob.clone(), b"stream-me".to_vec(), false)],
            false,
        )
        .unwrap();

        let mut out = Vec::new();
        {
            let mut writers: Vec<&mut dyn std::io::Write> = vec![&mut out];
            api.retrieve_to_writers(&[info(blob, ObjectType::File)], &mut writers, false)
                .unwrap();
        }
        assert_eq!(out, b"stream-me");
    }

    #[test]
    fn retrieve_to_cas_transfers_trees_children_first() {
        let dir = tempfile::tempdir().unwrap();
        let source = local_api(&dir.path().join("src"));
        let sink = local_api(&dir.path().join("dst"));

        let content = Digest::file(HashProtocol::Native, b"shared");
        source
            .upload(
                vec![ArtifactBlob::from_bytes(content.clone(), b"shared".to_vec(), false)],
                false,
            )
            .unwrap();
        let root = source
            .upload_tree(&[(PathBuf::from("f"), info(content.clone(), ObjectType::File))])
            .unwrap();

        source
            .retrieve_to_cas(&[info(root.clone(), ObjectType::Tree)], &sink)
            .unwrap();
        // the sink accepted the tree, which requires the child to be there
        assert!(sink.is_available(&root));
        assert!(sink.is_available(&content));
    }

    #[test]
    fn retrieve_to_cas_refuses_protocol_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let native = local_api(&dir.path().join("native"));
        let compatible = LocalApi::new(Arc::new(
            Storage::create(
                &StorageConfig::new(dir.path().join("compat"))
                    .with_protocol(HashProtocol::Compatible),
            )
            .unwrap(),
        ));

        let blob = Digest::file(HashProtocol::Native, b"x");
        native
            .upload(
                vec![ArtifactBlob::from_bytes(blob.clone(), b"x".to_vec(), false)],
                false,
            )
            .unwrap();
        assert!(native
            .retrieve_to_cas(&[info(blob, ObjectType::File)], &compatible)
            .is_err());
    }

    #[test]
    fn bundle_without_remote_aliases_local() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(local_api(dir.path()));
        let bundle = ApiBundle::new(api, None);
        assert!(!bundle.has_remote());
        assert_eq!(bundle.protocol(), HashProtocol::Native);
    }
}
