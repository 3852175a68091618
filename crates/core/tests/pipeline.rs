//! End-to-end pipeline tests: encode a tree into archive, chunk store, and
//! index, then reassemble it through every configured source.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use arcsync_core::{
    BaseKind, ChunkConfig, IndexReader, ObjectId, Store, SyncError, SyncStep, Synchronizer,
};

/// Small chunks so modest test data still splits into several objects.
const SMALL_CHUNKS: ChunkConfig = ChunkConfig {
    min_size: 1024,
    avg_size: 4096,
    max_size: 16 * 1024,
};

/// Step a pipeline to completion and return the archive digest.
fn drive(sync: &mut Synchronizer) -> Result<ObjectId, SyncError> {
    loop {
        if let SyncStep::Finished = sync.step()? {
            return sync.get_digest();
        }
    }
}

/// Deterministic pseudo-random bytes; varied enough to produce real cuts.
fn varied_bytes(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x0123_4567_89ab_cdef;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 56) as u8
        })
        .collect()
}

fn build_tree(root: &Path) {
    fs::create_dir_all(root.join("sub/deeper")).unwrap();
    fs::write(root.join("alpha.txt"), b"first file").unwrap();
    fs::write(root.join("sub/data.bin"), varied_bytes(100_000)).unwrap();
    fs::write(root.join("sub/deeper/tail"), b"the very last entry").unwrap();
}

/// Full-fanout encode of `base` into `archive`, `index`, and `store`.
fn encode_tree(base: &Path, archive: &Path, index: &Path, store: &Path) -> ObjectId {
    let mut sync = Synchronizer::new_encode();
    sync.set_base_path(base).unwrap();
    sync.set_archive_path(archive).unwrap();
    sync.set_store_local(store).unwrap();
    sync.set_index_path(index).unwrap();
    sync.set_chunk_config(SMALL_CHUNKS).unwrap();
    drive(&mut sync).unwrap()
}

fn chunk_files(store_root: &Path) -> Vec<PathBuf> {
    let mut chunks = Vec::new();
    for shard in fs::read_dir(store_root).unwrap() {
        let shard = shard.unwrap().path();
        if shard.is_dir() {
            for file in fs::read_dir(&shard).unwrap() {
                chunks.push(file.unwrap().path());
            }
        }
    }
    chunks
}

/// Encode both trees and compare the streams; equality means identical
/// content and permission bits.
fn assert_trees_equal(a: &Path, b: &Path) {
    let digest_of = |root: &Path| {
        let mut sync = Synchronizer::new_encode();
        sync.set_base_path(root).unwrap();
        drive(&mut sync).unwrap()
    };
    assert_eq!(digest_of(a), digest_of(b), "trees differ");
}

#[test]
fn test_encode_produces_archive_chunks_and_index() {
    let work = tempfile::tempdir().unwrap();
    let base = work.path().join("base");
    fs::create_dir(&base).unwrap();
    fs::write(base.join("zeros.bin"), vec![0u8; 10 * 1024 * 1024]).unwrap();

    let archive = work.path().join("tree.arc");
    let index = work.path().join("tree.arcsidx");
    let store = work.path().join("store");
    let digest = encode_tree(&base, &archive, &index, &store);

    // The archive landed at its final path and matches the digest.
    let archive_bytes = fs::read(&archive).unwrap();
    assert_eq!(ObjectId::from_bytes(&archive_bytes), digest);

    // Chunks exist, and the index covers the whole archive byte for byte.
    assert!(!chunk_files(&store).is_empty());

    let mut reader = IndexReader::open(&index).unwrap();
    let mut total = 0u64;
    let mut records = 0usize;
    while let Some((id, size)) = reader.read_object().unwrap() {
        let chunk = Store::open_seed(&store).unwrap().get(&id).unwrap().unwrap();
        assert_eq!(chunk.len() as u64, size);
        assert_eq!(ObjectId::from_bytes(&chunk), id);
        total += size;
        records += 1;
    }
    assert!(records > 0);
    assert_eq!(total, archive_bytes.len() as u64);
    assert_eq!(reader.digest(), Some(digest));
}

#[test]
fn test_decode_from_index_and_store() {
    let work = tempfile::tempdir().unwrap();
    let base = work.path().join("base");
    fs::create_dir(&base).unwrap();
    build_tree(&base);

    let archive = work.path().join("tree.arc");
    let index = work.path().join("tree.arcsidx");
    let store = work.path().join("store");
    let encode_digest = encode_tree(&base, &archive, &index, &store);

    // The archive itself is not needed to reassemble.
    fs::remove_file(&archive).unwrap();

    let restored = work.path().join("restored");
    let mut sync = Synchronizer::new_decode();
    sync.set_index_path(&index).unwrap();
    sync.set_store_local(&store).unwrap();
    sync.set_base_path(&restored).unwrap();
    sync.set_base_mode(BaseKind::Directory).unwrap();
    let decode_digest = drive(&mut sync).unwrap();

    assert_eq!(decode_digest, encode_digest);
    assert_trees_equal(&base, &restored);
}

#[test]
fn test_decode_from_archive_stream() {
    let work = tempfile::tempdir().unwrap();
    let base = work.path().join("base");
    fs::create_dir(&base).unwrap();
    build_tree(&base);

    let archive = work.path().join("tree.arc");
    let mut sync = Synchronizer::new_encode();
    sync.set_base_path(&base).unwrap();
    sync.set_archive_path(&archive).unwrap();
    drive(&mut sync).unwrap();

    let restored = work.path().join("restored");
    let mut sync = Synchronizer::new_decode();
    sync.set_archive_path(&archive).unwrap();
    sync.set_base_path(&restored).unwrap();
    sync.set_base_mode(BaseKind::Directory).unwrap();
    drive(&mut sync).unwrap();

    assert_trees_equal(&base, &restored);
}

#[test]
fn test_corrupted_index_size_is_bad_message() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("payload.bin");
    fs::write(&source, varied_bytes(100_000)).unwrap();

    let archive = work.path().join("file.arc");
    let index = work.path().join("file.arcsidx");
    let store = work.path().join("store");
    encode_tree(&source, &archive, &index, &store);

    // Bump the size field of the second record by one. The index layout is
    // an 8-byte magic followed by 41-byte records (tag + id + size).
    let mut bytes = fs::read(&index).unwrap();
    let size_offset = 8 + 41 + 1 + 32;
    let mut size = [0u8; 8];
    size.copy_from_slice(&bytes[size_offset..size_offset + 8]);
    let corrupted = u64::from_be_bytes(size) + 1;
    bytes[size_offset..size_offset + 8].copy_from_slice(&corrupted.to_be_bytes());
    fs::write(&index, &bytes).unwrap();

    let target = work.path().join("restored.bin");
    let error = {
        let mut sync = Synchronizer::new_decode();
        sync.set_index_path(&index).unwrap();
        sync.set_store_local(&store).unwrap();
        sync.set_base_path(&target).unwrap();
        sync.set_base_mode(BaseKind::Regular).unwrap();

        loop {
            match sync.step() {
                Ok(SyncStep::Finished) => panic!("corrupted index decoded"),
                Ok(_) => {}
                Err(e) => break e,
            }
        }
    };
    assert!(matches!(error, SyncError::BadMessage(_)));

    // Nothing was published and the temp sibling is gone after drop.
    assert!(!target.exists());
    let leftovers: Vec<_> = fs::read_dir(work.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.contains("restored"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
}

#[test]
fn test_seed_store_serves_misses() {
    let work = tempfile::tempdir().unwrap();
    let base = work.path().join("base");
    fs::create_dir(&base).unwrap();
    build_tree(&base);

    let archive = work.path().join("tree.arc");
    let index = work.path().join("tree.arcsidx");
    let seed = work.path().join("seed.store");
    encode_tree(&base, &archive, &index, &seed);

    // Move a single chunk into a fresh writable store; everything else must
    // come from the seed.
    let wstore = work.path().join("write.store");
    fs::create_dir(&wstore).unwrap();
    let moved = chunk_files(&seed).into_iter().next().unwrap();
    let relative = moved.strip_prefix(&seed).unwrap().to_path_buf();
    fs::create_dir_all(wstore.join(relative.parent().unwrap())).unwrap();
    fs::rename(&moved, wstore.join(&relative)).unwrap();

    let restored = work.path().join("restored");
    let mut sync = Synchronizer::new_decode();
    sync.set_index_path(&index).unwrap();
    sync.set_store_local(&wstore).unwrap();
    sync.add_seed_store_local(&seed).unwrap();
    sync.set_base_path(&restored).unwrap();
    sync.set_base_mode(BaseKind::Directory).unwrap();
    drive(&mut sync).unwrap();

    assert_trees_equal(&base, &restored);
}

#[test]
fn test_archive_path_is_write_once() {
    let work = tempfile::tempdir().unwrap();
    let mut sync = Synchronizer::new_encode();
    sync.set_archive_path(work.path().join("a.arc")).unwrap();
    assert!(matches!(
        sync.set_archive_path(work.path().join("b.arc")),
        Err(SyncError::Busy(_))
    ));
}

#[test]
fn test_regular_file_base_roundtrip() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("disk.img");
    fs::write(&source, varied_bytes(200_000)).unwrap();

    let encode_to = |archive: &Path| {
        let mut sync = Synchronizer::new_encode();
        sync.set_base_path(&source).unwrap();
        sync.set_archive_path(archive).unwrap();
        drive(&mut sync).unwrap()
    };

    // The digest is stable across runs over the same input.
    let first = encode_to(&work.path().join("one.arc"));
    let second = encode_to(&work.path().join("two.arc"));
    assert_eq!(first, second);
    assert_eq!(
        fs::read(work.path().join("one.arc")).unwrap(),
        fs::read(work.path().join("two.arc")).unwrap()
    );

    // Decode back into a regular file target.
    let restored = work.path().join("restored.img");
    let mut sync = Synchronizer::new_decode();
    sync.set_archive_path(work.path().join("one.arc")).unwrap();
    sync.set_base_path(&restored).unwrap();
    sync.set_base_mode(BaseKind::Regular).unwrap();
    drive(&mut sync).unwrap();

    assert_eq!(fs::read(&restored).unwrap(), fs::read(&source).unwrap());
}

#[test]
fn test_decode_into_provided_handle() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("blob");
    fs::write(&source, b"written through a caller-supplied handle").unwrap();

    let archive = work.path().join("blob.arc");
    let mut sync = Synchronizer::new_encode();
    sync.set_base_path(&source).unwrap();
    sync.set_archive_path(&archive).unwrap();
    drive(&mut sync).unwrap();

    let target = work.path().join("out");
    let fd = File::create(&target).unwrap();
    let mut sync = Synchronizer::new_decode();
    sync.set_archive_path(&archive).unwrap();
    sync.set_base_fd(fd).unwrap();
    drive(&mut sync).unwrap();

    assert_eq!(fs::read(&target).unwrap(), fs::read(&source).unwrap());
}

#[test]
fn test_step_after_finished_is_pipeline_closed() {
    let work = tempfile::tempdir().unwrap();
    let base = work.path().join("base");
    fs::create_dir(&base).unwrap();
    fs::write(base.join("f"), b"x").unwrap();

    let mut sync = Synchronizer::new_encode();
    sync.set_base_path(&base).unwrap();
    sync.set_archive_path(work.path().join("a.arc")).unwrap();
    drive(&mut sync).unwrap();

    assert!(matches!(sync.step(), Err(SyncError::PipelineClosed)));
}

#[test]
fn test_digest_before_finish_is_busy_and_stable_after() {
    let work = tempfile::tempdir().unwrap();
    let base = work.path().join("base");
    fs::create_dir(&base).unwrap();
    fs::write(base.join("f"), b"some bytes").unwrap();

    let mut sync = Synchronizer::new_encode();
    sync.set_base_path(&base).unwrap();
    sync.set_archive_path(work.path().join("a.arc")).unwrap();

    sync.step().unwrap();
    assert!(matches!(sync.get_digest(), Err(SyncError::Busy(_))));

    while !matches!(sync.step().unwrap(), SyncStep::Finished) {}
    let first = sync.get_digest().unwrap();
    let second = sync.get_digest().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_drop_before_finish_publishes_nothing() {
    let work = tempfile::tempdir().unwrap();
    let base = work.path().join("base");
    fs::create_dir(&base).unwrap();
    fs::write(base.join("big.bin"), varied_bytes(300_000)).unwrap();

    let out = work.path().join("out");
    fs::create_dir(&out).unwrap();
    let archive = out.join("tree.arc");

    {
        let mut sync = Synchronizer::new_encode();
        sync.set_base_path(&base).unwrap();
        sync.set_archive_path(&archive).unwrap();
        for _ in 0..4 {
            sync.step().unwrap();
        }
        // Dropped mid-stream.
    }

    assert!(!archive.exists());
    let leftovers: Vec<_> = fs::read_dir(&out).unwrap().collect();
    assert!(leftovers.is_empty(), "output directory is not empty");
}

#[test]
fn test_digest_only_encode_matches_archive_run() {
    let work = tempfile::tempdir().unwrap();
    let base = work.path().join("base");
    fs::create_dir(&base).unwrap();
    build_tree(&base);

    let mut bare = Synchronizer::new_encode();
    bare.set_base_path(&base).unwrap();
    let bare_digest = drive(&mut bare).unwrap();

    let archive = work.path().join("tree.arc");
    let mut full = Synchronizer::new_encode();
    full.set_base_path(&base).unwrap();
    full.set_archive_path(&archive).unwrap();
    let full_digest = drive(&mut full).unwrap();

    assert_eq!(bare_digest, full_digest);

    let mut archive_bytes = Vec::new();
    File::open(&archive)
        .unwrap()
        .read_to_end(&mut archive_bytes)
        .unwrap();
    assert_eq!(ObjectId::from_bytes(&archive_bytes), bare_digest);
}
