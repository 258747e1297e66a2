//! End-to-end storage engine scenarios: store/list/retrieve, wrong-key
//! behavior, rekey, compaction, streaming round trips and allocation.

mod common;

use common::{TestVault, incrementing, key, opts, write_source_file};
use veilstore_core::engine::StoreOptions;
use veilstore_core::error::StorageError;

const MIB: usize = 1024 * 1024;

#[test]
fn e1_store_list_retrieve() {
    let vault = TestVault::new();
    let k = key(0x01);

    let f1 = vault
        .engine
        .store_file(b"alpha", "f1.bin", "application/octet-stream", &k, opts())
        .unwrap();
    let f2 = vault
        .engine
        .store_file(b"beta", "f2.bin", "application/octet-stream", &k, opts())
        .unwrap();
    let f3_data = incrementing(MIB);
    let f3 = vault
        .engine
        .store_file(&f3_data, "f3.bin", "application/octet-stream", &k, opts())
        .unwrap();

    // Listing preserves store order.
    let views = vault.engine.list_files(&k).unwrap();
    assert_eq!(
        views.iter().map(|v| v.file_id).collect::<Vec<_>>(),
        vec![f1, f2, f3]
    );

    assert_eq!(vault.engine.retrieve_file(f1, &k).unwrap().content, b"alpha");
    assert_eq!(vault.engine.retrieve_file(f2, &k).unwrap().content, b"beta");
    assert_eq!(vault.engine.retrieve_file(f3, &k).unwrap().content, f3_data);

    // The primary cursor equals the sum of per-file on-disk sizes, and the
    // footer mirrors it.
    let total: u64 = views.iter().map(|v| v.size).sum();
    let blobs = vault.engine.blob_descriptors(&k).unwrap();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].cursor, total);
    assert_eq!(vault.engine.primary_cursor_on_disk().unwrap(), total);
}

#[test]
fn e2_wrong_key_fails_and_fresh_vault_is_isolated() {
    let vault = TestVault::new();
    let k = key(0x01);
    let k2 = key(0x02);

    vault
        .engine
        .store_file(b"secret", "s.bin", "application/octet-stream", &k, opts())
        .unwrap();

    // Force k2's lookup onto k's index file: decrypting it with the wrong
    // key must fail loudly, never read as an empty vault.
    let from = vault
        .root()
        .join(format!("vault_index_{}.bin", k.fingerprint()));
    let to = vault
        .root()
        .join(format!("vault_index_{}.bin", k2.fingerprint()));
    std::fs::copy(&from, &to).unwrap();
    assert!(matches!(
        vault.engine.list_files(&k2),
        Err(StorageError::IndexDecryptionFailed)
    ));
    std::fs::remove_file(&to).unwrap();

    // A fresh vault under k2 gets its own master key and sees nothing of
    // k's files.
    let views = vault.engine.list_files(&k2).unwrap();
    assert!(views.is_empty());
    let views_k = vault.engine.list_files(&k).unwrap();
    assert_eq!(views_k.len(), 1);
}

#[test]
fn e3_rekey_preserves_content_without_reencryption() {
    let vault = TestVault::new();
    let k = key(0x01);
    let k3 = key(0x03);

    let ids: Vec<_> = [b"one".as_slice(), b"two", b"three"]
        .iter()
        .enumerate()
        .map(|(i, data)| {
            vault
                .engine
                .store_file(data, &format!("{i}.bin"), "application/octet-stream", &k, opts())
                .unwrap()
        })
        .collect();

    let cursor = vault.engine.primary_cursor_on_disk().unwrap();
    let blob_before = std::fs::read(vault.primary_path()).unwrap();

    vault.engine.rekey_vault(&k, &k3).unwrap();

    // The old index file is gone; the vault answers under the new key.
    assert!(!vault
        .root()
        .join(format!("vault_index_{}.bin", k.fingerprint()))
        .exists());
    let views = vault.engine.list_files(&k3).unwrap();
    assert_eq!(views.len(), 3);
    assert_eq!(
        vault.engine.retrieve_file(ids[0], &k3).unwrap().content,
        b"one"
    );

    // The old key now addresses a fresh empty vault.
    assert!(vault.engine.list_files(&k).unwrap().is_empty());

    // No file content was re-encrypted: the used region is byte-identical.
    let blob_after = std::fs::read(vault.primary_path()).unwrap();
    assert_eq!(
        blob_before[..cursor as usize],
        blob_after[..cursor as usize]
    );
}

#[test]
fn e4_compact_drops_tombstones_and_preserves_content() {
    let vault = TestVault::new();
    let k = key(0x01);

    let f1 = vault
        .engine
        .store_file(b"alpha", "f1.bin", "application/octet-stream", &k, opts())
        .unwrap();
    let f2 = vault
        .engine
        .store_file(b"beta", "f2.bin", "application/octet-stream", &k, opts())
        .unwrap();
    let f3_data = incrementing(MIB);
    let f3 = vault
        .engine
        .store_file(&f3_data, "f3.bin", "application/octet-stream", &k, opts())
        .unwrap();

    let header_before = vault.engine.retrieve_file(f3, &k).unwrap().header;

    vault.engine.delete_file(f2, &k).unwrap();
    assert!(vault.engine.deleted_space(&k).unwrap() > 0);

    vault.engine.compact(&k).unwrap();

    assert_eq!(vault.engine.retrieve_file(f1, &k).unwrap().content, b"alpha");
    let f3_after = vault.engine.retrieve_file(f3, &k).unwrap();
    assert_eq!(f3_after.content, f3_data);
    assert_eq!(f3_after.header, header_before);
    assert!(matches!(
        vault.engine.retrieve_file(f2, &k),
        Err(StorageError::FileNotFound)
    ));
    assert_eq!(vault.engine.deleted_space(&k).unwrap(), 0);

    // Compaction keeps the footer invariant.
    let blobs = vault.engine.blob_descriptors(&k).unwrap();
    assert_eq!(
        vault.engine.primary_cursor_on_disk().unwrap(),
        blobs[0].cursor
    );
}

#[test]
fn streaming_round_trips_across_chunk_boundaries() {
    let vault = TestVault::new();
    let k = key(0x07);
    let chunk = 256 * 1024;

    for len in [1, chunk - 1, chunk, chunk + 1, MIB, MIB + 1] {
        let data = incrementing(len);
        let src = write_source_file(&vault.dir, &format!("src_{len}.dat"), &data);

        let id = vault
            .engine
            .store_file_from_path(&src, "file.bin", "application/octet-stream", &k, opts())
            .unwrap();
        let out = vault.engine.retrieve_to_temp(id, &k).unwrap();
        assert_eq!(out.header.original_size, len as u64);
        assert_eq!(std::fs::read(&out.temp_path).unwrap(), data, "len {len}");
        std::fs::remove_file(&out.temp_path).unwrap();
        std::fs::remove_file(&src).unwrap();
    }
}

#[test]
fn large_file_spills_into_an_expansion_container() {
    let vault = TestVault::new();
    let k = key(0x07);

    // 64 MiB exceeds the primary container entirely.
    let data = incrementing(64 * MIB);
    let src = write_source_file(&vault.dir, "big.dat", &data);
    let id = vault
        .engine
        .store_file_from_path(&src, "big.bin", "application/octet-stream", &k, opts())
        .unwrap();

    let blobs = vault.engine.blob_descriptors(&k).unwrap();
    assert_eq!(blobs.len(), 2);
    assert!(blobs[1].capacity >= 64 * MIB as u64);

    let out = vault.engine.retrieve_to_temp(id, &k).unwrap();
    assert_eq!(std::fs::read(&out.temp_path).unwrap(), data);
    std::fs::remove_file(&out.temp_path).unwrap();
}

#[test]
fn allocation_is_first_fit_in_blob_order() {
    let vault = TestVault::new();
    let k = key(0x09);

    // Fill most of the primary, force the next large file out, then show a
    // small file still lands in the primary's remaining gap.
    let a = incrementing(32 * MIB);
    let src_a = write_source_file(&vault.dir, "a.dat", &a);
    vault
        .engine
        .store_file_from_path(&src_a, "a.bin", "application/octet-stream", &k, opts())
        .unwrap();

    let b = incrementing(20 * MIB);
    let src_b = write_source_file(&vault.dir, "b.dat", &b);
    let id_b = vault
        .engine
        .store_file_from_path(&src_b, "b.bin", "application/octet-stream", &k, opts())
        .unwrap();

    let id_c = vault
        .engine
        .store_file(b"small", "c.bin", "application/octet-stream", &k, opts())
        .unwrap();

    let blobs = vault.engine.blob_descriptors(&k).unwrap();
    assert_eq!(blobs.len(), 2, "second large file created an expansion");

    let views = vault.engine.list_files(&k).unwrap();
    // Entry offsets and owning blobs come from the index.
    let entry = |id| views.iter().find(|v| v.file_id == id).unwrap();
    assert!(entry(id_b).size > 20 * MIB as u64);

    // The small file fits the primary's gap, so first-fit puts it there:
    // the expansion cursor covers only the large file.
    let primary_cursor = blobs[0].cursor;
    let expansion_cursor = blobs[1].cursor;
    assert_eq!(vault.engine.primary_cursor_on_disk().unwrap(), primary_cursor);
    assert!(primary_cursor > 32 * MIB as u64);
    assert_eq!(expansion_cursor, entry(id_b).size);

    assert_eq!(
        vault.engine.retrieve_file(id_c, &k).unwrap().content,
        b"small"
    );
}

#[test]
fn deletion_overwrites_ciphertext_in_place() {
    let vault = TestVault::new();
    let k = key(0x04);

    let data = incrementing(64 * 1024);
    let id = vault
        .engine
        .store_file(&data, "d.bin", "application/octet-stream", &k, opts())
        .unwrap();

    let views = vault.engine.list_files(&k).unwrap();
    let size = views[0].size as usize;
    let before = std::fs::read(vault.primary_path()).unwrap();

    vault.engine.delete_file(id, &k).unwrap();
    let after = std::fs::read(vault.primary_path()).unwrap();

    // No 16-byte window of the original ciphertext survives anywhere in
    // the overwritten range.
    let original = &before[..size];
    let overwritten = &after[..size];
    assert!(
        !overwritten
            .windows(16)
            .any(|w| original.windows(16).any(|o| o == w))
    );
}

#[test]
fn destroy_all_except_keeps_one_vault() {
    let vault = TestVault::new();
    let k1 = key(0x11);
    let k2 = key(0x12);

    vault
        .engine
        .store_file(b"one", "1.bin", "application/octet-stream", &k1, opts())
        .unwrap();
    vault
        .engine
        .store_file(b"two", "2.bin", "application/octet-stream", &k2, opts())
        .unwrap();

    vault.engine.destroy_all_except(&k2).unwrap();

    assert!(vault.engine.list_files(&k1).unwrap().is_empty());
    assert_eq!(vault.engine.list_files(&k2).unwrap().len(), 1);
}

#[test]
fn store_with_thumbnail_and_metadata_round_trips() {
    let vault = TestVault::new();
    let k = key(0x21);

    let id = vault
        .engine
        .store_file(
            b"video-bytes",
            "clip.mp4",
            "video/mp4",
            &k,
            StoreOptions {
                thumbnail: Some(b"jpeg-thumb".to_vec()),
                duration: Some(12.5),
                file_id: None,
                original_date: Some(1_600_000_000),
            },
        )
        .unwrap();

    let views = vault.engine.list_files(&k).unwrap();
    assert_eq!(views[0].file_id, id);
    assert_eq!(views[0].mime_type.as_deref(), Some("video/mp4"));
    assert_eq!(views[0].duration, Some(12.5));
    assert_eq!(views[0].original_date, Some(1_600_000_000));
    assert_eq!(views[0].thumbnail.as_deref(), Some(&b"jpeg-thumb"[..]));

    let (master, light) = vault.engine.list_files_lightweight(&k).unwrap();
    let raw = light[0].encrypted_thumbnail.as_ref().unwrap();
    // The lightweight view hands back ciphertext the caller decrypts
    // lazily with the returned master key.
    assert_eq!(master.open_frame(raw).unwrap(), b"jpeg-thumb");
}
