//! Backup pipeline scenarios: the v2 payload round trip across a wipe,
//! checksum rejection, interrupted-upload resume and the scheduler
//! decisions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestVault, incrementing, key, opts, write_source_file};
use veilstore_core::store::memory::MemoryObjectStore;
use veilstore_core::store::{FieldValue, ObjectStore, RecordType, SavePolicy};
use veilstore_core::transfer::backup::{BackupError, BackupOrchestrator, ScheduleDecision};

const MIB: usize = 1024 * 1024;

fn orchestrator(vault: &TestVault, store: &Arc<MemoryObjectStore>) -> BackupOrchestrator {
    BackupOrchestrator::new(
        Arc::clone(&vault.engine),
        Arc::clone(store) as Arc<dyn ObjectStore>,
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn e6_backup_and_restore_with_expansion_and_two_vaults() {
    let store = Arc::new(MemoryObjectStore::new());
    let source = TestVault::new();
    let k1 = key(0x71);
    let k2 = key(0x72);

    // Vault 1: a large file filling much of the primary, then one that
    // spills into an expansion.
    let big = incrementing(32 * MIB);
    let src_big = write_source_file(&source.dir, "big.dat", &big);
    let big_id = source
        .engine
        .store_file_from_path(&src_big, "big.bin", "application/octet-stream", &k1, opts())
        .unwrap();
    std::fs::remove_file(&src_big).unwrap();

    let spill = incrementing(20 * MIB);
    let src_spill = write_source_file(&source.dir, "spill.dat", &spill);
    let spill_id = source
        .engine
        .store_file_from_path(&src_spill, "spill.bin", "application/octet-stream", &k1, opts())
        .unwrap();
    std::fs::remove_file(&src_spill).unwrap();

    // Vault 2: a second index file on disk.
    let small_id = source
        .engine
        .store_file(b"second vault", "v2.bin", "application/octet-stream", &k2, opts())
        .unwrap();

    let blobs = source.engine.blob_descriptors(&k1).unwrap();
    assert_eq!(blobs.len(), 2, "expansion expected");
    // The footer is the authority for the primary cursor: it includes the
    // second vault's write, which vault 1's cached descriptor does not.
    let primary_cursor = source.engine.primary_cursor_on_disk().unwrap();
    let expansion_cursor = blobs[1].cursor;
    let expansion_name = blobs[1].file_name.clone();

    // Keep the original container bytes for the post-restore comparison.
    let original_primary = std::fs::read(source.primary_path()).unwrap();
    let original_expansion = std::fs::read(source.root().join(&expansion_name)).unwrap();

    let backup = orchestrator(&source, &store);
    backup.stage_backup(&k1).unwrap();
    assert!(backup.upload_backup().await.unwrap());
    assert!(!source.root().join("pending_backup").exists());

    // Restore into a fresh directory (the wiped device).
    let restored = TestVault::new();
    let restore_orch = orchestrator(&restored, &store);
    restore_orch.restore(&k1).await.unwrap();

    // Primary: full-size, restored prefix, re-randomised tail.
    let restored_primary = std::fs::read(restored.primary_path()).unwrap();
    assert_eq!(restored_primary.len(), 50 * MIB);
    assert_eq!(
        restored_primary[..primary_cursor as usize],
        original_primary[..primary_cursor as usize]
    );
    let tail_len = 1024 * 1024;
    let tail_start = primary_cursor as usize;
    assert_ne!(
        restored_primary[tail_start..tail_start + tail_len],
        original_primary[tail_start..tail_start + tail_len],
        "tail must be fresh random, not the original fill"
    );

    // Expansion: full-size with the used prefix intact.
    let restored_expansion = std::fs::read(restored.root().join(&expansion_name)).unwrap();
    assert_eq!(restored_expansion.len(), 50 * MIB);
    assert_eq!(
        restored_expansion[..expansion_cursor as usize],
        original_expansion[..expansion_cursor as usize]
    );

    // Both index files restored byte-exact: each vault loads and serves.
    let out_big = restored.engine.retrieve_to_temp(big_id, &k1).unwrap();
    assert_eq!(std::fs::read(&out_big.temp_path).unwrap(), big);
    std::fs::remove_file(&out_big.temp_path).unwrap();
    assert_eq!(
        restored.engine.retrieve_file(spill_id, &k1).unwrap().content,
        spill
    );
    assert_eq!(
        restored.engine.retrieve_file(small_id, &k2).unwrap().content,
        b"second vault"
    );
    assert_eq!(
        restored.engine.primary_cursor_on_disk().unwrap(),
        primary_cursor
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_rejects_a_flipped_bit_before_decrypting() {
    let store = Arc::new(MemoryObjectStore::new());
    let source = TestVault::new();
    let k = key(0x75);
    source
        .engine
        .store_file(b"precious", "p.bin", "application/octet-stream", &k, opts())
        .unwrap();

    let backup = orchestrator(&source, &store);
    backup.stage_backup(&k).unwrap();
    assert!(backup.upload_backup().await.unwrap());

    // Flip one bit in the first stored chunk.
    let chunk_id = store.ids(RecordType::VaultBackupChunk)[0].clone();
    let mut chunk = store
        .get(RecordType::VaultBackupChunk, &chunk_id)
        .await
        .unwrap()
        .unwrap();
    let mut data = chunk.bytes("chunkData").unwrap().to_vec();
    data[100] ^= 0x01;
    chunk.set("chunkData", FieldValue::Asset(data));
    store.put(chunk, SavePolicy::ChangedKeys).await.unwrap();

    let restored = TestVault::new();
    let restore_orch = orchestrator(&restored, &store);
    assert!(matches!(
        restore_orch.restore(&k).await,
        Err(BackupError::ChecksumMismatch)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_upload_resumes_from_staging() {
    let store = Arc::new(MemoryObjectStore::new());
    let source = TestVault::new();
    let k = key(0x76);
    source
        .engine
        .store_file(
            &incrementing(5 * MIB),
            "data.bin",
            "application/octet-stream",
            &k,
            opts(),
        )
        .unwrap();

    let backup = orchestrator(&source, &store);
    let state = backup.stage_backup(&k).unwrap();
    assert!(state.total_chunks > 1);

    store.fail_puts_after(1);
    assert!(backup.upload_backup().await.is_err());
    // Staging persisted, one chunk made it out.
    assert!(source.root().join("pending_backup/state.json").exists());
    assert_eq!(store.count(RecordType::VaultBackupChunk), 1);
    assert_eq!(store.count(RecordType::VaultBackup), 0);

    store.clear_failures();
    assert!(backup.upload_backup().await.unwrap());
    assert_eq!(
        store.count(RecordType::VaultBackupChunk) as u64,
        state.total_chunks
    );
    assert_eq!(store.count(RecordType::VaultBackup), 1);
    assert!(!source.root().join("pending_backup").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_new_backup_garbage_collects_the_previous_chunks() {
    let store = Arc::new(MemoryObjectStore::new());
    let source = TestVault::new();
    let k = key(0x77);
    source
        .engine
        .store_file(
            &incrementing(3 * MIB),
            "a.bin",
            "application/octet-stream",
            &k,
            opts(),
        )
        .unwrap();

    let backup = orchestrator(&source, &store);
    backup.run_backup(&k).await.unwrap();
    let first_chunks = store.ids(RecordType::VaultBackupChunk);
    assert!(!first_chunks.is_empty());

    source
        .engine
        .store_file(b"more", "b.bin", "application/octet-stream", &k, opts())
        .unwrap();
    backup.run_backup(&k).await.unwrap();

    let second_chunks = store.ids(RecordType::VaultBackupChunk);
    assert!(second_chunks.iter().all(|id| !first_chunks.contains(id)));
    assert_eq!(store.count(RecordType::VaultBackup), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_decisions_follow_the_policy() {
    let store = Arc::new(MemoryObjectStore::new());
    let source = TestVault::new();
    let k = key(0x78);
    source
        .engine
        .store_file(b"x", "x.bin", "application/octet-stream", &k, opts())
        .unwrap();

    let backup = orchestrator(&source, &store);

    // Disabled: nothing happens.
    let decision = backup.run_scheduled(false, || Some(k.clone())).await.unwrap();
    assert_eq!(decision, ScheduleDecision::Skipped);

    // Enabled, no prior success, vault locked: deferred with the first
    // cascade delay.
    let decision = backup.run_scheduled(true, || None).await.unwrap();
    assert_eq!(
        decision,
        ScheduleDecision::RetryLater(Duration::from_secs(15 * 60))
    );
    // The next locked attempt backs off further.
    let decision = backup.run_scheduled(true, || None).await.unwrap();
    assert_eq!(
        decision,
        ScheduleDecision::RetryLater(Duration::from_secs(3600))
    );

    // Unlocked: a backup runs end to end.
    let decision = backup
        .run_scheduled(true, || Some(k.clone()))
        .await
        .unwrap();
    assert_eq!(decision, ScheduleDecision::StagedAndUploaded);
    assert_eq!(store.count(RecordType::VaultBackup), 1);

    // Fresh success: the next tick is a no-op.
    let decision = backup.run_scheduled(true, || Some(k.clone())).await.unwrap();
    assert_eq!(decision, ScheduleDecision::Skipped);

    // Staged state pending: the tick resumes the upload instead.
    backup.stage_backup(&k).unwrap();
    let decision = backup.run_scheduled(true, || None).await.unwrap();
    assert_eq!(decision, ScheduleDecision::ResumedUpload);
}
