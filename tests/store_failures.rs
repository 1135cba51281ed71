//! Behaviour when the durable store misbehaves.

mod common;

use common::FlakyStore;
use cryptobox::{
    Cryptobox, CryptoboxError, CryptoboxStore, DeferredPreKeyView, IdentityManager, MemoryStore,
    PreKey, StoreError,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

async fn alice_hello(bob: &Cryptobox<FlakyStore>, prekey_id: u16) -> Vec<u8> {
    let alice = Cryptobox::open(Arc::new(MemoryStore::new())).await.unwrap();
    let bundle = bob.new_prekey(prekey_id).await.unwrap();
    let mut session = alice.create_from_bundle("bob", &bundle).await.unwrap();
    session.encrypt(b"Hello Bob!").unwrap()
}

#[tokio::test]
async fn test_failed_session_save_keeps_prekey() {
    let store = Arc::new(FlakyStore::new());
    let bob = Cryptobox::open(store.clone()).await.unwrap();
    let hello = alice_hello(&bob, 1).await;

    store.fail_session_save.store(true, Ordering::SeqCst);
    let (mut session, _) = bob.create_from_message("alice", &hello).await.unwrap();
    let err = assert_err!(bob.save(&mut session).await);
    assert!(matches!(err, CryptoboxError::Store(StoreError::Backend { .. })));

    assert!(store.inner.has_prekey(1).await);
    assert_eq!(store.prekey_deletes.load(Ordering::SeqCst), 0);
    assert!(bob.load("alice").await.unwrap().is_none());

    // A retry from scratch sees the prekey again
    store.fail_session_save.store(false, Ordering::SeqCst);
    let (mut retry, plaintext) = bob.create_from_message("alice", &hello).await.unwrap();
    assert_eq!(plaintext, b"Hello Bob!");
    assert_ok!(bob.save(&mut retry).await);
    assert!(!store.inner.has_prekey(1).await);
}

#[tokio::test]
async fn test_failed_prekey_delete_reported_after_session_saved() {
    let store = Arc::new(FlakyStore::new());
    let bob = Cryptobox::open(store.clone()).await.unwrap();
    let hello = alice_hello(&bob, 4).await;

    store.fail_deletes_of(&[4]);
    let (mut session, _) = bob.create_from_message("alice", &hello).await.unwrap();
    let err = assert_err!(bob.save(&mut session).await);
    match &err {
        CryptoboxError::Store(e @ StoreError::PreKeyCommit { .. }) => {
            assert_eq!(e.failed_prekeys(), vec![4]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_retryable());

    assert!(bob.load("alice").await.unwrap().is_some());
    assert!(store.inner.has_prekey(4).await);
    assert_eq!(session.staged_prekeys(), vec![4]);

    store.fail_deletes_of(&[]);
    assert_ok!(bob.save(&mut session).await);
    assert!(!store.inner.has_prekey(4).await);
    assert!(session.staged_prekeys().is_empty());
}

#[tokio::test]
async fn test_partial_commit_keeps_successes() {
    let store = Arc::new(FlakyStore::new());
    for id in 1..=3 {
        store.add_prekey(&PreKey::new(id)).await.unwrap();
    }
    store.fail_deletes_of(&[2]);

    let mut view = DeferredPreKeyView::new(store.clone());
    for id in 1..=3 {
        view.stage_delete(id);
    }

    let err = assert_err!(view.commit().await);
    assert!(matches!(
        err,
        CryptoboxError::Store(StoreError::PreKeyCommit { ref failed }) if failed.len() == 1 && failed[0].0 == 2
    ));
    assert_eq!(store.inner.prekey_ids().await, vec![2]);
    assert_eq!(view.staged().collect::<Vec<_>>(), vec![2]);

    store.fail_deletes_of(&[]);
    assert_ok!(view.commit().await);
    assert!(store.inner.prekey_ids().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identity_creation_generates_once() {
    let store = Arc::new(FlakyStore::new());
    let manager = Arc::new(IdentityManager::new(store.clone()));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .get_or_create_identity()
                    .await
                    .map(|identity| identity.fingerprint())
            })
        })
        .collect();

    let mut fingerprints = Vec::new();
    for task in tasks {
        fingerprints.push(task.await.unwrap().unwrap());
    }
    fingerprints.dedup();

    assert_eq!(fingerprints.len(), 1);
    assert_eq!(store.identity_saves.load(Ordering::SeqCst), 1);

    let cbox = Cryptobox::from_identity_manager(&manager).await.unwrap();
    assert_eq!(cbox.fingerprint(), fingerprints[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_open_shares_one_identity() {
    let store = Arc::new(FlakyStore::new());

    let (a, b) = tokio::join!(Cryptobox::open(store.clone()), Cryptobox::open(store.clone()));
    let (a, b) = (a.unwrap(), b.unwrap());

    let stored = store.load_identity().await.unwrap().unwrap();
    assert_eq!(a.fingerprint(), stored.fingerprint());
    assert_eq!(b.fingerprint(), stored.fingerprint());
    assert_eq!(store.identity_saves.load(Ordering::SeqCst), 1);
}
