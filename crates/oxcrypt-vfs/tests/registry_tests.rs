//! Vault discovery, caching and unlock through the registry.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{CountingPrompt, Harness, TEST_PASSWORD, fast_vault_config};
use oxcrypt_vfs::backend::{Flavor, MemoryBackend, OpKind};
use oxcrypt_vfs::callback::{DisabledConnectionCallback, DisabledDeleteCallback, DisabledListProgressListener};
use oxcrypt_vfs::config::RegistryConfig;
use oxcrypt_vfs::feature::{DeleteFeature, ListFeature, MoveFeature, ReadFeature};
use oxcrypt_vfs::{Discovery, FeatureError, Path, PasswordCallback, Session, TransferStatus, VaultError, VaultRegistry};

#[test]
fn test_repeated_lookup_returns_same_vault() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    h.write(&Path::file("/v/a.txt"), b"hello");

    let session = h.fresh_session();
    let file = Path::file("/v/a.txt");
    let first = h
        .registry
        .lookup(&session, &file, Discovery::Allowed)
        .unwrap()
        .expect("vault discovered");
    let second = h
        .registry
        .lookup(&session, &file, Discovery::Allowed)
        .unwrap()
        .expect("vault registered");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.root(), &Path::directory("/v"));
    assert!(!first.is_unlocked(), "lookup must not unlock");
    assert_eq!(h.prompt.calls(), 0);
}

#[test]
fn test_cache_only_lookup_does_no_io() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    let session = h.fresh_session();
    h.backend.clear_journal();

    let found = h
        .registry
        .lookup(&session, &Path::file("/v/a.txt"), Discovery::CacheOnly)
        .unwrap();
    assert!(found.is_none());

    let mv = session.feature::<dyn MoveFeature>().unwrap();
    let _ = mv.is_supported(&Path::file("/v/a.txt"), &Path::file("/v/b.txt"));
    let _ = mv.is_recursive(&Path::directory("/v/d"), &Path::directory("/e"));
    let delete = session.feature::<dyn DeleteFeature>().unwrap();
    let _ = delete.is_supported(&Path::file("/v/a.txt"));

    assert!(h.backend.journal().is_empty(), "journal: {:?}", h.backend.journal());
    assert_eq!(h.prompt.calls(), 0);
}

#[test]
fn test_nested_vault_wins_by_longest_root() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/outer");
    h.create_vault("/outer/inner");

    let file = Path::file("/outer/inner/x.txt");
    let vault = h
        .registry
        .lookup(&h.session, &file, Discovery::CacheOnly)
        .unwrap()
        .expect("registered");
    assert_eq!(vault.root(), &Path::directory("/outer/inner"));

    let session = h.fresh_session();
    let discovered = h
        .registry
        .lookup(&session, &file, Discovery::Allowed)
        .unwrap()
        .expect("discovered");
    assert_eq!(discovered.root(), &Path::directory("/outer/inner"));
}

#[test]
fn test_plain_path_is_negatively_cached() {
    let backend = Arc::new(MemoryBackend::new(Flavor::Posix));
    backend.put_file(&Path::file("/plain/docs/a.txt"), b"a");
    let registry = Arc::new(VaultRegistry::new(
        RegistryConfig::default()
            .vault(fast_vault_config())
            .negative_ttl(Duration::from_millis(100)),
        CountingPrompt::new(TEST_PASSWORD) as Arc<dyn PasswordCallback>,
    ));
    let session = Session::with_registry(Arc::clone(&backend) as _, Arc::clone(&registry), Default::default());
    let file = Path::file("/plain/docs/a.txt");

    assert!(registry.lookup(&session, &file, Discovery::Allowed).unwrap().is_none());
    let probed = backend.journal().len();
    assert!(probed > 0);

    assert!(registry.lookup(&session, &file, Discovery::Allowed).unwrap().is_none());
    assert_eq!(backend.journal().len(), probed, "misses answered from cache");

    thread::sleep(Duration::from_millis(250));
    assert!(registry.lookup(&session, &file, Discovery::Allowed).unwrap().is_none());
    assert!(backend.journal().len() > probed, "expired misses probe again");
}

#[test]
fn test_concurrent_unlock_prompts_once() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    h.write(&Path::file("/v/a.txt"), b"shared");
    let session = h.fresh_session();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&h.registry);
            let session = Arc::clone(&session);
            thread::spawn(move || {
                registry
                    .find(&session, &Path::file("/v/a.txt"), Discovery::Allowed)
                    .map(|vault| vault.map(|v| v.is_unlocked()))
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), Some(true));
    }

    assert_eq!(h.prompt.calls(), 1);
    assert_eq!(common::read_with(&session, &Path::file("/v/a.txt")), b"shared");
}

#[test]
fn test_cancelled_unlock_can_be_retried() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    h.write(&Path::file("/v/a.txt"), b"later");
    let session = h.fresh_session();
    let read = session.feature::<dyn ReadFeature>().unwrap();

    h.prompt.cancel();
    let err = read
        .read(&Path::file("/v/a.txt"), &TransferStatus::new(), &DisabledConnectionCallback)
        .err()
        .expect("cancelled unlock");
    assert!(matches!(err, FeatureError::VaultUnlockCancel { .. }), "{err:?}");
    assert!(err.is_cancellation());

    h.prompt.answer(TEST_PASSWORD);
    assert_eq!(common::read_with(&session, &Path::file("/v/a.txt")), b"later");
    assert_eq!(h.prompt.calls(), 2);
}

#[test]
fn test_wrong_passphrase_exhausts_attempts() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    let session = h.fresh_session();

    h.prompt.answer("not the password");
    let err = h
        .registry
        .find(&session, &Path::file("/v/a.txt"), Discovery::Allowed)
        .unwrap_err();
    match err {
        FeatureError::Vault(VaultError::IncorrectPassphrase { attempts, .. }) => {
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.prompt.calls(), 3);
}

#[test]
fn test_listing_plain_parent_does_not_unlock() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    let session = h.fresh_session();

    let list = session.feature::<dyn ListFeature>().unwrap();
    let entries = list.list(&Path::root(), &DisabledListProgressListener).unwrap();
    assert!(entries.find_name("v").unwrap().is_directory());
    assert_eq!(h.prompt.calls(), 0);
}

#[test]
fn test_listing_marker_registers_vault_despite_cached_miss() {
    let h = Harness::new(Flavor::Posix);
    h.backend.put_file(&Path::file("/p/readme.txt"), b"plain");
    let dir = Path::directory("/p");
    assert!(h.registry.lookup(&h.session, &dir, Discovery::Allowed).unwrap().is_none());

    // Marker appears after the miss was cached
    h.backend.put_file(&Path::file("/p/masterkey.cryptomator"), b"{}");
    assert!(h.registry.lookup(&h.session, &dir, Discovery::Allowed).unwrap().is_none());

    let entries = h
        .session
        .feature::<dyn ListFeature>()
        .unwrap()
        .list(&dir, &DisabledListProgressListener)
        .unwrap();
    assert!(entries.find_name("masterkey.cryptomator").is_some());

    let vaults = h.registry.vaults(h.session.id());
    assert_eq!(vaults.len(), 1);
    assert_eq!(vaults[0].root(), &dir);
    assert!(!vaults[0].is_unlocked());
}

#[test]
fn test_listing_vault_root_discovers_and_unlocks() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    h.write(&Path::file("/v/a.txt"), b"x");
    let session = h.fresh_session();

    let entries = session
        .feature::<dyn ListFeature>()
        .unwrap()
        .list(&Path::directory("/v"), &DisabledListProgressListener)
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries.find_name("a.txt").is_some());
    assert_eq!(h.prompt.calls(), 1);
}

#[test]
fn test_vault_root_listing_is_decrypted() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    h.write(&Path::file("/v/a.txt"), b"12345");
    h.mkdir(&Path::directory("/v/docs"));

    let list = h.session.feature::<dyn ListFeature>().unwrap();
    let entries = list
        .list(&Path::directory("/v"), &DisabledListProgressListener)
        .unwrap();
    let mut names: Vec<_> = entries.iter().filter_map(|e| e.name()).collect();
    names.sort_unstable();
    assert_eq!(names, ["a.txt", "docs"]);
    let file = entries.find_name("a.txt").unwrap();
    assert!(file.is_file());
    assert_eq!(file.attributes().size, Some(5));
    assert!(entries.find_name("docs").unwrap().is_directory());
}

#[test]
fn test_disabled_registry_treats_everything_as_plain() {
    let backend = Arc::new(MemoryBackend::new(Flavor::Posix));
    backend.put_file(&Path::file("/v/masterkey.cryptomator"), b"{}");
    let registry = Arc::new(VaultRegistry::new(
        RegistryConfig::disabled(),
        CountingPrompt::new(TEST_PASSWORD) as Arc<dyn PasswordCallback>,
    ));
    let session = Session::with_registry(Arc::clone(&backend) as _, Arc::clone(&registry), Default::default());

    let entries = session
        .feature::<dyn ListFeature>()
        .unwrap()
        .list(&Path::directory("/v"), &DisabledListProgressListener)
        .unwrap();
    assert!(entries.find_name("masterkey.cryptomator").is_some());
    assert!(registry.vaults(session.id()).is_empty());
}

#[test]
fn test_deleting_vault_root_closes_vault() {
    let h = Harness::new(Flavor::Posix);
    let vault = h.create_vault("/v");
    assert!(vault.is_unlocked());

    h.session
        .feature::<dyn DeleteFeature>()
        .unwrap()
        .delete(&[Path::directory("/v")], &DisabledDeleteCallback, &DisabledConnectionCallback)
        .unwrap();

    assert!(!h.backend.exists(&Path::directory("/v")));
    assert!(!vault.is_unlocked());
    assert!(h.registry.vaults(h.session.id()).is_empty());
    assert_eq!(h.backend.count(OpKind::Delete), 1);
}

#[test]
fn test_session_close_locks_its_vaults_only() {
    let h = Harness::new(Flavor::Posix);
    let vault = h.create_vault("/v");
    let other = h.fresh_session();
    h.registry
        .find(&other, &Path::file("/v/a.txt"), Discovery::Allowed)
        .unwrap();

    other.close();
    assert!(h.registry.vaults(other.id()).is_empty());
    assert!(vault.is_unlocked());
    assert_eq!(h.registry.vaults(h.session.id()).len(), 1);
}

#[test]
fn test_create_vault_twice_fails() {
    let h = Harness::new(Flavor::Posix);
    h.create_vault("/v");
    let err = h
        .registry
        .create_vault(&h.session, &Path::directory("/v"), TEST_PASSWORD)
        .unwrap_err();
    assert!(matches!(err, FeatureError::Vault(VaultError::AlreadyExists { .. })), "{err:?}");
}
