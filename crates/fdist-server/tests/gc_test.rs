//! Retention against a real store, liveness set and application index.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fdist_cas::{CasError, ContentStore, FileReference};
use fdist_config::testing::TestEnvironment;
use fdist_lock::{DistributedLock, MemoryCoordinator};
use fdist_registry::{ActiveApplications, ApplicationIndex, FileRegistry, ReferenceUsage};
use fdist_server::maintenance::{Maintainer, RetentionMaintainer, RetentionPolicy};
use filetime::FileTime;
use parking_lot::RwLock;

/// Liveness set the test can change between runs.
#[derive(Default)]
struct SharedUsage(RwLock<HashSet<FileReference>>);

impl ReferenceUsage for SharedUsage {
    fn references_in_use(&self) -> fdist_registry::Result<HashSet<FileReference>> {
        Ok(self.0.read().clone())
    }
}

fn make_old(store: &ContentStore, reference: &FileReference) {
    let dir = store.blob_dir(reference);
    filetime::set_file_mtime(dir, FileTime::from_unix_time(1_000_000, 0)).unwrap();
}

const WINDOW: Duration = Duration::from_secs(24 * 3600);

#[test]
fn test_in_use_reference_is_never_deleted() {
    let env = TestEnvironment::new().unwrap();
    let store = ContentStore::new(&env.store_root).unwrap();
    let used = store.add_blob(b"needed", "needed.txt").unwrap();
    let unused = store.add_blob(b"garbage", "garbage.txt").unwrap();
    make_old(&store, &used);
    make_old(&store, &unused);

    let usage = Arc::new(SharedUsage::default());
    usage.0.write().insert(used.clone());
    let maintainer = RetentionMaintainer::new(store.clone(), usage, RetentionPolicy::new(WINDOW));

    for _ in 0..3 {
        maintainer.delete_unused().unwrap();
        assert!(store.has_file(&used));
    }
    assert!(!store.has_file(&unused));
}

#[test]
fn test_unused_reference_deleted_exactly_once() {
    let env = TestEnvironment::new().unwrap();
    let store = ContentStore::new(&env.store_root).unwrap();
    let unused = store.add_blob(b"garbage", "garbage.txt").unwrap();
    make_old(&store, &unused);

    let maintainer =
        RetentionMaintainer::new(store.clone(), Arc::new(SharedUsage::default()), RetentionPolicy::new(WINDOW));

    let first = maintainer.delete_unused().unwrap();
    assert_eq!(first.deleted, vec![unused.clone()]);

    let second = maintainer.delete_unused().unwrap();
    assert!(second.deleted.is_empty());
    assert_eq!(second.scanned, 0);
}

#[test]
fn test_reference_used_again_before_deletion_survives() {
    /// Reports nothing in use for the scan, then the reference in use for
    /// the re-check under the lock.
    struct BecomesUsed {
        reference: FileReference,
        calls: parking_lot::Mutex<usize>,
    }

    impl ReferenceUsage for BecomesUsed {
        fn references_in_use(&self) -> fdist_registry::Result<HashSet<FileReference>> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls == 1 {
                Ok(HashSet::new())
            } else {
                Ok([self.reference.clone()].into_iter().collect())
            }
        }
    }

    let env = TestEnvironment::new().unwrap();
    let store = ContentStore::new(&env.store_root).unwrap();
    let reference = store.add_blob(b"revived", "r.txt").unwrap();
    make_old(&store, &reference);

    let usage = Arc::new(BecomesUsed {
        reference: reference.clone(),
        calls: parking_lot::Mutex::new(0),
    });
    let maintainer = RetentionMaintainer::new(store.clone(), usage, RetentionPolicy::new(WINDOW));
    let report = maintainer.delete_unused().unwrap();

    assert!(report.deleted.is_empty());
    assert_eq!(report.in_use, 1);
    assert!(store.has_file(&reference));
}

#[test]
fn test_locked_store_is_skipped_not_failed() {
    let env = TestEnvironment::new().unwrap();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let ours = Arc::new(
        DistributedLock::new("filedistribution", coordinator.clone())
            .with_default_timeout(Duration::from_millis(50)),
    );
    let other_replica = DistributedLock::new("filedistribution", coordinator);

    let store = ContentStore::new(&env.store_root).unwrap().with_lock(ours);
    let unused = store.add_blob(b"garbage", "garbage.txt").unwrap();
    make_old(&store, &unused);

    let _held = other_replica.try_acquire(Duration::from_secs(1)).unwrap();
    let mut maintainer =
        RetentionMaintainer::new(store.clone(), Arc::new(SharedUsage::default()), RetentionPolicy::new(WINDOW));
    let report = maintainer.delete_unused().unwrap();
    assert_eq!(report.skipped_locked, 1);
    assert_eq!(report.failed, 0);
    assert!(store.has_file(&unused));

    // The scheduler entry point swallows it too
    maintainer.run_once();
}

#[test]
fn test_end_to_end_scenario() {
    let env = TestEnvironment::new().unwrap();
    env.create_file("a/b.txt", b"hello").unwrap();
    env.create_file("c.txt", b"hello").unwrap();

    let store = ContentStore::new(&env.store_root).unwrap();
    let registry = FileRegistry::new(store.clone(), &env.app_dir);

    let r1 = registry.add_file("a/b.txt").unwrap();
    let dirs_after_first = std::fs::read_dir(&env.store_root).unwrap().count();
    assert_eq!(registry.add_file("a/b.txt").unwrap(), r1);
    assert_eq!(registry.add_file("c.txt").unwrap(), r1);
    assert_eq!(std::fs::read_dir(&env.store_root).unwrap().count(), dirs_after_first);
    assert_eq!(
        registry.export(),
        vec![("a/b.txt".to_string(), r1.clone()), ("c.txt".to_string(), r1.clone())]
    );

    // Deploy: persist the snapshot and mark the application active
    let snapshot_path = env.snapshot_path("tenant.app");
    registry.snapshot("cfg1").write(&snapshot_path).unwrap();
    let mut index = ApplicationIndex::new();
    index.register("tenant.app", &snapshot_path, None);
    index.save(&env.state_dir).unwrap();

    let usage = Arc::new(ActiveApplications::new(&env.state_dir, Duration::from_secs(5)));
    let maintainer = RetentionMaintainer::new(store.clone(), usage, RetentionPolicy::new(WINDOW));
    make_old(&store, &r1);

    // Active: old but in use
    let report = maintainer.delete_unused().unwrap();
    assert!(report.deleted.is_empty());
    assert!(store.get_file(&r1).is_ok());

    // Undeploy: no longer in use, and old
    let mut index = ApplicationIndex::load_or_create(&env.state_dir).unwrap();
    index.remove("tenant.app");
    index.save(&env.state_dir).unwrap();
    make_old(&store, &r1);

    let report = maintainer.delete_unused().unwrap();
    assert_eq!(report.deleted, vec![r1.clone()]);
    assert!(!store.blob_dir(&r1).exists());
    assert!(matches!(store.get_file(&r1), Err(CasError::NotFound { .. })));
}

#[test]
fn test_unreadable_liveness_aborts_run() {
    let env = TestEnvironment::new().unwrap();
    let store = ContentStore::new(&env.store_root).unwrap();
    let reference = store.add_blob(b"data", "d").unwrap();
    make_old(&store, &reference);

    let mut index = ApplicationIndex::new();
    index.register("ghost", &env.snapshot_path("ghost"), None);
    index.save(&env.state_dir).unwrap();

    let usage = Arc::new(ActiveApplications::new(&env.state_dir, Duration::from_secs(5)));
    let maintainer = RetentionMaintainer::new(store.clone(), usage, RetentionPolicy::new(WINDOW));
    assert!(maintainer.delete_unused().is_err());
    assert!(store.has_file(&reference));
}
