//! Multi-threaded use of one registry.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use rollcall_registry::collaborators::{Installer, LifecycleService, TransportError};
use rollcall_registry::{
    Collaborators, InstallLock, InstallToken, RegistryConfig, RegistryError, StopReply,
    UserFlags, UserId, UserRegistry,
};
use std::io;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Answers every stop from a separate thread after a short delay.
struct DelayedStop;

impl LifecycleService for DelayedStop {
    fn request_stop(&self, _id: UserId, reply: StopReply) -> Result<(), TransportError> {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            reply.stopped();
        });
        Ok(())
    }
}

/// Counts provision and cleanup calls.
#[derive(Default)]
struct CountingInstaller {
    provisioned: AtomicUsize,
    cleaned: AtomicUsize,
}

impl Installer for CountingInstaller {
    fn provision(&self, _token: &InstallToken, _id: UserId, _path: &Path) -> io::Result<()> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&self, _token: &InstallToken, _id: UserId) -> io::Result<()> {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn concurrent_creates_get_distinct_ids_and_serials() {
    let dir = TempDir::new().expect("temp dir");
    let registry = Arc::new(
        UserRegistry::open(
            RegistryConfig::new(dir.path()).with_max_users(17),
            Collaborators::default(),
        )
        .expect("open"),
    );

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                (0..4)
                    .map(|n| {
                        registry
                            .create(&format!("w{worker}-{n}"), UserFlags::empty())
                            .expect("create")
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = Vec::new();
    let mut serials = Vec::new();
    for handle in handles {
        for record in handle.join().expect("worker panicked") {
            ids.push(record.id);
            serials.push(record.serial_number);
        }
    }
    ids.sort_unstable();
    serials.sort_unstable();

    assert_eq!(ids, (10..26).collect::<Vec<_>>());
    assert_eq!(serials, (1..17).collect::<Vec<_>>());
    assert_eq!(registry.live_ids().len(), 17);
    assert!(matches!(
        registry.create("overflow", UserFlags::empty()),
        Err(RegistryError::LimitReached { max: 17 })
    ));
}

#[test]
fn concurrent_guest_enable_creates_one_guest() {
    let dir = TempDir::new().expect("temp dir");
    let installer = Arc::new(CountingInstaller::default());
    let registry = Arc::new(
        UserRegistry::open(
            RegistryConfig::new(dir.path()).with_max_users(8),
            Collaborators::default().with_installer(installer.clone()),
        )
        .expect("open"),
    );

    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.set_guest_enabled(true)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked").expect("enable guest");
    }

    let guests: Vec<_> = registry
        .list()
        .expect("list")
        .into_iter()
        .filter(|record| record.is_guest())
        .collect();
    assert_eq!(guests.len(), 1);
    assert!(registry.is_guest_enabled());
    assert_eq!(&*registry.live_ids(), &[0, guests[0].id]);
    assert_eq!(guests[0].serial_number, 1);
    assert_eq!(installer.provisioned.load(Ordering::SeqCst), 1);
    assert_eq!(
        registry.store().load_index().expect("load").expect("index").ids,
        vec![0, guests[0].id]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removals_confirmed_from_other_threads() {
    let dir = TempDir::new().expect("temp dir");
    let installer = Arc::new(CountingInstaller::default());
    let registry = Arc::new(
        UserRegistry::open(
            RegistryConfig::new(dir.path()),
            Collaborators::default()
                .with_installer(installer.clone())
                .with_lifecycle(Arc::new(DelayedStop)),
        )
        .expect("open"),
    );
    let pump = tokio::spawn(
        registry
            .take_stop_events()
            .expect("stop events")
            .run(Arc::clone(&registry)),
    );

    let created: Vec<_> = (0..3)
        .map(|n| registry.create(&format!("u{n}"), UserFlags::empty()).expect("create"))
        .collect();
    for record in &created {
        registry.request_removal(record.id).expect("request");
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.live_ids().len() > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("removals not applied in time");

    assert!(registry.pending_removals().is_empty());
    assert_eq!(installer.provisioned.load(Ordering::SeqCst), 3);
    assert_eq!(installer.cleaned.load(Ordering::SeqCst), 3);
    pump.abort();
}

#[test]
fn create_waits_for_install_lock() {
    let dir = TempDir::new().expect("temp dir");
    let install_lock = InstallLock::new();
    let registry = Arc::new(
        UserRegistry::open_with_install_lock(
            RegistryConfig::new(dir.path()),
            Collaborators::default(),
            install_lock.clone(),
        )
        .expect("open"),
    );

    let guard = install_lock.lock();
    let creator = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.create("late", UserFlags::empty()).expect("create"))
    };

    thread::sleep(Duration::from_millis(50));
    // Lock-free readers proceed while the installer holds its lock.
    assert_eq!(&*registry.live_ids(), &[0]);
    assert!(registry.exists(0));
    assert_eq!(registry.serial_number(0), Some(0));
    assert!(!creator.is_finished());

    drop(guard);
    let record = creator.join().expect("creator panicked");
    assert!(registry.exists(record.id));
}

#[test]
fn readers_see_consistent_snapshots() {
    let dir = TempDir::new().expect("temp dir");
    let registry = Arc::new(
        UserRegistry::open(
            RegistryConfig::new(dir.path()).with_max_users(64),
            Collaborators::default(),
        )
        .expect("open"),
    );

    let reader = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..500 {
                let ids = registry.live_ids();
                assert_eq!(ids.first(), Some(&0));
                assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
            }
        })
    };

    for n in 0..20 {
        registry.create(&format!("u{n}"), UserFlags::empty()).expect("create");
    }
    reader.join().expect("reader panicked");
}
