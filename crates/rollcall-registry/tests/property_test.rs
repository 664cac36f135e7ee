//! Property tests over random create and remove sequences.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use proptest::prelude::*;
use rollcall_registry::{
    Collaborators, RegistryConfig, RegistryError, RemovalRequest, UserFlags, UserRegistry,
};
use std::collections::BTreeSet;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Create(bool),
    /// Remove the n-th live id, wrapping; index 0 targets the primary.
    Remove(usize),
    Reopen,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<bool>().prop_map(Op::Create),
        3 => (0usize..8).prop_map(Op::Remove),
        1 => Just(Op::Reopen),
    ]
}

fn open(dir: &TempDir) -> (UserRegistry, rollcall_registry::StopEvents) {
    let registry = UserRegistry::open(
        RegistryConfig::new(dir.path()).with_max_users(6),
        Collaborators::default(),
    )
    .expect("open");
    let events = registry.take_stop_events().expect("stop events");
    (registry, events)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_registry_invariants(ops in proptest::collection::vec(op(), 1..40)) {
        let dir = TempDir::new().expect("temp dir");
        let (mut registry, mut events) = open(&dir);
        let mut seen_serials = BTreeSet::new();
        let mut last_serial = 0;

        for op in ops {
            match op {
                Op::Create(guest) => {
                    let flags = if guest { UserFlags::GUEST } else { UserFlags::empty() };
                    match registry.create("user", flags) {
                        Ok(record) => {
                            prop_assert!(record.id >= 10);
                            prop_assert!(record.serial_number > last_serial);
                            prop_assert!(seen_serials.insert(record.serial_number));
                            last_serial = record.serial_number;
                            prop_assert!(registry.exists(record.id));
                            prop_assert!(registry.live_ids().contains(&record.id));
                        }
                        Err(RegistryError::LimitReached { max }) => {
                            prop_assert_eq!(max, 6);
                            prop_assert_eq!(registry.live_ids().len(), 6);
                        }
                        Err(RegistryError::GuestExists(_)) => prop_assert!(guest),
                        Err(e) => prop_assert!(false, "unexpected error: {e}"),
                    }
                }
                Op::Remove(index) => {
                    let ids = registry.live_ids();
                    let id = ids[index % ids.len()];
                    match registry.request_removal(id) {
                        Ok(RemovalRequest::Accepted) => {
                            prop_assert_eq!(events.drain(&registry), 1);
                            prop_assert!(!registry.exists(id));
                            prop_assert!(!registry.store().record_path(id).exists());
                        }
                        Ok(RemovalRequest::AlreadyPending) => {
                            prop_assert!(false, "immediate stop leaves nothing pending");
                        }
                        Err(RegistryError::Protected(protected)) => prop_assert_eq!(protected, 0),
                        Err(e) => prop_assert!(false, "unexpected error: {e}"),
                    }
                }
                Op::Reopen => {
                    let before = registry.list().expect("list");
                    drop(events);
                    drop(registry);
                    (registry, events) = open(&dir);
                    prop_assert_eq!(registry.list().expect("list"), before);
                }
            }

            prop_assert!(registry.exists(0));
            let guests = registry
                .list()
                .expect("list")
                .iter()
                .filter(|record| record.is_guest())
                .count();
            prop_assert!(guests <= 1);

            let index = registry.store().load_index().expect("load").expect("index");
            prop_assert_eq!(&index.ids[..], &*registry.live_ids());
            prop_assert!(index.next_serial.unwrap_or(0) > u64::from(last_serial));
        }
    }
}
