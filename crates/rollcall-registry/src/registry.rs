//! In-memory registry.
//!
//! [`UserRegistry`] is the authoritative cache of identity records. Every
//! mutation updates the cache, publishes a fresh live-id snapshot and then
//! persists through the [`RecordStore`], all before the registry lock is
//! released. Notifications go out afterwards, with no lock held.
//!
//! # Lock order
//!
//! Two locks are involved and are always taken in this order:
//!
//! 1. the **install lock**, shared with the installer subsystem through
//!    [`InstallLock`]
//! 2. the **registry lock**, private to this type
//!
//! Operations that call into the [`Installer`](crate::collaborators::Installer)
//! go through a combined guard that takes both locks in order. Lookups take
//! only the registry lock. [`UserRegistry::live_ids`] and
//! [`UserRegistry::exists`] take no lock at all.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::allocator::IdAllocator;
use crate::collaborators::{Collaborators, IconImage, UserEvent, UserEventKind};
use crate::config::RegistryConfig;
use crate::record::{SerialNumber, UserFlags, UserId, UserRecord};
use crate::removal::{StopEvent, StopEvents, StopReply, stop_channel};
use crate::store::RecordStore;
use crate::{GUEST_USER_NAME, PRIMARY_USER_ID, PRIMARY_USER_NAME, RegistryError, Result};

/// Handle to the install lock.
///
/// Clones share the same lock. The installer subsystem holds one to
/// serialize its own work against identity creation and removal.
#[derive(Clone, Default)]
pub struct InstallLock {
    inner: Arc<Mutex<()>>,
}

impl InstallLock {
    /// Create an unlocked install lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the install lock is held.
    ///
    /// Never call a registry operation while holding the returned guard.
    pub fn lock(&self) -> InstallGuard<'_> {
        InstallGuard {
            _guard: self.inner.lock(),
            token: InstallToken { _private: () },
        }
    }

    /// Take the install lock if it is free.
    pub fn try_lock(&self) -> Option<InstallGuard<'_>> {
        self.inner.try_lock().map(|guard| InstallGuard {
            _guard: guard,
            token: InstallToken { _private: () },
        })
    }
}

impl fmt::Debug for InstallLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallLock")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

/// Proof that the install lock is held.
///
/// Only obtainable by reference from an [`InstallGuard`].
#[derive(Debug)]
pub struct InstallToken {
    _private: (),
}

/// Holds the install lock until dropped.
pub struct InstallGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    token: InstallToken,
}

impl InstallGuard<'_> {
    /// Token to pass to installer calls.
    pub fn token(&self) -> &InstallToken {
        &self.token
    }
}

impl fmt::Debug for InstallGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallGuard").finish_non_exhaustive()
    }
}

/// Outcome of a mutation with respect to the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Nothing to change (unknown id or identical value)
    Unchanged,
    /// Cache updated and written to disk
    Persisted,
    /// Cache updated but the write failed; see the logs
    NotPersisted,
}

/// Name and icon changes applied by [`UserRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    /// New display name
    pub name: Option<String>,
    /// New icon
    pub icon: Option<IconImage>,
}

impl UserUpdate {
    /// Change the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Change the icon.
    #[must_use]
    pub fn with_icon(mut self, icon: IconImage) -> Self {
        self.icon = Some(icon);
        self
    }
}

/// State guarded by the registry lock.
#[derive(Debug)]
pub(crate) struct RegistryState {
    pub(crate) users: BTreeMap<UserId, UserRecord>,
    pub(crate) allocator: IdAllocator,
    pub(crate) guest_enabled: bool,
    /// Ids waiting for their lifecycle service to confirm a stop
    pub(crate) pending_removals: BTreeSet<UserId>,
}

impl RegistryState {
    fn new(users: BTreeMap<UserId, UserRecord>, allocator: IdAllocator) -> Self {
        let guest_enabled = users.values().any(UserRecord::is_guest);
        Self {
            users,
            allocator,
            guest_enabled,
            pending_removals: BTreeSet::new(),
        }
    }

    pub(crate) fn ids(&self) -> Vec<UserId> {
        self.users.keys().copied().collect()
    }
}

/// Both locks, taken in order. Fields drop in declaration order, so the
/// registry lock is released before the install lock.
pub(crate) struct Locked<'a> {
    pub(crate) state: MutexGuard<'a, RegistryState>,
    pub(crate) install: InstallGuard<'a>,
}

/// Durable registry of identities.
pub struct UserRegistry {
    config: RegistryConfig,
    store: RecordStore,
    collaborators: Collaborators,
    install_lock: InstallLock,
    state: Mutex<RegistryState>,
    live_ids: ArcSwap<Arc<[UserId]>>,
    stop_sender: tokio::sync::mpsc::UnboundedSender<StopEvent>,
    stop_events: Mutex<Option<StopEvents>>,
}

impl fmt::Debug for UserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRegistry")
            .field("users_dir", &self.store.users_dir())
            .field("live_ids", &self.live_ids())
            .finish_non_exhaustive()
    }
}

impl UserRegistry {
    /// Open the store under `config.data_dir` and load every identity.
    ///
    /// A missing or unreadable index, or one whose primary record cannot be
    /// loaded, resets the store to a single primary identity.
    pub fn open(config: RegistryConfig, collaborators: Collaborators) -> Result<Self> {
        Self::open_with_install_lock(config, collaborators, InstallLock::new())
    }

    /// Like [`open`](Self::open), sharing an install lock the installer
    /// subsystem already holds a handle to.
    pub fn open_with_install_lock(
        config: RegistryConfig,
        collaborators: Collaborators,
        install_lock: InstallLock,
    ) -> Result<Self> {
        config.validate()?;
        let store = RecordStore::open(&config.data_dir)?;

        let state = match Self::load(&store, &config) {
            Some(state) => state,
            None => Self::bootstrap(&store, &config),
        };
        let ids = state.ids();

        info!(
            "Opened user registry at {} ({} users, next serial {})",
            store.users_dir().display(),
            ids.len(),
            state.allocator.peek_serial()
        );
        if state.allocator.is_exhausted() {
            warn!("Serial numbers are exhausted, no further users can be created");
        }

        let (stop_sender, receiver) = stop_channel();
        Ok(Self {
            config,
            store,
            collaborators,
            install_lock,
            state: Mutex::new(state),
            live_ids: ArcSwap::from_pointee(Arc::from(ids)),
            stop_sender,
            stop_events: Mutex::new(Some(StopEvents::new(receiver))),
        })
    }

    fn load(store: &RecordStore, config: &RegistryConfig) -> Option<RegistryState> {
        let index = match store.load_index() {
            Ok(Some(index)) => index,
            Ok(None) => {
                info!("No user index found");
                return None;
            }
            Err(e) => {
                warn!("Discarding unreadable user index: {e}");
                return None;
            }
        };

        let mut users = BTreeMap::new();
        for id in index.ids {
            match store.load_record(id) {
                Ok(Some(record)) => {
                    users.insert(id, record);
                }
                Ok(None) => warn!("Dropping user {id}: no usable record file"),
                Err(e) => warn!("Dropping user {id}: {e}"),
            }
        }

        if !users.contains_key(&PRIMARY_USER_ID) {
            warn!("Primary user record is missing");
            return None;
        }

        let start = index.next_serial.unwrap_or_else(|| {
            users
                .keys()
                .next_back()
                .map_or(1, |&max_id| u64::from(max_id) + 1)
        });
        let mut allocator = IdAllocator::new(config.min_user_id, start);
        for record in users.values() {
            allocator.observe(record.serial_number);
        }

        Some(RegistryState::new(users, allocator))
    }

    fn bootstrap(store: &RecordStore, config: &RegistryConfig) -> RegistryState {
        info!("Bootstrapping user store with the primary user");

        let primary = UserRecord::new(
            PRIMARY_USER_ID,
            0,
            PRIMARY_USER_NAME,
            UserFlags::ADMIN | UserFlags::PRIMARY,
        );
        let allocator = IdAllocator::new(config.min_user_id, 1);

        if let Err(e) = store.save_record(&primary) {
            error!("Failed to write primary user record: {e}");
        }
        if let Err(e) = store.save_index(&[PRIMARY_USER_ID], allocator.peek_serial()) {
            error!("Failed to write user index: {e}");
        }

        RegistryState::new(BTreeMap::from([(PRIMARY_USER_ID, primary)]), allocator)
    }

    /// Configuration the registry was opened with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// On-disk layout.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Handle to the install lock, for the installer subsystem.
    pub fn install_lock(&self) -> InstallLock {
        self.install_lock.clone()
    }

    /// Take the receiving end of the stop-event channel.
    ///
    /// Returns `None` after the first call.
    pub fn take_stop_events(&self) -> Option<StopEvents> {
        self.stop_events.lock().take()
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub(crate) fn stop_reply(&self, id: UserId) -> StopReply {
        StopReply::new(id, self.stop_sender.clone())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    pub(crate) fn lock_both(&self) -> Locked<'_> {
        let install = self.install_lock.lock();
        let state = self.state.lock();
        Locked { state, install }
    }

    pub(crate) fn check(&self, operation: &str) -> Result<()> {
        self.collaborators
            .permissions
            .check(operation)
            .map_err(|denied| {
                debug!("Denied {operation}: {denied}");
                RegistryError::PermissionDenied(denied.0)
            })
    }

    pub(crate) fn publish(&self, kind: UserEventKind, id: UserId) {
        self.collaborators.events.publish(UserEvent::new(kind, id));
    }

    pub(crate) fn publish_snapshot(&self, state: &RegistryState) {
        self.live_ids.store(Arc::new(Arc::from(state.ids())));
    }

    pub(crate) fn persist_index(&self, state: &RegistryState) -> bool {
        match self
            .store
            .save_index(&state.ids(), state.allocator.peek_serial())
        {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write user index: {e}");
                false
            }
        }
    }

    pub(crate) fn persist_record(&self, record: &UserRecord) -> WriteStatus {
        match self.store.save_record(record) {
            Ok(()) => WriteStatus::Persisted,
            Err(e) => {
                error!("Failed to write user {}: {e}", record.id);
                WriteStatus::NotPersisted
            }
        }
    }

    /// All identities, ordered by id.
    pub fn list(&self) -> Result<Vec<UserRecord>> {
        self.check("query users")?;
        Ok(self.lock_state().users.values().cloned().collect())
    }

    /// One identity, or `None` if the id is unknown.
    pub fn get(&self, id: UserId) -> Result<Option<UserRecord>> {
        self.check("query users")?;
        Ok(self.lock_state().users.get(&id).cloned())
    }

    /// Whether `id` is in the current live-id snapshot. Takes no lock.
    pub fn exists(&self, id: UserId) -> bool {
        self.live_ids().contains(&id)
    }

    /// Current live-id snapshot, sorted. Takes no lock.
    pub fn live_ids(&self) -> Arc<[UserId]> {
        let snapshot = self.live_ids.load();
        Arc::clone(&**snapshot)
    }

    /// Serial number of `id`.
    pub fn serial_number(&self, id: UserId) -> Option<SerialNumber> {
        self.lock_state().users.get(&id).map(|record| record.serial_number)
    }

    /// Id of the identity carrying `serial`.
    pub fn id_from_serial(&self, serial: SerialNumber) -> Option<UserId> {
        let ids = self.live_ids();
        let state = self.lock_state();
        ids.iter().copied().find(|id| {
            state
                .users
                .get(id)
                .is_some_and(|record| record.serial_number == serial)
        })
    }

    /// Whether guest identities are enabled.
    pub fn is_guest_enabled(&self) -> bool {
        self.lock_state().guest_enabled
    }

    /// Change the display name of `id`.
    pub fn rename(&self, id: UserId, name: impl Into<String>) -> Result<WriteStatus> {
        self.update(id, UserUpdate::default().with_name(name))
    }

    /// Store a new icon for `id`.
    ///
    /// If encoding or writing fails the previous icon path is kept, and the
    /// record is still written.
    pub fn set_icon(&self, id: UserId, image: IconImage) -> Result<WriteStatus> {
        self.update(id, UserUpdate::default().with_icon(image))
    }

    /// Apply a name and icon change in one write.
    ///
    /// An icon failure never undoes the name change.
    pub fn update(&self, id: UserId, update: UserUpdate) -> Result<WriteStatus> {
        self.check("update users")?;

        let status = {
            let mut state = self.lock_state();
            let Some(record) = state.users.get_mut(&id) else {
                debug!("Ignoring update for unknown user {id}");
                return Ok(WriteStatus::Unchanged);
            };

            let mut changed = false;
            if let Some(name) = update.name
                && record.name != name
            {
                record.name = name;
                changed = true;
            }
            if let Some(image) = update.icon {
                changed = true;
                match self.write_icon(id, &image) {
                    Ok(path) => record.icon_path = Some(path),
                    Err(e) => warn!("Failed to store icon for user {id}: {e}"),
                }
            }
            if !changed {
                return Ok(WriteStatus::Unchanged);
            }

            let record = record.clone();
            self.publish_snapshot(&state);
            self.persist_record(&record)
        };

        self.publish(UserEventKind::Changed, id);
        Ok(status)
    }

    fn write_icon(&self, id: UserId, image: &IconImage) -> Result<PathBuf> {
        let bytes = self.collaborators.codec.encode(image)?;
        self.store.write_icon(id, &bytes)
    }

    /// Decode the stored icon of `id`.
    ///
    /// Returns `None` for an unknown id, an identity without an icon, or an
    /// icon that cannot be read or decoded.
    pub fn icon(&self, id: UserId) -> Result<Option<IconImage>> {
        self.check("read user icons")?;

        let path = {
            let state = self.lock_state();
            state
                .users
                .get(&id)
                .and_then(|record| record.icon_path.clone())
        };
        let Some(path) = path else {
            return Ok(None);
        };

        let decoded = self
            .store
            .read_icon(&path)
            .and_then(|bytes| self.collaborators.codec.decode(&bytes));
        match decoded {
            Ok(image) => Ok(Some(image)),
            Err(e) => {
                warn!("Failed to load icon for user {id} from {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    /// Enable or disable guest identities.
    ///
    /// Disabling requests removal of the existing guest. Enabling creates one
    /// named "Guest" unless a guest already exists. Setting the current value
    /// again does nothing.
    pub fn set_guest_enabled(&self, enabled: bool) -> Result<()> {
        self.check("enable guest users")?;

        let added = {
            let mut locked = self.lock_both();
            if locked.state.guest_enabled == enabled {
                return Ok(());
            }

            let guest = locked
                .state
                .users
                .values()
                .find(|record| record.is_guest())
                .map(|record| record.id);

            let added = match (enabled, guest) {
                (false, Some(id)) => {
                    self.request_removal_locked(&mut locked.state, id)?;
                    None
                }
                (true, None) => Some(self.create_locked(
                    &mut locked,
                    GUEST_USER_NAME,
                    UserFlags::GUEST,
                )?),
                _ => None,
            };

            locked.state.guest_enabled = enabled;
            info!("Guest user {}", if enabled { "enabled" } else { "disabled" });
            added
        };

        if let Some(record) = added {
            self.publish(UserEventKind::Added, record.id);
        }
        Ok(())
    }

    /// Create an identity.
    ///
    /// Fails with [`RegistryError::LimitReached`] when the registry is full
    /// with [`RegistryError::GuestExists`] when `flags` asks for a second
    /// guest, and with [`RegistryError::SerialsExhausted`] once the last
    /// serial number has been used. Nothing is written in these cases.
    pub fn create(&self, name: &str, flags: UserFlags) -> Result<UserRecord> {
        self.check("create users")?;

        let record = {
            let mut locked = self.lock_both();
            self.create_locked(&mut locked, name, flags)?
        };

        self.publish(UserEventKind::Added, record.id);
        Ok(record)
    }

    fn create_locked(
        &self,
        locked: &mut Locked<'_>,
        name: &str,
        flags: UserFlags,
    ) -> Result<UserRecord> {
        let state = &mut *locked.state;

        let max = self.config.max_users;
        if state.users.len() >= max {
            warn!("Cannot create user {name:?}: limit of {max} reached");
            return Err(RegistryError::LimitReached { max });
        }
        if flags.contains(UserFlags::GUEST)
            && let Some(guest) = state.users.values().find(|record| record.is_guest())
        {
            return Err(RegistryError::GuestExists(guest.id));
        }

        let id = state
            .allocator
            .next_id(|id| state.users.contains_key(&id))
            .ok_or(RegistryError::LimitReached { max })?;
        let Some(serial) = state.allocator.next_serial() else {
            warn!("Cannot create user {name:?}: serial numbers exhausted");
            return Err(RegistryError::SerialsExhausted);
        };
        let record = UserRecord::new(id, serial, name, flags);

        state.users.insert(id, record.clone());
        if record.is_guest() {
            state.guest_enabled = true;
        }
        self.publish_snapshot(state);
        self.persist_index(state);
        self.persist_record(&record);

        let user_path = self.config.user_data_path().join(id.to_string());
        if let Err(e) = self
            .collaborators
            .installer
            .provision(locked.install.token(), id, &user_path)
        {
            warn!(
                "Failed to provision storage for user {id} at {}: {e}",
                user_path.display()
            );
        }

        info!("Created user {id} {name:?} (serial {serial}, flags {:#x})", flags.bits());
        Ok(record)
    }

    /// Mark first-time setup of `id` as complete.
    ///
    /// Only the first call writes anything.
    pub fn make_initialized(&self, id: UserId) -> Result<WriteStatus> {
        self.check("initialize users")?;

        let mut state = self.lock_state();
        let Some(record) = state.users.get_mut(&id) else {
            error!("Cannot initialize unknown user {id}");
            return Ok(WriteStatus::Unchanged);
        };
        if record.is_initialized() {
            return Ok(WriteStatus::Unchanged);
        }

        record.flags |= UserFlags::INITIALIZED;
        let record = record.clone();
        self.publish_snapshot(&state);
        Ok(self.persist_record(&record))
    }
}
