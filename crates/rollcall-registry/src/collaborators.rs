//! Seams to the subsystems the registry coordinates with.
//!
//! The registry never checks permissions, provisions storage, encodes icons,
//! delivers notifications or stops processes itself. Each of those concerns
//! is a trait here, and [`Collaborators`] bundles one implementation of
//! each. The defaults let a store run standalone:
//!
//! | Seam | Default |
//! |------|---------|
//! | [`PermissionGuard`] | [`AllowAll`] |
//! | [`Installer`] | [`NoopInstaller`] |
//! | [`IconCodec`] | [`UnsupportedCodec`] |
//! | [`EventBus`] | [`BroadcastEventBus`] |
//! | [`LifecycleService`] | [`ImmediateStop`] |

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::registry::InstallToken;
use crate::removal::StopReply;
use crate::{RegistryError, Result, UserId};

/// Rejection from a [`PermissionGuard`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct Denied(pub String);

/// Failure to reach a [`LifecycleService`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Authorizes guarded registry operations.
pub trait PermissionGuard: Send + Sync {
    /// Check whether the caller may perform `operation`.
    fn check(&self, operation: &str) -> std::result::Result<(), Denied>;
}

/// Guard that allows every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionGuard for AllowAll {
    fn check(&self, _operation: &str) -> std::result::Result<(), Denied> {
        Ok(())
    }
}

/// Guard that rejects every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl PermissionGuard for DenyAll {
    fn check(&self, operation: &str) -> std::result::Result<(), Denied> {
        Err(Denied(format!("caller may not {operation}")))
    }
}

/// Provisions and cleans up per-identity package storage.
///
/// Both calls run while the registry holds the install lock; the token
/// proves it. Implementations must not call back into the registry.
pub trait Installer: Send + Sync {
    /// Create storage for a new identity rooted at `path`.
    fn provision(&self, token: &InstallToken, id: UserId, path: &Path) -> io::Result<()>;

    /// Remove storage for an identity that is being deleted.
    fn cleanup(&self, token: &InstallToken, id: UserId) -> io::Result<()>;
}

/// Installer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstaller;

impl Installer for NoopInstaller {
    fn provision(&self, _token: &InstallToken, id: UserId, path: &Path) -> io::Result<()> {
        trace!("Skipping provisioning for user {id} at {}", path.display());
        Ok(())
    }

    fn cleanup(&self, _token: &InstallToken, id: UserId) -> io::Result<()> {
        trace!("Skipping cleanup for user {id}");
        Ok(())
    }
}

/// Decoded icon: RGBA pixels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconImage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// `width * height * 4` bytes
    pub pixels: Vec<u8>,
}

/// Converts icons to and from their stored byte form.
pub trait IconCodec: Send + Sync {
    /// Encode an image for storage.
    fn encode(&self, image: &IconImage) -> Result<Vec<u8>>;

    /// Decode stored bytes.
    fn decode(&self, bytes: &[u8]) -> Result<IconImage>;
}

/// Codec used when none is configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedCodec;

impl IconCodec for UnsupportedCodec {
    fn encode(&self, _image: &IconImage) -> Result<Vec<u8>> {
        Err(RegistryError::Codec("no icon codec configured".to_string()))
    }

    fn decode(&self, _bytes: &[u8]) -> Result<IconImage> {
        Err(RegistryError::Codec("no icon codec configured".to_string()))
    }
}

/// What happened to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserEventKind {
    /// Name or icon changed
    Changed,
    /// Identity created
    Added,
    /// Identity removed
    Removed,
}

/// Notification published after a registry change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserEvent {
    /// Kind of change
    pub kind: UserEventKind,
    /// Affected identity
    pub id: UserId,
}

impl UserEvent {
    /// Create an event.
    pub const fn new(kind: UserEventKind, id: UserId) -> Self {
        Self { kind, id }
    }
}

/// Delivers [`UserEvent`]s. Called with no registry lock held.
pub trait EventBus: Send + Sync {
    /// Publish one event.
    fn publish(&self, event: UserEvent);
}

/// Event bus backed by a `tokio::sync::broadcast` channel.
///
/// Events published while nobody is subscribed are dropped. Slow
/// subscribers observe `RecvError::Lagged` once the buffer overflows.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<UserEvent>,
}

impl BroadcastEventBus {
    /// Default number of buffered events per subscriber.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Create a bus buffering up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: UserEvent) {
        if self.sender.send(event).is_err() {
            trace!("No subscribers for {event:?}");
        }
    }
}

/// Stops the processes of an identity before it is deleted.
///
/// `request_stop` must return promptly. The outcome is reported later, from
/// any thread, through the [`StopReply`]. The reply may also be used before
/// `request_stop` returns; it only enqueues a message.
pub trait LifecycleService: Send + Sync {
    /// Ask for everything running as `id` to stop.
    fn request_stop(&self, id: UserId, reply: StopReply)
    -> std::result::Result<(), TransportError>;
}

/// Lifecycle service with nothing to stop: every request is acknowledged at
/// once.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateStop;

impl LifecycleService for ImmediateStop {
    fn request_stop(
        &self,
        _id: UserId,
        reply: StopReply,
    ) -> std::result::Result<(), TransportError> {
        reply.stopped();
        Ok(())
    }
}

/// The set of collaborators a registry is opened with.
#[derive(Clone)]
pub struct Collaborators {
    /// Authorization for guarded operations
    pub permissions: Arc<dyn PermissionGuard>,
    /// Package storage provisioning
    pub installer: Arc<dyn Installer>,
    /// Icon encoding
    pub codec: Arc<dyn IconCodec>,
    /// Change notifications
    pub events: Arc<dyn EventBus>,
    /// Process lifecycle
    pub lifecycle: Arc<dyn LifecycleService>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            permissions: Arc::new(AllowAll),
            installer: Arc::new(NoopInstaller),
            codec: Arc::new(UnsupportedCodec),
            events: Arc::new(BroadcastEventBus::default()),
            lifecycle: Arc::new(ImmediateStop),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Replace the permission guard.
    #[must_use]
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionGuard>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Replace the installer.
    #[must_use]
    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    /// Replace the icon codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn IconCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Replace the event bus.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Replace the lifecycle service.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn LifecycleService>) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}
