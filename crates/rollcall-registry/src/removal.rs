//! Two-phase removal.
//!
//! Removing an identity first asks the
//! [`LifecycleService`](crate::collaborators::LifecycleService) to stop
//! everything running as it. The identity is deleted only once the service
//! confirms, by sending [`StopEvent::Stopped`] through the [`StopReply`] it
//! was handed:
//!
//! ```text
//! Active --request_removal--> StopRequested --Stopped--> (deleted)
//!                                   |
//!                                   +--------Aborted---> Active
//! ```
//!
//! Confirmations are plain channel messages, so a service may answer from
//! any thread, including from inside `request_stop`, without re-entering
//! the registry. The host drives the receiving side with [`StopEvents`].
//! There is no timeout: an identity whose stop is never confirmed stays
//! pending, visible through [`UserRegistry::pending_removals`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::collaborators::UserEventKind;
use crate::registry::{RegistryState, UserRegistry};
use crate::{PRIMARY_USER_ID, RegistryError, Result, UserId};

/// Outcome of an accepted removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalRequest {
    /// A stop was requested; the identity is deleted once it is confirmed.
    Accepted,
    /// A removal of this identity was already waiting for its stop.
    AlreadyPending,
}

/// Answer from the lifecycle service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopEvent {
    /// Everything running as the identity has stopped.
    Stopped(UserId),
    /// The identity could not be stopped and stays active.
    Aborted(UserId),
}

impl StopEvent {
    /// Identity the event is about.
    pub const fn id(&self) -> UserId {
        match self {
            Self::Stopped(id) | Self::Aborted(id) => *id,
        }
    }
}

pub(crate) fn stop_channel() -> (
    mpsc::UnboundedSender<StopEvent>,
    mpsc::UnboundedReceiver<StopEvent>,
) {
    mpsc::unbounded_channel()
}

/// One-shot reply handle passed to
/// [`LifecycleService::request_stop`](crate::collaborators::LifecycleService::request_stop).
#[derive(Debug)]
pub struct StopReply {
    id: UserId,
    sender: mpsc::UnboundedSender<StopEvent>,
}

impl StopReply {
    pub(crate) fn new(id: UserId, sender: mpsc::UnboundedSender<StopEvent>) -> Self {
        Self { id, sender }
    }

    /// Identity whose stop was requested.
    pub const fn id(&self) -> UserId {
        self.id
    }

    /// Confirm the stop. Returns false if the registry is gone.
    pub fn stopped(self) -> bool {
        self.send(StopEvent::Stopped(self.id))
    }

    /// Report that the stop failed. Returns false if the registry is gone.
    pub fn aborted(self) -> bool {
        self.send(StopEvent::Aborted(self.id))
    }

    fn send(&self, event: StopEvent) -> bool {
        match self.sender.send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!("Registry closed, discarding {event:?}");
                false
            }
        }
    }
}

/// Receiving side of the stop-event channel.
///
/// Obtained once from [`UserRegistry::take_stop_events`].
#[derive(Debug)]
pub struct StopEvents {
    receiver: mpsc::UnboundedReceiver<StopEvent>,
}

impl StopEvents {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<StopEvent>) -> Self {
        Self { receiver }
    }

    /// Apply events as they arrive.
    ///
    /// Each event is handled on the blocking pool, one at a time and in
    /// arrival order. Only a weak reference to the registry is kept, so the
    /// loop ends once the registry has been dropped.
    pub async fn run(mut self, registry: Arc<UserRegistry>) {
        let registry = Arc::downgrade(&registry);

        while let Some(event) = self.receiver.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            if let Err(e) =
                tokio::task::spawn_blocking(move || registry.handle_stop_event(event)).await
            {
                error!("Stop event handler for user {} failed: {e}", event.id());
            }
        }

        debug!("Stop event loop finished");
    }

    /// Apply every event already queued, without waiting.
    ///
    /// Returns the number of events taken from the queue.
    pub fn drain(&mut self, registry: &UserRegistry) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.receiver.try_recv() {
            registry.handle_stop_event(event);
            handled += 1;
        }
        handled
    }
}

impl UserRegistry {
    /// Start removing `id`.
    ///
    /// Returns as soon as the lifecycle service has been asked to stop the
    /// identity. The primary identity can never be removed.
    pub fn request_removal(&self, id: UserId) -> Result<RemovalRequest> {
        self.check("remove users")?;
        let mut state = self.lock_state();
        self.request_removal_locked(&mut state, id)
    }

    pub(crate) fn request_removal_locked(
        &self,
        state: &mut RegistryState,
        id: UserId,
    ) -> Result<RemovalRequest> {
        if id == PRIMARY_USER_ID {
            return Err(RegistryError::Protected(id));
        }
        if !state.users.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        if !state.pending_removals.insert(id) {
            debug!("Removal of user {id} already pending");
            return Ok(RemovalRequest::AlreadyPending);
        }

        info!("Requesting stop of user {id} before removal");
        let reply = self.stop_reply(id);
        if let Err(e) = self.collaborators().lifecycle.request_stop(id, reply) {
            state.pending_removals.remove(&id);
            warn!("Failed to request stop of user {id}: {e}");
            return Err(RegistryError::Transport(e.0));
        }

        Ok(RemovalRequest::Accepted)
    }

    /// Ids whose removal is waiting for a stop confirmation.
    pub fn pending_removals(&self) -> Vec<UserId> {
        self.lock_state().pending_removals.iter().copied().collect()
    }

    /// Apply one answer from the lifecycle service.
    ///
    /// Returns whether the event changed anything. Events for identities
    /// with no pending removal are logged and ignored.
    pub fn handle_stop_event(&self, event: StopEvent) -> bool {
        match event {
            StopEvent::Stopped(id) => self.finish_removal(id),
            StopEvent::Aborted(id) => self.abort_removal(id),
        }
    }

    fn finish_removal(&self, id: UserId) -> bool {
        {
            let mut locked = self.lock_both();
            if !locked.state.pending_removals.remove(&id) {
                warn!("Ignoring stop confirmation for user {id}: no removal pending");
                return false;
            }

            if let Err(e) = self
                .collaborators()
                .installer
                .cleanup(locked.install.token(), id)
            {
                warn!("Failed to clean up storage of user {id}: {e}");
            }

            let state = &mut *locked.state;
            state.users.remove(&id);
            self.publish_snapshot(state);
            self.store().delete_record(id);
            self.persist_index(state);
            self.store().remove_user_tree(id);

            info!("Removed user {id}");
        }

        self.publish(UserEventKind::Removed, id);
        true
    }

    fn abort_removal(&self, id: UserId) -> bool {
        let mut state = self.lock_state();
        if state.pending_removals.remove(&id) {
            info!("Removal of user {id} aborted, user stays active");
            true
        } else {
            warn!("Ignoring stop abort for user {id}: no removal pending");
            false
        }
    }
}
