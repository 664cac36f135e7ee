//! Durable multi-identity registry.
//!
//! This crate keeps an in-memory index of identity records ("users") backed
//! by crash-consistent files on disk. The architecture has four layers:
//!
//! - **Record store** ([`store`]): one XML-like file per identity plus one
//!   index file, each replaced atomically (temp file, fsync, rename)
//! - **Allocator** ([`allocator`]): recycled ids and never-reused serials
//! - **Registry** ([`registry`]): the authoritative cache, the live-id
//!   snapshot, and the lock order shared with the installer subsystem
//! - **Removal** ([`removal`]): two-phase removal that waits for the
//!   process-lifecycle service to confirm an identity has stopped
//!
//! Everything outside those layers (permission checks, package provisioning,
//! icon codecs, notifications, process lifecycle) is reached through the
//! traits in [`collaborators`].
//!
//! # Storage Layout
//!
//! ```text
//! <data_dir>/system/users/userlist.xml   index: ids + next serial number
//! <data_dir>/system/users/<id>.xml       one record per identity
//! <data_dir>/system/users/<id>/          per-identity system directory
//! <base_user_path>/<id>/                 provisioned by the installer
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use rollcall_registry::{Collaborators, RegistryConfig, UserFlags, UserRegistry};
//!
//! # fn example() -> rollcall_registry::Result<()> {
//! let registry = UserRegistry::open(RegistryConfig::new("/var/lib/rollcall"), Collaborators::default())?;
//! let guest = registry.create("Visitor", UserFlags::GUEST)?;
//! assert!(registry.exists(guest.id));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// On-disk records and index
pub mod store;

// Id and serial number allocation
pub mod allocator;

// Record types
pub mod record;

// External collaborator seams
pub mod collaborators;

// In-memory registry and lock order
pub mod registry;

// Two-phase removal
pub mod removal;

// Configuration
pub mod config;

pub use collaborators::{Collaborators, EventBus, IconImage, UserEvent, UserEventKind};
pub use config::RegistryConfig;
pub use record::{SerialNumber, UserFlags, UserId, UserRecord};
pub use registry::{InstallLock, InstallToken, UserRegistry, UserUpdate, WriteStatus};
pub use removal::{RemovalRequest, StopEvent, StopEvents, StopReply};

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The permission guard rejected the caller.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No identity with this id exists.
    #[error("User not found: {0}")]
    NotFound(UserId),

    /// The identity can never be removed.
    #[error("User {0} is protected")]
    Protected(UserId),

    /// The identity count is at capacity.
    #[error("User limit reached ({max} users)")]
    LimitReached {
        /// Configured maximum number of identities
        max: usize,
    },

    /// Every serial number has been handed out.
    #[error("Serial numbers exhausted")]
    SerialsExhausted,

    /// A guest identity already exists.
    #[error("Guest user {0} already exists")]
    GuestExists(UserId),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A collaborator could not be reached.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// On-disk content failed validation.
    #[error("Malformed record: {0}")]
    Malformed(String),

    /// Icon encoding or decoding failed.
    #[error("Icon codec error: {0}")]
    Codec(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Version information for the registry.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Users directory, relative to the data directory.
pub const USERS_DIR: &str = "system/users";

/// Index filename inside [`USERS_DIR`].
pub const USER_LIST_FILENAME: &str = "userlist.xml";

/// Icon filename inside a per-identity system directory.
pub const USER_PHOTO_FILENAME: &str = "photo.png";

/// Default parent of provisioned per-identity trees, relative to the data
/// directory.
pub const USER_DATA_DIR: &str = "user";

/// Id of the primary identity. Always present, never removable.
pub const PRIMARY_USER_ID: UserId = 0;

/// Name given to the primary identity when the store is bootstrapped.
pub const PRIMARY_USER_NAME: &str = "Primary";

/// Name given to the guest identity created by
/// [`UserRegistry::set_guest_enabled`].
pub const GUEST_USER_NAME: &str = "Guest";
