//! Identity record types.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of an identity. Recyclable after removal.
pub type UserId = u32;

/// Permanent ordinal of an identity. Never reassigned.
pub type SerialNumber = u32;

bitflags! {
    /// Identity flags, persisted as a decimal integer.
    ///
    /// Bits not named here are preserved when a record is read and written
    /// back.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct UserFlags: u32 {
        /// The primary identity (id 0).
        const PRIMARY = 0x0000_0001;
        /// Identity with administrative rights.
        const ADMIN = 0x0000_0002;
        /// Temporary guest identity. At most one exists.
        const GUEST = 0x0000_0004;
        /// Identity with restricted rights.
        const RESTRICTED = 0x0000_0008;
        /// The identity finished its first-time setup.
        const INITIALIZED = 0x0000_0010;

        const _ = !0;
    }
}

/// One managed identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable identifier
    pub id: UserId,
    /// Serial number assigned at creation
    pub serial_number: SerialNumber,
    /// Display name
    pub name: String,
    /// Flag bits
    pub flags: UserFlags,
    /// Absolute path of the stored icon, once one was written
    pub icon_path: Option<PathBuf>,
}

impl UserRecord {
    /// Create a record without an icon.
    pub fn new(
        id: UserId,
        serial_number: SerialNumber,
        name: impl Into<String>,
        flags: UserFlags,
    ) -> Self {
        Self {
            id,
            serial_number,
            name: name.into(),
            flags,
            icon_path: None,
        }
    }

    /// Check if this is the primary identity.
    pub const fn is_primary(&self) -> bool {
        self.flags.contains(UserFlags::PRIMARY)
    }

    /// Check if this identity has administrative rights.
    pub const fn is_admin(&self) -> bool {
        self.flags.contains(UserFlags::ADMIN)
    }

    /// Check if this is a guest identity.
    pub const fn is_guest(&self) -> bool {
        self.flags.contains(UserFlags::GUEST)
    }

    /// Check if this identity is restricted.
    pub const fn is_restricted(&self) -> bool {
        self.flags.contains(UserFlags::RESTRICTED)
    }

    /// Check if first-time setup has completed.
    pub const fn is_initialized(&self) -> bool {
        self.flags.contains(UserFlags::INITIALIZED)
    }
}
