//! Id and serial number allocation.
//!
//! Ids are recycled: [`IdAllocator::next_id`] returns the lowest free id at
//! or above the floor, so an id freed by removal is handed out again. Serial
//! numbers are never recycled; the counter only moves forward and is
//! persisted with the index.

use crate::{SerialNumber, UserId};

/// Allocator for identity ids and serial numbers.
///
/// The serial counter is wider than [`SerialNumber`] so that it can sit one
/// past `SerialNumber::MAX` once every serial has been handed out.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    /// Lowest id returned by `next_id`.
    floor: UserId,
    /// Serial number handed out next.
    next_serial: u64,
}

impl IdAllocator {
    /// Create an allocator with the given id floor and serial counter.
    pub const fn new(floor: UserId, next_serial: u64) -> Self {
        Self { floor, next_serial }
    }

    /// Lowest id this allocator hands out.
    pub const fn floor(&self) -> UserId {
        self.floor
    }

    /// Current counter value, as persisted with the index.
    pub const fn peek_serial(&self) -> u64 {
        self.next_serial
    }

    /// Whether every serial number has been handed out.
    pub fn is_exhausted(&self) -> bool {
        SerialNumber::try_from(self.next_serial).is_err()
    }

    /// Return the first id at or above the floor for which `in_use` is false.
    ///
    /// Returns `None` only when every id up to `UserId::MAX` is taken.
    pub fn next_id(&self, in_use: impl Fn(UserId) -> bool) -> Option<UserId> {
        (self.floor..=UserId::MAX).find(|&id| !in_use(id))
    }

    /// Hand out the current serial number and advance the counter.
    ///
    /// Returns `None` once `SerialNumber::MAX` has been handed out.
    pub fn next_serial(&mut self) -> Option<SerialNumber> {
        let serial = SerialNumber::try_from(self.next_serial).ok()?;
        self.next_serial = u64::from(serial) + 1;
        Some(serial)
    }

    /// Raise the counter past a serial number seen on disk.
    pub fn observe(&mut self, serial: SerialNumber) {
        self.next_serial = self.next_serial.max(u64::from(serial) + 1);
    }
}
