/*!
 * Core Types
 * Common types shared by the handle table and event stream
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Slot index within a handle table
pub type SlotIndex = u64;

/// Generation counter distinguishing successive occupants of a slot
pub type Generation = u64;

/// Event serial number (16-bit, wraps)
pub type Serial = u16;

/// Common result type for handle table operations
pub type HandleResult<T> = Result<T, super::errors::HandleError>;

/// Opaque 64-bit object handle
///
/// Encodes a slot index in the low `size_bits` bits and a generation id in
/// the bits above it. The layout is owned by the issuing table; callers
/// treat the value as opaque. `Handle::NULL` (0) is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl Handle {
    /// The permanently invalid handle
    pub const NULL: Handle = Handle(0);

    /// Raw 64-bit value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True for the reserved invalid handle
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> u64 {
        handle.0
    }
}
