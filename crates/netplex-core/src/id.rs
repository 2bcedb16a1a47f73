//! Handle and timer identifier types
//!
//! Both are 32-bit arena indices. The reactor's handle table and the
//! timing wheel's timer table are flat arrays; ids index into them, and
//! list linkage is expressed in ids rather than pointers. The maximum
//! value (u32::MAX) is reserved as a sentinel for "none".

use core::fmt;

/// Identifier of a registered readiness handle
///
/// Indexes the owning reactor's slot table. Ids are only meaningful on
/// the reactor that issued them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HandleId(u32);

impl HandleId {
    /// Sentinel value indicating no handle
    pub const NONE: HandleId = HandleId(u32::MAX);

    /// Create a new HandleId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        HandleId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Check if this is a valid handle id
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }
}

impl From<u32> for HandleId {
    #[inline]
    fn from(id: u32) -> Self {
        HandleId(id)
    }
}

impl From<HandleId> for u32 {
    #[inline]
    fn from(id: HandleId) -> Self {
        id.0
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "HandleId(NONE)")
        } else {
            write!(f, "HandleId({})", self.0)
        }
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for HandleId {
    fn default() -> Self {
        HandleId::NONE
    }
}

/// Identifier of a timer in the timing wheel's arena
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TimerId(u32);

impl TimerId {
    /// Sentinel value indicating no timer
    pub const NONE: TimerId = TimerId(u32::MAX);

    #[inline]
    pub const fn new(id: u32) -> Self {
        TimerId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TimerId(NONE)")
        } else {
            write!(f, "TimerId({})", self.0)
        }
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for TimerId {
    fn default() -> Self {
        TimerId::NONE
    }
}
