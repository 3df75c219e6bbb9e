//! Status word returned by navigation mesh operations
//!
//! Queries report their outcome as a bitfield rather than an error
//! hierarchy: exactly one of the high bits (success, failure, in-progress)
//! is set, and the low detail mask qualifies it. Partial outcomes are
//! successes with detail bits such as [`Status::PARTIAL_RESULT`] set.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Result alias for operations that fail with a [`Status`] word
pub type StatusResult<T> = std::result::Result<T, Status>;

/// Bitfield describing the outcome of a navmesh operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u32);

impl Status {
    /// Operation failed
    pub const FAILURE: Status = Status(1 << 31);
    /// Operation succeeded
    pub const SUCCESS: Status = Status(1 << 30);
    /// Operation still in progress
    pub const IN_PROGRESS: Status = Status(1 << 29);

    /// Mask covering all detail bits
    pub const DETAIL_MASK: u32 = 0x0ffffff;
    /// Input data magic number was not recognized
    pub const WRONG_MAGIC: Status = Status(1 << 0);
    /// Input data version was not recognized
    pub const WRONG_VERSION: Status = Status(1 << 1);
    /// Operation ran out of memory
    pub const OUT_OF_MEMORY: Status = Status(1 << 2);
    /// An input parameter was invalid
    pub const INVALID_PARAM: Status = Status(1 << 3);
    /// Result buffer was too small to hold the full result
    pub const BUFFER_TOO_SMALL: Status = Status(1 << 4);
    /// Search ran out of nodes while expanding
    pub const OUT_OF_NODES: Status = Status(1 << 5);
    /// Search did not reach the end location; best guess returned
    pub const PARTIAL_RESULT: Status = Status(1 << 6);
    /// A tile is already loaded at the given location
    pub const ALREADY_OCCUPIED: Status = Status(1 << 7);

    /// Returns true if the success bit is set
    #[inline]
    pub fn is_success(self) -> bool {
        self.0 & Self::SUCCESS.0 != 0
    }

    /// Returns true if the failure bit is set
    #[inline]
    pub fn is_failure(self) -> bool {
        self.0 & Self::FAILURE.0 != 0
    }

    /// Returns true if the in-progress bit is set
    #[inline]
    pub fn is_in_progress(self) -> bool {
        self.0 & Self::IN_PROGRESS.0 != 0
    }

    /// Returns true if the given detail bit is set
    #[inline]
    pub fn has_detail(self, detail: Status) -> bool {
        self.0 & detail.0 & Self::DETAIL_MASK != 0
    }

    /// Returns only the detail bits
    #[inline]
    pub fn detail(self) -> Status {
        Status(self.0 & Self::DETAIL_MASK)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl BitOr for Status {
    type Output = Status;

    #[inline]
    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    #[inline]
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "success")?;
        } else if self.is_failure() {
            write!(f, "failure")?;
        } else if self.is_in_progress() {
            write!(f, "in progress")?;
        } else {
            write!(f, "unset")?;
        }

        let mut details = Vec::new();
        if self.has_detail(Self::WRONG_MAGIC) {
            details.push("wrong magic");
        }
        if self.has_detail(Self::WRONG_VERSION) {
            details.push("wrong version");
        }
        if self.has_detail(Self::OUT_OF_MEMORY) {
            details.push("out of memory");
        }
        if self.has_detail(Self::INVALID_PARAM) {
            details.push("invalid param");
        }
        if self.has_detail(Self::BUFFER_TOO_SMALL) {
            details.push("buffer too small");
        }
        if self.has_detail(Self::OUT_OF_NODES) {
            details.push("out of nodes");
        }
        if self.has_detail(Self::PARTIAL_RESULT) {
            details.push("partial result");
        }
        if self.has_detail(Self::ALREADY_OCCUPIED) {
            details.push("already occupied");
        }

        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }

        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_bits() {
        assert!(Status::SUCCESS.is_success());
        assert!(!Status::SUCCESS.is_failure());
        assert!(Status::FAILURE.is_failure());
        assert!(Status::IN_PROGRESS.is_in_progress());
        assert!(!Status::IN_PROGRESS.is_success());
    }

    #[test]
    fn test_detail_bits() {
        let s = Status::SUCCESS | Status::PARTIAL_RESULT;
        assert!(s.is_success());
        assert!(s.has_detail(Status::PARTIAL_RESULT));
        assert!(!s.has_detail(Status::BUFFER_TOO_SMALL));

        let f = Status::FAILURE | Status::INVALID_PARAM | Status::BUFFER_TOO_SMALL;
        assert!(f.is_failure());
        assert!(f.has_detail(Status::INVALID_PARAM));
        assert!(f.has_detail(Status::BUFFER_TOO_SMALL));
        assert_eq!(
            f.detail().0,
            Status::INVALID_PARAM.0 | Status::BUFFER_TOO_SMALL.0
        );
    }

    #[test]
    fn test_detail_query_ignores_high_bits() {
        // FAILURE and a detail share no bits, but has_detail must only
        // look at the low mask.
        let s = Status::FAILURE;
        assert!(!s.has_detail(Status::FAILURE));
    }
}
