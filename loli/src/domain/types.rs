//! Newtype wrappers for profiler identifiers
//!
//! These keep record ids, capture sequence numbers and interned string
//! handles from being mixed up in function signatures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session-unique handle of an allocation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Agent-assigned capture-order counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Seq(pub u32);

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Stable 32-bit hash of an interned string
///
/// `StringHash(0)` is reserved for "no string".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct StringHash(pub u32);

impl StringHash {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StringHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(RecordId(7).to_string(), "#7");
        assert_eq!(Seq(42).to_string(), "seq:42");
        assert_eq!(StringHash(0xab).to_string(), "000000ab");
        assert!(StringHash::EMPTY.is_empty());
    }
}
