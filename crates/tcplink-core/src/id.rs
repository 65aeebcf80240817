//! Link identifiers

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Port-unique identity of a link, stable across pool reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Monotonic id source, one per port
#[derive(Debug)]
pub struct LinkIdGen(AtomicU64);

impl Default for LinkIdGen {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkIdGen {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> LinkId {
        LinkId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let ids = LinkIdGen::new();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "link-1");
    }
}
