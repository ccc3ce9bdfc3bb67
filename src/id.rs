use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique identifier for one pipe, stable for the connection's lifetime.
///
/// Pipe identity is the key the bus relay uses to exclude a message's
/// arrival pipe when forwarding, so identifiers are never reused within a
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipeId(u64);

impl PipeId {
    /// Draws the next process-unique identifier.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Gets the underlying ID number.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<PipeId> for u64 {
    fn from(id: PipeId) -> Self {
        id.0
    }
}

impl Display for PipeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = PipeId::next();
        let b = PipeId::next();
        assert_ne!(a, b);
        assert!(b.into_inner() > a.into_inner());
    }
}
