//! Track id generation (spec §3 `TrackId`, §4.5 step "new track").
//!
//! One generator per tracking scope: a single IOU run (C5) or a single
//! frame group (C6). Never shared across groups — ids are only unique
//! within their owning scope, per spec GLOSSARY "TrackId".

use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::TrackId;

#[derive(Debug, Default)]
pub struct TrackIdGenerator {
    next: AtomicU64,
}

impl TrackIdGenerator {
    pub fn new() -> Self {
        TrackIdGenerator {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TrackId {
        TrackId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential_and_start_at_one() {
        let gen = TrackIdGenerator::new();
        assert_eq!(gen.next_id(), TrackId(1));
        assert_eq!(gen.next_id(), TrackId(2));
        assert_eq!(gen.next_id(), TrackId(3));
    }
}
