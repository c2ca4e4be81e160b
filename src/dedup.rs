//! Guards against applying the same fragment twice.
//!
//! Frames that carry a backend `seq` are admitted only when the number moves
//! forward. Frames without one fall back to a substring check against the
//! target buffer, which costs O(buffer length) per append and can only tell
//! that an identical fragment is already present, not that it was delivered
//! twice.

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Skip when the fragment already appears anywhere in the buffer.
    Contained,
    /// Skip when the buffer already ends with the fragment.
    Trailing,
}

#[derive(Debug, Clone, Default)]
pub struct DeduplicationGuard {
    last_seq: Option<u64>,
    skipped: usize,
}

impl DeduplicationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a frame by sequence number. Frames without one always pass.
    pub fn admit_seq(&mut self, seq: Option<u64>) -> bool {
        let Some(seq) = seq else {
            return true;
        };
        match self.last_seq {
            Some(last) if seq <= last => {
                trace!(seq, last, "dropping replayed frame");
                self.skipped += 1;
                false
            }
            _ => {
                self.last_seq = Some(seq);
                true
            }
        }
    }

    /// Returns whether `fragment` should be appended to `buffer`.
    pub fn admit(&mut self, buffer: &str, fragment: &str, policy: DedupPolicy) -> bool {
        if fragment.is_empty() {
            return false;
        }
        let duplicate = match policy {
            DedupPolicy::Contained => buffer.contains(fragment),
            DedupPolicy::Trailing => buffer.ends_with(fragment),
        };
        if duplicate {
            trace!(?policy, len = fragment.len(), "dropping duplicate fragment");
            self.skipped += 1;
        }
        !duplicate
    }

    /// Forgets sequence state; a new stream numbers its frames afresh.
    pub fn reset_sequence(&mut self) {
        self.last_seq = None;
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_must_advance() {
        let mut guard = DeduplicationGuard::new();
        assert!(guard.admit_seq(Some(1)));
        assert!(guard.admit_seq(Some(2)));
        assert!(!guard.admit_seq(Some(2)));
        assert!(!guard.admit_seq(Some(1)));
        assert!(guard.admit_seq(None));
        assert!(guard.admit_seq(Some(5)));
        assert_eq!(guard.skipped(), 2);

        guard.reset_sequence();
        assert!(guard.admit_seq(Some(1)));
    }

    #[test]
    fn contained_policy_matches_anywhere() {
        let mut guard = DeduplicationGuard::new();
        let buffer = "intro\n```sql\nSELECT 1\n```\nmore";
        assert!(!guard.admit(buffer, "```sql\nSELECT 1\n```", DedupPolicy::Contained));
        assert!(guard.admit(buffer, "```sql\nSELECT 2\n```", DedupPolicy::Contained));
    }

    #[test]
    fn trailing_policy_only_matches_suffix() {
        let mut guard = DeduplicationGuard::new();
        assert!(guard.admit("ok\n\nblock\n\ntail", "\n\nblock", DedupPolicy::Trailing));
        assert!(!guard.admit("ok\n\nblock", "\n\nblock", DedupPolicy::Trailing));
    }

    #[test]
    fn empty_fragments_are_never_appended() {
        let mut guard = DeduplicationGuard::new();
        assert!(!guard.admit("anything", "", DedupPolicy::Trailing));
    }
}
