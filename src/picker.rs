//! Download-priority feedback to the host engine.
//!
//! The cache cannot keep every piece resident. When it evicts a piece or
//! refuses to buffer one, it has to hand the piece back to the engine's
//! piece picker so the engine stops counting it as owned and may
//! re-request it later. This module defines that capability surface.

/// Piece download priority as understood by the host engine.
///
/// The numeric values match the host library's priority scale: 0 disables
/// downloading, 7 is the front of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// The piece must not be requested from peers.
    DontDownload = 0,
    /// Background priority.
    Low = 1,
    /// Normal download priority.
    Default = 4,
    /// Front of the request queue.
    Top = 7,
}

/// The slice of the engine's piece picker the cache depends on.
///
/// Restoring a piece calls [`reset_deadline`], [`set_priority`] with
/// [`Priority::DontDownload`] and [`mark_not_have`], in that order; the
/// three together return the engine to a state where the piece is no
/// longer accounted for but may be re-requested once its priority is
/// raised again.
///
/// Implementations must not call back into the cache: the cache may
/// invoke the picker while holding its pool lock.
///
/// [`reset_deadline`]: Picker::reset_deadline
/// [`set_priority`]: Picker::set_priority
/// [`mark_not_have`]: Picker::mark_not_have
pub trait Picker: Send + Sync {
    /// Drops any streaming deadline attached to `piece`.
    fn reset_deadline(&self, piece: usize);

    /// Sets the download priority of `piece`.
    fn set_priority(&self, piece: usize, priority: Priority);

    /// Tells the engine it no longer owns `piece`.
    fn mark_not_have(&self, piece: usize);

    /// Current download priority of `piece`.
    fn priority(&self, piece: usize) -> Priority;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::{Picker, Priority};

    /// Records every picker call and serves priorities from a table, so
    /// tests can assert on the restore feedback loop.
    #[derive(Default)]
    pub(crate) struct RecordingPicker {
        pub(crate) deadline_resets: Mutex<Vec<usize>>,
        pub(crate) not_have: Mutex<Vec<usize>>,
        pub(crate) priorities: Mutex<HashMap<usize, Priority>>,
    }

    impl RecordingPicker {
        /// Pieces restored so far, in call order.
        pub(crate) fn restored(&self) -> Vec<usize> {
            self.not_have.lock().clone()
        }

        pub(crate) fn set(&self, piece: usize, priority: Priority) {
            self.priorities.lock().insert(piece, priority);
        }
    }

    impl Picker for RecordingPicker {
        fn reset_deadline(&self, piece: usize) {
            self.deadline_resets.lock().push(piece);
        }

        fn set_priority(&self, piece: usize, priority: Priority) {
            self.priorities.lock().insert(piece, priority);
        }

        fn mark_not_have(&self, piece: usize) {
            self.not_have.lock().push(piece);
        }

        fn priority(&self, piece: usize) -> Priority {
            self.priorities
                .lock()
                .get(&piece)
                .copied()
                .unwrap_or(Priority::Default)
        }
    }
}
