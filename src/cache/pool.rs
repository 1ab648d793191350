use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::layout::PieceLayout;

/// Per-piece bookkeeping. Pieces link to buffer slots by index, never by
/// pointer, so the slot vector can grow without invalidating anything.
#[derive(Debug)]
pub(crate) struct PieceState {
    /// Configured length of this piece; the last piece may be shorter.
    pub(crate) length: usize,
    /// Bytes written so far. Grows until completion, reset on eviction.
    pub(crate) size: usize,
    /// Index of the assigned buffer slot.
    pub(crate) slot: Option<usize>,
    /// All `length` bytes have been written.
    pub(crate) completed: bool,
    /// A reader consumed the last byte of a completed piece.
    pub(crate) read: bool,
}

impl PieceState {
    fn new(length: usize) -> Self {
        Self {
            length,
            size: 0,
            slot: None,
            completed: false,
            read: false,
        }
    }

    pub(crate) fn is_buffered(&self) -> bool {
        self.slot.is_some()
    }

    pub(crate) fn reset(&mut self) {
        self.slot = None;
        self.completed = false;
        self.read = false;
        self.size = 0;
    }
}

/// One pooled buffer of `piece_length` bytes.
///
/// The byte storage sits behind its own lock so the actual copy can run
/// outside the pool lock while the slot is pinned by `in_use`. Lock order
/// is always pool first, then slot storage, never the reverse.
pub(crate) struct Slot {
    pub(crate) bytes: Arc<Mutex<BytesMut>>,
    /// Piece currently assigned to this slot.
    pub(crate) piece: Option<usize>,
    pub(crate) in_use: bool,
    pub(crate) last_access: Instant,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(zeroed(capacity))),
            piece: None,
            in_use: false,
            last_access: Instant::now(),
        }
    }
}

fn zeroed(len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(len);
    buf.resize(len, 0);
    buf
}

/// Number of buffer slots a capacity of `capacity` bytes warrants.
///
/// Two slots above the strict quotient absorb the transient overlap
/// between a freshly allocated write target and the victim being evicted
/// for it. A capacity of zero means unbounded: one slot per piece.
pub(crate) fn slot_quota(capacity: u64, piece_length: usize, piece_count: usize) -> usize {
    if capacity == 0 {
        return piece_count;
    }
    let quotient = capacity.div_ceil(piece_length as u64) as usize;
    (quotient + 2).min(piece_count)
}

/// Slot-table state guarded by the cache's pool lock: the piece table,
/// the buffer slots and the usage counters the evictor works against.
pub(crate) struct Pool {
    pub(crate) pieces: Vec<PieceState>,
    pub(crate) slots: Vec<Slot>,
    /// Configured capacity in bytes; zero means unbounded.
    pub(crate) capacity: u64,
    /// Eviction quota. Starts at the slot count and is reduced by one for
    /// every resident piece under reservation or lookbehind protection.
    pub(crate) buffer_limit: usize,
    /// In-use slots whose piece is not protected.
    pub(crate) buffer_used: usize,
    piece_length: usize,
}

impl Pool {
    pub(crate) fn new(layout: &PieceLayout, capacity: u64) -> Self {
        let piece_count = layout.piece_count();
        let piece_length = layout.piece_length();
        let pieces = (0..piece_count)
            .map(|i| PieceState::new(layout.piece_size(i)))
            .collect();
        let slot_count = slot_quota(capacity, piece_length, piece_count);
        let slots = (0..slot_count).map(|_| Slot::new(piece_length)).collect();
        Self {
            pieces,
            slots,
            capacity,
            buffer_limit: slot_count,
            buffer_used: 0,
            piece_length,
        }
    }

    /// First unused slot in index order.
    pub(crate) fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.in_use)
    }

    /// Grows the pool for a raised capacity and recomputes the quota,
    /// re-subtracting the burden of currently resident protected pieces.
    /// Returns the number of appended slots; zero when the raise does not
    /// warrant more buffers.
    pub(crate) fn grow(&mut self, capacity: u64, protected_residents: usize) -> usize {
        self.capacity = capacity;
        let target = slot_quota(capacity, self.piece_length, self.pieces.len());
        if target <= self.slots.len() {
            return 0;
        }
        let appended = target - self.slots.len();
        for _ in 0..appended {
            self.slots.push(Slot::new(self.piece_length));
        }
        self.buffer_limit = target.saturating_sub(protected_residents);
        appended
    }
}
