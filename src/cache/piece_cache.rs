use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use super::piece_set::PieceSet;
use super::pool::Pool;
use crate::layout::PieceLayout;
use crate::picker::{Picker, Priority};

/// Headroom on the protection bit-sets beyond the observed piece count.
const SET_PADDING: usize = 10;

/// In-memory piece store for one torrent.
///
/// Holds recently downloaded pieces in a bounded pool of fixed-length
/// buffers so the engine can hash-verify them and a streaming reader can
/// consume them without any disk underneath. Three protection layers
/// constrain eviction: the reader's forward window, application
/// reservations and a lookbehind window kept for backward seeks. Pieces
/// the cache refuses to buffer or has just discarded are handed back to
/// the engine's [`Picker`] so they can be re-requested later.
///
/// All operations are synchronous and callable from many disk-worker
/// threads at once. Two locks split the state: the pool lock covers slot
/// assignment, usage counters and eviction; the range lock serializes
/// protection-set replacement. Protection bits are readable without
/// either lock, so eviction never nests the two.
pub struct PieceCache {
    layout: PieceLayout,
    pool: Mutex<Pool>,
    /// Piece-to-slot mirror (-1 when unassigned) for the unlocked
    /// allocation fast path and lock-free residency queries.
    assigned: Vec<AtomicI32>,
    reader_pieces: PieceSet,
    reserved_pieces: PieceSet,
    lookbehind_pieces: PieceSet,
    buffer_reserved: AtomicUsize,
    /// Serializes whole-set replacement of the protection bit-sets.
    range_lock: Mutex<()>,
    picker: RwLock<Option<Weak<dyn Picker>>>,
    /// Set once a streaming reader has issued its first read; from then
    /// on writes outside the reader's wanted set are refused.
    reading: AtomicBool,
}

impl PieceCache {
    /// Creates a cache for `layout` bounded by `capacity` bytes. A
    /// capacity of zero means unbounded: every piece can stay resident.
    pub fn new(layout: PieceLayout, capacity: u64) -> Arc<Self> {
        let piece_count = layout.piece_count();
        let pool = Pool::new(&layout, capacity);
        tracing::debug!(
            capacity,
            pieces = piece_count,
            piece_length = layout.piece_length(),
            buffers = pool.slots.len(),
            "piece cache created"
        );
        let assigned = (0..piece_count).map(|_| AtomicI32::new(-1)).collect();
        Arc::new(Self {
            layout,
            pool: Mutex::new(pool),
            assigned,
            reader_pieces: PieceSet::new(piece_count + SET_PADDING),
            reserved_pieces: PieceSet::new(piece_count + SET_PADDING),
            lookbehind_pieces: PieceSet::new(piece_count + SET_PADDING),
            buffer_reserved: AtomicUsize::new(0),
            range_lock: Mutex::new(()),
            picker: RwLock::new(None),
            reading: AtomicBool::new(false),
        })
    }

    /// Piece geometry this cache was built for.
    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    /// Binds the engine's picker for restore feedback. Only a weak
    /// reference is kept: restores become no-ops once the picker drops.
    pub fn bind_picker(&self, picker: Arc<dyn Picker>) {
        *self.picker.write() = Some(Arc::downgrade(&picker));
    }

    // ------------------------------------------------------------------
    // Sizing
    // ------------------------------------------------------------------

    /// Configured capacity in bytes; zero means unbounded.
    pub fn memory_size(&self) -> u64 {
        self.pool.lock().capacity
    }

    /// Raises the capacity, appending buffer slots as warranted. The pool
    /// never shrinks: a smaller (or unbounded-to-bounded) capacity is
    /// ignored.
    pub fn set_memory_size(&self, capacity: u64) {
        let mut pool = self.pool.lock();
        if pool.capacity == 0 || capacity <= pool.capacity {
            return;
        }
        let protected_residents = pool
            .slots
            .iter()
            .filter(|slot| slot.in_use)
            .filter_map(|slot| slot.piece)
            .filter(|&pi| self.is_protected(pi))
            .count();
        let appended = pool.grow(capacity, protected_residents);
        if appended == 0 {
            tracing::debug!(buffers = pool.slots.len(), "capacity raise adds no buffers");
        } else {
            tracing::debug!(buffers = pool.slots.len(), appended, "buffer pool grown");
        }
    }

    // ------------------------------------------------------------------
    // Storage operations
    // ------------------------------------------------------------------

    /// Writes `buf` into `piece` starting at `offset`. See [`writev`].
    ///
    /// [`writev`]: PieceCache::writev
    pub fn write(&self, buf: &[u8], piece: usize, offset: usize) -> usize {
        self.writev(&[buf], piece, offset)
    }

    /// Writes the spans in `bufs` contiguously into `piece` starting at
    /// `offset`, clamped to the piece length. Returns the number of bytes
    /// copied; zero means the write was refused because no buffer could
    /// be assigned, which is not an error: the engine retries once the
    /// piece is wanted again.
    pub fn writev(&self, bufs: &[&[u8]], piece: usize, offset: usize) -> usize {
        if piece >= self.layout.piece_count() {
            return 0;
        }
        if !self.get_buffer(piece, true) {
            tracing::trace!(piece, "no write buffer");
            return 0;
        }

        // Pin the slot storage, then copy outside the pool lock.
        let (si, storage) = {
            let pool = self.pool.lock();
            match pool.pieces[piece].slot {
                Some(si) => (si, pool.slots[si].bytes.clone()),
                None => return 0,
            }
        };

        let length = self.layout.piece_size(piece);
        let start = offset.min(length);
        let mut at = start;
        {
            let mut data = storage.lock();
            for buf in bufs {
                let room = length - at;
                if room == 0 {
                    break;
                }
                let take = room.min(buf.len());
                data[at..at + take].copy_from_slice(&buf[..take]);
                at += take;
            }
        }
        let copied = at - start;

        let mut pool = self.pool.lock();
        if pool.pieces[piece].slot != Some(si) {
            // Lost the slot to an eviction mid-copy; the picker has
            // already been told to re-request the piece.
            return 0;
        }
        {
            let entry = &mut pool.pieces[piece];
            entry.size = (entry.size + copied).min(entry.length);
            if entry.size == entry.length {
                entry.completed = true;
            }
        }
        pool.slots[si].last_access = Instant::now();

        if pool.capacity > 0 && pool.buffer_used >= pool.buffer_limit {
            self.trim(&mut pool, piece);
        }
        copied
    }

    /// Reads from `piece` at `offset` into the spans of `bufs`, clamped
    /// at the piece's current size. Returns the number of bytes copied;
    /// zero means the piece is not resident (a miss) and the caller
    /// should wait for the download and re-read.
    pub fn readv(&self, bufs: &mut [&mut [u8]], piece: usize, offset: usize) -> usize {
        if piece >= self.layout.piece_count() {
            return 0;
        }
        if !self.get_buffer(piece, false) {
            return 0;
        }

        let (si, storage, size) = {
            let pool = self.pool.lock();
            match pool.pieces[piece].slot {
                Some(si) => (si, pool.slots[si].bytes.clone(), pool.pieces[piece].size),
                None => return 0,
            }
        };

        let start = offset.min(size);
        let mut at = start;
        {
            let data = storage.lock();
            for buf in bufs.iter_mut() {
                let avail = size - at;
                if avail == 0 {
                    break;
                }
                let take = avail.min(buf.len());
                buf[..take].copy_from_slice(&data[at..at + take]);
                at += take;
            }
        }
        let copied = at - start;

        let mut pool = self.pool.lock();
        if pool.pieces[piece].slot == Some(si) {
            pool.slots[si].last_access = Instant::now();
            let entry = &mut pool.pieces[piece];
            if entry.completed && offset + copied >= entry.size {
                entry.read = true;
            }
        }
        copied
    }

    /// Single-destination read used by the streaming reader.
    ///
    /// Unlike [`readv`], which reports a plain miss or short read, this
    /// path hands the piece back to the picker and fails both on a miss
    /// and on a piece that arrived only partially, so the engine
    /// re-prioritizes and re-downloads it instead of the player being
    /// served short data.
    ///
    /// [`readv`]: PieceCache::readv
    pub fn read(&self, buf: &mut [u8], piece: usize, offset: usize) -> Option<usize> {
        if piece >= self.layout.piece_count() {
            return None;
        }
        self.reading.store(true, Ordering::Relaxed);

        if !self.get_buffer(piece, false) {
            tracing::trace!(piece, offset, "reader miss");
            self.restore_piece(piece);
            return None;
        }

        let (si, storage, size) = {
            let pool = self.pool.lock();
            let Some(si) = pool.pieces[piece].slot else {
                return None;
            };
            let (size, length) = (pool.pieces[piece].size, pool.pieces[piece].length);
            if size < length {
                tracing::trace!(piece, size, length, "reader hit a partial piece");
                drop(pool);
                self.restore_piece(piece);
                return None;
            }
            (si, pool.slots[si].bytes.clone(), size)
        };

        let start = offset.min(size);
        let take = (size - start).min(buf.len());
        {
            let data = storage.lock();
            buf[..take].copy_from_slice(&data[start..start + take]);
        }

        let mut pool = self.pool.lock();
        if pool.pieces[piece].slot == Some(si) {
            pool.slots[si].last_access = Instant::now();
            let entry = &mut pool.pieces[piece];
            if entry.completed && offset + take >= entry.size {
                entry.read = true;
            }
        }
        Some(take)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Ensures `piece` has a buffer slot. Read acquisitions never
    /// allocate; write acquisitions claim the first free slot, refusing
    /// pieces the reader does not want once reader traffic has started.
    fn get_buffer(&self, piece: usize, write: bool) -> bool {
        // Fast path: already assigned, no locking.
        if self.assigned[piece].load(Ordering::Acquire) >= 0 {
            return true;
        }

        let mut pool = self.pool.lock();
        // Re-check under the lock: a parallel write may have assigned it.
        if pool.pieces[piece].is_buffered() {
            return true;
        }
        if !write {
            return false;
        }
        if self.reading.load(Ordering::Relaxed) && !self.is_readered(piece) {
            drop(pool);
            self.restore_piece(piece);
            return false;
        }

        let Some(si) = pool.find_free_slot() else {
            return false;
        };
        tracing::trace!(slot = si, piece, "assigning buffer");
        {
            let slot = &mut pool.slots[si];
            slot.in_use = true;
            slot.piece = Some(piece);
            slot.last_access = Instant::now();
        }
        pool.pieces[piece].slot = Some(si);
        self.assigned[piece].store(si as i32, Ordering::Release);

        if self.is_protected(piece) {
            // A protected resident burdens the quota instead of counting
            // toward it.
            pool.buffer_limit = pool.buffer_limit.saturating_sub(1);
        } else {
            pool.buffer_used += 1;
        }
        true
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Evicts until the quota holds again or nothing evictable remains.
    /// `caller` is the piece that triggered the trim and is never chosen.
    fn trim(&self, pool: &mut Pool, caller: usize) {
        while pool.buffer_used >= pool.buffer_limit {
            tracing::debug!(
                used = pool.buffer_used,
                limit = pool.buffer_limit,
                reserved = self.buffer_reserved.load(Ordering::Relaxed),
                "trimming buffers"
            );

            // Prefer pieces the picker no longer wants while a reader
            // window is active.
            if !self.reader_pieces.is_empty() {
                if let Some(si) = self.find_victim(pool, caller, true) {
                    tracing::debug!(slot = si, piece = ?pool.slots[si].piece, "evicting unwanted piece");
                    self.remove_piece(pool, si);
                    continue;
                }
            }

            if let Some(si) = self.find_victim(pool, caller, false) {
                tracing::debug!(slot = si, piece = ?pool.slots[si].piece, "evicting lru piece");
                self.remove_piece(pool, si);
                continue;
            }

            // Everything left is protected; stop rather than spin.
            break;
        }
    }

    /// Least-recently-accessed eligible slot. Scans in slot-index order
    /// with a strict comparison, so equal timestamps resolve to the
    /// lowest index.
    fn find_victim(&self, pool: &Pool, caller: usize, skip_readered: bool) -> Option<usize> {
        let mut victim = None;
        let mut min_access = Instant::now();
        for (si, slot) in pool.slots.iter().enumerate() {
            if !slot.in_use {
                continue;
            }
            let Some(pi) = slot.piece else {
                continue;
            };
            if pi == caller || self.is_protected(pi) {
                continue;
            }
            if skip_readered && self.is_readered(pi) {
                continue;
            }
            if slot.last_access < min_access {
                victim = Some(si);
                min_access = slot.last_access;
            }
        }
        victim
    }

    /// Releases the slot at `si`: zeroes its bytes, resets its piece and
    /// hands the piece back to the picker.
    fn remove_piece(&self, pool: &mut Pool, si: usize) {
        let piece = {
            let slot = &mut pool.slots[si];
            let piece = slot.piece.take();
            slot.in_use = false;
            slot.last_access = Instant::now();
            slot.bytes.lock().fill(0);
            piece
        };
        match piece {
            Some(pi) if self.is_protected(pi) => {
                // An explicitly cleared protected resident gives back the
                // quota it burdened at allocation.
                pool.buffer_limit += 1;
                pool.pieces[pi].reset();
                self.assigned[pi].store(-1, Ordering::Release);
                self.restore_piece(pi);
            }
            Some(pi) => {
                pool.buffer_used = pool.buffer_used.saturating_sub(1);
                pool.pieces[pi].reset();
                self.assigned[pi].store(-1, Ordering::Release);
                self.restore_piece(pi);
            }
            None => {
                pool.buffer_used = pool.buffer_used.saturating_sub(1);
            }
        }
    }

    /// Evicts `piece` if resident, handing it back to the picker.
    pub fn clear_piece(&self, piece: usize) {
        if piece >= self.layout.piece_count() {
            return;
        }
        let mut pool = self.pool.lock();
        if let Some(si) = pool.pieces[piece].slot {
            self.remove_piece(&mut pool, si);
        }
    }

    /// Drops every buffered piece without notifying the picker. Used on
    /// teardown, where the engine is discarding the torrent anyway.
    pub fn release(&self) {
        let mut pool = self.pool.lock();
        for slot in pool.slots.iter_mut() {
            if slot.in_use {
                slot.bytes.lock().fill(0);
            }
            slot.piece = None;
            slot.in_use = false;
            slot.last_access = Instant::now();
        }
        for piece in pool.pieces.iter_mut() {
            piece.reset();
        }
        pool.buffer_used = 0;
        pool.buffer_limit = pool.slots.len();
        for entry in &self.assigned {
            entry.store(-1, Ordering::Release);
        }
    }

    // ------------------------------------------------------------------
    // Restore feedback
    // ------------------------------------------------------------------

    /// Returns `piece` to the picker: deadline cleared, priority dropped
    /// to don't-download, ownership revoked. No-op without a picker.
    fn restore_piece(&self, piece: usize) {
        let picker = match self.picker.read().as_ref() {
            Some(weak) => weak.upgrade(),
            None => None,
        };
        let Some(picker) = picker else {
            return;
        };
        tracing::debug!(piece, "restoring piece to the picker");
        picker.reset_deadline(piece);
        picker.set_priority(piece, Priority::DontDownload);
        picker.mark_not_have(piece);
    }

    /// Whether the engine still wants `piece`. True when no picker is
    /// bound, so refusal never fires before the engine is wired up.
    fn is_readered(&self, piece: usize) -> bool {
        let picker = match self.picker.read().as_ref() {
            Some(weak) => weak.upgrade(),
            None => None,
        };
        match picker {
            Some(picker) => picker.priority(piece) != Priority::DontDownload,
            None => true,
        }
    }

    // ------------------------------------------------------------------
    // Protection
    // ------------------------------------------------------------------

    /// Atomically replaces the reader's forward window. Out-of-range
    /// indices are dropped.
    pub fn update_reader_pieces(&self, pieces: &[usize]) {
        let _range = self.range_lock.lock();
        let n = self.layout.piece_count();
        self.reader_pieces
            .replace_with(pieces.iter().copied().filter(|&p| p < n));
    }

    /// Atomically replaces the application-reserved set. Reserved pieces
    /// are not fetched or pinned into memory by this call; they are only
    /// shielded from eviction while resident.
    pub fn update_reserved_pieces(&self, pieces: &[usize]) {
        let _range = self.range_lock.lock();
        let n = self.layout.piece_count();
        let count = self
            .reserved_pieces
            .replace_with(pieces.iter().copied().filter(|&p| p < n));
        self.buffer_reserved.store(count, Ordering::Relaxed);
    }

    /// Atomically replaces the lookbehind set.
    pub fn set_lookbehind_pieces(&self, pieces: &[usize]) {
        let _range = self.range_lock.lock();
        let n = self.layout.piece_count();
        self.lookbehind_pieces
            .replace_with(pieces.iter().copied().filter(|&p| p < n));
    }

    /// Empties the lookbehind set.
    pub fn clear_lookbehind(&self) {
        let _range = self.range_lock.lock();
        self.lookbehind_pieces.clear();
    }

    pub fn is_reserved(&self, piece: usize) -> bool {
        self.reserved_pieces.contains(piece)
    }

    pub fn is_lookbehind_protected(&self, piece: usize) -> bool {
        self.lookbehind_pieces.contains(piece)
    }

    /// Lookbehind-protected and currently resident, meaning a backward
    /// seek into this piece will be served from memory.
    pub fn is_lookbehind_available(&self, piece: usize) -> bool {
        self.lookbehind_pieces.contains(piece)
            && piece < self.assigned.len()
            && self.assigned[piece].load(Ordering::Acquire) >= 0
    }

    /// Number of pieces currently under lookbehind protection.
    pub fn lookbehind_protected_count(&self) -> usize {
        self.lookbehind_pieces.count()
    }

    /// Number of lookbehind-protected pieces that are resident.
    pub fn lookbehind_available_count(&self) -> usize {
        (0..self.layout.piece_count())
            .filter(|&p| self.is_lookbehind_available(p))
            .count()
    }

    /// Bytes of resident lookbehind data.
    pub fn lookbehind_memory_used(&self) -> u64 {
        self.lookbehind_available_count() as u64 * self.layout.piece_length() as u64
    }

    /// Number of application-reserved pieces.
    pub fn reserved_count(&self) -> usize {
        self.buffer_reserved.load(Ordering::Relaxed)
    }

    fn is_protected(&self, piece: usize) -> bool {
        self.reserved_pieces.contains(piece) || self.lookbehind_pieces.contains(piece)
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    /// In-use slots counting toward the eviction quota.
    pub fn buffer_used(&self) -> usize {
        self.pool.lock().buffer_used
    }

    /// Current eviction quota.
    pub fn buffer_limit(&self) -> usize {
        self.pool.lock().buffer_limit
    }

    /// Slot-to-piece assignment snapshot for diagnostics.
    pub fn buffer_assignments(&self) -> Vec<(usize, Option<usize>)> {
        let pool = self.pool.lock();
        pool.slots
            .iter()
            .enumerate()
            .map(|(si, slot)| (si, slot.piece))
            .collect()
    }

    /// Whether `piece` currently has a buffer assigned.
    pub fn is_piece_resident(&self, piece: usize) -> bool {
        piece < self.assigned.len() && self.assigned[piece].load(Ordering::Acquire) >= 0
    }

    /// Whether all of `piece` has been written.
    pub fn is_piece_complete(&self, piece: usize) -> bool {
        piece < self.layout.piece_count() && self.pool.lock().pieces[piece].completed
    }

    /// Whether a reader consumed `piece` to the end.
    pub fn is_piece_read(&self, piece: usize) -> bool {
        piece < self.layout.piece_count() && self.pool.lock().pieces[piece].read
    }
}
