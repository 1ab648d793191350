//! Playback-position-driven lookbehind protection.
//!
//! Keeps the pieces just behind the player's position resident so
//! backward seeks land in memory instead of triggering a re-download.
//! The window is sized from the media bitrate ("N seconds of rewind"),
//! capped by the cache memory budget, and slides forward as the
//! application reports playback positions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::PieceCache;
use crate::config::{CacheConfig, MIN_LOOKBEHIND_SIZE};

/// Position updates arriving closer together than this are ignored.
const UPDATE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Maintains the lookbehind window for one file being streamed.
pub struct LookbehindManager {
    cache: Arc<PieceCache>,
    /// Window size in bytes behind the current position.
    window_bytes: u64,
    time_secs: u64,
    piece_length: u64,
    piece_count: usize,
    /// Byte offset of the streamed file inside the torrent payload.
    file_offset: u64,
    state: Mutex<PositionState>,
}

struct PositionState {
    current_byte_pos: u64,
    last_update: Option<Instant>,
    protected: Vec<usize>,
}

/// Snapshot of the lookbehind window for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbehindStats {
    /// Window size the manager aims for.
    pub configured_bytes: u64,
    /// Bytes of protected data actually resident.
    pub resident_bytes: u64,
    /// Pieces currently marked for protection.
    pub protected_pieces: usize,
    /// Protected pieces that are resident.
    pub available_pieces: usize,
    /// Seconds of playback the window was sized for.
    pub time_secs: u64,
    /// Piece under the last reported playback position.
    pub current_piece: usize,
}

impl LookbehindManager {
    /// Creates a manager for a file of `file_size` bytes starting at
    /// `file_offset` within the torrent. `duration_secs` is the media
    /// duration used to derive the bitrate; zero if unknown. Returns
    /// `None` when the lookbehind is disabled by configuration.
    pub fn new(
        config: &CacheConfig,
        cache: Arc<PieceCache>,
        file_size: u64,
        file_offset: u64,
        duration_secs: f64,
    ) -> Option<Self> {
        if !config.lookbehind.enabled {
            return None;
        }

        let mut window = config.lookbehind_size(file_size, duration_secs);
        if window < MIN_LOOKBEHIND_SIZE {
            window = MIN_LOOKBEHIND_SIZE;
        }
        // Leave at least half the memory to the forward buffer.
        if config.memory_size > 0 {
            let max_allowed = config.memory_size / 2;
            if window > max_allowed {
                tracing::debug!(window = max_allowed, "lookbehind capped to half of cache memory");
                window = max_allowed;
            }
        }

        let piece_length = cache.layout().piece_length() as u64;
        let piece_count = cache.layout().piece_count();
        tracing::debug!(
            window,
            time_secs = config.lookbehind.time_secs,
            "lookbehind initialized"
        );

        Some(Self {
            cache,
            window_bytes: window,
            time_secs: config.lookbehind.time_secs,
            piece_length,
            piece_count,
            file_offset,
            state: Mutex::new(PositionState {
                current_byte_pos: 0,
                last_update: None,
                protected: Vec::new(),
            }),
        })
    }

    /// Slides the window after a playback position change. `file_byte_pos`
    /// is the position within the streamed file. Updates are debounced
    /// and skipped until the position has moved by at least one piece.
    pub fn update_position(&self, file_byte_pos: u64) {
        let mut state = self.state.lock();

        if let Some(at) = state.last_update {
            if at.elapsed() < UPDATE_DEBOUNCE {
                return;
            }
        }
        if state.current_byte_pos.abs_diff(file_byte_pos) < self.piece_length {
            return;
        }
        state.current_byte_pos = file_byte_pos;
        state.last_update = Some(Instant::now());

        let torrent_pos = self.file_offset + file_byte_pos;
        let current_piece = (torrent_pos / self.piece_length) as usize;
        let start_byte = torrent_pos
            .saturating_sub(self.window_bytes)
            .max(self.file_offset);
        let start_piece = (start_byte / self.piece_length) as usize;

        state.protected = (start_piece..current_piece)
            .filter(|&p| p < self.piece_count)
            .collect();
        self.cache.set_lookbehind_pieces(&state.protected);

        if let (Some(&first), Some(&last)) = (state.protected.first(), state.protected.last()) {
            tracing::trace!(
                first,
                last,
                count = state.protected.len(),
                "lookbehind window updated"
            );
        }
    }

    /// Whether a backward seek into `piece` would be served from memory.
    pub fn is_available(&self, piece: usize) -> bool {
        self.cache.is_lookbehind_available(piece)
    }

    /// Whether `piece` falls inside the current window, resident or not.
    pub fn is_in_window(&self, piece: usize) -> bool {
        let state = self.state.lock();
        match (state.protected.first(), state.protected.last()) {
            (Some(&first), Some(&last)) => piece >= first && piece <= last,
            _ => false,
        }
    }

    /// Number of pieces the window currently protects.
    pub fn protected_count(&self) -> usize {
        self.state.lock().protected.len()
    }

    /// Number of protected pieces actually resident.
    pub fn available_count(&self) -> usize {
        self.cache.lookbehind_available_count()
    }

    /// Drops all protection. Call when playback stops or switches files.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.protected.clear();
        state.current_byte_pos = 0;
        self.cache.clear_lookbehind();
        tracing::debug!("lookbehind cleared");
    }

    pub fn stats(&self) -> LookbehindStats {
        let state = self.state.lock();
        LookbehindStats {
            configured_bytes: self.window_bytes,
            resident_bytes: self.cache.lookbehind_memory_used(),
            protected_pieces: self.cache.lookbehind_protected_count(),
            available_pieces: self.cache.lookbehind_available_count(),
            time_secs: self.time_secs,
            current_piece: (state.current_byte_pos / self.piece_length) as usize,
        }
    }
}
