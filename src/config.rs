//! Cache and lookbehind configuration.
//!
//! The daemon threads these values through to each torrent's cache; the
//! lookbehind window is sized from the media bitrate so "N seconds of
//! rewind" translates into bytes.

/// Default cache memory per torrent.
pub const DEFAULT_MEMORY_SIZE: u64 = 256 * 1024 * 1024;

/// Default forward (read-ahead) buffer.
pub const DEFAULT_BUFFER_SIZE: u64 = 20 * 1024 * 1024;

/// Default buffer kept for the end of the file (seeks to credits).
pub const DEFAULT_END_BUFFER_SIZE: u64 = 4 * 1024 * 1024;

/// Default seconds of playback the lookbehind should cover.
pub const DEFAULT_LOOKBEHIND_TIME_SECS: u64 = 30;

/// Default upper bound on the lookbehind window.
pub const DEFAULT_LOOKBEHIND_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// Memory kept aside for engine internals when sizing the lookbehind.
pub const MEMORY_OVERHEAD: u64 = 8 * 1024 * 1024;

/// Below this a lookbehind window stops being useful.
pub const MIN_LOOKBEHIND_SIZE: u64 = 10 * 1024 * 1024;

/// Assumed bitrate when the media duration is unknown (typical 1080p).
pub const FALLBACK_BITRATE: u64 = 2500 * 1024;

/// Lookbehind buffer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookbehindConfig {
    pub enabled: bool,
    /// Seconds of playback to keep behind the reader.
    pub time_secs: u64,
    /// Hard cap on the window in bytes.
    pub max_size: u64,
    /// Recompute the window when playback conditions change.
    pub auto_adjust: bool,
}

impl Default for LookbehindConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time_secs: DEFAULT_LOOKBEHIND_TIME_SECS,
            max_size: DEFAULT_LOOKBEHIND_MAX_SIZE,
            auto_adjust: true,
        }
    }
}

/// Memory settings for one torrent's cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Total cache memory in bytes; zero means unbounded.
    pub memory_size: u64,
    /// Forward buffer ahead of the reader.
    pub buffer_size: u64,
    /// Buffer held at the end of the file.
    pub end_buffer_size: u64,
    pub lookbehind: LookbehindConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            end_buffer_size: DEFAULT_END_BUFFER_SIZE,
            lookbehind: LookbehindConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Caps the lookbehind at what the memory budget actually leaves
    /// after the forward and end buffers, never more than half the total
    /// memory, and disables it outright when the remainder is too small
    /// to matter.
    pub fn enforce_lookbehind_constraints(&mut self) {
        if !self.lookbehind.enabled {
            return;
        }

        let reserved = self.buffer_size + self.end_buffer_size + MEMORY_OVERHEAD;
        let mut available = self.memory_size.saturating_sub(reserved);
        let max_allowed = self.memory_size / 2;
        if available > max_allowed {
            available = max_allowed;
        }

        if self.lookbehind.max_size > available {
            tracing::warn!(
                requested = self.lookbehind.max_size,
                available,
                "lookbehind size exceeds available memory, capping"
            );
            self.lookbehind.max_size = available;
        }

        if self.lookbehind.max_size < MIN_LOOKBEHIND_SIZE {
            tracing::warn!("insufficient memory for lookbehind, disabling");
            self.lookbehind.enabled = false;
        }
    }

    /// Window size covering `time_secs` of playback at the media's real
    /// bitrate, capped at the configured maximum. Duration zero falls
    /// back to a typical 1080p bitrate.
    pub fn lookbehind_size(&self, file_size: u64, duration_secs: f64) -> u64 {
        if !self.lookbehind.enabled || self.lookbehind.time_secs == 0 {
            return 0;
        }

        let bitrate = if duration_secs > 0.0 {
            (file_size as f64 / duration_secs) as u64
        } else {
            FALLBACK_BITRATE
        };

        (bitrate * self.lookbehind.time_secs).min(self.lookbehind.max_size)
    }
}
