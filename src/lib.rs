//! memstor - In-memory piece storage for streaming BitTorrent engines
//!
//! This library replaces on-disk storage with a bounded RAM cache for
//! engines that stream large media files: pieces arrive from peers, get
//! hash-verified and served to a local player, then make room for the
//! pieces the player has not reached yet. Eviction is LRU with layered
//! protection (reader window, application reservations, lookbehind for
//! backward seeks), and anything the cache cannot keep is handed back to
//! the engine's piece picker for a later re-download.
//!
//! # Modules
//!
//! - [`cache`] - Piece buffer pool, eviction policy and protection sets
//! - [`config`] - Memory and lookbehind configuration
//! - [`layout`] - Piece geometry of a torrent
//! - [`lookbehind`] - Playback-position-driven lookbehind window
//! - [`picker`] - Priority feedback interface to the host engine
//! - [`storage`] - Per-torrent and session-wide storage adapters

pub mod cache;
pub mod config;
pub mod layout;
pub mod lookbehind;
pub mod picker;
pub mod storage;

pub use cache::PieceCache;
pub use config::{CacheConfig, LookbehindConfig};
pub use layout::PieceLayout;
pub use lookbehind::{LookbehindManager, LookbehindStats};
pub use picker::{Picker, Priority};
pub use storage::{MemoryDiskIo, MemoryStorage, StorageError, StorageIndex, StorageLookbehind};
