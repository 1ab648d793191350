use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::cache::PieceCache;
use crate::layout::PieceLayout;
use crate::picker::Picker;

use super::error::StorageError;

/// Block granularity for v2 hashing (16 KiB).
const HASH_BLOCK_SIZE: usize = 16384;

/// Stable identity of a torrent inside a [`MemoryDiskIo`]. Indices freed
/// by [`MemoryDiskIo::remove_torrent`] are reused for later torrents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageIndex(usize);

impl StorageIndex {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Lookbehind telemetry for one storage index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageLookbehind {
    /// Protected pieces that are actually resident.
    pub available: usize,
    /// Pieces marked for protection, resident or not.
    pub protected: usize,
    /// Bytes of resident lookbehind data.
    pub memory_used: u64,
}

struct SlotTable {
    entries: Vec<Option<Arc<PieceCache>>>,
    free: Vec<usize>,
}

/// Session-wide disk interface backed entirely by memory.
///
/// Hosts that route all torrents through a single async disk layer get
/// one [`PieceCache`] per torrent here, addressed by a stable
/// [`StorageIndex`]. Reads, writes, hashing and clears complete
/// immediately; moving storage is rejected, since there is no disk to
/// move.
pub struct MemoryDiskIo {
    torrents: RwLock<SlotTable>,
    by_id: DashMap<String, StorageIndex>,
    /// Capacity applied to each newly added torrent; zero is unbounded.
    capacity: u64,
}

impl MemoryDiskIo {
    pub fn new(capacity: u64) -> Self {
        tracing::debug!(capacity, "memory disk interface created");
        Self {
            torrents: RwLock::new(SlotTable {
                entries: Vec::new(),
                free: Vec::new(),
            }),
            by_id: DashMap::new(),
            capacity,
        }
    }

    /// Registers a torrent and returns its storage index. `id` is the
    /// torrent's info-hash (hex) for reverse lookup.
    pub fn add_torrent(&self, id: impl Into<String>, layout: PieceLayout) -> StorageIndex {
        let cache = PieceCache::new(layout, self.capacity);
        let mut table = self.torrents.write();
        let raw = match table.free.pop() {
            Some(raw) => {
                table.entries[raw] = Some(cache);
                raw
            }
            None => {
                table.entries.push(Some(cache));
                table.entries.len() - 1
            }
        };
        let index = StorageIndex(raw);
        self.by_id.insert(id.into(), index);
        tracing::debug!(index = raw, "torrent added to memory disk");
        index
    }

    /// Drops a torrent's buffers and recycles its index.
    pub fn remove_torrent(&self, index: StorageIndex) {
        let mut guard = self.torrents.write();
        let table = &mut *guard;
        if let Some(entry) = table.entries.get_mut(index.0) {
            if entry.take().is_some() {
                table.free.push(index.0);
                tracing::debug!(index = index.0, "torrent removed from memory disk");
            }
        }
        drop(guard);
        self.by_id.retain(|_, v| *v != index);
    }

    /// Storage index registered under `id`, if any.
    pub fn lookup(&self, id: &str) -> Option<StorageIndex> {
        self.by_id.get(id).map(|entry| *entry)
    }

    /// The cache behind `index`, for protection updates and telemetry.
    pub fn cache(&self, index: StorageIndex) -> Result<Arc<PieceCache>, StorageError> {
        self.torrents
            .read()
            .entries
            .get(index.0)
            .and_then(|entry| entry.clone())
            .ok_or(StorageError::TorrentNotFound(index.0))
    }

    /// Binds the engine's picker for one torrent.
    pub fn bind_picker(
        &self,
        index: StorageIndex,
        picker: Arc<dyn Picker>,
    ) -> Result<(), StorageError> {
        self.cache(index)?.bind_picker(picker);
        Ok(())
    }

    /// Reads up to `len` bytes of `piece` starting at `offset`.
    pub async fn read(
        &self,
        index: StorageIndex,
        piece: usize,
        offset: usize,
        len: usize,
    ) -> Result<Bytes, StorageError> {
        let cache = self.cache(index)?;
        check_piece(&cache, piece)?;
        if !cache.is_piece_resident(piece) {
            return Err(StorageError::PieceNotResident(piece));
        }
        let mut data = vec![0u8; len];
        let n = cache.readv(&mut [&mut data[..]], piece, offset);
        if n == 0 && len > 0 {
            return Err(StorageError::PieceNotResident(piece));
        }
        data.truncate(n);
        Ok(Bytes::from(data))
    }

    /// Writes a block into `piece`. `Ok(0)` means the cache refused the
    /// write and the piece was handed back to the picker.
    pub async fn write(
        &self,
        index: StorageIndex,
        piece: usize,
        offset: usize,
        data: &[u8],
    ) -> Result<usize, StorageError> {
        let cache = self.cache(index)?;
        check_piece(&cache, piece)?;
        Ok(cache.write(data, piece, offset))
    }

    /// SHA-1 hash of a fully resident piece, for v1 verification.
    pub async fn hash(
        &self,
        index: StorageIndex,
        piece: usize,
    ) -> Result<[u8; 20], StorageError> {
        let cache = self.cache(index)?;
        let size = check_piece(&cache, piece)?;
        tokio::task::spawn_blocking(move || {
            let mut data = vec![0u8; size];
            if cache.readv(&mut [&mut data[..]], piece, 0) < size {
                return Err(StorageError::PieceNotResident(piece));
            }
            let mut hasher = Sha1::new();
            hasher.update(&data);
            Ok(hasher.finalize().into())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    /// SHA-256 hash of the 16 KiB block at `offset`, for v2 torrents.
    pub async fn hash2(
        &self,
        index: StorageIndex,
        piece: usize,
        offset: usize,
    ) -> Result<[u8; 32], StorageError> {
        let cache = self.cache(index)?;
        let size = check_piece(&cache, piece)?;
        if offset >= size {
            return Err(StorageError::PieceNotResident(piece));
        }
        let len = HASH_BLOCK_SIZE.min(size - offset);
        tokio::task::spawn_blocking(move || {
            let mut data = vec![0u8; len];
            if cache.readv(&mut [&mut data[..]], piece, offset) < len {
                return Err(StorageError::PieceNotResident(piece));
            }
            let mut hasher = Sha256::new();
            hasher.update(&data);
            Ok(hasher.finalize().into())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    /// Evicts `piece`, handing it back to the picker.
    pub async fn clear_piece(
        &self,
        index: StorageIndex,
        piece: usize,
    ) -> Result<(), StorageError> {
        self.cache(index)?.clear_piece(piece);
        Ok(())
    }

    /// Drops every buffered piece of a torrent without restore feedback.
    pub async fn release(&self, index: StorageIndex) -> Result<(), StorageError> {
        self.cache(index)?.release();
        Ok(())
    }

    /// Memory storage cannot be moved to a path.
    pub async fn move_storage(
        &self,
        index: StorageIndex,
        _save_path: &str,
    ) -> Result<(), StorageError> {
        self.cache(index)?;
        Err(StorageError::NotSupported)
    }

    // ------------------------------------------------------------------
    // Lookbehind pass-throughs
    // ------------------------------------------------------------------

    pub fn set_lookbehind_pieces(
        &self,
        index: StorageIndex,
        pieces: &[usize],
    ) -> Result<(), StorageError> {
        self.cache(index)?.set_lookbehind_pieces(pieces);
        Ok(())
    }

    pub fn clear_lookbehind(&self, index: StorageIndex) -> Result<(), StorageError> {
        self.cache(index)?.clear_lookbehind();
        Ok(())
    }

    pub fn is_lookbehind_available(
        &self,
        index: StorageIndex,
        piece: usize,
    ) -> Result<bool, StorageError> {
        Ok(self.cache(index)?.is_lookbehind_available(piece))
    }

    pub fn lookbehind_stats(
        &self,
        index: StorageIndex,
    ) -> Result<StorageLookbehind, StorageError> {
        let cache = self.cache(index)?;
        Ok(StorageLookbehind {
            available: cache.lookbehind_available_count(),
            protected: cache.lookbehind_protected_count(),
            memory_used: cache.lookbehind_memory_used(),
        })
    }
}

/// Validates the piece index and returns its configured size.
fn check_piece(cache: &PieceCache, piece: usize) -> Result<usize, StorageError> {
    if piece >= cache.layout().piece_count() {
        return Err(StorageError::InvalidPieceIndex(piece));
    }
    Ok(cache.layout().piece_size(piece))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_with_torrent() -> (MemoryDiskIo, StorageIndex) {
        let disk = MemoryDiskIo::new(64);
        let index = disk.add_torrent("abcd", PieceLayout::new(4, 16));
        (disk, index)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (disk, index) = disk_with_torrent();
        assert_eq!(disk.write(index, 0, 0, &[1, 2, 3, 4]).await.unwrap(), 4);
        let data = disk.read(index, 0, 0, 4).await.unwrap();
        assert_eq!(data.as_ref(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_read_miss() {
        let (disk, index) = disk_with_torrent();
        assert!(matches!(
            disk.read(index, 1, 0, 4).await,
            Err(StorageError::PieceNotResident(1))
        ));
    }

    #[tokio::test]
    async fn test_invalid_piece_index() {
        let (disk, index) = disk_with_torrent();
        assert!(matches!(
            disk.write(index, 99, 0, &[1]).await,
            Err(StorageError::InvalidPieceIndex(99))
        ));
    }

    #[tokio::test]
    async fn test_piece_hash() {
        let (disk, index) = disk_with_torrent();
        disk.write(index, 0, 0, &[1, 2, 3, 4]).await.unwrap();

        let expected: [u8; 20] = {
            let mut hasher = Sha1::new();
            hasher.update([1, 2, 3, 4]);
            hasher.finalize().into()
        };
        assert_eq!(disk.hash(index, 0).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_hash_requires_complete_piece() {
        let (disk, index) = disk_with_torrent();
        disk.write(index, 0, 0, &[1, 2]).await.unwrap();
        assert!(matches!(
            disk.hash(index, 0).await,
            Err(StorageError::PieceNotResident(0))
        ));
    }

    #[tokio::test]
    async fn test_block_hash() {
        let (disk, index) = disk_with_torrent();
        disk.write(index, 0, 0, &[9, 9, 9, 9]).await.unwrap();

        let expected: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update([9, 9, 9, 9]);
            hasher.finalize().into()
        };
        assert_eq!(disk.hash2(index, 0, 0).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_move_storage_not_supported() {
        let (disk, index) = disk_with_torrent();
        assert!(matches!(
            disk.move_storage(index, "/somewhere").await,
            Err(StorageError::NotSupported)
        ));
    }

    #[tokio::test]
    async fn test_clear_piece_drops_data() {
        let (disk, index) = disk_with_torrent();
        disk.write(index, 0, 0, &[1, 2, 3, 4]).await.unwrap();
        disk.clear_piece(index, 0).await.unwrap();
        assert!(disk.read(index, 0, 0, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_release_drops_all_pieces() {
        let (disk, index) = disk_with_torrent();
        disk.write(index, 0, 0, &[1, 2, 3, 4]).await.unwrap();
        disk.write(index, 1, 0, &[5, 6, 7, 8]).await.unwrap();
        disk.release(index).await.unwrap();
        assert!(disk.read(index, 0, 0, 4).await.is_err());
        assert!(disk.read(index, 1, 0, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_removed_torrent_reports_not_found() {
        let (disk, index) = disk_with_torrent();
        disk.remove_torrent(index);
        assert!(matches!(
            disk.read(index, 0, 0, 4).await,
            Err(StorageError::TorrentNotFound(0))
        ));
        assert_eq!(disk.lookup("abcd"), None);
    }

    #[tokio::test]
    async fn test_indices_are_recycled() {
        let disk = MemoryDiskIo::new(64);
        let a = disk.add_torrent("a", PieceLayout::new(4, 16));
        let b = disk.add_torrent("b", PieceLayout::new(4, 16));
        assert_eq!(a.as_usize(), 0);
        assert_eq!(b.as_usize(), 1);

        disk.remove_torrent(a);
        let c = disk.add_torrent("c", PieceLayout::new(4, 16));
        assert_eq!(c.as_usize(), 0);
        assert_eq!(disk.lookup("c"), Some(c));
    }

    #[tokio::test]
    async fn test_lookbehind_stats_passthrough() {
        let (disk, index) = disk_with_torrent();
        disk.set_lookbehind_pieces(index, &[0, 1]).unwrap();
        disk.write(index, 0, 0, &[1, 2, 3, 4]).await.unwrap();

        let stats = disk.lookbehind_stats(index).unwrap();
        assert_eq!(stats.protected, 2);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.memory_used, 4);
        assert!(disk.is_lookbehind_available(index, 0).unwrap());
        assert!(!disk.is_lookbehind_available(index, 1).unwrap());

        disk.clear_lookbehind(index).unwrap();
        assert_eq!(disk.lookbehind_stats(index).unwrap().protected, 0);
    }
}
