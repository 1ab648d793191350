use std::sync::Arc;

use crate::cache::PieceCache;
use crate::layout::PieceLayout;
use crate::picker::Picker;

use super::error::StorageError;

/// Per-torrent storage adapter over the in-memory piece cache.
///
/// Mirrors the synchronous storage interface of host libraries that keep
/// one storage object per torrent and call it from their disk workers.
/// Filesystem-shaped operations are rejected or accepted as no-ops: the
/// torrent only ever lives in RAM.
pub struct MemoryStorage {
    cache: Arc<PieceCache>,
}

impl MemoryStorage {
    /// Creates storage for one torrent, bounded by `capacity` bytes.
    pub fn new(layout: PieceLayout, capacity: u64) -> Self {
        Self {
            cache: PieceCache::new(layout, capacity),
        }
    }

    /// The underlying cache, for protection updates and telemetry.
    pub fn cache(&self) -> &Arc<PieceCache> {
        &self.cache
    }

    /// Binds the engine's picker for restore feedback.
    pub fn bind_picker(&self, picker: Arc<dyn Picker>) {
        self.cache.bind_picker(picker);
    }

    /// Vectored piece write; zero means the write was refused.
    pub fn writev(&self, bufs: &[&[u8]], piece: usize, offset: usize) -> usize {
        self.cache.writev(bufs, piece, offset)
    }

    /// Vectored piece read; zero means the piece is not resident.
    pub fn readv(&self, bufs: &mut [&mut [u8]], piece: usize, offset: usize) -> usize {
        self.cache.readv(bufs, piece, offset)
    }

    pub fn write(&self, buf: &[u8], piece: usize, offset: usize) -> usize {
        self.cache.write(buf, piece, offset)
    }

    /// Streaming read; `None` hands the piece back for re-download.
    pub fn read(&self, buf: &mut [u8], piece: usize, offset: usize) -> Option<usize> {
        self.cache.read(buf, piece, offset)
    }

    /// Memory storage cannot move anywhere.
    pub fn move_storage(&self, _save_path: &str) -> Result<(), StorageError> {
        Err(StorageError::NotSupported)
    }

    /// Nothing on disk to rename; accepted as a no-op.
    pub fn rename_file(&self, _file: usize, _new_name: &str) -> Result<(), StorageError> {
        Ok(())
    }

    /// Nothing on disk to delete; accepted as a no-op.
    pub fn delete_files(&self) -> Result<(), StorageError> {
        tracing::debug!("delete_files on memory storage ignored");
        Ok(())
    }

    /// No file handles to give back.
    pub fn release_files(&self) {}

    /// Memory storage never has partial files lying around.
    pub fn has_any_file(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> MemoryStorage {
        MemoryStorage::new(PieceLayout::new(4, 16), 16)
    }

    #[test]
    fn test_round_trip_through_adapter() {
        let storage = storage();
        assert_eq!(storage.write(&[1, 2, 3, 4], 0, 0), 4);

        let mut buf = [0u8; 4];
        assert_eq!(storage.readv(&mut [&mut buf[..]], 0, 0), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(storage.read(&mut buf, 0, 0), Some(4));
    }

    #[test]
    fn test_move_storage_not_supported() {
        let storage = storage();
        assert!(matches!(
            storage.move_storage("/tmp/elsewhere"),
            Err(StorageError::NotSupported)
        ));
    }

    #[test]
    fn test_filesystem_ops_are_noops() {
        let storage = storage();
        assert!(storage.rename_file(0, "renamed.mkv").is_ok());
        assert!(storage.delete_files().is_ok());
        storage.release_files();
        assert!(!storage.has_any_file());
    }
}
