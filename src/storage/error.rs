use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation not supported by memory storage")]
    NotSupported,

    #[error("torrent not registered: {0}")]
    TorrentNotFound(usize),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(usize),

    #[error("piece {0} not resident in memory")]
    PieceNotResident(usize),
}
