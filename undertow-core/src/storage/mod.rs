//! Storage layer for torrent data.
//!
//! Defines the storage interface for piece data with a file-based
//! implementation. Local storage failures are the one error class that is
//! fatal to a torrent: the session surfaces them by entering its error state
//! until the operator intervenes.

pub mod file_storage;

use std::path::Path;

use async_trait::async_trait;

pub use file_storage::FileStorage;

use crate::torrent::PieceIndex;

/// Storage operations for one torrent's piece data.
///
/// Implementations handle the mapping from pieces to on-disk files.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores verified piece data to persistent storage.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - File system operation failed
    async fn write_piece(&self, index: PieceIndex, piece_bytes: &[u8])
        -> Result<(), StorageError>;

    /// Loads a whole piece, or `None` when the data is absent or short.
    ///
    /// Used by the initial verify scan; absence is normal, not an error.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - File system operation failed
    async fn read_piece(&self, index: PieceIndex) -> Result<Option<Vec<u8>>, StorageError>;

    /// Loads one block of a piece for upload to a peer.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - File system operation failed
    /// - `StorageError::InvalidRange` - Block outside the piece layout
    async fn read_block(
        &self,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    /// Moves the torrent's data to a new download directory.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Rename or copy failed
    async fn relocate(&mut self, new_root: &Path) -> Result<(), StorageError>;

    /// Deletes the torrent's downloaded files.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Removal failed
    async fn remove_data(&self) -> Result<(), StorageError>;
}

/// Errors from the storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Requested range outside piece layout: {reason}")]
    InvalidRange { reason: String },
}
