//! File-based piece storage.
//!
//! Maps each piece's byte range onto the torrent's file list. Single-file
//! torrents live directly in the download directory; multi-file torrents get
//! a directory named after the torrent.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{Storage, StorageError};
use crate::torrent::{PieceIndex, TorrentFile, TorrentMetadata};

/// One file's slice of a piece's byte range.
struct FileSpan {
    path: PathBuf,
    /// Offset within the file where the span starts
    file_offset: u64,
    /// Offset within the piece buffer where the span starts
    piece_offset: usize,
    length: usize,
}

/// Piece storage over the local filesystem.
pub struct FileStorage {
    root: PathBuf,
    name: String,
    files: Vec<TorrentFile>,
    piece_length: u32,
    total_length: u64,
}

impl FileStorage {
    /// Creates storage for a torrent rooted at the download directory.
    pub fn new(root: PathBuf, metadata: &TorrentMetadata) -> Self {
        Self {
            root,
            name: metadata.name.clone(),
            files: metadata.files.clone(),
            piece_length: metadata.piece_length,
            total_length: metadata.total_length,
        }
    }

    /// Download directory currently in use.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn piece_size(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    /// Absolute path of one torrent file.
    fn file_path(&self, file: &TorrentFile) -> PathBuf {
        let mut path = self.root.clone();
        if self.files.len() > 1 {
            path.push(&self.name);
        }
        for component in &file.path {
            path.push(component);
        }
        path
    }

    /// Maps an absolute byte range onto the file list.
    fn spans(&self, start: u64, length: usize) -> Vec<FileSpan> {
        let mut spans = Vec::new();
        let end = start + length as u64;
        let mut file_start = 0u64;

        for file in &self.files {
            let file_end = file_start + file.length;
            if file_end > start && file_start < end {
                let overlap_start = start.max(file_start);
                let overlap_end = end.min(file_end);
                spans.push(FileSpan {
                    path: self.file_path(file),
                    file_offset: overlap_start - file_start,
                    piece_offset: (overlap_start - start) as usize,
                    length: (overlap_end - overlap_start) as usize,
                });
            }
            file_start = file_end;
        }
        spans
    }

    fn validate_range(&self, index: PieceIndex, offset: u32, length: u32) -> Result<(), StorageError> {
        let piece = index.as_u32();
        let piece_count = self.total_length.div_ceil(self.piece_length.max(1) as u64) as u32;
        if piece >= piece_count
            || offset as u64 + length as u64 > self.piece_size(piece) as u64
        {
            return Err(StorageError::InvalidRange {
                reason: format!("piece {piece} offset {offset} length {length}"),
            });
        }
        Ok(())
    }

    async fn read_range(&self, start: u64, length: usize) -> Result<Option<Vec<u8>>, StorageError> {
        let mut buffer = vec![0u8; length];
        for span in self.spans(start, length) {
            let mut file = match fs::File::open(&span.path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            let slice = &mut buffer[span.piece_offset..span.piece_offset + span.length];
            if file.read_exact(slice).await.is_err() {
                // Short file: the data simply is not there yet
                return Ok(None);
            }
        }
        Ok(Some(buffer))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn write_piece(
        &self,
        index: PieceIndex,
        piece_bytes: &[u8],
    ) -> Result<(), StorageError> {
        let start = index.as_u32() as u64 * self.piece_length as u64;
        for span in self.spans(start, piece_bytes.len()) {
            if let Some(parent) = span.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&span.path)
                .await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&piece_bytes[span.piece_offset..span.piece_offset + span.length])
                .await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Option<Vec<u8>>, StorageError> {
        let piece = index.as_u32();
        let start = piece as u64 * self.piece_length as u64;
        self.read_range(start, self.piece_size(piece) as usize).await
    }

    async fn read_block(
        &self,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.validate_range(index, offset, length)?;
        let start = index.as_u32() as u64 * self.piece_length as u64 + offset as u64;
        self.read_range(start, length as usize).await
    }

    async fn relocate(&mut self, new_root: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(new_root).await?;

        let Some(first) = self.files.first() else {
            // Nothing on disk yet (metadata still pending)
            self.root = new_root.to_path_buf();
            return Ok(());
        };
        let moved: &Path = if self.files.len() > 1 {
            Path::new(&self.name)
        } else {
            Path::new(&first.path[0])
        };
        let from = self.root.join(moved);
        let to = new_root.join(moved);

        if fs::metadata(&from).await.is_ok() {
            fs::rename(&from, &to).await?;
        }
        self.root = new_root.to_path_buf();
        tracing::info!("relocated {} to {}", self.name, new_root.display());
        Ok(())
    }

    async fn remove_data(&self) -> Result<(), StorageError> {
        if self.files.len() > 1 {
            let dir = self.root.join(&self.name);
            if fs::metadata(&dir).await.is_ok() {
                fs::remove_dir_all(&dir).await?;
            }
        } else if let Some(first) = self.files.first() {
            let path = self.file_path(first);
            if fs::metadata(&path).await.is_ok() {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;

    fn metadata(piece_length: u32, files: Vec<TorrentFile>) -> TorrentMetadata {
        let total_length = files.iter().map(|f| f.length).sum();
        let piece_count = total_length.div_ceil(piece_length as u64);
        TorrentMetadata {
            info_hash: InfoHash::new([1u8; 20]),
            name: "example".to_string(),
            piece_length,
            piece_hashes: vec![[0u8; 20]; piece_count as usize],
            total_length,
            files,
            announce_tiers: vec![vec!["http://t/announce".to_string()]],
            private: false,
            comment: None,
            created_by: None,
            creation_date: None,
        }
    }

    #[tokio::test]
    async fn test_single_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(
            64,
            vec![TorrentFile {
                path: vec!["example".to_string()],
                length: 150,
            }],
        );
        let storage = FileStorage::new(dir.path().to_path_buf(), &meta);

        let piece0 = vec![0xAA; 64];
        let piece2 = vec![0xCC; 22]; // Final short piece
        storage.write_piece(PieceIndex::new(0), &piece0).await.unwrap();
        storage.write_piece(PieceIndex::new(2), &piece2).await.unwrap();

        assert_eq!(
            storage.read_piece(PieceIndex::new(0)).await.unwrap(),
            Some(piece0)
        );
        assert_eq!(
            storage.read_piece(PieceIndex::new(2)).await.unwrap(),
            Some(piece2)
        );
    }

    #[tokio::test]
    async fn test_missing_data_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(
            64,
            vec![TorrentFile {
                path: vec!["example".to_string()],
                length: 128,
            }],
        );
        let storage = FileStorage::new(dir.path().to_path_buf(), &meta);

        assert_eq!(storage.read_piece(PieceIndex::new(0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_piece_spanning_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(
            100,
            vec![
                TorrentFile {
                    path: vec!["a.bin".to_string()],
                    length: 60,
                },
                TorrentFile {
                    path: vec!["sub".to_string(), "b.bin".to_string()],
                    length: 90,
                },
            ],
        );
        let storage = FileStorage::new(dir.path().to_path_buf(), &meta);

        let piece0: Vec<u8> = (0..100).collect();
        let piece1: Vec<u8> = (100..150).collect();
        storage.write_piece(PieceIndex::new(0), &piece0).await.unwrap();
        storage.write_piece(PieceIndex::new(1), &piece1).await.unwrap();

        // Files land under a directory named after the torrent
        assert!(dir.path().join("example/a.bin").exists());
        assert!(dir.path().join("example/sub/b.bin").exists());

        assert_eq!(
            storage.read_piece(PieceIndex::new(0)).await.unwrap(),
            Some(piece0)
        );
        assert_eq!(
            storage.read_piece(PieceIndex::new(1)).await.unwrap(),
            Some(piece1)
        );
    }

    #[tokio::test]
    async fn test_read_block_range_validation() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(
            64,
            vec![TorrentFile {
                path: vec!["example".to_string()],
                length: 128,
            }],
        );
        let storage = FileStorage::new(dir.path().to_path_buf(), &meta);

        let result = storage.read_block(PieceIndex::new(0), 60, 10).await;
        assert!(matches!(result, Err(StorageError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn test_remove_data() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(
            64,
            vec![TorrentFile {
                path: vec!["example".to_string()],
                length: 64,
            }],
        );
        let storage = FileStorage::new(dir.path().to_path_buf(), &meta);

        storage
            .write_piece(PieceIndex::new(0), &vec![1u8; 64])
            .await
            .unwrap();
        assert!(dir.path().join("example").exists());

        storage.remove_data().await.unwrap();
        assert!(!dir.path().join("example").exists());
    }

    #[tokio::test]
    async fn test_relocate_moves_data() {
        let dir = tempfile::tempdir().unwrap();
        let new_dir = tempfile::tempdir().unwrap();
        let meta = metadata(
            64,
            vec![TorrentFile {
                path: vec!["example".to_string()],
                length: 64,
            }],
        );
        let mut storage = FileStorage::new(dir.path().to_path_buf(), &meta);

        let piece = vec![7u8; 64];
        storage.write_piece(PieceIndex::new(0), &piece).await.unwrap();

        storage.relocate(new_dir.path()).await.unwrap();
        assert!(!dir.path().join("example").exists());
        assert!(new_dir.path().join("example").exists());
        assert_eq!(
            storage.read_piece(PieceIndex::new(0)).await.unwrap(),
            Some(piece)
        );
    }
}
