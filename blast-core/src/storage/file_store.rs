//! File-based block storage

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{BlockLayout, BlockStore, StorageError};
use crate::torrent::PieceIndex;

/// Single-file store backing one torrent.
///
/// The file is pre-sized to the payload length on open, so blocks that were
/// never written read back as zeros and fail verification.
pub struct FileBlockStore {
    path: PathBuf,
    layout: BlockLayout,
    file: Mutex<File>,
}

impl FileBlockStore {
    /// Opens or creates the payload file at `path`.
    ///
    /// Existing content is kept so a restarted download can verify what it
    /// already has.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the file or its parent directory cannot be created
    pub async fn open(path: impl AsRef<Path>, layout: BlockLayout) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let current_len = file.metadata().await?.len();
        if current_len != layout.total_length() {
            file.set_len(layout.total_length()).await?;
        }

        tracing::debug!(
            "Opened block store: path={}, length={}",
            path.display(),
            layout.total_length()
        );

        Ok(Self {
            path,
            layout,
            file: Mutex::new(file),
        })
    }

    /// Location of the payload file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockStore for FileBlockStore {
    async fn read_block(&self, piece: PieceIndex, block: u32) -> Result<Vec<u8>, StorageError> {
        let (offset, len) = self.layout.block_range(piece, block)?;
        let mut buffer = vec![0u8; len];

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }

    async fn write_block(
        &self,
        piece: PieceIndex,
        block: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let (offset, len) = self.layout.block_range(piece, block)?;
        if data.len() != len {
            return Err(StorageError::BlockSizeMismatch {
                piece,
                block,
                expected: len,
                actual: data.len(),
            });
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}
