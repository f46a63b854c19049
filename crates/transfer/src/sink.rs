//! Destinations for incoming file bytes.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};

use crate::TransferError;
use crate::validation::validate_relative_path;

/// A completed incoming file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedFile {
    /// Whole file materialized in memory.
    Memory(Vec<u8>),
    /// File already written to this path.
    Streamed(PathBuf),
}

/// Accumulates chunks in memory and joins them on close.
#[derive(Debug, Default)]
pub struct BufferedSink {
    chunks: Vec<Vec<u8>>,
    len: usize,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, bytes: Vec<u8>) {
        self.len += bytes.len();
        self.chunks.push(bytes);
    }

    pub fn close(self) -> Vec<u8> {
        let mut all = Vec::with_capacity(self.len);
        for chunk in self.chunks {
            all.extend_from_slice(&chunk);
        }
        all
    }
}

/// Writes chunks straight to a file under the download directory.
///
/// The partial file is removed on abort.
#[derive(Debug)]
pub struct StreamingSink {
    writer: BufWriter<tokio::fs::File>,
    path: PathBuf,
}

impl StreamingSink {
    /// Creates `download_dir/relative_path`, creating parent directories.
    pub async fn create(download_dir: &Path, relative_path: &str) -> Result<Self, TransferError> {
        validate_relative_path(relative_path)?;
        let path = download_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<PathBuf, TransferError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(self.path)
    }

    pub async fn abort(self) {
        let path = self.path;
        drop(self.writer);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), "failed to remove partial file: {e}");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sink selected once per incoming transfer.
#[derive(Debug)]
pub enum Sink {
    Buffered(BufferedSink),
    Streaming(StreamingSink),
}

impl Sink {
    /// Chooses the sink for a transfer of `size` bytes: memory below
    /// `memory_limit`, disk at or above it.
    pub async fn open(
        size: u64,
        memory_limit: u64,
        download_dir: &Path,
        relative_path: &str,
    ) -> Result<Self, TransferError> {
        if size < memory_limit {
            Ok(Sink::Buffered(BufferedSink::new()))
        } else {
            StreamingSink::create(download_dir, relative_path)
                .await
                .map(Sink::Streaming)
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Sink::Streaming(_))
    }

    pub async fn write(&mut self, bytes: Vec<u8>) -> Result<(), TransferError> {
        match self {
            Sink::Buffered(sink) => {
                sink.write(bytes);
                Ok(())
            }
            Sink::Streaming(sink) => sink.write(&bytes).await,
        }
    }

    pub async fn close(self) -> Result<ReceivedFile, TransferError> {
        match self {
            Sink::Buffered(sink) => Ok(ReceivedFile::Memory(sink.close())),
            Sink::Streaming(sink) => sink.close().await.map(ReceivedFile::Streamed),
        }
    }

    pub async fn abort(self) {
        match self {
            Sink::Buffered(_) => {}
            Sink::Streaming(sink) => sink.abort().await,
        }
    }
}
