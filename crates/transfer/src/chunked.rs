use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{MAX_CHUNK_SIZE, TransferError};

/// Reads a byte source in fixed-size chunks.
///
/// Every chunk except the last is exactly `chunk_size` bytes, regardless of
/// how the underlying reader splits its reads.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    size: u64,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Wraps `reader`, expected to yield `size` bytes.
    ///
    /// If `chunk_size` is 0, [`MAX_CHUNK_SIZE`] is used.
    pub fn new(reader: R, size: u64, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            MAX_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            reader,
            chunk_size,
            offset: 0,
            size,
        }
    }

    /// Reads the next chunk. Returns `None` at end of source.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        self.offset += filled as u64;
        Ok(Some(buf))
    }

    /// Bytes read so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Declared source size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
