use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::{MAX_CHUNK_SIZE, TransferError};

/// Compresses one file chunk as raw deflate.
pub fn compress_chunk(data: &[u8]) -> Result<Vec<u8>, TransferError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder
        .write_all(data)
        .map_err(|e| TransferError::Compression(format!("compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| TransferError::Compression(format!("compression failed: {e}")))
}

/// Decompresses one received chunk.
///
/// Output larger than [`MAX_CHUNK_SIZE`] is rejected, so a hostile frame
/// cannot expand into an arbitrarily large allocation.
pub fn decompress_chunk(data: &[u8]) -> Result<Vec<u8>, TransferError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(MAX_CHUNK_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| TransferError::Compression(format!("decompression failed: {e}")))?;
    if out.len() > MAX_CHUNK_SIZE {
        return Err(TransferError::Compression(format!(
            "decompressed chunk exceeds {MAX_CHUNK_SIZE} bytes"
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn identity_on_empty_and_single_byte() {
        for input in [&b""[..], &b"x"[..]] {
            let packed = compress_chunk(input).unwrap();
            assert_eq!(decompress_chunk(&packed).unwrap(), input);
        }
    }

    #[test]
    fn identity_on_random_full_chunk() {
        let mut data = vec![0u8; MAX_CHUNK_SIZE];
        rand::thread_rng().fill_bytes(&mut data);
        let packed = compress_chunk(&data).unwrap();
        assert_eq!(decompress_chunk(&packed).unwrap(), data);
    }

    #[test]
    fn repetitive_data_shrinks() {
        let data = vec![7u8; 64 * 1024];
        let packed = compress_chunk(&data).unwrap();
        assert!(packed.len() < data.len() / 10);
    }

    #[test]
    fn garbage_input_is_an_error() {
        // 0xff starts a deflate block with the reserved block type 3.
        assert!(matches!(
            decompress_chunk(&[0xff, 0xff, 0xff, 0xff]),
            Err(TransferError::Compression(_))
        ));
    }

    #[test]
    fn oversized_output_is_rejected() {
        let data = vec![0u8; MAX_CHUNK_SIZE + 1];
        let packed = compress_chunk(&data).unwrap();
        assert!(decompress_chunk(&packed).is_err());
    }
}
