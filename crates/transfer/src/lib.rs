//! File transfer engine running over a peer-to-peer data channel.
//!
//! Outgoing files are streamed one at a time: read in chunks, compressed,
//! framed with their transfer id and sent while honouring the channel's
//! buffered-amount threshold. Incoming transfers are demultiplexed by id and
//! each drains into its own sink (memory or disk) independently.

mod channel;
mod chunked;
mod compress;
mod engine;
mod progress;
mod receiver;
mod sender;
mod sink;
mod source;
mod types;
mod validation;

pub use channel::{
    ChannelError, ChannelFuture, DataChannel, MemoryChannel, MemoryInbox, memory_channel_pair,
};
pub use chunked::ChunkReader;
pub use compress::{compress_chunk, decompress_chunk};
pub use engine::{CloseReason, EngineConfig, TransferEngine};
pub use progress::ProgressThrottle;
pub use sink::{BufferedSink, ReceivedFile, Sink, StreamingSink};
pub use source::{FileSource, OutgoingFile, collect_files};
pub use types::{
    EngineStats, IncomingSnapshot, OutgoingSnapshot, ReceiveStatus, SendStatus, TransferEvent,
};
pub use validation::validate_relative_path;

pub use airdelivery_protocol::constants::MAX_CHUNK_SIZE;

/// Fraction of the channel's message limit a chunk may use, leaving room
/// for the frame header and compression overhead.
pub const CHUNK_HEADROOM: f64 = 0.9;

/// Outbound buffered bytes allowed before the sender waits, in chunks.
pub const BUFFER_THRESHOLD_CHUNKS: usize = 8;

/// Declared size at or above which incoming files stream to disk (1.2 GB).
pub const MEMORY_SINK_LIMIT: u64 = 1_200_000_000;

/// Chunk size for a channel with the given maximum message size.
///
/// Unknown limits use [`MAX_CHUNK_SIZE`].
pub fn chunk_size_for(max_message_size: Option<usize>) -> usize {
    match max_message_size {
        Some(max) if max > 0 => {
            let scaled = (max as f64 * CHUNK_HEADROOM).floor() as usize;
            scaled.clamp(1, MAX_CHUNK_SIZE)
        }
        _ => MAX_CHUNK_SIZE,
    }
}

/// Buffered-amount threshold above which the sender stops producing frames.
pub fn buffer_threshold(chunk_size: usize) -> usize {
    chunk_size * BUFFER_THRESHOLD_CHUNKS
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("frame error: {0}")]
    Frame(#[from] airdelivery_protocol::FrameError),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("transfer not found: {0}")]
    NotFound(String),
}
