//! Background tasks driving the signaling WebSocket.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
