//! Wire protocol shared by the AirDelivery rendezvous server and peers.
//!
//! Two independent formats live here: the JSON envelope spoken over the
//! signaling WebSocket, and the control/data frames carried inside the
//! established peer-to-peer data channel.

pub mod constants;
pub mod envelope;
pub mod frame;
pub mod messages;
pub mod types;

pub use constants::MessageType;
pub use envelope::Message;
pub use frame::{ChannelPayload, ControlFrame, DataFrame, Frame, FrameError};
