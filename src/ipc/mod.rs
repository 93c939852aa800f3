//! Control-plane IPC: JSON messages over a length-prefixed Unix socket.

mod handler;
pub mod protocol;
mod protocol_codec;
mod protocol_types;
mod server;

pub use handler::IpcHandler;
pub use protocol::{
    decode_message, encode_message, read_frame, write_frame, ActivationRequest, ActivationResponse,
    ActivationStatus, ErrorCode, IpcMessage, ProtocolError, RouteRequest, RouteResponse,
    MAX_FRAME_SIZE,
};
pub use server::{run_server, ServerError};
