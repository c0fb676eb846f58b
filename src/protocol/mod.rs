//! Wire-level protocol: Content-Length framing and JSON-RPC envelopes.

mod envelope;
mod frame;

pub use envelope::{
    error_codes, ErrorObject, Message, Notification, Request, RequestId, Response,
    JSONRPC_VERSION,
};
pub use frame::{encode_frame, read_frame, Extracted, FrameBuffer, FrameError, MAX_CONTENT_LENGTH};
