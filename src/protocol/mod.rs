//! Protocol module - wire format, framing, and payload buffers.
//!
//! - Request line encoding and response decoding
//! - Sentinel framing for accumulating partial reads
//! - Buffer pool for staging large request payloads

mod buffer_pool;
mod framed_channel;
mod wire_format;

pub use buffer_pool::{BufferPool, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BUFFERS};
pub use framed_channel::{Frame, FramedChannel};
pub use wire_format::{
    encode_exit_request, encode_request_into, Message, DEFAULT_MAX_INBOUND_BUFFER,
    DEFAULT_SENTINEL, EXIT_COMMAND, EXIT_REQUEST_ID,
};
