//! Wire protocol for the grove daemon socket.
//!
//! Two sub-protocols share the Unix stream socket:
//!
//! - **Request/response**: the client writes one newline-terminated JSON
//!   [`Request`]; the daemon writes one newline-terminated JSON [`Response`]
//!   and then either closes or streams raw bytes (setup output, logs,
//!   finish/check output).
//! - **Attach framing**: after a successful attach acknowledgement, both
//!   directions switch to length-prefixed frames (see [`frames`]) until the
//!   client detaches or the agent exits.

pub mod frames;
pub mod messages;

pub use frames::{
    parse_resize, read_frame, resize_payload, write_frame, FRAME_DATA, FRAME_DETACH, FRAME_RESIZE,
    MAX_FRAME_LEN,
};
pub use messages::{InstanceInfo, Request, RequestType, Response};
