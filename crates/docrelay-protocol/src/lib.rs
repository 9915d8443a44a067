//! IPC framing and message types for docrelay.
//!
//! UI-facing processes never touch credentials or the action table directly;
//! they talk to the daemon over a Unix socket using this protocol.
//!
//! # Framing
//!
//! Messages are sent as length-prefixed JSON:
//! - 4 bytes: message length (u32, big-endian)
//! - N bytes: JSON payload
//!
//! Every message is wrapped in an [`Envelope`] carrying the protocol version
//! and a `request_id` used to correlate the reply with its request.
//!
//! # Push notifications
//!
//! After a [`Request::Subscribe`] the server answers with
//! [`Response::Subscribed`] and then keeps writing
//! [`Response::Notification`] frames on the same connection until the client
//! disconnects. Notifications are not replayed to late subscribers.
//!
//! ```rust
//! use docrelay_protocol::{Envelope, Request, encode_message, decode_message};
//!
//! let request = Envelope::request("req-123", Request::CheckToken);
//! let bytes = encode_message(&request).unwrap();
//! let decoded: Envelope<Request> = decode_message(&bytes).unwrap();
//! assert_eq!(decoded.payload, Request::CheckToken);
//! ```

mod error;
mod framing;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter, decode_message, encode_message};
pub use types::{
    ActionFilter, Envelope, ErrorCode, ErrorResponse, EventKind, FlowState, Notification,
    Request, Response, StatusInfo,
};

/// Protocol version constant.
pub const PROTOCOL_VERSION: &str = "1";

/// Maximum message size (1 MB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
