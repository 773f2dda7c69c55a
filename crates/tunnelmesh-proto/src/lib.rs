//! Wire protocol for tunnelmesh sessions
//!
//! A session is a single WebSocket connection carrying many virtual byte
//! streams. Every binary WebSocket message is exactly one [`Frame`]:
//!
//! ```text
//! +----------------------+--------+-----------------+
//! | conn id (u64, BE)    | kind   | payload         |
//! | 8 bytes              | 1 byte | rest of message |
//! +----------------------+--------+-----------------+
//! ```
//!
//! Connection ids opened by the accepting side of a session are even, ids
//! opened by the dialing side are odd, so both ends can allocate without
//! coordination.

pub mod frame;
pub mod headers;
pub mod payload;

pub use frame::{ConnId, Frame, FrameError, FrameKind};
pub use payload::{ClientAdvert, ConnectRequest};

/// Largest payload a single data frame carries. Writes larger than this are
/// split across several frames.
pub const MAX_DATA_PAYLOAD: usize = 32 * 1024;

/// Bytes a sender may have in flight on one connection before the receiver
/// returns credit with a `Window` frame
pub const CONN_WINDOW: usize = 8 * MAX_DATA_PAYLOAD;

/// Default dial timeout for connections opened through a session
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 15;
