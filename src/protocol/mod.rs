//! Wire protocol between controller and agent.
//!
//! Every frame is one JSON object on its own line. Unary calls are a single
//! [`Request`] answered by a single [`Response`]. An Exec stream starts with
//! [`Request::Exec`] and then carries [`ExecRequestFrame`]s inbound and
//! [`Response::Exec`] frames outbound until the `done` frame.

pub mod codec;
pub mod messages;

pub use codec::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
pub use messages::{
    error_response, AgentStatus, ErrorCode, ErrorResponse, ExecRequestFrame, ExecResponseFrame,
    Request, Response, StartRequest, StartResponse, StdinRequest, StopRequest, StopResponse,
    VersionResponse, PROTOCOL_VERSION,
};
