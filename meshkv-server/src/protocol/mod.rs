//! Wire protocol: frame codec and the request/response envelopes that
//! multiplex many concurrent calls over a single TCP connection.

pub mod envelope;
pub mod frame;

pub use envelope::{Fault, Request, RequestBody, Response, ResponseBody};
pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
