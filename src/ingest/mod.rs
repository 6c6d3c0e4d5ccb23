pub mod frame;
pub mod protocol;
pub mod receiver;

pub use frame::Frame;
pub use protocol::{encode_frame, read_frame, ReadTimeouts};
pub use receiver::{FrameReceiver, ReceiverHandle, ReceiverState, ReceiverStatus};
