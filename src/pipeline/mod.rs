pub mod ringbuf;

pub use self::ringbuf::{BufferStats, FrameBuffer};
