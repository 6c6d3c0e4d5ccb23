pub mod stream;
pub mod web;

pub use stream::MjpegStream;
pub use web::{AppContext, StatusReport};
