pub mod dispatcher;
pub mod preview;
pub mod ringbuf;

pub use dispatcher::{CameraStatus, DispatcherHandle, Health};
pub use preview::PreviewBoard;
pub use ringbuf::LatestFrameBuffer;
