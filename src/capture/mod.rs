pub mod emulated;
pub mod frame;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use emulated::EmulatedDriver;
pub use frame::{Frame, FrameMetadata, Geometry, PixelFormat};
pub use source::{AcquisitionParams, CameraDriver, CameraHandle, CameraSource, DeviceRef, Grab, GrabError};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Driver;
