//! rollcall-hw: Webcam capture for the attendance sampler.
//!
//! V4L2 device access plus the pixel conversions needed to hand the
//! detector a clean grayscale frame.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, DEFAULT_DEVICE};
pub use frame::{Frame, FrameError};
