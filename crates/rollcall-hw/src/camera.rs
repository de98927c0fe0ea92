//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

pub const DEFAULT_DEVICE: &str = "/dev/video0";
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const DARK_FRACTION: f32 = 0.95;
/// Raw dequeues allowed per good frame before giving up on exposure.
const ATTEMPTS_PER_FRAME: usize = 3;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not a video capture device: {0}")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("only dark frames after {0} attempts")]
    TooDark(usize),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Grey,
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    fn to_luma(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_luma(buf, width, height),
            Self::Grey => frame::grey_to_luma(buf, width, height),
            Self::Y16 => frame::y16_to_luma(buf, width, height),
        }
    }
}

/// An open webcam. Dropping it closes the device.
pub struct Camera {
    device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Frames thrown away at the start of every capture while exposure settles.
    warmup: usize,
}

fn open_error(device_path: &str, e: std::io::Error) -> CameraError {
    let reason = format!("{device_path}: {e}");
    match e.raw_os_error() {
        Some(16) => CameraError::DeviceBusy(reason),
        Some(13) | Some(1) => CameraError::PermissionDenied(reason),
        _ => match e.kind() {
            std::io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(reason),
            _ => CameraError::DeviceNotFound(reason),
        },
    }
}

impl Camera {
    /// Open a webcam by path (e.g. "/dev/video0") and negotiate a 640x480 luma-capable format.
    pub fn open(device_path: &str, warmup: usize) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let mut fmt = device
            .format()
            .map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
            })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
            })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "opened webcam"
        );

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            warmup,
        })
    }

    /// One usable (non-dark) frame, contrast-stretched.
    ///
    /// Each call opens a short-lived mmap stream, so the device is idle
    /// between samples.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        for _ in 0..self.warmup {
            stream
                .next()
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to dequeue warmup buffer: {e}"))
                })?;
        }

        for _ in 0..ATTEMPTS_PER_FRAME {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
            let mut luma = self.pixel_format.to_luma(buf, self.width, self.height)?;

            if frame::is_dark_frame(&luma, DARK_FRACTION) {
                tracing::debug!(seq = meta.sequence, "skipping dark frame");
                continue;
            }
            frame::stretch_contrast(&mut luma);

            return Ok(Frame {
                data: luma,
                width: self.width,
                height: self.height,
                sequence: meta.sequence,
                captured_at: std::time::Instant::now(),
                is_dark: false,
            });
        }

        Err(CameraError::TooDark(ATTEMPTS_PER_FRAME))
    }

    /// One raw frame with no dark filtering or enhancement, for diagnostics.
    pub fn capture_raw(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let luma = self.pixel_format.to_luma(buf, self.width, self.height)?;
        let is_dark = frame::is_dark_frame(&luma, DARK_FRACTION);
        Ok(Frame {
            data: luma,
            width: self.width,
            height: self.height,
            sequence: meta.sequence,
            captured_at: std::time::Instant::now(),
            is_dark,
        })
    }

    /// Close the device now rather than at drop.
    pub fn close(self) {
        tracing::info!(device = %self.device_path, "closing webcam");
    }

    /// V4L2 capture devices among /dev/video0..15.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}
