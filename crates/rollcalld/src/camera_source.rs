//! Adapts the V4L2 webcam to the sampler's frame source.
//!
//! The device is opened on the first read, so open failures surface through
//! `Sampler::start` like any other unavailable camera.

use rollcall_core::{FrameRead, FrameSource, GrayFrame, SourceError};
use rollcall_hw::{Camera, CameraError};

pub struct CameraSource {
    device: String,
    warmup_frames: usize,
    camera: Option<Camera>,
    released: bool,
}

impl CameraSource {
    pub fn new(device: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            device: device.into(),
            warmup_frames,
            camera: None,
            released: false,
        }
    }

    fn camera(&mut self) -> Result<&Camera, SourceError> {
        if self.camera.is_none() {
            let camera = Camera::open(&self.device, self.warmup_frames).map_err(to_source_error)?;
            self.camera = Some(camera);
        }
        self.camera
            .as_ref()
            .ok_or_else(|| SourceError::Unavailable(self.device.clone()))
    }
}

fn to_source_error(e: CameraError) -> SourceError {
    match e {
        CameraError::DeviceNotFound(_)
        | CameraError::DeviceBusy(_)
        | CameraError::PermissionDenied(_)
        | CameraError::NotCaptureDevice(_)
        | CameraError::FormatNegotiationFailed(_) => SourceError::Unavailable(e.to_string()),
        other => SourceError::Capture(other.to_string()),
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<FrameRead, SourceError> {
        if self.released {
            return Ok(FrameRead::Ended);
        }
        let frame = self.camera()?.capture_frame().map_err(to_source_error)?;
        Ok(FrameRead::Frame(GrayFrame::new(frame.data, frame.width, frame.height)))
    }

    fn release(&mut self) {
        self.released = true;
        if let Some(camera) = self.camera.take() {
            camera.close();
        }
    }
}
