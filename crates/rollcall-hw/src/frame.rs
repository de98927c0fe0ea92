//! Captured frames and the pixel work done on them: YUYV/Y16 to luma,
//! exposure checks, contrast stretch.

use thiserror::Error;

/// One grayscale frame from the webcam.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Row-major luma, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub captured_at: std::time::Instant,
    pub is_dark: bool,
}

impl Frame {
    /// Mean luma, 0.0 to 255.0.
    pub fn mean_brightness(&self) -> f32 {
        mean_brightness(&self.data)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{format} buffer too short: expected {expected} bytes, got {actual}")]
    ShortBuffer {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::ShortBuffer {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Packed YUYV 4:2:2 is `[Y0, U, Y1, V]` per pixel pair; luma is every even byte.
pub fn yuyv_to_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    check_len("YUYV", buf, expected)?;
    Ok(buf[..expected].iter().step_by(2).copied().collect())
}

/// Little-endian 16-bit luma, keeping the high byte.
pub fn y16_to_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    check_len("Y16", buf, expected)?;
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

pub fn grey_to_luma(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize;
    check_len("GREY", buf, expected)?;
    Ok(buf[..expected].to_vec())
}

pub fn mean_brightness(luma: &[u8]) -> f32 {
    if luma.is_empty() {
        return 0.0;
    }
    luma.iter().map(|&p| p as u64).sum::<u64>() as f32 / luma.len() as f32
}

/// True when more than `max_dark_fraction` of pixels are below 32.
///
/// Webcams deliver a few near-black frames while auto-exposure settles; those
/// are worthless to the detector.
pub fn is_dark_frame(luma: &[u8], max_dark_fraction: f32) -> bool {
    if luma.is_empty() {
        return true;
    }
    let dark = luma.iter().filter(|&&p| p < 32).count();
    dark as f32 / luma.len() as f32 > max_dark_fraction
}

/// Linear stretch of the 1st..99th percentile range onto 0..255.
///
/// Dim classrooms produce flat, muddy frames; this is cheap and enough for SCRFD.
pub fn stretch_contrast(luma: &mut [u8]) {
    if luma.is_empty() {
        return;
    }
    let mut hist = [0usize; 256];
    for &p in luma.iter() {
        hist[p as usize] += 1;
    }
    let cut = luma.len() / 100;
    let low = percentile(&hist, cut);
    let high = percentile(&hist, luma.len().saturating_sub(cut + 1));
    if high <= low {
        return;
    }
    let span = (high - low) as f32;
    for p in luma.iter_mut() {
        let v = (*p as f32 - low as f32) / span * 255.0;
        *p = v.round().clamp(0.0, 255.0) as u8;
    }
}

/// Smallest value whose cumulative count exceeds `rank`.
fn percentile(hist: &[usize; 256], rank: usize) -> u8 {
    let mut seen = 0;
    for (value, &count) in hist.iter().enumerate() {
        seen += count;
        if seen > rank {
            return value as u8;
        }
    }
    255
}
