//! Per-tick annotations: one labeled box per detected face.

use crate::types::{BoundingBox, GrayFrame, MatchLabel, MatchResult, Roster};
use image::{Rgb, RgbImage};
use serde::Serialize;

const MATCHED_RGB: [u8; 3] = [0, 200, 0];
const UNMATCHED_RGB: [u8; 3] = [220, 0, 0];
const LINE_WIDTH: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxColor {
    Matched,
    Unmatched,
}

impl BoxColor {
    pub fn rgb(self) -> [u8; 3] {
        match self {
            BoxColor::Matched => MATCHED_RGB,
            BoxColor::Unmatched => UNMATCHED_RGB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayBox {
    pub bbox: BoundingBox,
    pub label: String,
    pub color: BoxColor,
}

impl OverlayBox {
    /// Box for one match result, labeled "name (0.30)" or "unknown (0.90)".
    pub fn for_match(bbox: BoundingBox, result: &MatchResult, roster: &Roster) -> Self {
        let (name, color) = match result.label {
            MatchLabel::Known(id) => (roster.name_of(id).unwrap_or("unknown"), BoxColor::Matched),
            MatchLabel::Unknown => ("unknown", BoxColor::Unmatched),
        };
        Self {
            bbox,
            label: format!("{name} ({:.2})", result.distance),
            color,
        }
    }
}

/// Latest annotated frame. An empty `boxes` list means "clear the overlay".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Overlay {
    pub tick: u64,
    #[serde(skip)]
    pub frame: Option<GrayFrame>,
    pub boxes: Vec<OverlayBox>,
}

impl Overlay {
    pub fn cleared(tick: u64, frame: Option<GrayFrame>) -> Self {
        Self {
            tick,
            frame,
            boxes: Vec::new(),
        }
    }

    /// Draw the box outlines over an RGB copy of the frame.
    pub fn render(&self) -> Option<RgbImage> {
        let frame = self.frame.as_ref()?;
        let mut img = RgbImage::from_fn(frame.width, frame.height, |x, y| {
            let v = frame.data.get((y * frame.width + x) as usize).copied().unwrap_or(0);
            Rgb([v, v, v])
        });
        for b in &self.boxes {
            draw_outline(&mut img, &b.bbox, Rgb(b.color.rgb()));
        }
        Some(img)
    }
}

fn draw_outline(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
    let (x0, x1) = (clamp_x(bbox.x), clamp_x(bbox.x + bbox.width));
    let (y0, y1) = (clamp_y(bbox.y), clamp_y(bbox.y + bbox.height));

    for t in 0..LINE_WIDTH {
        for x in x0..=x1 {
            img.put_pixel(x, (y0 + t).min(h - 1), color);
            img.put_pixel(x, y1.saturating_sub(t), color);
        }
        for y in y0..=y1 {
            img.put_pixel((x0 + t).min(w - 1), y, color);
            img.put_pixel(x1.saturating_sub(t), y, color);
        }
    }
}
