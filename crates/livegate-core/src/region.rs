use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Axis-aligned face rectangle in pixel coordinates of the frame it was
/// detected in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceRegion {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Intersect with the frame bounds. Returns `None` when nothing is left.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<FaceRegion> {
        let x1 = self.x.max(0);
        let y1 = self.y.max(0);
        let x2 = (self.x + self.width).min(frame_width as i32);
        let y2 = (self.y + self.height).min(frame_height as i32);
        let clamped = FaceRegion::new(x1, y1, x2 - x1, y2 - y1);
        (!clamped.is_empty()).then_some(clamped)
    }

    /// Region centre normalised to `[0, 1]` by the frame dimensions.
    pub fn normalized_center(&self, frame_width: u32, frame_height: u32) -> PositionSample {
        let cx = self.x as f32 + self.width as f32 / 2.0;
        let cy = self.y as f32 + self.height as f32 / 2.0;
        PositionSample::from_pixels(cx, cy, frame_width, frame_height)
    }

    /// Copy the pixels under this region (clamped to the frame) into a new frame.
    pub fn crop(&self, frame: &Frame) -> Option<Frame> {
        let r = self.clamp_to(frame.width(), frame.height())?;
        let channels = frame.channels() as usize;
        let stride = frame.width() as usize * channels;
        let row_len = r.width as usize * channels;
        let mut data = Vec::with_capacity(row_len * r.height as usize);
        for row in r.y as usize..(r.y + r.height) as usize {
            let start = row * stride + r.x as usize * channels;
            data.extend_from_slice(&frame.data()[start..start + row_len]);
        }
        Some(Frame::new(
            data,
            r.width as u32,
            r.height as u32,
            frame.channels(),
        ))
    }
}

/// A tracked facial point, each coordinate normalised to `[0, 1]` relative
/// to the frame size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub x: f32,
    pub y: f32,
}

impl PositionSample {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }

    pub fn from_pixels(px: f32, py: f32, frame_width: u32, frame_height: u32) -> Self {
        let w = frame_width.max(1) as f32;
        let h = frame_height.max(1) as f32;
        Self::new(px / w, py / h)
    }

    pub fn distance(&self, other: &PositionSample) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}
