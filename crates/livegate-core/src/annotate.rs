//! Preview overlays drawn on a private copy of the frame.
//!
//! Text is not rasterised; the status string travels next to the frame as
//! the caption of a [`crate::ProcessedFrame`]. The overlay encodes the same
//! information visually: a coloured status band, the face box and a
//! progress bar for the stability run.

use image::{Rgb, RgbImage};

use crate::frame::Frame;
use crate::region::FaceRegion;

const BOX_THICKNESS: u32 = 2;
const BAND_HEIGHT: u32 = 6;
const BAR_HEIGHT: u32 = 8;

/// Colour coding of the session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// No face / idle.
    Idle,
    /// Collecting the passive stability run.
    Checking,
    /// Waiting for the active challenge.
    Action,
    /// Verification passed.
    Success,
    /// Degraded or error.
    Alert,
}

impl Tone {
    fn color(self) -> Rgb<u8> {
        match self {
            Tone::Idle => Rgb([128, 128, 128]),
            Tone::Checking => Rgb([255, 200, 0]),
            Tone::Action => Rgb([0, 160, 255]),
            Tone::Success => Rgb([0, 220, 0]),
            Tone::Alert => Rgb([230, 30, 30]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub tone: Tone,
    pub region: Option<FaceRegion>,
    /// Fraction of the stability run collected, `0.0..=1.0`.
    pub progress: Option<f32>,
}

impl Overlay {
    pub fn new(tone: Tone) -> Self {
        Self {
            tone,
            region: None,
            progress: None,
        }
    }

    pub fn with_region(mut self, region: FaceRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_progress(mut self, done: usize, total: usize) -> Self {
        self.progress = Some(if total == 0 {
            1.0
        } else {
            (done as f32 / total as f32).clamp(0.0, 1.0)
        });
        self
    }
}

/// Draw `overlay` onto `frame`. Frames that are not RGB are returned as is.
pub fn annotate(frame: Frame, overlay: &Overlay) -> Frame {
    let Some(mut img) = frame.to_rgb_image() else {
        return frame;
    };
    let color = overlay.tone.color();

    let band_width = img.width();
    fill_rect(&mut img, 0, 0, band_width, BAND_HEIGHT, color);
    if let Some(region) = overlay.region {
        draw_box(&mut img, &region, color);
    }
    if let Some(progress) = overlay.progress {
        draw_progress(&mut img, progress, color);
    }

    Frame::from_rgb_image(img)
}

fn fill_rect(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let x_end = x.saturating_add(w).min(img.width());
    let y_end = y.saturating_add(h).min(img.height());
    for py in y..y_end {
        for px in x..x_end {
            img.put_pixel(px, py, color);
        }
    }
}

fn draw_box(img: &mut RgbImage, region: &FaceRegion, color: Rgb<u8>) {
    let Some(r) = region.clamp_to(img.width(), img.height()) else {
        return;
    };
    let (x, y, w, h) = (r.x as u32, r.y as u32, r.width as u32, r.height as u32);
    let t = BOX_THICKNESS.min(w).min(h);
    fill_rect(img, x, y, w, t, color);
    fill_rect(img, x, y + h - t, w, t, color);
    fill_rect(img, x, y, t, h, color);
    fill_rect(img, x + w - t, y, t, h, color);
}

fn draw_progress(img: &mut RgbImage, progress: f32, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    if h <= BAR_HEIGHT {
        return;
    }
    let y = h - BAR_HEIGHT;
    fill_rect(img, 0, y, w, BAR_HEIGHT, Rgb([40, 40, 40]));
    let filled = (w as f32 * progress).round() as u32;
    fill_rect(img, 0, y, filled, BAR_HEIGHT, color);
}
