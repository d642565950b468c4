use livegate_core::Frame;

use crate::{FrameSource, SourceError};

const BACKGROUND: [u8; 3] = [32, 32, 48];
const SUBJECT: [u8; 3] = [220, 180, 150];

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Fail the read after this many frames, simulating a stream cut.
    pub drop_after: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            drop_after: None,
        }
    }
}

impl SyntheticConfig {
    /// Parse the part of a `stub://` URI after the scheme,
    /// e.g. `front?width=320&height=240&drop_after=100`.
    pub fn from_query(rest: &str) -> Result<Self, SourceError> {
        let mut config = Self::default();
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(config);
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let invalid = || SourceError::InvalidParam {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "width" => config.width = value.parse().map_err(|_| invalid())?,
                "height" => config.height = value.parse().map_err(|_| invalid())?,
                "drop_after" => config.drop_after = Some(value.parse().map_err(|_| invalid())?),
                _ => return Err(invalid()),
            }
        }

        if config.width == 0 || config.height == 0 {
            return Err(SourceError::InvalidParam {
                key: "size".to_string(),
                value: format!("{}x{}", config.width, config.height),
            });
        }
        Ok(config)
    }
}

/// Generates a dark background with a light square that drifts slowly,
/// giving the pipeline something face-sized that moves between frames.
pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    fn render(&self) -> Frame {
        let (w, h) = (self.config.width, self.config.height);
        let mut frame = Frame::filled(w, h, BACKGROUND);

        let side = (w.min(h) / 3).max(1);
        // Small periodic drift around the centre
        let phase = (self.frame_count % 16) as i64 - 8;
        let cx = (w / 2) as i64 + phase.abs() - 4;
        let cy = (h / 2) as i64;
        let x0 = (cx - side as i64 / 2).clamp(0, (w - side) as i64) as u32;
        let y0 = (cy - side as i64 / 2).clamp(0, (h - side) as i64) as u32;

        let stride = w as usize * 3;
        let data = frame.data_mut();
        for y in y0..y0 + side {
            let row = y as usize * stride;
            for x in x0..x0 + side {
                let i = row + x as usize * 3;
                data[i..i + 3].copy_from_slice(&SUBJECT);
            }
        }
        frame
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if self
            .config
            .drop_after
            .is_some_and(|limit| self.frame_count >= limit)
        {
            return Err(SourceError::EndOfStream);
        }
        let frame = self.render();
        self.frame_count += 1;
        Ok(frame)
    }
}
