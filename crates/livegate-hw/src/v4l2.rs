//! Live capture from a local V4L2 device.
//!
//! URI: `v4l2:///dev/videoN[?width=W&height=H&fps=F]`, or the bare device
//! path. The device is asked for RGB24; YUYV and MJPEG are converted when the
//! driver insists on them. Capture needs the `v4l2` cargo feature.

use std::path::PathBuf;

use crate::SourceError;

#[derive(Clone, Debug, PartialEq)]
pub struct V4l2Config {
    pub device: PathBuf,
    /// Requested size; the driver may pick the nearest it supports.
    pub width: u32,
    pub height: u32,
    /// 0 leaves the driver's frame rate alone.
    pub fps: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

impl V4l2Config {
    /// Parse the part of a `v4l2://` URI after the scheme,
    /// e.g. `/dev/video2?width=1280&height=720&fps=15`.
    pub fn from_query(rest: &str) -> Result<Self, SourceError> {
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut config = Self::default();
        if !path.is_empty() {
            config.device = PathBuf::from(path);
        }

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let invalid = || SourceError::InvalidParam {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "width" => config.width = value.parse().map_err(|_| invalid())?,
                "height" => config.height = value.parse().map_err(|_| invalid())?,
                "fps" => config.fps = value.parse().map_err(|_| invalid())?,
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

#[cfg(feature = "v4l2")]
pub use device::V4l2Source;

#[cfg(feature = "v4l2")]
mod device {
    use std::path::{Path, PathBuf};

    use livegate_core::Frame;
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;
    use v4l::{Device, Format, FourCC};

    use super::V4l2Config;
    use crate::{FrameSource, SourceError};

    const BUFFER_COUNT: u32 = 4;

    #[derive(Clone, Copy, Debug, PartialEq)]
    pub(super) enum PixelFormat {
        Rgb24,
        Yuyv,
        Mjpeg,
    }

    impl PixelFormat {
        fn from_fourcc(fourcc: FourCC) -> Option<Self> {
            match &fourcc.repr {
                b"RGB3" => Some(Self::Rgb24),
                b"YUYV" => Some(Self::Yuyv),
                b"MJPG" => Some(Self::Mjpeg),
                _ => None,
            }
        }
    }

    /// An open capture stream. Dropping it stops streaming and closes the
    /// device.
    pub struct V4l2Source {
        // Declared before the device so it is released first.
        stream: Stream<'static>,
        _device: Device,
        path: PathBuf,
        width: u32,
        height: u32,
        pixel: PixelFormat,
    }

    impl V4l2Source {
        pub fn open(config: &V4l2Config) -> Result<Self, SourceError> {
            let io_err = |source: std::io::Error| SourceError::Io {
                path: config.device.clone(),
                source,
            };

            let device = Device::with_path(&config.device).map_err(io_err)?;
            let requested = Format::new(config.width, config.height, FourCC::new(b"RGB3"));
            let format = match device.set_format(&requested) {
                Ok(format) => format,
                Err(e) => {
                    tracing::warn!(
                        device = %config.device.display(),
                        error = %e,
                        "failed to set capture format, using the current one"
                    );
                    device.format().map_err(io_err)?
                }
            };
            let pixel = PixelFormat::from_fourcc(format.fourcc)
                .ok_or_else(|| SourceError::UnsupportedFormat(format.fourcc.to_string()))?;

            if config.fps > 0 {
                let params = v4l::video::capture::Parameters::with_fps(config.fps);
                if let Err(e) = device.set_params(&params) {
                    tracing::warn!(device = %config.device.display(), error = %e, "failed to set frame rate");
                }
            }

            let stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
                .map_err(io_err)?;

            tracing::debug!(
                device = %config.device.display(),
                width = format.width,
                height = format.height,
                ?pixel,
                "capture stream created"
            );
            Ok(Self {
                stream,
                _device: device,
                path: config.device.clone(),
                width: format.width,
                height: format.height,
                pixel,
            })
        }

        pub fn size(&self) -> (u32, u32) {
            (self.width, self.height)
        }
    }

    impl FrameSource for V4l2Source {
        fn read_frame(&mut self) -> Result<Frame, SourceError> {
            let (buf, _meta) = self.stream.next().map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
            decode(self.pixel, buf, self.width, self.height, &self.path)
        }
    }

    pub(super) fn decode(
        pixel: PixelFormat,
        buf: &[u8],
        width: u32,
        height: u32,
        path: &Path,
    ) -> Result<Frame, SourceError> {
        let pixels = width as usize * height as usize;
        match pixel {
            PixelFormat::Rgb24 => {
                let data = buf.get(..pixels * 3).ok_or(SourceError::ShortFrame {
                    expected: pixels * 3,
                    got: buf.len(),
                })?;
                Ok(Frame::new(data.to_vec(), width, height, 3))
            }
            PixelFormat::Yuyv => {
                let data = buf.get(..pixels * 2).ok_or(SourceError::ShortFrame {
                    expected: pixels * 2,
                    got: buf.len(),
                })?;
                Ok(Frame::new(yuyv_to_rgb(data), width, height, 3))
            }
            PixelFormat::Mjpeg => {
                let img = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                    .map_err(|source| SourceError::Decode {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Ok(Frame::from_rgb_image(img.to_rgb8()))
            }
        }
    }

    /// BT.601 limited range, two pixels per `Y0 U Y1 V` group.
    fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
        for group in data.chunks_exact(4) {
            let (u, v) = (group[1] as i32 - 128, group[3] as i32 - 128);
            for y in [group[0], group[2]] {
                let c = 298 * (y as i32 - 16);
                rgb.push(((c + 409 * v + 128) >> 8).clamp(0, 255) as u8);
                rgb.push(((c - 100 * u - 208 * v + 128) >> 8).clamp(0, 255) as u8);
                rgb.push(((c + 516 * u + 128) >> 8).clamp(0, 255) as u8);
            }
        }
        rgb
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn path() -> PathBuf {
            PathBuf::from("/dev/video0")
        }

        #[test]
        fn test_yuyv_extremes() {
            let frame = decode(PixelFormat::Yuyv, &[16, 128, 235, 128], 2, 1, &path()).unwrap();
            assert_eq!(frame.data(), &[0, 0, 0, 255, 255, 255]);
        }

        #[test]
        fn test_short_buffer_rejected() {
            let err = decode(PixelFormat::Rgb24, &[0; 5], 2, 1, &path()).unwrap_err();
            assert!(matches!(err, SourceError::ShortFrame { expected: 6, got: 5 }));
        }

        #[test]
        fn test_mjpeg_decoded() {
            let img = image::RgbImage::from_pixel(8, 4, image::Rgb([200, 200, 200]));
            let mut jpeg = std::io::Cursor::new(Vec::new());
            img.write_to(&mut jpeg, image::ImageFormat::Jpeg).unwrap();

            let frame = decode(PixelFormat::Mjpeg, jpeg.get_ref(), 8, 4, &path()).unwrap();
            assert_eq!((frame.width(), frame.height(), frame.channels()), (8, 4, 3));
        }

        #[test]
        fn test_fourcc_mapping() {
            assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
            assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
        }
    }
}
