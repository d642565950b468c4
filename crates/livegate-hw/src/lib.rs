//! Frame Source Adapters.
//!
//! A [`SourceOpener`] knows how to (re)connect to a video feed and hands out
//! a [`FrameSource`] handle; the handle yields frames until it fails. The
//! handle is released by dropping it. Reconnect policy lives with the caller.
//!
//! Supported URIs:
//! - `stub://<name>[?width=W&height=H&drop_after=N]`: synthetic moving pattern
//! - `dir://<path>` or a plain directory path: replay still images in name order
//! - `v4l2:///dev/videoN[?width=W&height=H&fps=F]` or a bare `/dev/video*`
//!   path: live capture (needs the `v4l2` feature)

mod sequence;
mod synthetic;
mod v4l2;

use std::path::{Path, PathBuf};

use livegate_core::Frame;
use thiserror::Error;

pub use sequence::ImageSequenceSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use v4l2::V4l2Config;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unsupported frame source: {0}")]
    Unsupported(String),
    #[error("invalid source parameter {key}={value}")]
    InvalidParam { key: String, value: String },
    #[error("no images found in {0}")]
    EmptyDirectory(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(String),
    #[error("short frame: expected {expected} bytes, got {got}")]
    ShortFrame { expected: usize, got: usize },
    #[error("stream ended")]
    EndOfStream,
}

/// An open video feed.
pub trait FrameSource: Send {
    /// Read the next frame, or fail. A failure ends the handle's useful life.
    fn read_frame(&mut self) -> Result<Frame, SourceError>;
}

/// Opens (and reopens) a feed.
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, SourceError>;

    /// Human-readable location of the feed, for logs.
    fn describe(&self) -> String;
}

/// Opener dispatching on the source URI scheme.
#[derive(Debug, Clone)]
pub struct UriOpener {
    uri: String,
}

impl UriOpener {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl SourceOpener for UriOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, SourceError> {
        if let Some(rest) = self.uri.strip_prefix("stub://") {
            let config = SyntheticConfig::from_query(rest)?;
            tracing::info!(
                uri = %self.uri,
                width = config.width,
                height = config.height,
                "synthetic source opened"
            );
            return Ok(Box::new(SyntheticSource::new(config)));
        }

        if let Some(rest) = self.uri.strip_prefix("v4l2://") {
            return open_v4l2(&self.uri, &V4l2Config::from_query(rest)?);
        }
        if self.uri.starts_with("/dev/video") {
            return open_v4l2(&self.uri, &V4l2Config::from_query(&self.uri)?);
        }

        let dir = self.uri.strip_prefix("dir://").unwrap_or(&self.uri);
        let path = Path::new(dir);
        if path.is_dir() {
            let source = ImageSequenceSource::open(path)?;
            tracing::info!(uri = %self.uri, images = source.len(), "image sequence opened");
            return Ok(Box::new(source));
        }

        Err(SourceError::Unsupported(self.uri.clone()))
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

#[cfg(feature = "v4l2")]
fn open_v4l2(uri: &str, config: &V4l2Config) -> Result<Box<dyn FrameSource>, SourceError> {
    let source = V4l2Source::open(config)?;
    let (width, height) = source.size();
    tracing::info!(uri, width, height, "capture device opened");
    Ok(Box::new(source))
}

#[cfg(not(feature = "v4l2"))]
fn open_v4l2(uri: &str, _config: &V4l2Config) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::Unsupported(format!(
        "{uri} (built without the v4l2 feature)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_uri_opens_synthetic() {
        let opener = UriOpener::new("stub://cam?width=64&height=48");
        let mut source = opener.open().unwrap();
        let frame = source.read_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
    }

    #[test]
    fn test_unknown_uri_is_unsupported() {
        let opener = UriOpener::new("rtmp://example.invalid/live");
        assert!(matches!(opener.open(), Err(SourceError::Unsupported(_))));
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn test_capture_uri_needs_feature() {
        for uri in ["v4l2:///dev/video0", "/dev/video0"] {
            let err = UriOpener::new(uri).open().err().unwrap();
            assert!(err.to_string().contains("v4l2 feature"), "{err}");
        }
    }

    #[test]
    fn test_capture_uri_params_checked() {
        let opener = UriOpener::new("v4l2:///dev/video0?fps=fast");
        assert!(matches!(opener.open(), Err(SourceError::InvalidParam { .. })));
    }

    #[test]
    fn test_bad_param_is_rejected() {
        let opener = UriOpener::new("stub://cam?width=wide");
        assert!(matches!(opener.open(), Err(SourceError::InvalidParam { .. })));
    }
}
