use std::path::{Path, PathBuf};

use livegate_core::Frame;

use crate::{FrameSource, SourceError};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Replays the still images of a directory in file-name order, looping at
/// the end. Useful for reproducing a recorded session frame by frame.
#[derive(Debug)]
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::EmptyDirectory(dir.to_path_buf()));
        }
        Ok(Self { paths, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl FrameSource for ImageSequenceSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let path = &self.paths[self.next];
        self.next = (self.next + 1) % self.paths.len();

        let img = image::open(path).map_err(|source| SourceError::Decode {
            path: path.clone(),
            source,
        })?;
        Ok(Frame::from_rgb_image(img.to_rgb8()))
    }
}
