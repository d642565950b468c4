/// A captured video frame: contiguous RGB bytes in row-major order.
///
/// Frames are never shared by reference between the loops. The ingestion
/// loop hands an owned frame to the store, and every reader gets its own
/// clone, so drawing overlays on one copy cannot race with a new capture.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
}

impl Frame {
    pub const RGB_CHANNELS: u8 = 3;

    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * (channels as usize),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    /// A uniformly filled RGB frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(data, width, height, Self::RGB_CHANNELS)
    }

    pub fn from_rgb_image(img: image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self::new(img.into_raw(), width, height, Self::RGB_CHANNELS)
    }

    /// Convert into an `image` buffer. Returns `None` for non-RGB frames.
    pub fn into_rgb_image(self) -> Option<image::RgbImage> {
        if self.channels != Self::RGB_CHANNELS {
            return None;
        }
        image::RgbImage::from_raw(self.width, self.height, self.data)
    }

    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        self.clone().into_rgb_image()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filled_frame_layout() {
        let frame = Frame::filled(2, 2, [1, 2, 3]);
        assert_eq!(frame.data(), &[1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3]);
        assert_eq!(frame.channels(), 3);
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_clone_is_independent() {
        let frame = Frame::filled(2, 2, [100, 100, 100]);
        let mut cloned = frame.clone();
        cloned.data_mut()[0] = 0;
        assert_eq!(frame.data()[0], 100);
        assert_eq!(cloned.data()[0], 0);
    }

    #[test]
    fn test_rgb_image_conversion() {
        let frame = Frame::filled(4, 3, [10, 20, 30]);
        let img = frame.to_rgb_image().unwrap();
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(img.get_pixel(3, 2).0, [10, 20, 30]);
        assert_eq!(Frame::from_rgb_image(img), frame);
    }

    #[test]
    fn test_grey_frame_has_no_rgb_image() {
        let frame = Frame::new(vec![0u8; 4], 2, 2, 1);
        assert!(frame.into_rgb_image().is_none());
    }

    #[test]
    #[should_panic(expected = "data length must equal width * height * channels")]
    fn test_mismatched_data_length_panics_in_debug() {
        Frame::new(vec![0u8; 10], 2, 2, 3);
    }
}
