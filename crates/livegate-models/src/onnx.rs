//! Shared ONNX Runtime plumbing: session loading and image-to-tensor
//! preprocessing.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use livegate_core::{CapabilityError, Frame};
use ndarray::Array4;
use ort::session::Session;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("failed to load ONNX model {path}: {message}")]
    Session { path: PathBuf, message: String },
}

pub(crate) fn load_session(path: &Path) -> Result<Session, ModelLoadError> {
    let session = Session::builder()
        .map_err(load_error(path))?
        .commit_from_file(path)
        .map_err(load_error(path))?;
    tracing::debug!(path = %path.display(), "ONNX session created");
    Ok(session)
}

fn load_error<E: std::fmt::Display>(path: &Path) -> impl Fn(E) -> ModelLoadError + '_ {
    move |e| ModelLoadError::Session {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

pub(crate) fn inference_error<E: std::fmt::Display>(
    capability: &'static str,
) -> impl Fn(E) -> CapabilityError {
    move |e| CapabilityError::Inference {
        capability,
        message: e.to_string(),
    }
}

/// Spatial input size of an NCHW model, falling back to `default` when the
/// shape is dynamic or unreadable.
pub(crate) fn input_size(session: &Session, default: (u32, u32)) -> (u32, u32) {
    session
        .inputs()
        .first()
        .and_then(|input| {
            if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
                // [N, C, H, W]
                if shape.len() >= 4 && shape[2] > 0 && shape[3] > 0 {
                    Some((shape[3] as u32, shape[2] as u32))
                } else {
                    None
                }
            } else {
                None
            }
        })
        .unwrap_or(default)
}

/// Per-channel normalisation applied while building the tensor:
/// `(pixel - mean[c]) * scale`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Normalize {
    pub mean: [f32; 3],
    pub scale: f32,
    /// Feed channels as BGR instead of RGB.
    pub bgr: bool,
}

/// Resize `frame` to `width` x `height` and pack it as a `[1, 3, H, W]` tensor.
pub(crate) fn to_nchw(
    frame: &Frame,
    width: u32,
    height: u32,
    norm: Normalize,
) -> Result<Array4<f32>, CapabilityError> {
    let img = frame
        .to_rgb_image()
        .ok_or_else(|| CapabilityError::InvalidInput("expected an RGB frame".to_string()))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(CapabilityError::InvalidInput("empty frame".to_string()));
    }
    let resized = image::imageops::resize(&img, width, height, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let src = if norm.bgr { 2 - c } else { c };
            tensor[[0, c, y as usize, x as usize]] =
                (pixel.0[src] as f32 - norm.mean[c]) * norm.scale;
        }
    }
    Ok(tensor)
}

/// Run `session` on a single input and copy every output out as a flat vector.
pub(crate) fn run_flat(
    session: &mut Session,
    input: Array4<f32>,
    capability: &'static str,
) -> Result<Vec<Vec<f32>>, CapabilityError> {
    let value = ort::value::Tensor::from_array(input).map_err(inference_error(capability))?;
    let outputs = session
        .run(ort::inputs![value])
        .map_err(inference_error(capability))?;

    let mut flat = Vec::with_capacity(outputs.len());
    for i in 0..outputs.len() {
        let tensor = outputs[i]
            .try_extract_array::<f32>()
            .map_err(inference_error(capability))?;
        flat.push(tensor.iter().copied().collect());
    }
    if flat.is_empty() {
        return Err(CapabilityError::UnexpectedOutput {
            capability,
            message: "model produced no outputs".to_string(),
        });
    }
    Ok(flat)
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_nchw_layout_and_normalisation() {
        let frame = Frame::filled(4, 4, [10, 20, 30]);
        let norm = Normalize {
            mean: [0.0, 0.0, 0.0],
            scale: 1.0,
            bgr: false,
        };
        let t = to_nchw(&frame, 2, 3, norm).unwrap();
        assert_eq!(t.shape(), &[1, 3, 3, 2]);
        assert_eq!(t[[0, 0, 0, 0]], 10.0);
        assert_eq!(t[[0, 2, 2, 1]], 30.0);
    }

    #[test]
    fn test_to_nchw_bgr_and_mean() {
        let frame = Frame::filled(2, 2, [10, 20, 30]);
        let norm = Normalize {
            mean: [1.0, 2.0, 3.0],
            scale: 0.5,
            bgr: true,
        };
        let t = to_nchw(&frame, 2, 2, norm).unwrap();
        assert_eq!(t[[0, 0, 0, 0]], (30.0 - 1.0) * 0.5);
        assert_eq!(t[[0, 2, 0, 0]], (10.0 - 3.0) * 0.5);
    }

    #[test]
    fn test_to_nchw_rejects_grey() {
        let frame = Frame::new(vec![0; 4], 2, 2, 1);
        let norm = Normalize {
            mean: [0.0; 3],
            scale: 1.0,
            bgr: false,
        };
        assert!(to_nchw(&frame, 2, 2, norm).is_err());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 3.0]);
        assert!((p[0] + p[1] - 1.0).abs() < 1e-6);
        assert!(p[1] > p[0]);
    }
}
