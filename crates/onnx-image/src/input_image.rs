//! Image inputs and pixel conversion
//!
//! Inputs arrive as a file path, an encoded byte buffer, a decoded RGBA
//! bitmap, or an already-built pixel tensor; the diffusers only ever see
//! `[1, 3, H, W]` float tensors in the requested normalization.

use std::path::PathBuf;

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage, RgbaImage};
use ndarray::Array4;

use onnx_image_core::{DiffusionError, Result};

/// Pixel value range of a prepared tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageNormalization {
    ZeroToOne,
    MinusOneToOne,
}

/// An image input in whichever form the host has it.
#[derive(Clone)]
pub enum InputImage {
    File(PathBuf),
    Bytes(Vec<u8>),
    /// Pre-built `[1, 3, H, W]` tensor, assumed already normalized.
    Tensor(Array4<f32>),
    Rgba(RgbaImage),
}

impl InputImage {
    /// Decodes, resizes and normalizes into a `[1, 3, H, W]` tensor.
    ///
    /// A `Tensor` input is validated against the requested size and passed
    /// through untouched; its normalization is the caller's contract.
    pub fn to_tensor(
        &self,
        height: usize,
        width: usize,
        normalization: ImageNormalization,
    ) -> Result<Array4<f32>> {
        let decoded = match self {
            InputImage::Tensor(tensor) => {
                let dims = tensor.dim();
                if dims.0 != 1 || dims.1 != 3 || dims.2 != height || dims.3 != width {
                    return Err(DiffusionError::shape(
                        &[1, 3, height, width],
                        &[dims.0, dims.1, dims.2, dims.3],
                    ));
                }
                return Ok(tensor.clone());
            }
            InputImage::File(path) => image::open(path)
                .map_err(|e| DiffusionError::InvalidOptions(format!("image {}: {e}", path.display())))?,
            InputImage::Bytes(bytes) => image::load_from_memory(bytes)
                .map_err(|e| DiffusionError::InvalidOptions(format!("image bytes: {e}")))?,
            InputImage::Rgba(rgba) => DynamicImage::ImageRgba8(rgba.clone()),
        };

        let resized = decoded
            .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
            .to_rgb8();
        Ok(rgb_to_tensor(&resized, normalization))
    }

    /// Decodes a mask into a single-channel `[1, 1, H, W]` tensor in
    /// [0, 1], via the luminance of the source image.
    pub fn to_mask_tensor(&self, height: usize, width: usize) -> Result<Array4<f32>> {
        let rgb = self.to_tensor(height, width, ImageNormalization::ZeroToOne)?;
        Ok(Array4::from_shape_fn((1, 1, height, width), |(_, _, y, x)| {
            (rgb[[0, 0, y, x]] + rgb[[0, 1, y, x]] + rgb[[0, 2, y, x]]) / 3.0
        }))
    }
}

fn rgb_to_tensor(image: &RgbImage, normalization: ImageNormalization) -> Array4<f32> {
    let (width, height) = image.dimensions();
    Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| {
            let value = image.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0;
            match normalization {
                ImageNormalization::ZeroToOne => value,
                ImageNormalization::MinusOneToOne => value * 2.0 - 1.0,
            }
        },
    )
}

/// Converts a `[1, 3, H, W]` pixel tensor in [0, 1] into an 8-bit RGB
/// image for the host's encoder.
pub fn tensor_to_rgb_image(tensor: &Array4<f32>) -> Result<RgbImage> {
    let (batch, channels, height, width) = tensor.dim();
    if batch != 1 || channels != 3 {
        return Err(DiffusionError::shape(
            &[1, 3, height, width],
            &[batch, channels, height, width],
        ));
    }
    let mut image = RgbImage::new(width as u32, height as u32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        for c in 0..3 {
            pixel.0[c] =
                (tensor[[0, c, y as usize, x as usize]].clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }
    Ok(image)
}
