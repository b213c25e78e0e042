//! Dense tensor utilities
//!
//! Pure helpers over `ndarray` used throughout the diffusion loops. Every
//! operation allocates a fresh buffer; the caller keeps single ownership of
//! each latent and replaces it wholesale between steps.

use ndarray::{concatenate, Array4, ArrayView4, Axis};

use crate::error::{DiffusionError, Result};

/// Concatenates `n` copies of a tensor along the batch axis.
///
/// Used to duplicate the latent for classifier-free guidance, where the
/// negative and positive halves share one UNet call.
pub fn repeat(tensor: &Array4<f32>, n: usize) -> Result<Array4<f32>> {
    let views: Vec<ArrayView4<'_, f32>> = (0..n.max(1)).map(|_| tensor.view()).collect();
    concatenate(Axis(0), &views).map_err(|_| DiffusionError::shape(tensor.shape(), tensor.shape()))
}

/// Concatenates two tensors along the batch axis.
pub fn concat_batch(a: &Array4<f32>, b: &Array4<f32>) -> Result<Array4<f32>> {
    concat_axis(0, &[a.view(), b.view()])
}

/// Concatenates tensors along an arbitrary axis.
///
/// Channel stacking (full inpaint UNet input) uses axis 1; prompt chunk
/// joins use axis 1 on the 3-d embedding tensors via `ndarray` directly.
pub fn concat_axis(axis: usize, parts: &[ArrayView4<'_, f32>]) -> Result<Array4<f32>> {
    concatenate(Axis(axis), parts).map_err(|_| {
        let actual = parts.last().map(|p| p.shape().to_vec()).unwrap_or_default();
        let expected = parts.first().map(|p| p.shape().to_vec()).unwrap_or_default();
        DiffusionError::ShapeMismatch { expected, actual }
    })
}

/// Multiplies every element by a scalar.
pub fn multiply_by_scalar(tensor: &Array4<f32>, value: f32) -> Array4<f32> {
    tensor.mapv(|v| v * value)
}

/// Elementwise sum of two equally shaped tensors.
pub fn add(a: &Array4<f32>, b: &Array4<f32>) -> Result<Array4<f32>> {
    if a.shape() != b.shape() {
        return Err(DiffusionError::shape(a.shape(), b.shape()));
    }
    Ok(a + b)
}

/// Elementwise difference of two equally shaped tensors.
pub fn sub(a: &Array4<f32>, b: &Array4<f32>) -> Result<Array4<f32>> {
    if a.shape() != b.shape() {
        return Err(DiffusionError::shape(a.shape(), b.shape()));
    }
    Ok(a - b)
}

/// Maps decoder output from [-1, 1] to [0, 1], clamped.
pub fn normalize_minus_one_to_one(tensor: &Array4<f32>) -> Array4<f32> {
    tensor.mapv(|v| (v / 2.0 + 0.5).clamp(0.0, 1.0))
}

/// Converts decoder output straight to interleaved RGB bytes (HWC order),
/// `round(clamp(x/2 + 0.5, 0, 1) * 255)`.
pub fn to_byte_pixels(tensor: &Array4<f32>) -> Vec<u8> {
    let (_, channels, height, width) = tensor.dim();
    let mut bytes = Vec::with_capacity(height * width * channels);
    for y in 0..height {
        for x in 0..width {
            for c in 0..channels {
                let v = tensor[[0, c, y, x]];
                bytes.push(((v / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
    }
    bytes
}

/// Nearest-neighbor resize along the two spatial axes.
///
/// Masks are downsampled to latent resolution with this; it preserves the
/// hard 0/1 edges a mask needs.
pub fn resize_nearest(tensor: &Array4<f32>, target_h: usize, target_w: usize) -> Array4<f32> {
    let (batch, channels, height, width) = tensor.dim();
    Array4::from_shape_fn((batch, channels, target_h, target_w), |(b, c, th, tw)| {
        let src_h = (th * height / target_h).min(height - 1);
        let src_w = (tw * width / target_w).min(width - 1);
        tensor[[b, c, src_h, src_w]]
    })
}

/// Mean squared error between two equally shaped tensors.
pub fn mse(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
    let n = a.len().max(1) as f32;
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_batch_axis() {
        let t = Array4::<f32>::ones((1, 4, 8, 8));
        let doubled = repeat(&t, 2).unwrap();
        assert_eq!(doubled.dim(), (2, 4, 8, 8));
    }

    #[test]
    fn test_concat_batch() {
        let a = Array4::<f32>::zeros((1, 4, 8, 8));
        let b = Array4::<f32>::ones((1, 4, 8, 8));
        let joined = concat_batch(&a, &b).unwrap();
        assert_eq!(joined.dim(), (2, 4, 8, 8));
        assert_eq!(joined[[0, 0, 0, 0]], 0.0);
        assert_eq!(joined[[1, 0, 0, 0]], 1.0);
    }

    #[test]
    fn test_concat_rejects_mismatched_shapes() {
        let a = Array4::<f32>::zeros((1, 4, 8, 8));
        let b = Array4::<f32>::ones((1, 3, 8, 8));
        assert!(concat_batch(&a, &b).is_err());
    }

    #[test]
    fn test_normalize_clamps() {
        let t = Array4::from_elem((1, 3, 1, 1), 3.0);
        let n = normalize_minus_one_to_one(&t);
        assert_eq!(n[[0, 0, 0, 0]], 1.0);

        let t = Array4::from_elem((1, 3, 1, 1), -1.0);
        let n = normalize_minus_one_to_one(&t);
        assert_eq!(n[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_byte_pixels_known_values() {
        let mut t = Array4::<f32>::zeros((1, 3, 1, 1));
        t[[0, 0, 0, 0]] = -1.0; // -> 0
        t[[0, 1, 0, 0]] = 0.0; // -> 128
        t[[0, 2, 0, 0]] = 1.0; // -> 255
        assert_eq!(to_byte_pixels(&t), vec![0, 128, 255]);
    }

    #[test]
    fn test_resize_nearest_downsample() {
        let t = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32);
        let small = resize_nearest(&t, 2, 2);
        assert_eq!(small.dim(), (1, 1, 2, 2));
        assert_eq!(small[[0, 0, 0, 0]], 0.0);
        assert_eq!(small[[0, 0, 1, 1]], 10.0);
    }

    #[test]
    fn test_mse_zero_for_identical() {
        let t = Array4::from_elem((1, 3, 2, 2), 0.5);
        assert_eq!(mse(&t, &t), 0.0);
    }
}
