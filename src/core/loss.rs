use crate::core::patch::patchify;
use crate::types::{MaeError, MaeResult};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis};

/// Stabiliser added to the per-patch variance before normalising
const NORM_EPS: f32 = 1e-6;

/// Normalise every patch vector to zero mean and unit (sample) variance
pub fn normalize_patches(patches: &mut Array3<f32>) {
    for mut patch in patches.lanes_mut(Axis(2)) {
        let n = patch.len() as f32;
        let mean = patch.sum() / n;
        let var = patch.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n - 1.0).max(1.0);
        let inv_std = 1.0 / (var + NORM_EPS).sqrt();
        patch.mapv_inplace(|v| (v - mean) * inv_std);
    }
}

/// Mean squared error of each reconstructed patch, [B, L]
pub fn per_patch_error(
    cube: ArrayView4<f32>,
    pixels: ArrayView3<f32>,
    patch_size: usize,
    norm_pix_loss: bool,
) -> MaeResult<Array2<f32>> {
    let mut target = patchify(cube, patch_size)?;
    if target.dim() != pixels.dim() {
        return Err(MaeError::Shape(format!(
            "Reconstruction {:?} does not match target patches {:?}",
            pixels.shape(),
            target.shape()
        )));
    }

    if norm_pix_loss {
        normalize_patches(&mut target);
    }

    let squared = (&target - &pixels).mapv(|d| d * d);
    squared
        .mean_axis(Axis(2))
        .ok_or_else(|| MaeError::Shape("Patches have no pixels".to_string()))
}

/// Reconstruction loss over hidden patches only.
///
/// `sum(error * mask) / sum(mask)`; visible patches never contribute. A mask
/// with no hidden patch is a configuration error rather than a NaN.
pub fn reconstruction_loss(
    cube: ArrayView4<f32>,
    pixels: ArrayView3<f32>,
    mask: ArrayView2<f32>,
    patch_size: usize,
    norm_pix_loss: bool,
) -> MaeResult<f32> {
    let errors = per_patch_error(cube, pixels, patch_size, norm_pix_loss)?;
    if errors.dim() != mask.dim() {
        return Err(MaeError::Shape(format!(
            "Mask {:?} does not match patch errors {:?}",
            mask.shape(),
            errors.shape()
        )));
    }

    let hidden = mask.sum();
    if hidden <= 0.0 {
        return Err(MaeError::Config(
            "Mask ratio hides no patches; the reconstruction loss is undefined".to_string(),
        ));
    }

    Ok((&errors * &mask).sum() / hidden)
}
