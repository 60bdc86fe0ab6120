use crate::core::layers::{randn_vector, Linear};
use crate::types::{MaeError, MaeResult};
use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Split a cube into flattened patches.
///
/// `[B, C, H, W]` becomes `[B, (H/P)*(W/P), C*P*P]`; patches are row-major over
/// the grid and each patch vector is ordered channel, then patch row, then patch column.
pub fn patchify(cube: ArrayView4<f32>, patch_size: usize) -> MaeResult<Array3<f32>> {
    let (batch, channels, height, width) = cube.dim();
    let (grid_h, grid_w) = grid_dims(height, width, patch_size)?;
    let patch_area = patch_size * patch_size;

    let mut patches = Array3::<f32>::zeros((batch, grid_h * grid_w, channels * patch_area));
    for b in 0..batch {
        for gy in 0..grid_h {
            for gx in 0..grid_w {
                let mut dst = patches.slice_mut(s![b, gy * grid_w + gx, ..]);
                for c in 0..channels {
                    let tile = cube.slice(s![
                        b,
                        c,
                        gy * patch_size..(gy + 1) * patch_size,
                        gx * patch_size..(gx + 1) * patch_size
                    ]);
                    for (i, &v) in tile.iter().enumerate() {
                        dst[c * patch_area + i] = v;
                    }
                }
            }
        }
    }

    Ok(patches)
}

/// Reassemble `[B, L, C*P*P]` patches into a `[B, C, H, W]` cube on a square grid
pub fn unpatchify(patches: ArrayView3<f32>, channels: usize, patch_size: usize) -> MaeResult<Array4<f32>> {
    let (batch, num_patches, patch_len) = patches.dim();
    let patch_area = patch_size * patch_size;
    if patch_len != channels * patch_area {
        return Err(MaeError::Shape(format!(
            "Patch length {} does not match {} channels of {}x{} pixels",
            patch_len, channels, patch_size, patch_size
        )));
    }
    let grid = square_grid(num_patches)?;

    let side = grid * patch_size;
    let mut cube = Array4::<f32>::zeros((batch, channels, side, side));
    for b in 0..batch {
        for l in 0..num_patches {
            let (gy, gx) = (l / grid, l % grid);
            let src = patches.slice(s![b, l, ..]);
            for c in 0..channels {
                let mut tile = cube.slice_mut(s![
                    b,
                    c,
                    gy * patch_size..(gy + 1) * patch_size,
                    gx * patch_size..(gx + 1) * patch_size
                ]);
                for (i, v) in tile.iter_mut().enumerate() {
                    *v = src[c * patch_area + i];
                }
            }
        }
    }

    Ok(cube)
}

/// Patch grid dimensions for an image, requiring exact tiling and a square grid
pub fn grid_dims(height: usize, width: usize, patch_size: usize) -> MaeResult<(usize, usize)> {
    if patch_size == 0 {
        return Err(MaeError::Config("Patch size must be positive".to_string()));
    }
    if height % patch_size != 0 || width % patch_size != 0 {
        return Err(MaeError::Shape(format!(
            "Image {}x{} is not divisible by patch size {}",
            height, width, patch_size
        )));
    }
    let (grid_h, grid_w) = (height / patch_size, width / patch_size);
    if grid_h != grid_w {
        return Err(MaeError::Config(format!(
            "Patch grid must be square, got {}x{}",
            grid_h, grid_w
        )));
    }
    Ok((grid_h, grid_w))
}

/// Side of the square grid holding `num_patches` patches
pub fn square_grid(num_patches: usize) -> MaeResult<usize> {
    let grid = (num_patches as f64).sqrt().round() as usize;
    if grid * grid != num_patches {
        return Err(MaeError::Config(format!(
            "{} patches do not form a square grid",
            num_patches
        )));
    }
    Ok(grid)
}

/// Maps pixel patches to embeddings and back, conditioned on band wavelengths.
///
/// The number and identity of bands can change between calls; `waves` carries
/// one wavelength per channel.
pub trait PatchProjector: Send + Sync {
    /// `[B, C, H, W]` pixels to `[B, L, D]` patch embeddings, plus the
    /// wavelength encoding used `[C, wave_dim]`
    fn encode(&self, cube: ArrayView4<f32>, waves: ArrayView1<f32>) -> MaeResult<(Array3<f32>, Array2<f32>)>;

    /// `[B, N, D]` tokens to `[B, N, C*P*P]` pixel patches, plus the wavelength encoding used
    fn decode(&self, tokens: ArrayView3<f32>, waves: ArrayView1<f32>) -> MaeResult<(Array3<f32>, Array2<f32>)>;

    fn patch_size(&self) -> usize;

    fn embed_dim(&self) -> usize;
}

/// Wavelength projector parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectorParams {
    /// Width of the sinusoidal wavelength encoding
    pub wave_dim: usize,
    /// Number of learned basis kernels mixed per band
    pub num_latent_tokens: usize,
}

impl Default for ProjectorParams {
    fn default() -> Self {
        Self {
            wave_dim: 128,
            num_latent_tokens: 32,
        }
    }
}

/// Projector whose per-band kernels are generated from the band wavelength.
///
/// Each band gets a kernel `[P*P, D]` mixed from shared basis kernels with
/// coefficients predicted from its wavelength encoding, so any set of bands
/// can be embedded with the same parameters.
pub struct WavelengthProjector {
    patch_size: usize,
    embed_dim: usize,
    wave_dim: usize,
    num_latent_tokens: usize,
    /// Wavelength encoding -> basis mixing coefficients
    pub coefficients: Linear,
    /// Basis kernels, [num_latent_tokens, P*P*D]
    pub bases: Array2<f32>,
    /// Wavelength encoding -> embedding bias (averaged over bands)
    pub encode_bias: Linear,
    /// Wavelength encoding -> per-band pixel bias
    pub decode_bias: Linear,
}

impl WavelengthProjector {
    pub fn new<R: Rng + ?Sized>(
        params: &ProjectorParams,
        patch_size: usize,
        embed_dim: usize,
        rng: &mut R,
    ) -> MaeResult<Self> {
        if params.wave_dim < 4 || params.wave_dim % 2 != 0 {
            return Err(MaeError::Config(format!(
                "wave_dim must be an even number >= 4, got {}",
                params.wave_dim
            )));
        }
        if params.num_latent_tokens == 0 || patch_size == 0 || embed_dim == 0 {
            return Err(MaeError::Config(
                "Projector latent tokens, patch size and embedding width must be positive".to_string(),
            ));
        }

        let patch_area = patch_size * patch_size;
        let basis_std = 1.0 / (patch_area as f32).sqrt();
        let bases = randn_vector(params.num_latent_tokens * patch_area * embed_dim, basis_std, rng)
            .into_shape((params.num_latent_tokens, patch_area * embed_dim))?;

        Ok(Self {
            patch_size,
            embed_dim,
            wave_dim: params.wave_dim,
            num_latent_tokens: params.num_latent_tokens,
            coefficients: Linear::new(params.wave_dim, params.num_latent_tokens, true, rng),
            bases,
            encode_bias: Linear::new(params.wave_dim, embed_dim, true, rng),
            decode_bias: Linear::new(params.wave_dim, patch_area, true, rng),
        })
    }

    /// Sinusoidal encoding of wavelengths (micrometres, scaled to nanometres)
    pub fn encode_waves(&self, waves: ArrayView1<f32>) -> Array2<f32> {
        let half = self.wave_dim / 2;
        let temperature = 10_000f32;
        let mut encoded = Array2::<f32>::zeros((waves.len(), self.wave_dim));
        for (c, &wave) in waves.iter().enumerate() {
            let pos = wave * 1000.0;
            for k in 0..half {
                let omega = 1.0 / temperature.powf(k as f32 / (half - 1) as f32);
                encoded[[c, k]] = (pos * omega).sin();
                encoded[[c, half + k]] = (pos * omega).cos();
            }
        }
        encoded
    }

    /// Stacked band kernels `[C*P*P, D]` for the given wavelength encoding
    fn band_kernels(&self, wave_encoding: &Array2<f32>) -> MaeResult<Array2<f32>> {
        let channels = wave_encoding.nrows();
        let scale = 1.0 / (self.num_latent_tokens as f32).sqrt();
        let coeffs = self.coefficients.forward(wave_encoding.view()) * scale;
        let kernels = coeffs
            .dot(&self.bases)
            .into_shape((channels * self.patch_size * self.patch_size, self.embed_dim))?;
        Ok(kernels)
    }

    fn check_bands(&self, channels: usize, waves: ArrayView1<f32>) -> MaeResult<()> {
        if waves.len() != channels {
            return Err(MaeError::Shape(format!(
                "Got {} wavelengths for {} channels",
                waves.len(),
                channels
            )));
        }
        Ok(())
    }
}

impl PatchProjector for WavelengthProjector {
    fn encode(&self, cube: ArrayView4<f32>, waves: ArrayView1<f32>) -> MaeResult<(Array3<f32>, Array2<f32>)> {
        let channels = cube.len_of(Axis(1));
        self.check_bands(channels, waves)?;

        let patches = patchify(cube, self.patch_size)?;
        let wave_encoding = self.encode_waves(waves);
        let kernels = self.band_kernels(&wave_encoding)?;
        let bias = self
            .encode_bias
            .forward(wave_encoding.view())
            .mean_axis(Axis(0))
            .ok_or_else(|| MaeError::Shape("No bands to embed".to_string()))?;

        let (batch, num_patches, _) = patches.dim();
        let mut embeddings = Array3::<f32>::zeros((batch, num_patches, self.embed_dim));
        for (b, mut out) in embeddings.outer_iter_mut().enumerate() {
            let mut projected = patches.index_axis(Axis(0), b).dot(&kernels);
            projected += &bias;
            out.assign(&projected);
        }

        log::debug!(
            "Encoded {} bands into {} patches of width {}",
            channels,
            num_patches,
            self.embed_dim
        );
        Ok((embeddings, wave_encoding))
    }

    fn decode(&self, tokens: ArrayView3<f32>, waves: ArrayView1<f32>) -> MaeResult<(Array3<f32>, Array2<f32>)> {
        let (batch, num_tokens, width) = tokens.dim();
        if width != self.embed_dim {
            return Err(MaeError::Shape(format!(
                "Token width {} does not match projector width {}",
                width, self.embed_dim
            )));
        }

        let wave_encoding = self.encode_waves(waves);
        let kernels_t = self.band_kernels(&wave_encoding)?.reversed_axes();
        let bias = self.decode_bias.forward(wave_encoding.view());
        let bias = bias.into_shape(waves.len() * self.patch_size * self.patch_size)?;

        let mut pixels = Array3::<f32>::zeros((batch, num_tokens, kernels_t.ncols()));
        for (b, mut out) in pixels.outer_iter_mut().enumerate() {
            let mut projected = tokens.index_axis(Axis(0), b).dot(&kernels_t);
            projected += &bias;
            out.assign(&projected);
        }

        Ok((pixels, wave_encoding))
    }

    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn embed_dim(&self) -> usize {
        self.embed_dim
    }
}
