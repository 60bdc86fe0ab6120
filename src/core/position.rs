use crate::core::metadata::{encode_metadata, MetadataFlags};
use crate::types::{MaeError, MaeResult, METADATA_WIDTH};
use ndarray::{s, Array2, Array3, ArrayView2};

/// Produces a fixed positional vector for every patch of a grid
pub trait SpatialPositionEncoder: Send + Sync {
    /// Position matrix of shape [grid_height * grid_width, width], row-major over the grid
    fn positions(
        &self,
        grid_height: usize,
        grid_width: usize,
        width: usize,
        gsd: f32,
    ) -> MaeResult<Array2<f32>>;
}

/// 2D sine/cosine position encoding scaled by ground sample distance
#[derive(Debug, Clone)]
pub struct SincosPositionEncoder {
    pub temperature: f32,
}

impl SincosPositionEncoder {
    pub fn new(temperature: f32) -> Self {
        Self { temperature }
    }
}

impl Default for SincosPositionEncoder {
    fn default() -> Self {
        Self::new(10_000.0)
    }
}

impl SpatialPositionEncoder for SincosPositionEncoder {
    fn positions(
        &self,
        grid_height: usize,
        grid_width: usize,
        width: usize,
        gsd: f32,
    ) -> MaeResult<Array2<f32>> {
        if width == 0 || width % 4 != 0 {
            return Err(MaeError::Config(format!(
                "Position encoding width must be a positive multiple of 4, got {}",
                width
            )));
        }

        let quarter = width / 4;
        let denom = (quarter.max(2) - 1) as f32;
        let omega: Vec<f32> = (0..quarter)
            .map(|k| {
                let exponent = 2.0 * (k as f32 / denom) / width as f32;
                gsd / self.temperature.powf(exponent)
            })
            .collect();

        let mut pe = Array2::<f32>::zeros((grid_height * grid_width, width));
        for row in 0..grid_height {
            for col in 0..grid_width {
                let idx = row * grid_width + col;
                for (k, &w) in omega.iter().enumerate() {
                    let x = col as f32 * w;
                    let y = row as f32 * w;
                    pe[[idx, k]] = x.sin();
                    pe[[idx, quarter + k]] = x.cos();
                    pe[[idx, 2 * quarter + k]] = y.sin();
                    pe[[idx, 3 * quarter + k]] = y.cos();
                }
            }
        }

        Ok(pe)
    }
}

/// Combined position + metadata encoding broadcast to [B, L, dim].
///
/// The first `dim - 8` channels hold the spatial encoding, the last 8 the
/// per-sample metadata, whatever the model width.
pub fn spatiotemporal_encoding(
    encoder: &dyn SpatialPositionEncoder,
    grid_size: usize,
    dim: usize,
    gsd: f32,
    time: ArrayView2<f32>,
    latlon: ArrayView2<f32>,
    flags: MetadataFlags,
) -> MaeResult<Array3<f32>> {
    if dim <= METADATA_WIDTH {
        return Err(MaeError::Config(format!(
            "Embedding width {} leaves no room for position encoding (needs > {})",
            dim, METADATA_WIDTH
        )));
    }

    let spatial_width = dim - METADATA_WIDTH;
    let positions = encoder.positions(grid_size, grid_size, spatial_width, gsd)?;
    let metadata = encode_metadata(time, latlon, flags)?;

    let batch = metadata.nrows();
    let num_patches = grid_size * grid_size;
    let mut encoding = Array3::<f32>::zeros((batch, num_patches, dim));

    for (b, mut sample) in encoding.outer_iter_mut().enumerate() {
        sample.slice_mut(s![.., ..spatial_width]).assign(&positions);
        sample
            .slice_mut(s![.., spatial_width..])
            .assign(&metadata.row(b).broadcast((num_patches, METADATA_WIDTH)).ok_or_else(|| {
                MaeError::Shape("metadata row could not be broadcast across patches".to_string())
            })?);
    }

    Ok(encoding)
}
