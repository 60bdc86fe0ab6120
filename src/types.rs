use chrono::{DateTime, Datelike, Timelike, Utc};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView4, Axis};

/// Pixel element type
pub type Pixel = f32;

/// Raw pixel batch (batch x channels x height x width)
pub type PixelCube = Array4<Pixel>;

/// Per-sample token sequences (batch x tokens x width)
pub type TokenBatch = Array3<f32>;

/// Per-sample patch index lists (batch x count)
pub type IndexBatch = Array2<usize>;

/// Width of the spatiotemporal metadata block appended to every position encoding
pub const METADATA_WIDTH: usize = 8;

/// A batch of multi-band rasters with their acquisition metadata.
///
/// Fields are only reachable through [`Datacube::new`], so every instance
/// agrees on its batch size.
#[derive(Debug, Clone)]
pub struct Datacube {
    /// Pixel values [B, C, H, W]
    pixels: PixelCube,
    /// Acquisition time [B, 2] as (hour of day, week of year)
    time: Array2<f32>,
    /// Scene centre [B, 2] as (latitude, longitude) in degrees
    latlon: Array2<f32>,
    /// Ground sample distance per sample [B]
    gsd: Array1<f32>,
    /// Band centre wavelengths per sample [B, C]
    waves: Array2<f32>,
}

impl Datacube {
    /// Assemble a datacube, checking that every field agrees on the batch size
    /// and that each wavelength row covers every channel.
    pub fn new(
        pixels: PixelCube,
        time: Array2<f32>,
        latlon: Array2<f32>,
        gsd: Array1<f32>,
        waves: Array2<f32>,
    ) -> MaeResult<Self> {
        let (batch, channels, _, _) = pixels.dim();

        if batch == 0 {
            return Err(MaeError::Shape("Datacube must contain at least one sample".to_string()));
        }
        if time.dim() != (batch, 2) {
            return Err(MaeError::Shape(format!(
                "time must be [{}, 2], got {:?}",
                batch,
                time.shape()
            )));
        }
        if latlon.dim() != (batch, 2) {
            return Err(MaeError::Shape(format!(
                "latlon must be [{}, 2], got {:?}",
                batch,
                latlon.shape()
            )));
        }
        if gsd.len() != batch {
            return Err(MaeError::Shape(format!(
                "gsd must have {} entries, got {}",
                batch,
                gsd.len()
            )));
        }
        if waves.dim() != (batch, channels) {
            return Err(MaeError::Shape(format!(
                "waves must be [{}, {}], got {:?}",
                batch,
                channels,
                waves.shape()
            )));
        }

        let cube = Self { pixels, time, latlon, gsd, waves };
        cube.warn_if_heterogeneous();
        Ok(cube)
    }

    pub fn pixels(&self) -> ArrayView4<'_, f32> {
        self.pixels.view()
    }

    pub fn time(&self) -> ArrayView2<'_, f32> {
        self.time.view()
    }

    pub fn latlon(&self) -> ArrayView2<'_, f32> {
        self.latlon.view()
    }

    pub fn gsd(&self) -> ArrayView1<'_, f32> {
        self.gsd.view()
    }

    pub fn waves(&self) -> ArrayView2<'_, f32> {
        self.waves.view()
    }

    pub fn batch_size(&self) -> usize {
        self.pixels.len_of(Axis(0))
    }

    pub fn channels(&self) -> usize {
        self.pixels.len_of(Axis(1))
    }

    /// Ground sample distance shared by the batch (first sample)
    pub fn shared_gsd(&self) -> f32 {
        self.gsd[0]
    }

    /// Wavelengths shared by the batch (first sample)
    pub fn shared_waves(&self) -> ArrayView1<'_, f32> {
        self.waves.row(0)
    }

    /// Only the first sample's gsd and wavelengths are consulted; say so when
    /// the rest of the batch disagrees.
    fn warn_if_heterogeneous(&self) {
        let gsd0 = self.gsd[0];
        if self.gsd.iter().any(|&g| g != gsd0) {
            log::warn!("Batch has differing gsd values; using {} from the first sample", gsd0);
        }
        let waves0 = self.waves.row(0);
        if self.waves.outer_iter().any(|row| row != waves0) {
            log::warn!("Batch has differing wavelength rows; using the first sample's");
        }
    }
}

/// Convert an acquisition timestamp into (hour of day, week of year) features.
///
/// Hour keeps its fractional minutes; week is zero-based and capped at 51 so the
/// last partial week of the year folds into the previous one.
pub fn time_features(timestamp: &DateTime<Utc>) -> [f32; 2] {
    let hour = timestamp.hour() as f32 + timestamp.minute() as f32 / 60.0;
    let week = (timestamp.ordinal0() / 7).min(51) as f32;
    [hour, week]
}

/// Error types for masked-autoencoder operations
#[derive(Debug, thiserror::Error)]
pub enum MaeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Non-finite values: {0}")]
    NonFinite(String),

    #[error("Array error: {0}")]
    Array(#[from] ndarray::ShapeError),
}

/// Result type for masked-autoencoder operations
pub type MaeResult<T> = Result<T, MaeError>;
