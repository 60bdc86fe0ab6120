use crate::core::decoder::Decoder;
use crate::core::encoder::{Encoder, EncoderOutput};
use crate::core::loss::reconstruction_loss;
use crate::core::masking::{Mask, MaskingEngine, MaskingMode};
use crate::core::metadata::MetadataFlags;
use crate::core::patch::{square_grid, ProjectorParams, WavelengthProjector};
use crate::core::position::SincosPositionEncoder;
use crate::core::transformer::{Transformer, TransformerParams};
use crate::types::{Datacube, MaeError, MaeResult, TokenBatch, METADATA_WIDTH};
use ndarray::{s, Array2, Array4, ArrayBase, Axis, Data, Dimension};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Registered model sizes
const MODEL_SIZES: &[&str] = &["tiny"];

/// Encoder and decoder transformer layouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArchitecture {
    pub encoder: TransformerParams,
    pub decoder: TransformerParams,
}

impl ModelArchitecture {
    /// Look up a registered model size
    pub fn for_size(name: &str) -> MaeResult<Self> {
        match name {
            "tiny" => Ok(Self::tiny()),
            _ => Err(MaeError::Config(format!(
                "Invalid model size {}. Expected one of {:?}",
                name, MODEL_SIZES
            ))),
        }
    }

    pub fn tiny() -> Self {
        Self {
            encoder: TransformerParams {
                dim: 192,
                depth: 4,
                heads: 4,
                dim_head: 48,
                mlp_ratio: 2.0,
            },
            decoder: TransformerParams {
                dim: 96,
                depth: 2,
                heads: 2,
                dim_head: 48,
                mlp_ratio: 2.0,
            },
        }
    }

    pub fn registered_sizes() -> &'static [&'static str] {
        MODEL_SIZES
    }

    pub fn validate(&self) -> MaeResult<()> {
        for (name, params) in [("encoder", &self.encoder), ("decoder", &self.decoder)] {
            params.validate(name)?;
            if params.dim < METADATA_WIDTH + 4 || (params.dim - METADATA_WIDTH) % 4 != 0 {
                return Err(MaeError::Config(format!(
                    "{} width {} must be at least {} and leave a multiple of 4 after the {} metadata channels",
                    name,
                    params.dim,
                    METADATA_WIDTH + 4,
                    METADATA_WIDTH
                )));
            }
        }
        Ok(())
    }
}

/// Masked-autoencoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaeConfig {
    /// Registered size name, see [`ModelArchitecture::for_size`]
    pub model_size: String,
    /// Fraction of patches hidden from the encoder
    pub mask_ratio: f32,
    /// Normalise target patches before computing the loss
    pub norm_pix_loss: bool,
    /// Patch side in pixels
    pub patch_size: usize,
    pub metadata: MetadataFlags,
    pub projector: ProjectorParams,
    /// Position encoding temperature
    pub temperature: f32,
}

impl Default for MaeConfig {
    fn default() -> Self {
        Self {
            model_size: "tiny".to_string(),
            mask_ratio: 0.75,
            norm_pix_loss: false,
            patch_size: 16,
            metadata: MetadataFlags::default(),
            projector: ProjectorParams::default(),
            temperature: 10_000.0,
        }
    }
}

impl MaeConfig {
    pub fn validate(&self) -> MaeResult<()> {
        if !(self.mask_ratio > 0.0 && self.mask_ratio < 1.0) {
            return Err(MaeError::Config(format!(
                "Mask ratio must be in (0, 1) for training, got {}",
                self.mask_ratio
            )));
        }
        if self.patch_size == 0 {
            return Err(MaeError::Config("Patch size must be positive".to_string()));
        }
        if !(self.temperature > 0.0) {
            return Err(MaeError::Config(format!(
                "Position temperature must be positive, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Granularity of embeddings returned by [`MaskedAutoencoder::embed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingLevel {
    /// The summary token, [B, D]
    Summary,
    /// Mean over patch tokens, [B, D].
    ///
    /// The summary token is excluded from the average.
    Mean,
    /// Patch tokens on their grid, [B, g, g, D]
    Patch,
}

/// Pooled scene embeddings
#[derive(Debug, Clone, PartialEq)]
pub enum Embeddings {
    Scene(Array2<f32>),
    Patches(Array4<f32>),
}

/// Everything a training step produces
#[derive(Debug, Clone)]
pub struct MaeOutput {
    pub loss: f32,
    /// Reconstructed patches [B, L, C*P*P]
    pub reconstruction: TokenBatch,
    pub mask: Mask,
}

/// Encoder, decoder and masked reconstruction loss
pub struct MaskedAutoencoder {
    config: MaeConfig,
    architecture: ModelArchitecture,
    masking: MaskingEngine,
    pub encoder: Encoder,
    pub decoder: Decoder,
}

impl MaskedAutoencoder {
    /// Build a model for the registered size named in `config`
    pub fn new<R: Rng + ?Sized>(config: MaeConfig, rng: &mut R) -> MaeResult<Self> {
        let architecture = ModelArchitecture::for_size(&config.model_size)?;
        Self::with_architecture(config, architecture, rng)
    }

    /// Build a model with an explicit architecture, bypassing the size registry
    pub fn with_architecture<R: Rng + ?Sized>(
        config: MaeConfig,
        architecture: ModelArchitecture,
        rng: &mut R,
    ) -> MaeResult<Self> {
        config.validate()?;
        architecture.validate()?;

        log::info!(
            "Building masked autoencoder: size={}, encoder dim={} depth={}, decoder dim={} depth={}, patch={}, mask_ratio={}",
            config.model_size,
            architecture.encoder.dim,
            architecture.encoder.depth,
            architecture.decoder.dim,
            architecture.decoder.depth,
            config.patch_size,
            config.mask_ratio
        );

        let encoder = Encoder::new(
            Box::new(WavelengthProjector::new(
                &config.projector,
                config.patch_size,
                architecture.encoder.dim,
                rng,
            )?),
            Box::new(SincosPositionEncoder::new(config.temperature)),
            Transformer::new(&architecture.encoder, rng),
            config.metadata,
            rng,
        )?;

        let decoder = Decoder::new(
            architecture.encoder.dim,
            Transformer::new(&architecture.decoder, rng),
            Box::new(WavelengthProjector::new(
                &config.projector,
                config.patch_size,
                architecture.decoder.dim,
                rng,
            )?),
            Box::new(SincosPositionEncoder::new(config.temperature)),
            config.metadata,
            rng,
        )?;

        Ok(Self {
            masking: MaskingEngine::new(config.mask_ratio)?,
            config,
            architecture,
            encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &MaeConfig {
        &self.config
    }

    pub fn architecture(&self) -> &ModelArchitecture {
        &self.architecture
    }

    /// Scalar reconstruction loss for a batch
    pub fn forward(&self, datacube: &Datacube, mode: MaskingMode<'_>) -> MaeResult<f32> {
        Ok(self.forward_detailed(datacube, mode)?.loss)
    }

    /// Loss together with the reconstruction and the mask that produced it
    pub fn forward_detailed(&self, datacube: &Datacube, mode: MaskingMode<'_>) -> MaeResult<MaeOutput> {
        let (_, _, height, width) = datacube.pixels().dim();
        let num_patches = (height / self.config.patch_size) * (width / self.config.patch_size);
        if self.masking.num_masked(num_patches) == 0 {
            return Err(MaeError::Config(format!(
                "Mask ratio {} hides no patches out of {}",
                self.masking.mask_ratio(),
                num_patches
            )));
        }

        log::info!("Forward pass on batch of {} ({:?} masking)", datacube.batch_size(), mode);

        let EncoderOutput { encoded, mask } = self.encoder.forward(datacube, &self.masking, mode)?;

        let (reconstruction, _) = self.decoder.forward(
            &encoded,
            &mask,
            datacube.time(),
            datacube.latlon(),
            datacube.shared_gsd(),
            datacube.shared_waves(),
        )?;

        let loss = reconstruction_loss(
            datacube.pixels(),
            reconstruction.view(),
            mask.dense.view(),
            self.config.patch_size,
            self.config.norm_pix_loss,
        )?;

        log::info!("Reconstruction loss: {:.6}", loss);
        Ok(MaeOutput { loss, reconstruction, mask })
    }

    /// Encoder output for every patch, [B, 1 + L, D], with masking disabled
    pub fn encode_all(&self, datacube: &Datacube) -> MaeResult<TokenBatch> {
        let output = self
            .encoder
            .forward(datacube, &MaskingEngine::disabled(), MaskingMode::Sequential)?;
        Ok(output.encoded)
    }

    /// Scene embeddings pooled at the requested level.
    ///
    /// Finiteness is not checked here; see [`ensure_finite`].
    pub fn embed(&self, datacube: &Datacube, level: EmbeddingLevel) -> MaeResult<Embeddings> {
        let encoded = self.encode_all(datacube)?;
        let patches = encoded.slice(s![.., 1.., ..]);
        let (batch, num_patches, dim) = patches.dim();

        let embeddings = match level {
            EmbeddingLevel::Summary => Embeddings::Scene(encoded.slice(s![.., 0, ..]).to_owned()),
            EmbeddingLevel::Mean => Embeddings::Scene(
                patches
                    .mean_axis(Axis(1))
                    .ok_or_else(|| MaeError::Shape("No patch tokens to average".to_string()))?,
            ),
            EmbeddingLevel::Patch => {
                let grid = square_grid(num_patches)?;
                Embeddings::Patches(patches.to_owned().into_shape((batch, grid, grid, dim))?)
            }
        };

        log::debug!("Produced {:?} embeddings for {} samples", level, batch);
        Ok(embeddings)
    }
}

/// Fail if any value is NaN or infinite.
///
/// The forward path never checks this itself.
pub fn ensure_finite<S, D>(values: &ArrayBase<S, D>) -> MaeResult<()>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let bad = values.iter().filter(|v| !v.is_finite()).count();
    if bad > 0 {
        return Err(MaeError::NonFinite(format!(
            "{} of {} values are NaN or infinite",
            bad,
            values.len()
        )));
    }
    Ok(())
}
