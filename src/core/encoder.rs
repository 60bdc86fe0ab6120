use crate::core::layers::randn_vector;
use crate::core::masking::{Mask, MaskingEngine, MaskingMode};
use crate::core::metadata::MetadataFlags;
use crate::core::patch::{grid_dims, PatchProjector};
use crate::core::position::{spatiotemporal_encoding, SpatialPositionEncoder};
use crate::core::transformer::Transformer;
use crate::types::{Datacube, MaeError, MaeResult, TokenBatch};
use ndarray::{s, Array1, Array3, Axis};

/// Encoder output: the summary token followed by the visible patches, plus the mask used
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// [B, 1 + visible, D]
    pub encoded: TokenBatch,
    pub mask: Mask,
}

/// Embeds the visible patches of a datacube
pub struct Encoder {
    /// Learned summary token [D]
    pub cls_token: Array1<f32>,
    pub patch_projector: Box<dyn PatchProjector>,
    pub position_encoder: Box<dyn SpatialPositionEncoder>,
    pub transformer: Transformer,
    pub metadata_flags: MetadataFlags,
    dim: usize,
}

impl Encoder {
    pub fn new<R: rand::Rng + ?Sized>(
        patch_projector: Box<dyn PatchProjector>,
        position_encoder: Box<dyn SpatialPositionEncoder>,
        transformer: Transformer,
        metadata_flags: MetadataFlags,
        rng: &mut R,
    ) -> MaeResult<Self> {
        let dim = transformer.dim();
        if patch_projector.embed_dim() != dim {
            return Err(MaeError::Config(format!(
                "Projector width {} does not match encoder width {}",
                patch_projector.embed_dim(),
                dim
            )));
        }

        Ok(Self {
            cls_token: randn_vector(dim, 0.02, rng),
            patch_projector,
            position_encoder,
            transformer,
            metadata_flags,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn patch_size(&self) -> usize {
        self.patch_projector.patch_size()
    }

    /// Patch embeddings with position and metadata added, [B, L, D]
    pub fn embed_patches(&self, datacube: &Datacube) -> MaeResult<TokenBatch> {
        let (_, _, height, width) = datacube.pixels().dim();
        let (grid, _) = grid_dims(height, width, self.patch_size())?;

        let (patches, _) = self
            .patch_projector
            .encode(datacube.pixels(), datacube.shared_waves())?;

        let encoding = spatiotemporal_encoding(
            self.position_encoder.as_ref(),
            grid,
            self.dim,
            datacube.shared_gsd(),
            datacube.time(),
            datacube.latlon(),
            self.metadata_flags,
        )?;

        Ok(patches + &encoding)
    }

    /// Encode a datacube, hiding the patches chosen by `masking`
    pub fn forward(
        &self,
        datacube: &Datacube,
        masking: &MaskingEngine,
        mode: MaskingMode<'_>,
    ) -> MaeResult<EncoderOutput> {
        let patches = self.embed_patches(datacube)?;
        let (batch, num_patches, _) = patches.dim();

        let mask = masking.mask(batch, num_patches, mode);
        let visible = mask.keep_unmasked(patches.view())?;

        let mut tokens = Array3::<f32>::zeros((batch, 1 + mask.num_unmasked(), self.dim));
        for (b, mut sample) in tokens.axis_iter_mut(Axis(0)).enumerate() {
            sample.row_mut(0).assign(&self.cls_token);
            sample.slice_mut(s![1.., ..]).assign(&visible.index_axis(Axis(0), b));
        }

        log::debug!(
            "Encoder running on {} tokens per sample ({} of {} patches visible)",
            tokens.len_of(Axis(1)),
            mask.num_unmasked(),
            num_patches
        );

        let encoded = self.transformer.forward(&tokens)?;
        Ok(EncoderOutput { encoded, mask })
    }
}
