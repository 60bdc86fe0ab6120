use crate::core::layers::{randn_vector, Linear};
use crate::core::masking::Mask;
use crate::core::metadata::MetadataFlags;
use crate::core::patch::{square_grid, PatchProjector};
use crate::core::position::{spatiotemporal_encoding, SpatialPositionEncoder};
use crate::core::transformer::Transformer;
use crate::types::{MaeError, MaeResult, TokenBatch};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::Rng;

/// Rebuilds full patch sequences from encoder output and projects them back to pixels
pub struct Decoder {
    /// Encoder width -> decoder width; `None` when the widths match
    pub enc_to_dec: Option<Linear>,
    /// Learned placeholder for hidden patches [D]
    pub mask_token: Array1<f32>,
    pub transformer: Transformer,
    pub pixel_projector: Box<dyn PatchProjector>,
    pub position_encoder: Box<dyn SpatialPositionEncoder>,
    pub metadata_flags: MetadataFlags,
    dim: usize,
}

impl Decoder {
    pub fn new<R: Rng + ?Sized>(
        encoder_dim: usize,
        transformer: Transformer,
        pixel_projector: Box<dyn PatchProjector>,
        position_encoder: Box<dyn SpatialPositionEncoder>,
        metadata_flags: MetadataFlags,
        rng: &mut R,
    ) -> MaeResult<Self> {
        let dim = transformer.dim();
        if pixel_projector.embed_dim() != dim {
            return Err(MaeError::Config(format!(
                "Projector width {} does not match decoder width {}",
                pixel_projector.embed_dim(),
                dim
            )));
        }

        let enc_to_dec = if encoder_dim != dim {
            Some(Linear::new(encoder_dim, dim, true, rng))
        } else {
            None
        };

        Ok(Self {
            enc_to_dec,
            mask_token: randn_vector(dim, 1.0, rng),
            transformer,
            pixel_projector,
            position_encoder,
            metadata_flags,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn project_to_decoder(&self, encoded: &TokenBatch) -> TokenBatch {
        match &self.enc_to_dec {
            Some(linear) => {
                let (batch, tokens, _) = encoded.dim();
                let mut projected = Array3::<f32>::zeros((batch, tokens, self.dim));
                for (mut out, sample) in projected.outer_iter_mut().zip(encoded.outer_iter()) {
                    out.assign(&linear.forward(sample));
                }
                projected
            }
            None => encoded.clone(),
        }
    }

    /// Summary token followed by all L patches in grid order, position encoded, [B, 1 + L, D]
    pub fn reconstruct_sequence(
        &self,
        encoded: &TokenBatch,
        mask: &Mask,
        time: ArrayView2<f32>,
        latlon: ArrayView2<f32>,
        gsd: f32,
    ) -> MaeResult<TokenBatch> {
        let projected = self.project_to_decoder(encoded);
        let (batch, tokens, _) = projected.dim();
        let num_patches = mask.num_patches();

        if batch != mask.batch_size() || tokens != 1 + mask.num_unmasked() {
            return Err(MaeError::Shape(format!(
                "Encoder output [{}, {}] does not match mask of {} visible patches over {} samples",
                batch,
                tokens,
                mask.num_unmasked(),
                mask.batch_size()
            )));
        }
        if time.nrows() != batch || latlon.nrows() != batch {
            return Err(MaeError::Shape(format!(
                "Metadata rows (time {}, latlon {}) do not match batch of {}",
                time.nrows(),
                latlon.nrows(),
                batch
            )));
        }

        let grid = square_grid(num_patches)?;
        let encoding = spatiotemporal_encoding(
            self.position_encoder.as_ref(),
            grid,
            self.dim,
            gsd,
            time,
            latlon,
            self.metadata_flags,
        )?;

        let mut sequence = Array3::<f32>::zeros((batch, 1 + num_patches, self.dim));
        for b in 0..batch {
            sequence.slice_mut(s![b, 0, ..]).assign(&projected.slice(s![b, 0, ..]));

            for (slot, &idx) in mask.unmasked.row(b).iter().enumerate() {
                let token = &projected.slice(s![b, 1 + slot, ..]) + &encoding.slice(s![b, idx, ..]);
                sequence.slice_mut(s![b, 1 + idx, ..]).assign(&token);
            }
            for &idx in mask.masked.row(b) {
                let token = &self.mask_token + &encoding.slice(s![b, idx, ..]);
                sequence.slice_mut(s![b, 1 + idx, ..]).assign(&token);
            }
        }

        Ok(sequence)
    }

    /// Decode to per-patch pixels [B, L, C*P*P]; also returns the wavelength encoding
    pub fn forward(
        &self,
        encoded: &TokenBatch,
        mask: &Mask,
        time: ArrayView2<f32>,
        latlon: ArrayView2<f32>,
        gsd: f32,
        waves: ArrayView1<f32>,
    ) -> MaeResult<(TokenBatch, Array2<f32>)> {
        let sequence = self.reconstruct_sequence(encoded, mask, time, latlon, gsd)?;
        log::debug!("Decoder running on {} tokens per sample", sequence.len_of(Axis(1)));

        let decoded = self.transformer.forward(&sequence)?;
        let (pixels, wave_encoding) = self.pixel_projector.decode(decoded.view(), waves)?;

        // Drop the summary token's reconstruction
        let pixels = pixels.slice(s![.., 1.., ..]).to_owned();
        Ok((pixels, wave_encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::masking::{MaskingEngine, MaskingMode};
    use crate::core::patch::{ProjectorParams, WavelengthProjector};
    use crate::core::position::SincosPositionEncoder;
    use crate::core::transformer::TransformerParams;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_decoder(encoder_dim: usize, dim: usize, rng: &mut StdRng) -> Decoder {
        let params = TransformerParams { dim, depth: 1, heads: 2, dim_head: 4, mlp_ratio: 2.0 };
        let projector = WavelengthProjector::new(
            &ProjectorParams { wave_dim: 8, num_latent_tokens: 2 },
            2,
            dim,
            rng,
        )
        .unwrap();
        let transformer = Transformer::new(&params, rng);
        Decoder::new(
            encoder_dim,
            transformer,
            Box::new(projector),
            Box::new(SincosPositionEncoder::default()),
            MetadataFlags::reference(),
            rng,
        )
        .unwrap()
    }

    #[test]
    fn test_identity_projection_when_widths_match() {
        let mut rng = StdRng::seed_from_u64(31);
        assert!(small_decoder(16, 16, &mut rng).enc_to_dec.is_none());
        assert!(small_decoder(24, 16, &mut rng).enc_to_dec.is_some());
    }

    #[test]
    fn test_sequence_scatters_visible_and_placeholder_tokens() {
        let mut rng = StdRng::seed_from_u64(32);
        let decoder = small_decoder(12, 12, &mut rng);
        let mask = MaskingEngine::new(0.5).unwrap().mask(1, 4, MaskingMode::Sequential);

        // Summary token then visible patches 2 and 3
        let encoded = Array3::from_shape_fn((1, 3, 12), |(_, n, _)| (n + 1) as f32 * 10.0);
        let time = array![[0.0f32, 0.0]];
        let latlon = array![[0.0f32, 0.0]];
        let sequence = decoder
            .reconstruct_sequence(&encoded, &mask, time.view(), latlon.view(), 1.0)
            .unwrap();
        assert_eq!(sequence.dim(), (1, 5, 12));

        let encoding = spatiotemporal_encoding(
            &SincosPositionEncoder::default(),
            2,
            12,
            1.0,
            time.view(),
            latlon.view(),
            MetadataFlags::reference(),
        )
        .unwrap();

        // Summary token passes through untouched
        assert!(sequence.slice(s![0, 0, ..]).iter().all(|&v| v == 10.0));
        for d in 0..12 {
            // Hidden patches 0 and 1 carry the placeholder
            assert_abs_diff_eq!(sequence[[0, 1, d]], decoder.mask_token[d] + encoding[[0, 0, d]], epsilon = 1e-6);
            assert_abs_diff_eq!(sequence[[0, 2, d]], decoder.mask_token[d] + encoding[[0, 1, d]], epsilon = 1e-6);
            // Visible patches 2 and 3 come from encoder slots 1 and 2
            assert_abs_diff_eq!(sequence[[0, 3, d]], 20.0 + encoding[[0, 2, d]], epsilon = 1e-6);
            assert_abs_diff_eq!(sequence[[0, 4, d]], 30.0 + encoding[[0, 3, d]], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_forward_returns_one_reconstruction_per_patch() {
        let mut rng = StdRng::seed_from_u64(33);
        let decoder = small_decoder(20, 12, &mut rng);
        let mask = MaskingEngine::new(0.75)
            .unwrap()
            .mask(2, 16, MaskingMode::Random(&mut rng));
        let encoded = Array3::<f32>::ones((2, 1 + mask.num_unmasked(), 20));
        let time = Array2::<f32>::zeros((2, 2));
        let latlon = Array2::<f32>::zeros((2, 2));
        let waves = array![0.45f32, 0.55, 0.65];

        let (pixels, wave_encoding) = decoder
            .forward(&encoded, &mask, time.view(), latlon.view(), 10.0, waves.view())
            .unwrap();
        assert_eq!(pixels.dim(), (2, 16, 3 * 2 * 2));
        assert_eq!(wave_encoding.dim(), (3, 8));
    }

    #[test]
    fn test_rejects_mismatched_encoder_output() {
        let mut rng = StdRng::seed_from_u64(34);
        let decoder = small_decoder(12, 12, &mut rng);
        let mask = MaskingEngine::new(0.5).unwrap().mask(1, 4, MaskingMode::Sequential);
        let encoded = Array3::<f32>::zeros((1, 4, 12));
        let time = array![[0.0f32, 0.0]];
        let latlon = array![[0.0f32, 0.0]];
        let result = decoder.reconstruct_sequence(&encoded, &mask, time.view(), latlon.view(), 1.0);
        assert!(matches!(result, Err(MaeError::Shape(_))));
    }

    #[test]
    fn test_rejects_metadata_for_smaller_batch() {
        let mut rng = StdRng::seed_from_u64(35);
        let decoder = small_decoder(12, 12, &mut rng);
        let mask = MaskingEngine::new(0.5).unwrap().mask(2, 4, MaskingMode::Sequential);
        let encoded = Array3::<f32>::zeros((2, 3, 12));
        let time = array![[0.0f32, 0.0]];
        let latlon = array![[0.0f32, 0.0]];
        let result = decoder.reconstruct_sequence(&encoded, &mask, time.view(), latlon.view(), 1.0);
        assert!(matches!(result, Err(MaeError::Shape(_))));
    }
}
