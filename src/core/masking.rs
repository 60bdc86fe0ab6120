use crate::types::{IndexBatch, MaeError, MaeResult, TokenBatch};
use ndarray::{s, Array2, Array3, ArrayView3};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

/// Source of patch ordering for a masking pass
pub enum MaskingMode<'a> {
    /// Independent random shuffle per sample (training)
    Random(&'a mut dyn RngCore),
    /// Identity ordering: the first patches are always the masked ones (evaluation)
    Sequential,
}

impl std::fmt::Debug for MaskingMode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaskingMode::Random(_) => write!(f, "Random"),
            MaskingMode::Sequential => write!(f, "Sequential"),
        }
    }
}

/// Per-sample split of patch indices into masked and visible sets
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    /// Permutation sorting the scores, [B, L]
    pub shuffle: IndexBatch,
    /// Inverse of `shuffle`, [B, L]
    pub restore: IndexBatch,
    /// Hidden patch indices, [B, num_masked]
    pub masked: IndexBatch,
    /// Visible patch indices, [B, L - num_masked]
    pub unmasked: IndexBatch,
    /// 1.0 where the patch is hidden, in grid order, [B, L]
    pub dense: Array2<f32>,
}

impl Mask {
    pub fn batch_size(&self) -> usize {
        self.dense.nrows()
    }

    pub fn num_patches(&self) -> usize {
        self.dense.ncols()
    }

    pub fn num_masked(&self) -> usize {
        self.masked.ncols()
    }

    pub fn num_unmasked(&self) -> usize {
        self.unmasked.ncols()
    }

    /// Gather the visible rows of each sample, [B, L, D] -> [B, L - num_masked, D]
    pub fn keep_unmasked(&self, patches: ArrayView3<f32>) -> MaeResult<TokenBatch> {
        let (batch, num_patches, width) = patches.dim();
        if (batch, num_patches) != self.dense.dim() {
            return Err(MaeError::Shape(format!(
                "Mask covers {:?} patches but got [{}, {}]",
                self.dense.dim(),
                batch,
                num_patches
            )));
        }

        let mut kept = Array3::<f32>::zeros((batch, self.num_unmasked(), width));
        for b in 0..batch {
            for (slot, &idx) in self.unmasked.row(b).iter().enumerate() {
                kept.slice_mut(s![b, slot, ..]).assign(&patches.slice(s![b, idx, ..]));
            }
        }
        Ok(kept)
    }
}

/// Chooses which patches the encoder never sees
#[derive(Debug, Clone)]
pub struct MaskingEngine {
    mask_ratio: f32,
}

impl MaskingEngine {
    pub fn new(mask_ratio: f32) -> MaeResult<Self> {
        if !(0.0..1.0).contains(&mask_ratio) {
            return Err(MaeError::Config(format!(
                "Mask ratio must be in [0, 1), got {}",
                mask_ratio
            )));
        }
        Ok(Self { mask_ratio })
    }

    /// Engine that hides nothing, for embedding extraction
    pub fn disabled() -> Self {
        Self { mask_ratio: 0.0 }
    }

    pub fn mask_ratio(&self) -> f32 {
        self.mask_ratio
    }

    /// Number of hidden patches out of `num_patches`; the product is truncated
    pub fn num_masked(&self, num_patches: usize) -> usize {
        (self.mask_ratio * num_patches as f32) as usize
    }

    /// Build a mask for `batch` samples of `num_patches` patches
    pub fn mask(&self, batch: usize, num_patches: usize, mode: MaskingMode<'_>) -> Mask {
        let num_masked = self.num_masked(num_patches);
        log::debug!(
            "Masking {} of {} patches per sample ({:?})",
            num_masked,
            num_patches,
            mode
        );

        let shuffle = match mode {
            MaskingMode::Random(rng) => {
                let mut shuffle = Array2::<usize>::zeros((batch, num_patches));
                for mut row in shuffle.outer_iter_mut() {
                    let scores: Vec<f32> = (0..num_patches).map(|_| StandardNormal.sample(&mut *rng)).collect();
                    let order = argsort(&scores);
                    for (slot, idx) in order.into_iter().enumerate() {
                        row[slot] = idx;
                    }
                }
                shuffle
            }
            MaskingMode::Sequential => Array2::from_shape_fn((batch, num_patches), |(_, l)| l),
        };

        let mut restore = Array2::<usize>::zeros((batch, num_patches));
        let mut dense = Array2::<f32>::zeros((batch, num_patches));
        for b in 0..batch {
            for (rank, &idx) in shuffle.row(b).iter().enumerate() {
                restore[[b, idx]] = rank;
                if rank < num_masked {
                    dense[[b, idx]] = 1.0;
                }
            }
        }

        Mask {
            masked: shuffle.slice(s![.., ..num_masked]).to_owned(),
            unmasked: shuffle.slice(s![.., num_masked..]).to_owned(),
            shuffle,
            restore,
            dense,
        }
    }
}

/// Indices that sort `scores` ascending
fn argsort(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    order
}
