use crate::core::layers::{gelu, softmax_rows, LayerNorm, Linear};
use crate::types::{MaeError, MaeResult, TokenBatch};
use ndarray::{s, Array2, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Width, depth and attention layout of one transformer stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerParams {
    pub dim: usize,
    pub depth: usize,
    pub heads: usize,
    pub dim_head: usize,
    /// Hidden width of the feed-forward block as a multiple of `dim`
    pub mlp_ratio: f32,
}

impl TransformerParams {
    pub fn mlp_dim(&self) -> usize {
        (self.dim as f32 * self.mlp_ratio) as usize
    }

    pub fn validate(&self, name: &str) -> MaeResult<()> {
        if self.depth == 0 || self.heads == 0 || self.dim_head == 0 || self.mlp_dim() == 0 {
            return Err(MaeError::Config(format!(
                "{} depth, heads, dim_head and mlp width must be positive: {:?}",
                name, self
            )));
        }
        Ok(())
    }
}

/// Multi-head self-attention with pre-normalisation
#[derive(Debug, Clone)]
pub struct Attention {
    pub norm: LayerNorm,
    pub to_qkv: Linear,
    pub to_out: Linear,
    heads: usize,
    dim_head: usize,
}

impl Attention {
    pub fn new<R: Rng + ?Sized>(dim: usize, heads: usize, dim_head: usize, rng: &mut R) -> Self {
        let inner = heads * dim_head;
        Self {
            norm: LayerNorm::new(dim),
            to_qkv: Linear::new(dim, inner * 3, false, rng),
            to_out: Linear::new(inner, dim, false, rng),
            heads,
            dim_head,
        }
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let normed = self.norm.forward(x);
        let qkv = self.to_qkv.forward(normed.view());
        let inner = self.heads * self.dim_head;
        let scale = (self.dim_head as f32).powf(-0.5);

        let mut merged = Array2::<f32>::zeros((x.nrows(), inner));
        for h in 0..self.heads {
            let cols = h * self.dim_head..(h + 1) * self.dim_head;
            let q = qkv.slice(s![.., cols.clone()]);
            let k = qkv.slice(s![.., inner + cols.start..inner + cols.end]);
            let v = qkv.slice(s![.., 2 * inner + cols.start..2 * inner + cols.end]);

            let mut scores = q.dot(&k.t()) * scale;
            softmax_rows(&mut scores);
            merged.slice_mut(s![.., cols]).assign(&scores.dot(&v));
        }

        self.to_out.forward(merged.view())
    }
}

/// Pre-normalised MLP block
#[derive(Debug, Clone)]
pub struct FeedForward {
    pub norm: LayerNorm,
    pub fc1: Linear,
    pub fc2: Linear,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(dim: usize, hidden: usize, rng: &mut R) -> Self {
        Self {
            norm: LayerNorm::new(dim),
            fc1: Linear::new(dim, hidden, true, rng),
            fc2: Linear::new(hidden, dim, true, rng),
        }
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let normed = self.norm.forward(x);
        let hidden = self.fc1.forward(normed.view()).mapv(gelu);
        self.fc2.forward(hidden.view())
    }
}

/// Stack of residual attention + MLP blocks followed by a final norm
#[derive(Debug, Clone)]
pub struct Transformer {
    pub layers: Vec<(Attention, FeedForward)>,
    pub norm: LayerNorm,
    dim: usize,
}

impl Transformer {
    pub fn new<R: Rng + ?Sized>(params: &TransformerParams, rng: &mut R) -> Self {
        let layers = (0..params.depth)
            .map(|_| {
                let attn = Attention::new(params.dim, params.heads, params.dim_head, rng);
                let ff = FeedForward::new(params.dim, params.mlp_dim(), rng);
                (attn, ff)
            })
            .collect();

        Self {
            layers,
            norm: LayerNorm::new(params.dim),
            dim: params.dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Run one token sequence [N, D]
    pub fn forward_sequence(&self, tokens: ArrayView2<f32>) -> Array2<f32> {
        let mut x = tokens.to_owned();
        for (attn, ff) in &self.layers {
            x = attn.forward(x.view()) + &x;
            x = ff.forward(x.view()) + &x;
        }
        self.norm.forward(x.view())
    }

    /// Run every sample of a [B, N, D] batch independently
    pub fn forward(&self, tokens: &TokenBatch) -> MaeResult<TokenBatch> {
        let (batch, _, width) = tokens.dim();
        if width != self.dim {
            return Err(MaeError::Shape(format!(
                "Transformer expects width {}, got {}",
                self.dim, width
            )));
        }
        if batch == 0 {
            return Ok(tokens.clone());
        }

        let mut output = tokens.clone();

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;

            output
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(tokens.axis_iter(Axis(0)).into_par_iter())
                .for_each(|(mut out, sample)| out.assign(&self.forward_sequence(sample)));
        }

        #[cfg(not(feature = "parallel"))]
        {
            for (mut out, sample) in output.axis_iter_mut(Axis(0)).zip(tokens.axis_iter(Axis(0))) {
                out.assign(&self.forward_sequence(sample));
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params() -> TransformerParams {
        TransformerParams {
            dim: 16,
            depth: 2,
            heads: 2,
            dim_head: 8,
            mlp_ratio: 2.0,
        }
    }

    #[test]
    fn test_forward_preserves_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        let transformer = Transformer::new(&params(), &mut rng);
        let tokens = Array3::from_shape_fn((3, 5, 16), |(b, n, d)| ((b + n + d) as f32).sin());
        let out = transformer.forward(&tokens).unwrap();
        assert_eq!(out.dim(), (3, 5, 16));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_samples_are_independent() {
        let mut rng = StdRng::seed_from_u64(4);
        let transformer = Transformer::new(&params(), &mut rng);
        let mut tokens = Array3::from_shape_fn((2, 4, 16), |(b, n, d)| ((b * 7 + n * 3 + d) as f32).cos());
        let before = transformer.forward(&tokens).unwrap();

        tokens.slice_mut(s![1, .., ..]).fill(0.25);
        let after = transformer.forward(&tokens).unwrap();

        for (a, b) in before.slice(s![0, .., ..]).iter().zip(after.slice(s![0, .., ..]).iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rejects_wrong_width() {
        let mut rng = StdRng::seed_from_u64(5);
        let transformer = Transformer::new(&params(), &mut rng);
        let tokens = Array3::<f32>::zeros((1, 3, 8));
        assert!(matches!(transformer.forward(&tokens), Err(MaeError::Shape(_))));
    }

    #[test]
    fn test_params_validation() {
        let mut bad = params();
        bad.heads = 0;
        assert!(bad.validate("encoder").is_err());
        assert_eq!(params().mlp_dim(), 32);
    }
}
