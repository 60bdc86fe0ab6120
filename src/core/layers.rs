//! Dense building blocks shared by the transformer stacks and projectors

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::distributions::Uniform;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Fully connected layer, `y = x W + b`
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix [in, out]
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    /// Uniform init in `±1/sqrt(in)`
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let weight = Array2::from_shape_fn((in_features, out_features), |_| dist.sample(rng));
        let bias = if bias {
            Some(Array1::from_shape_fn(out_features, |_| dist.sample(rng)))
        } else {
            None
        };
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight);
        if let Some(bias) = &self.bias {
            y += bias;
        }
        y
    }
}

/// Layer normalisation over the last axis
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut out = x.to_owned();
        for mut row in out.outer_iter_mut() {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            row.mapv_inplace(|v| (v - mean) * inv_std);
            row *= &self.gamma;
            row += &self.beta;
        }
        out
    }
}

/// GELU, tanh approximation
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

/// Row-wise softmax, in place
pub fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}

/// Standard-normal vector scaled by `std`
pub fn randn_vector<R: Rng + ?Sized>(len: usize, std: f32, rng: &mut R) -> Array1<f32> {
    Array1::from_shape_fn(len, |_| {
        let v: f32 = StandardNormal.sample(rng);
        v * std
    })
}
