//! Python bindings

use crate::core::{
    encode_metadata, EmbeddingLevel, Embeddings, MaeConfig, MaskedAutoencoder, MaskingMode,
    MetadataFlags,
};
use crate::types::{Datacube, MaeError};
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray1, PyReadonlyArray2, PyReadonlyArray4};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

impl From<MaeError> for PyErr {
    fn from(err: MaeError) -> Self {
        match err {
            MaeError::Config(_) | MaeError::Shape(_) => PyValueError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyMaeModel>()?;
    m.add_function(wrap_pyfunction!(py_encode_metadata, m)?)?;
    Ok(())
}

fn build_datacube(
    pixels: PyReadonlyArray4<f32>,
    time: PyReadonlyArray2<f32>,
    latlon: PyReadonlyArray2<f32>,
    gsd: PyReadonlyArray1<f32>,
    waves: PyReadonlyArray2<f32>,
) -> PyResult<Datacube> {
    Ok(Datacube::new(
        pixels.as_array().to_owned(),
        time.as_array().to_owned(),
        latlon.as_array().to_owned(),
        gsd.as_array().to_owned(),
        waves.as_array().to_owned(),
    )?)
}

/// Python wrapper for MaskedAutoencoder
#[pyclass(name = "MaeModel")]
struct PyMaeModel {
    inner: MaskedAutoencoder,
    rng: StdRng,
}

#[pymethods]
impl PyMaeModel {
    #[new]
    #[pyo3(signature = (model_size = "tiny", mask_ratio = 0.75, norm_pix_loss = false, patch_size = 16, seed = None))]
    fn new(
        model_size: &str,
        mask_ratio: f32,
        norm_pix_loss: bool,
        patch_size: usize,
        seed: Option<u64>,
    ) -> PyResult<Self> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let config = MaeConfig {
            model_size: model_size.to_string(),
            mask_ratio,
            norm_pix_loss,
            patch_size,
            ..MaeConfig::default()
        };
        let inner = MaskedAutoencoder::new(config, &mut rng)?;
        Ok(PyMaeModel { inner, rng })
    }

    /// Reconstruction loss; `training` selects random rather than sequential masking
    #[pyo3(signature = (pixels, time, latlon, gsd, waves, training = true))]
    fn forward(
        &mut self,
        pixels: PyReadonlyArray4<f32>,
        time: PyReadonlyArray2<f32>,
        latlon: PyReadonlyArray2<f32>,
        gsd: PyReadonlyArray1<f32>,
        waves: PyReadonlyArray2<f32>,
        training: bool,
    ) -> PyResult<f32> {
        let datacube = build_datacube(pixels, time, latlon, gsd, waves)?;
        let mode = if training {
            MaskingMode::Random(&mut self.rng)
        } else {
            MaskingMode::Sequential
        };
        Ok(self.inner.forward(&datacube, mode)?)
    }

    /// Embeddings at level "summary", "mean" or "patch"
    #[pyo3(signature = (pixels, time, latlon, gsd, waves, level = "mean"))]
    fn embed(
        &self,
        py: Python,
        pixels: PyReadonlyArray4<f32>,
        time: PyReadonlyArray2<f32>,
        latlon: PyReadonlyArray2<f32>,
        gsd: PyReadonlyArray1<f32>,
        waves: PyReadonlyArray2<f32>,
        level: &str,
    ) -> PyResult<PyObject> {
        let level = match level.to_lowercase().as_str() {
            "summary" => EmbeddingLevel::Summary,
            "mean" => EmbeddingLevel::Mean,
            "patch" => EmbeddingLevel::Patch,
            _ => {
                return Err(PyValueError::new_err(format!(
                    "Invalid embeddings level: {}. Choose one of summary, mean, patch",
                    level
                )))
            }
        };

        let datacube = build_datacube(pixels, time, latlon, gsd, waves)?;
        let embeddings = self.inner.embed(&datacube, level)?;
        Ok(match embeddings {
            Embeddings::Scene(array) => array.into_pyarray(py).to_object(py),
            Embeddings::Patches(array) => array.into_pyarray(py).to_object(py),
        })
    }

    #[getter]
    fn embed_dim(&self) -> usize {
        self.inner.architecture().encoder.dim
    }

    #[getter]
    fn mask_ratio(&self) -> f32 {
        self.inner.config().mask_ratio
    }

    fn __repr__(&self) -> String {
        format!(
            "MaeModel(model_size='{}', mask_ratio={}, patch_size={})",
            self.inner.config().model_size,
            self.inner.config().mask_ratio,
            self.inner.config().patch_size
        )
    }
}

/// Encode (hour, week) and (lat, lon) rows into 8 cyclic features
#[pyfunction]
#[pyo3(name = "encode_metadata", signature = (time, latlon, include_latlon = true, include_time = false))]
fn py_encode_metadata<'py>(
    py: Python<'py>,
    time: PyReadonlyArray2<f32>,
    latlon: PyReadonlyArray2<f32>,
    include_latlon: bool,
    include_time: bool,
) -> PyResult<&'py PyArray2<f32>> {
    let flags = MetadataFlags { include_latlon, include_time };
    let encoded = encode_metadata(time.as_array(), latlon.as_array(), flags)?;
    Ok(encoded.into_pyarray(py))
}
