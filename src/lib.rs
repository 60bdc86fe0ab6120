//! cubemae: masked-autoencoder representation learning for geospatial datacubes
//!
//! A datacube is a batch of multi-band rasters with acquisition time, location,
//! ground sample distance and band wavelengths. The model hides most of each
//! scene's patches, encodes the visible ones and learns to reconstruct the
//! rest; the encoder output is a reusable embedding of the scene.

pub mod types;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{time_features, Datacube, MaeError, MaeResult, METADATA_WIDTH};

pub use crate::core::{
    encode_metadata, ensure_finite, EmbeddingLevel, Embeddings, MaeConfig, MaeOutput,
    MaskedAutoencoder, MaskingMode, MetadataFlags, ModelArchitecture,
};
