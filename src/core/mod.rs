//! Masked-autoencoder components

pub mod layers;
pub mod metadata;
pub mod position;
pub mod patch;
pub mod masking;
pub mod transformer;
pub mod encoder;
pub mod decoder;
pub mod loss;
pub mod model;

// Re-export main types
pub use metadata::{encode_metadata, MetadataFlags};
pub use position::{spatiotemporal_encoding, SincosPositionEncoder, SpatialPositionEncoder};
pub use patch::{patchify, unpatchify, PatchProjector, ProjectorParams, WavelengthProjector};
pub use masking::{Mask, MaskingEngine, MaskingMode};
pub use transformer::{Transformer, TransformerParams};
pub use encoder::{Encoder, EncoderOutput};
pub use decoder::Decoder;
pub use loss::{per_patch_error, reconstruction_loss};
pub use model::{
    ensure_finite, EmbeddingLevel, Embeddings, MaeConfig, MaeOutput, MaskedAutoencoder,
    ModelArchitecture,
};
