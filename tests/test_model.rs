use cubemae::core::{MaskingEngine, TransformerParams};
use cubemae::{
    ensure_finite, Datacube, EmbeddingLevel, Embeddings, MaeConfig, MaeError, MaskedAutoencoder,
    MaskingMode, MetadataFlags, ModelArchitecture,
};
use ndarray::{Array1, Array2, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sentinel_like_cube(batch: usize, channels: usize, side: usize) -> Datacube {
    let pixels = Array4::from_shape_fn((batch, channels, side, side), |(b, c, y, x)| {
        ((b * 31 + c * 17 + y * 5 + x) as f32 * 0.05).sin()
    });
    let time = Array2::from_shape_fn((batch, 2), |(b, k)| if k == 0 { 10.0 + b as f32 } else { 20.0 });
    let latlon = Array2::from_shape_fn((batch, 2), |(b, k)| if k == 0 { 45.0 } else { 7.0 + b as f32 });
    let gsd = Array1::from_elem(batch, 10.0);
    let waves = Array2::from_shape_fn((batch, channels), |(_, c)| 0.49 + 0.1 * c as f32);
    Datacube::new(pixels, time, latlon, gsd, waves).expect("consistent datacube")
}

fn small_architecture() -> ModelArchitecture {
    ModelArchitecture {
        encoder: TransformerParams { dim: 40, depth: 2, heads: 2, dim_head: 8, mlp_ratio: 2.0 },
        decoder: TransformerParams { dim: 24, depth: 1, heads: 2, dim_head: 8, mlp_ratio: 2.0 },
    }
}

fn small_config(patch_size: usize) -> MaeConfig {
    MaeConfig {
        patch_size,
        projector: cubemae::core::ProjectorParams { wave_dim: 16, num_latent_tokens: 4 },
        ..MaeConfig::default()
    }
}

fn small_model(seed: u64) -> MaskedAutoencoder {
    let mut rng = StdRng::seed_from_u64(seed);
    MaskedAutoencoder::with_architecture(small_config(4), small_architecture(), &mut rng)
        .expect("valid model")
}

#[test]
fn test_tiny_model_shapes_end_to_end() -> anyhow::Result<()> {
    init_logging();
    let mut rng = StdRng::seed_from_u64(1);
    let model = MaskedAutoencoder::new(MaeConfig::default(), &mut rng)?;
    let datacube = sentinel_like_cube(2, 4, 32);

    // L = 4, 3 hidden, 1 visible
    let engine = MaskingEngine::new(0.75)?;
    let encoded = model.encoder.forward(&datacube, &engine, MaskingMode::Random(&mut rng))?;
    assert_eq!(encoded.encoded.dim(), (2, 1 + 1, 192));

    let (pixels, wave_encoding) = model.decoder.forward(
        &encoded.encoded,
        &encoded.mask,
        datacube.time(),
        datacube.latlon(),
        datacube.shared_gsd(),
        datacube.shared_waves(),
    )?;
    assert_eq!(pixels.dim(), (2, 4, 4 * 16 * 16));
    assert_eq!(wave_encoding.nrows(), 4);

    let output = model.forward_detailed(&datacube, MaskingMode::Random(&mut rng))?;
    assert_eq!(output.reconstruction.dim(), (2, 4, 1024));
    assert!(output.loss.is_finite());
    assert!(output.loss > 0.0);
    Ok(())
}

#[test]
fn test_unknown_model_size_is_rejected() {
    let mut rng = StdRng::seed_from_u64(2);
    let config = MaeConfig { model_size: "gigantic".to_string(), ..MaeConfig::default() };
    match MaskedAutoencoder::new(config, &mut rng) {
        Err(MaeError::Config(message)) => {
            assert!(message.contains("gigantic"));
            assert!(message.contains("tiny"));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("unknown size accepted"),
    }
}

#[test]
fn test_zero_mask_ratio_is_rejected() {
    let mut rng = StdRng::seed_from_u64(3);
    let config = MaeConfig { mask_ratio: 0.0, ..small_config(4) };
    let result = MaskedAutoencoder::with_architecture(config, small_architecture(), &mut rng);
    assert!(matches!(result, Err(MaeError::Config(_))));
}

#[test]
fn test_ratio_too_small_for_grid_is_rejected() {
    // 0.2 of 4 patches truncates to zero hidden patches
    let mut rng = StdRng::seed_from_u64(4);
    let config = MaeConfig { mask_ratio: 0.2, ..small_config(4) };
    let model = MaskedAutoencoder::with_architecture(config, small_architecture(), &mut rng)
        .expect("valid model");
    let datacube = sentinel_like_cube(1, 3, 8);
    let result = model.forward(&datacube, MaskingMode::Sequential);
    assert!(matches!(result, Err(MaeError::Config(_))));
}

#[test]
fn test_sequential_forward_is_deterministic() -> anyhow::Result<()> {
    init_logging();
    let model = small_model(5);
    let datacube = sentinel_like_cube(2, 3, 16);
    let first = model.forward_detailed(&datacube, MaskingMode::Sequential)?;
    let second = model.forward_detailed(&datacube, MaskingMode::Sequential)?;
    assert_eq!(first.loss, second.loss);
    assert_eq!(first.mask, second.mask);
    assert_eq!(first.reconstruction, second.reconstruction);
    Ok(())
}

#[test]
fn test_random_forward_uses_hidden_patch_count() -> anyhow::Result<()> {
    let model = small_model(6);
    let datacube = sentinel_like_cube(3, 3, 16);
    let mut rng = StdRng::seed_from_u64(60);
    let output = model.forward_detailed(&datacube, MaskingMode::Random(&mut rng))?;
    assert_eq!(output.mask.num_masked(), 12);
    assert_eq!(output.mask.dense.sum(), 36.0);
    Ok(())
}

#[test]
fn test_embedding_levels() -> anyhow::Result<()> {
    let model = small_model(7);
    let datacube = sentinel_like_cube(2, 3, 16);

    let full = model.encode_all(&datacube)?;
    assert_eq!(full.dim(), (2, 17, 40));
    ensure_finite(&full)?;

    match model.embed(&datacube, EmbeddingLevel::Summary)? {
        Embeddings::Scene(summary) => assert_eq!(summary.dim(), (2, 40)),
        other => panic!("unexpected embeddings {:?}", other),
    }
    match model.embed(&datacube, EmbeddingLevel::Mean)? {
        Embeddings::Scene(mean) => {
            assert_eq!(mean.dim(), (2, 40));
            let expected = full.slice(ndarray::s![0, 1.., 3]).mean().unwrap();
            approx::assert_abs_diff_eq!(mean[[0, 3]], expected, epsilon = 1e-5);
        }
        other => panic!("unexpected embeddings {:?}", other),
    }
    match model.embed(&datacube, EmbeddingLevel::Patch)? {
        Embeddings::Patches(grid) => {
            assert_eq!(grid.dim(), (2, 4, 4, 40));
            // Grid cell (1, 2) is patch 6, token 7
            assert_eq!(grid[[1, 1, 2, 5]], full[[1, 7, 5]]);
        }
        other => panic!("unexpected embeddings {:?}", other),
    }
    Ok(())
}

#[test]
fn test_embeddings_depend_on_metadata_flags() -> anyhow::Result<()> {
    let datacube = sentinel_like_cube(1, 3, 8);

    let build = |flags: MetadataFlags| {
        let mut rng = StdRng::seed_from_u64(8);
        let config = MaeConfig { metadata: flags, ..small_config(4) };
        MaskedAutoencoder::with_architecture(config, small_architecture(), &mut rng)
    };

    let reference = build(MetadataFlags::reference())?.encode_all(&datacube)?;
    let with_time = build(MetadataFlags::all())?.encode_all(&datacube)?;
    let without = build(MetadataFlags::none())?.encode_all(&datacube)?;

    assert_ne!(reference, with_time);
    assert_ne!(reference, without);
    Ok(())
}

#[test]
fn test_mismatched_image_is_shape_error() {
    let model = small_model(9);
    // 10 pixels do not tile into 4-pixel patches
    let datacube = sentinel_like_cube(1, 3, 10);
    let result = model.encode_all(&datacube);
    assert!(matches!(result, Err(MaeError::Shape(_))));
}

#[test]
fn test_band_count_can_change_between_calls() -> anyhow::Result<()> {
    let model = small_model(10);
    for channels in [1usize, 4, 10] {
        let datacube = sentinel_like_cube(1, channels, 8);
        let output = model.forward_detailed(&datacube, MaskingMode::Sequential)?;
        assert_eq!(output.reconstruction.dim(), (1, 4, channels * 16));
    }
    Ok(())
}

#[test]
fn test_decoder_rejects_metadata_from_smaller_batch() -> anyhow::Result<()> {
    let model = small_model(40);
    let datacube = sentinel_like_cube(2, 3, 8);
    let single = sentinel_like_cube(1, 3, 8);

    let output = model
        .encoder
        .forward(&datacube, &MaskingEngine::new(0.5)?, MaskingMode::Sequential)?;
    let result = model.decoder.forward(
        &output.encoded,
        &output.mask,
        single.time(),
        single.latlon(),
        datacube.shared_gsd(),
        datacube.shared_waves(),
    );
    assert!(matches!(result, Err(MaeError::Shape(_))));
    Ok(())
}

#[test]
fn test_datacube_with_short_time_never_reaches_model() {
    let pixels = Array4::<f32>::zeros((2, 1, 8, 8));
    let result = Datacube::new(
        pixels,
        Array2::zeros((1, 2)),
        Array2::zeros((2, 2)),
        Array1::ones(2),
        Array2::ones((2, 1)),
    );
    assert!(matches!(result, Err(MaeError::Shape(_))));
}
