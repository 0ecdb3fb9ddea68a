/// Caption training on pre-extracted image features
use caption_transformer::data::{
    captions_for_images, read_caption_file, read_image_names, BatchDataLoader, CaptionDataLoader,
    CaptionDataset, CaptionTokenizer,
};
use caption_transformer::training::Trainer;
use caption_transformer::utils::select_device;
use caption_transformer::RunConfig;

const CONFIG_PATH: &str = "./config/config.yml";
const DATASET: &str = "FLICKER";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== Caption Transformer Training ===");

    let config = RunConfig::from_yaml_file(CONFIG_PATH, DATASET)?;
    log::info!("Dataset: {}", config.dataset_name);

    let device = select_device()?;
    log::info!("Using device: {:?}", device);

    log::info!("Reading captions from {:?}", config.txt_path);
    let captions = read_caption_file(&config.txt_path)?;
    let train_names = read_image_names(&config.img_name)?;

    // Vocabulary comes from the training split only
    let tokenizer = CaptionTokenizer::load_or_build(
        &config.cap_file,
        captions_for_images(&captions, &train_names),
        config.top_k,
    )?;
    log::info!("  - Vocab size: {}", tokenizer.vocab_size());

    let train_set = CaptionDataset::from_paths(
        &config.img_path,
        &captions,
        &train_names,
        &tokenizer,
        config.max_length,
    )?;
    let (_, feature_dim) = train_set
        .feature_shape()
        .ok_or_else(|| anyhow::anyhow!("no training features found in {:?}", config.img_path))?;

    let mut valid_loader = match (&config.val_img_name, config.validate) {
        (Some(path), true) => {
            let names = read_image_names(path)?;
            let valid_set = CaptionDataset::from_paths(
                &config.img_path,
                &captions,
                &names,
                &tokenizer,
                config.max_length,
            )?;
            Some(CaptionDataLoader::new(valid_set, config.batch_size, false))
        }
        (None, true) => {
            log::warn!("VALIDATE is set but VAL_IMG_NAME is missing, skipping validation");
            None
        }
        _ => None,
    };

    let mut train_loader = CaptionDataLoader::new(train_set, config.batch_size, config.shuffle);
    log::info!("Data loader created:");
    log::info!("  - Batch size: {}", config.batch_size);
    log::info!("  - Num batches: {}", train_loader.num_batches());

    let model_config = config.model_config(tokenizer.vocab_size(), feature_dim);
    log::info!("Model configuration: {:#?}", model_config);

    log::info!("Training configuration:");
    log::info!("  - Epochs: {}", config.epochs);
    log::info!("  - LR multiplier: {}", config.lr_mul);
    log::info!("  - Warmup steps: {}", config.warmup_step);
    log::info!("  - Label smoothing: {}", config.label_smoothing);
    log::info!("  - Save mode: {:?}", config.save_mode);

    let mut trainer = Trainer::build(model_config, config, device)?;

    let valid = valid_loader
        .as_mut()
        .map(|loader| loader as &mut dyn BatchDataLoader);
    trainer.train(&mut train_loader, valid)?;

    log::info!("=== Training Complete ===");

    Ok(())
}
