/// Flickr-style caption dataset over pre-extracted image features (.npy)
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use candle_core::{Device, Result, Tensor};
use ndarray::{Array2, Array3, Axis};
use ndarray_npy::ReadNpyExt;

use super::tokenizer::CaptionTokenizer;
use super::{BatchDataLoader, CaptionBatch};
use crate::CaptionError;

/// Read `<image>#<n>\t<caption>` lines into (image name, caption) pairs
pub fn read_caption_file<P: AsRef<Path>>(path: P) -> crate::Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let mut captions = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((key, caption)) = line.split_once('\t') else {
            log::warn!("Skipping caption line without a tab: {}", line);
            continue;
        };

        let image = key.split('#').next().unwrap_or(key).trim();
        captions.push((image.to_string(), caption.trim().to_string()));
    }

    log::info!("Read {} captions from {:?}", captions.len(), path.as_ref());
    Ok(captions)
}

/// Read one image file name per line
pub fn read_image_names<P: AsRef<Path>>(path: P) -> crate::Result<Vec<String>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Captions of the listed images only, in file order
pub fn captions_for_images<'a>(
    captions: &'a [(String, String)],
    image_names: &[String],
) -> Vec<&'a str> {
    let names: HashSet<&str> = image_names.iter().map(String::as_str).collect();
    captions
        .iter()
        .filter(|(image, _)| names.contains(image.as_str()))
        .map(|(_, caption)| caption.as_str())
        .collect()
}

/// Captions paired with the feature matrix of their image
pub struct CaptionDataset {
    /// One [regions, feature_dim] matrix per image
    features: Vec<Array2<f32>>,
    image_names: Vec<String>,
    /// (image index, padded token ids)
    samples: Vec<(usize, Vec<u32>)>,
    max_length: usize,
}

impl CaptionDataset {
    /// Load features for `image_names` from `img_dir/<name>.npy`
    ///
    /// Every caption of a listed image becomes one sample. Images without a
    /// feature file or without captions are skipped.
    pub fn from_paths<P: AsRef<Path>>(
        img_dir: P,
        captions: &[(String, String)],
        image_names: &[String],
        tokenizer: &CaptionTokenizer,
        max_length: usize,
    ) -> crate::Result<Self> {
        let dir = img_dir.as_ref();
        log::info!("Loading image features from: {:?}", dir);

        let mut by_image: HashMap<&str, Vec<&str>> = HashMap::new();
        for (image, caption) in captions {
            by_image.entry(image.as_str()).or_default().push(caption.as_str());
        }

        let mut loaded = Vec::new();
        for name in image_names {
            let Some(image_captions) = by_image.get(name.as_str()) else {
                log::warn!("No captions for image {}, skipping", name);
                continue;
            };

            let feature_path = dir.join(format!("{}.npy", name));
            if !feature_path.exists() {
                log::warn!("Feature file {:?} not found, skipping", feature_path);
                continue;
            }

            let features = <Array2<f32> as ReadNpyExt>::read_npy(File::open(&feature_path)?)?;
            loaded.push((name.clone(), features, image_captions.clone()));
        }

        let mut dataset = Self {
            features: Vec::with_capacity(loaded.len()),
            image_names: Vec::with_capacity(loaded.len()),
            samples: Vec::new(),
            max_length,
        };
        for (name, features, image_captions) in loaded {
            dataset.push_image(name, features, &image_captions, tokenizer)?;
        }

        log::info!(
            "Dataset loaded: {} images, {} captions, max_length={}",
            dataset.num_images(),
            dataset.len(),
            max_length
        );

        Ok(dataset)
    }

    /// Build a dataset from in-memory features
    pub fn from_features(
        items: Vec<(String, Array2<f32>, Vec<String>)>,
        tokenizer: &CaptionTokenizer,
        max_length: usize,
    ) -> crate::Result<Self> {
        let mut dataset = Self {
            features: Vec::new(),
            image_names: Vec::new(),
            samples: Vec::new(),
            max_length,
        };
        for (name, features, image_captions) in items {
            let image_captions: Vec<&str> = image_captions.iter().map(String::as_str).collect();
            dataset.push_image(name, features, &image_captions, tokenizer)?;
        }
        Ok(dataset)
    }

    fn push_image(
        &mut self,
        name: String,
        features: Array2<f32>,
        image_captions: &[&str],
        tokenizer: &CaptionTokenizer,
    ) -> crate::Result<()> {
        if let Some(first) = self.features.first() {
            if first.shape() != features.shape() {
                return Err(CaptionError::Data(format!(
                    "Shape mismatch: image {} has features {:?}, expected {:?}",
                    name,
                    features.shape(),
                    first.shape()
                )));
            }
        }

        let image_idx = self.features.len();
        self.features.push(features);
        self.image_names.push(name);

        for caption in image_captions {
            self.samples
                .push((image_idx, tokenizer.encode_padded(caption, self.max_length)));
        }

        Ok(())
    }

    /// Number of (image, caption) samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_images(&self) -> usize {
        self.features.len()
    }

    /// (regions, feature_dim); `None` when empty
    pub fn feature_shape(&self) -> Option<(usize, usize)> {
        self.features.first().map(|f| f.dim())
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Features, tokens and image name of sample `idx`
    pub fn get(&self, idx: usize) -> (&Array2<f32>, &[u32], &str) {
        let (image_idx, tokens) = &self.samples[idx];
        (
            &self.features[*image_idx],
            tokens,
            &self.image_names[*image_idx],
        )
    }
}

/// Data loader for caption datasets
pub struct CaptionDataLoader {
    dataset: CaptionDataset,
    batch_size: usize,
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
}

impl CaptionDataLoader {
    /// Create new data loader
    pub fn new(dataset: CaptionDataset, batch_size: usize, shuffle: bool) -> Self {
        let mut loader = Self {
            indices: (0..dataset.len()).collect(),
            dataset,
            batch_size,
            current_idx: 0,
            shuffle,
        };
        loader.shuffle_indices();
        loader
    }

    fn shuffle_indices(&mut self) {
        if self.shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    /// Get next batch
    pub fn next_batch(&mut self, device: &Device) -> Result<Option<CaptionBatch>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.current_idx..end_idx];
        let actual_batch_size = batch_indices.len();

        let (regions, feature_dim) = self
            .dataset
            .feature_shape()
            .ok_or_else(|| candle_core::Error::Msg("empty dataset".to_string()))?;
        let max_length = self.dataset.max_length();

        let mut images = Array3::<f32>::zeros((actual_batch_size, regions, feature_dim));
        let mut caption_data = Vec::with_capacity(actual_batch_size * max_length);
        let mut names = Vec::with_capacity(actual_batch_size);

        for (row, &idx) in batch_indices.iter().enumerate() {
            let (features, tokens, name) = self.dataset.get(idx);
            images.index_axis_mut(Axis(0), row).assign(features);
            caption_data.extend_from_slice(tokens);
            names.push(name.to_string());
        }

        self.current_idx = end_idx;

        let image_data: Vec<f32> = images.into_iter().collect();
        let images = Tensor::from_vec(image_data, (actual_batch_size, regions, feature_dim), device)?;
        let captions = Tensor::from_vec(caption_data, (actual_batch_size, max_length), device)?;

        Ok(Some(CaptionBatch {
            images,
            captions,
            names,
        }))
    }

    /// Reset loader for new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;
        self.shuffle_indices();
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Get dataset reference
    pub fn dataset(&self) -> &CaptionDataset {
        &self.dataset
    }
}

impl BatchDataLoader for CaptionDataLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<CaptionBatch>> {
        CaptionDataLoader::next_batch(self, device)
    }

    fn reset(&mut self) {
        CaptionDataLoader::reset(self)
    }

    fn num_batches(&self) -> usize {
        CaptionDataLoader::num_batches(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::WriteNpyExt;
    use std::io::Write;

    fn tokenizer() -> CaptionTokenizer {
        CaptionTokenizer::build(["a dog runs", "a cat sleeps", "two dogs play"], 100)
    }

    #[test]
    fn test_read_caption_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("captions.txt");
        let mut file = File::create(&path)?;
        writeln!(file, "1000.jpg#0\tA dog runs .")?;
        writeln!(file, "1000.jpg#1\tA brown dog runs")?;
        writeln!(file)?;
        writeln!(file, "broken line without tab")?;
        writeln!(file, "2000.jpg#0\tA cat sleeps")?;

        let captions = read_caption_file(&path)?;

        assert_eq!(captions.len(), 3);
        assert_eq!(captions[0], ("1000.jpg".to_string(), "A dog runs .".to_string()));
        assert_eq!(captions[2].0, "2000.jpg");

        Ok(())
    }

    #[test]
    fn test_captions_for_images_keeps_split() {
        let captions = vec![
            ("1000.jpg".to_string(), "a dog runs".to_string()),
            ("2000.jpg".to_string(), "a zebra grazes".to_string()),
            ("1000.jpg".to_string(), "two dogs play".to_string()),
        ];
        let train_names = vec!["1000.jpg".to_string()];

        let selected = captions_for_images(&captions, &train_names);
        assert_eq!(selected, vec!["a dog runs", "two dogs play"]);

        let tokenizer = CaptionTokenizer::build(selected, 100);
        assert_eq!(tokenizer.encode("zebra")[1], tokenizer.unk_id());
    }

    #[test]
    fn test_from_paths_skips_missing_features() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let features = Array2::<f32>::from_elem((3, 4), 0.5);
        features
            .write_npy(File::create(dir.path().join("1000.jpg.npy"))?)
            .map_err(|e| CaptionError::Data(e.to_string()))?;

        let captions = vec![
            ("1000.jpg".to_string(), "a dog runs".to_string()),
            ("1000.jpg".to_string(), "two dogs play".to_string()),
            ("2000.jpg".to_string(), "a cat sleeps".to_string()),
        ];
        let names = vec!["1000.jpg".to_string(), "2000.jpg".to_string()];

        let dataset = CaptionDataset::from_paths(dir.path(), &captions, &names, &tokenizer(), 6)?;

        assert_eq!(dataset.num_images(), 1);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.feature_shape(), Some((3, 4)));

        let (feats, tokens, name) = dataset.get(1);
        assert_eq!(name, "1000.jpg");
        assert_eq!(feats[[2, 3]], 0.5);
        assert_eq!(tokens.len(), 6);

        Ok(())
    }

    #[test]
    fn test_feature_shape_mismatch() {
        let items = vec![
            ("a".to_string(), Array2::zeros((3, 4)), vec!["a dog".to_string()]),
            ("b".to_string(), Array2::zeros((2, 4)), vec!["a cat".to_string()]),
        ];

        let result = CaptionDataset::from_features(items, &tokenizer(), 5);
        assert!(matches!(result, Err(CaptionError::Data(_))));
    }

    #[test]
    fn test_loader_batches() -> crate::Result<()> {
        let device = Device::Cpu;
        let items = (0..5)
            .map(|i| {
                (
                    format!("{}.jpg", i),
                    Array2::from_elem((2, 3), i as f32),
                    vec!["a dog runs".to_string()],
                )
            })
            .collect();
        let dataset = CaptionDataset::from_features(items, &tokenizer(), 7)?;

        let mut loader = CaptionDataLoader::new(dataset, 2, false);
        assert_eq!(loader.num_batches(), 3);

        let first = loader.next_batch(&device)?.expect("first batch");
        assert_eq!(first.images.dims(), &[2, 2, 3]);
        assert_eq!(first.captions.dims(), &[2, 7]);
        assert_eq!(first.names, vec!["0.jpg", "1.jpg"]);

        let images = first.images.to_vec3::<f32>()?;
        assert_eq!(images[1][0][0], 1.0);

        let mut sizes = vec![first.len()];
        while let Some(batch) = loader.next_batch(&device)? {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);

        loader.reset();
        assert!(loader.next_batch(&device)?.is_some());

        Ok(())
    }
}
