/// Word-level caption tokenizer
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CaptionError, Result};

pub const PAD_TOKEN: &str = "<pad>";
pub const START_TOKEN: &str = "<start>";
pub const END_TOKEN: &str = "<end>";
pub const UNK_TOKEN: &str = "<unk>";

/// Vocabulary built from training captions
///
/// Index 0 is always `<pad>`, followed by `<start>`, `<end>` and `<unk>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionTokenizer {
    id_to_word: Vec<String>,
    #[serde(skip)]
    word_to_id: HashMap<String, u32>,
}

impl CaptionTokenizer {
    /// Build a vocabulary keeping the `top_k` most frequent words
    ///
    /// Ties are broken alphabetically so the same captions always give the
    /// same ids.
    pub fn build<'a, I>(captions: I, top_k: usize) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for caption in captions {
            for word in normalize(caption) {
                *counts.entry(word).or_insert(0) += 1;
            }
        }

        let mut words: Vec<(String, usize)> = counts.into_iter().collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        words.truncate(top_k);

        let id_to_word = [PAD_TOKEN, START_TOKEN, END_TOKEN, UNK_TOKEN]
            .iter()
            .map(|s| s.to_string())
            .chain(words.into_iter().map(|(word, _)| word))
            .collect();

        Self::from_words(id_to_word)
    }

    fn from_words(id_to_word: Vec<String>) -> Self {
        let word_to_id = id_to_word
            .iter()
            .enumerate()
            .map(|(id, word)| (word.clone(), id as u32))
            .collect();
        Self {
            id_to_word,
            word_to_id,
        }
    }

    /// Load a tokenizer saved with [`CaptionTokenizer::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let loaded: CaptionTokenizer = serde_json::from_reader(reader)?;

        if loaded.id_to_word.first().map(String::as_str) != Some(PAD_TOKEN) {
            return Err(CaptionError::Data(format!(
                "tokenizer {:?} does not start with {}",
                path.as_ref(),
                PAD_TOKEN
            )));
        }

        Ok(Self::from_words(loaded.id_to_word))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Load the cached tokenizer, or build it and write the cache
    pub fn load_or_build<'a, P, I>(path: P, captions: I, top_k: usize) -> Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = &'a str>,
    {
        let path = path.as_ref();
        if path.exists() {
            log::info!("Loading tokenizer from {:?}", path);
            return Self::load(path);
        }

        let tokenizer = Self::build(captions, top_k);
        log::info!(
            "Built tokenizer with {} entries, caching to {:?}",
            tokenizer.vocab_size(),
            path
        );
        tokenizer.save(path)?;
        Ok(tokenizer)
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_word.len()
    }

    pub fn pad_id(&self) -> u32 {
        0
    }

    pub fn start_id(&self) -> u32 {
        1
    }

    pub fn end_id(&self) -> u32 {
        2
    }

    pub fn unk_id(&self) -> u32 {
        3
    }

    /// `<start> w1 .. wn <end>`, unknown words mapped to `<unk>`
    pub fn encode(&self, caption: &str) -> Vec<u32> {
        let mut ids = vec![self.start_id()];
        ids.extend(
            normalize(caption)
                .map(|word| self.word_to_id.get(&word).copied().unwrap_or(self.unk_id())),
        );
        ids.push(self.end_id());
        ids
    }

    /// Fixed-length encoding; truncation keeps the closing `<end>`
    pub fn encode_padded(&self, caption: &str, max_length: usize) -> Vec<u32> {
        let mut ids = self.encode(caption);
        if ids.len() > max_length {
            ids.truncate(max_length);
            if let Some(last) = ids.last_mut() {
                *last = self.end_id();
            }
        }
        ids.resize(max_length, self.pad_id());
        ids
    }

    /// Words between `<start>` and `<end>`, padding dropped
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .copied()
            .skip_while(|&id| id == self.start_id())
            .take_while(|&id| id != self.end_id())
            .filter(|&id| id != self.pad_id())
            .map(|id| {
                self.id_to_word
                    .get(id as usize)
                    .map(String::as_str)
                    .unwrap_or(UNK_TOKEN)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Lower-case and strip everything but letters, digits and apostrophes
fn normalize(caption: &str) -> impl Iterator<Item = String> + '_ {
    caption.split_whitespace().filter_map(|raw| {
        let word: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '\'')
            .flat_map(char::to_lowercase)
            .collect();
        if word.is_empty() {
            None
        } else {
            Some(word)
        }
    })
}
