//! Dictionary lookup is the first thing the phonemizer tries, the model is only asked about words
//! the dictionary doesn't have. This is a fairly simple map from word to list of pronunciations and
//! like the lexicon used in training it's read from a CMU dict style file. We don't handle picking
//! the correct pronunciation for homographs, the first one found is the one used.
use crate::config::DatasetConfig;
use crate::dataset::load_dict;
use anyhow::Context;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

/// A pronunciation is just the phoneme symbols in order
pub type Pronunciation = Vec<String>;

/// Type that wraps the dictionary, the underlying dictionary store is backed by a `BTreeMap`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dictionary {
    /// One word may have multiple pronunciations
    dictionary: BTreeMap<String, Vec<Pronunciation>>,
}

impl Dictionary {
    /// Opens a dictionary from a file
    pub fn open(path: impl AsRef<Path>, config: &DatasetConfig) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening dictionary {}", path.display()))?;
        Ok(Self::from_reader(io::BufReader::new(file), config)?)
    }

    /// Works from a reader so the dictionary can be tested with in-memory data. Homograph markers
    /// and stress are handled the same way as the training lexicon so `READ(1)` lands on `READ`.
    pub fn from_reader(reader: impl BufRead, config: &DatasetConfig) -> io::Result<Self> {
        let mut dictionary: BTreeMap<String, Vec<Pronunciation>> = BTreeMap::new();
        for entry in load_dict(reader, config)? {
            if entry.word.is_empty() {
                continue;
            }
            let pronunciations = dictionary.entry(entry.word).or_default();
            if !pronunciations.contains(&entry.pronunciation) {
                pronunciations.push(entry.pronunciation);
            }
        }
        Ok(Self { dictionary })
    }

    /// Adds every pronunciation from `other`, keeping ours first so they still win in `get`. A
    /// user's own words are easier to keep track of in a separate file merged on top of CMU dict.
    pub fn merge(&mut self, other: Dictionary) {
        for (word, pronunciations) in other.dictionary {
            for pronunciation in pronunciations {
                self.insert(word.clone(), pronunciation);
            }
        }
    }

    /// Adds a single pronunciation, mainly for user overrides
    pub fn insert(&mut self, word: impl Into<String>, pronunciation: Pronunciation) {
        let pronunciations = self.dictionary.entry(word.into()).or_default();
        if !pronunciations.contains(&pronunciation) {
            pronunciations.push(pronunciation);
        }
    }

    /// Number of words in the dictionary
    pub fn len(&self) -> usize {
        self.dictionary.len()
    }

    /// Whether the dictionary is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_pronunciations(&self, word: &str) -> Option<&Vec<Pronunciation>> {
        self.dictionary.get(word)
    }

    /// Pretends that words only have one possible pronunciation, and it's the first one in the
    /// dictionary.
    pub fn get(&self, word: &str) -> Option<&Pronunciation> {
        self.dictionary.get(word).and_then(|x| x.first())
    }
}
