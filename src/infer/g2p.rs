//! Turns words into phonemes for downstream use. A dictionary is the reliable option so it's tried
//! first, then anything it doesn't know is run through a model. Model predictions are cached as
//! running the greedy loop is far more expensive than a lookup and the same out of vocabulary
//! words tend to keep coming up.
use super::phones::PhoneSet;
use crate::dictionary::{Dictionary, Pronunciation};
use crate::model::{greedy_decode, StepPredictor};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;
use unicode_segmentation::UnicodeSegmentation;

pub struct Phonemizer {
    dictionary: Option<Dictionary>,
    model: Option<Box<dyn StepPredictor>>,
    phones: Option<PhoneSet>,
    cache: HashMap<String, Pronunciation>,
}

#[derive(Default)]
pub struct PhonemizerBuilder {
    dict: Option<Dictionary>,
    model: Option<Box<dyn StepPredictor>>,
    phones: Option<PhoneSet>,
}

impl PhonemizerBuilder {
    pub fn add_dictionary(mut self, dict: Dictionary) -> Self {
        self.dict = Some(dict);
        self
    }

    pub fn add_model(mut self, model: impl StepPredictor + 'static) -> Self {
        self.model = Some(Box::new(model));
        self
    }

    /// Only symbols in the phone set are returned from `query`
    pub fn add_phone_set(mut self, phones: PhoneSet) -> Self {
        self.phones = Some(phones);
        self
    }

    pub fn build(self) -> anyhow::Result<Phonemizer> {
        if self.dict.is_none() && self.model.is_none() {
            anyhow::bail!("No means of working out pronunciation");
        }
        Ok(Phonemizer {
            dictionary: self.dict,
            model: self.model,
            phones: self.phones,
            cache: HashMap::new(),
        })
    }
}

fn is_punctuation(word: &str) -> bool {
    static PUNCT_REGEX: OnceCell<Regex> = OnceCell::new();
    let punct_regex = PUNCT_REGEX.get_or_init(|| Regex::new(r"^\p{P}$").unwrap());

    punct_regex.is_match(word)
}

impl Phonemizer {
    pub fn create() -> PhonemizerBuilder {
        PhonemizerBuilder::default()
    }

    /// Gets the pronunciation of a word. Empty input and lone punctuation have none, nor does a
    /// word the dictionary doesn't know when there's no model or the model has nothing to say.
    pub fn query(&mut self, word: &str) -> anyhow::Result<Option<Pronunciation>> {
        let found = self.lookup(word)?;
        Ok(match (&self.phones, found) {
            (Some(phones), Some(pronunciation)) => {
                Some(phones.retain_valid(&pronunciation)).filter(|p| !p.is_empty())
            }
            (_, found) => found,
        })
    }

    fn lookup(&mut self, word: &str) -> anyhow::Result<Option<Pronunciation>> {
        if word.is_empty() || is_punctuation(word) {
            return Ok(None);
        }
        if let Some(dict) = &self.dictionary {
            let found = dict
                .get(word)
                .or_else(|| dict.get(&word.to_uppercase()))
                .or_else(|| dict.get(&word.to_lowercase()));
            if let Some(pronunciation) = found {
                return Ok(Some(pronunciation.clone()));
            }
        }
        if let Some(cached) = self.cache.get(word) {
            return Ok(Some(cached.clone()));
        }

        let predicted = match self.predict(word)? {
            Some(p) => p,
            None => return Ok(None),
        };
        self.cache.insert(word.to_string(), predicted.clone());
        Ok(Some(predicted))
    }

    fn predict(&self, word: &str) -> anyhow::Result<Option<Pronunciation>> {
        let model = match &self.model {
            Some(m) => m,
            None => return Ok(None),
        };
        let graphemes = model.graphemes();
        // Graphemes the model wasn't trained on are left out rather than fed in as unknown
        let src = word
            .graphemes(true)
            .filter_map(|g| {
                graphemes
                    .index(g)
                    .or_else(|| graphemes.index(&g.to_lowercase()))
                    .or_else(|| graphemes.index(&g.to_uppercase()))
            })
            .collect::<Vec<_>>();
        if src.is_empty() {
            return Ok(None);
        }

        let tgt = greedy_decode(model.as_ref(), &src)?;
        let phonemes = model.phonemes();
        let pronunciation = tgt[1..]
            .iter()
            .filter_map(|i| phonemes.symbol(*i))
            .map(|x| x.to_string())
            .collect::<Vec<_>>();
        debug!("Predicted {} as {:?}", word, pronunciation);
        if pronunciation.is_empty() {
            Ok(None)
        } else {
            Ok(Some(pronunciation))
        }
    }

    /// Without a phone set every symbol counts as valid
    pub fn is_valid_symbol(&self, symbol: &str) -> bool {
        self.phones
            .as_ref()
            .map_or(true, |phones| phones.is_valid_symbol(symbol))
    }

    pub fn is_vowel(&self, symbol: &str) -> bool {
        self.phones.as_ref().map_or(false, |phones| phones.is_vowel(symbol))
    }

    pub fn is_glide(&self, symbol: &str) -> bool {
        self.phones.as_ref().map_or(false, |phones| phones.is_glide(symbol))
    }

    /// Number of model predictions held in the cache
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
