//! The phone set shipped beside a model, one `SYMBOL type` pair per line like CMU dict's
//! `cmudict.phones`. Callers use it to throw away symbols they can't sing or say and to find the
//! vowels and glides when lining phonemes up with notes or syllables.
use anyhow::Context;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhoneSet {
    /// Symbol to whether it's a vowel
    symbols: HashMap<String, bool>,
    glides: HashSet<String>,
}

impl PhoneSet {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening phone set {}", path.display()))?;
        Ok(Self::from_reader(io::BufReader::new(file))?)
    }

    /// Lines that aren't exactly a symbol and a type are skipped
    pub fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let mut phones = Self::default();
        for line in reader.lines() {
            let line = line?;
            let parts = line.split_whitespace().collect::<Vec<_>>();
            if let [symbol, kind] = parts.as_slice() {
                phones.insert(symbol, kind);
            }
        }
        Ok(phones)
    }

    /// Adds or replaces a symbol. `vowel` marks vowels, `semivowel` and `liquid` are glides.
    pub fn insert(&mut self, symbol: &str, kind: &str) {
        self.symbols.insert(symbol.to_string(), kind == "vowel");
        if kind == "semivowel" || kind == "liquid" {
            self.glides.insert(symbol.to_string());
        } else {
            self.glides.remove(symbol);
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn is_valid_symbol(&self, symbol: &str) -> bool {
        self.symbols.contains_key(symbol)
    }

    pub fn is_vowel(&self, symbol: &str) -> bool {
        self.symbols.get(symbol).copied().unwrap_or(false)
    }

    pub fn is_glide(&self, symbol: &str) -> bool {
        self.glides.contains(symbol)
    }

    /// Drops any symbols not in the set
    pub fn retain_valid(&self, pronunciation: &[String]) -> Vec<String> {
        pronunciation
            .iter()
            .filter(|s| self.is_valid_symbol(s))
            .cloned()
            .collect()
    }
}
