//! Symbol tables for the two sides of the model. Both the grapheme and phoneme vocabularies share
//! the same four reserved symbols at the start, this lets the dataset, model and any downstream
//! consumer agree on what index 2 means without passing anything else around.
//!
//! The beginning-of-sequence symbol doubles as the transducer blank. When the joint network
//! predicts it during decoding we move on to the next input letter instead of emitting a phoneme.
use anyhow::ensure;
use std::collections::HashMap;

/// Index of the unknown symbol
pub const UNK_IDX: u32 = 0;
/// Index of the padding symbol
pub const PAD_IDX: u32 = 1;
/// Index of the beginning-of-sequence symbol, also used as the transducer blank
pub const BOS_IDX: u32 = 2;
/// Index of the end-of-sequence symbol
pub const EOS_IDX: u32 = 3;

/// The reserved symbols every vocabulary must start with, in index order.
pub const SPECIAL_SYMBOLS: [&str; 4] = ["<unk>", "<pad>", "<bos>", "<eos>"];

/// An ordered list of symbols where the position is the index fed into the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vocabulary {
    symbols: Vec<String>,
    indexes: HashMap<String, u32>,
}

impl Vocabulary {
    /// Creates a vocabulary, this fails if the reserved symbols aren't the first four entries or
    /// if there's nothing after them.
    pub fn new(symbols: Vec<String>) -> anyhow::Result<Self> {
        ensure!(
            symbols.len() > SPECIAL_SYMBOLS.len(),
            "vocabulary needs at least one symbol after the reserved ones, got {} symbols",
            symbols.len()
        );
        for (i, special) in SPECIAL_SYMBOLS.iter().enumerate() {
            ensure!(
                symbols[i] == *special,
                "vocabulary index {} must be '{}' but is '{}'",
                i,
                special,
                symbols[i]
            );
        }
        let indexes = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        Ok(Self { symbols, indexes })
    }

    /// Builds a vocabulary from just the regular symbols, the reserved ones are prepended.
    pub fn with_specials<S: Into<String>>(symbols: impl IntoIterator<Item = S>) -> anyhow::Result<Self> {
        let all = SPECIAL_SYMBOLS
            .iter()
            .map(|x| x.to_string())
            .chain(symbols.into_iter().map(Into::into))
            .collect();
        Self::new(all)
    }

    /// Number of symbols including the reserved ones
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the vocabulary is empty
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn index(&self, symbol: &str) -> Option<u32> {
        self.indexes.get(symbol).copied()
    }

    /// Looks up a symbol falling back to `UNK_IDX` when it isn't present.
    pub fn index_or_unk(&self, symbol: &str) -> u32 {
        self.index(symbol).unwrap_or(UNK_IDX)
    }

    pub fn symbol(&self, index: u32) -> Option<&str> {
        self.symbols.get(index as usize).map(|x| x.as_str())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.indexes.contains_key(symbol)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefix_enforced() {
        assert!(Vocabulary::with_specials(["a"]).is_ok());
        // Only the reserved symbols
        assert!(Vocabulary::with_specials(Vec::<String>::new()).is_err());

        let swapped = ["<pad>", "<unk>", "<bos>", "<eos>", "a"]
            .map(String::from)
            .to_vec();
        assert!(Vocabulary::new(swapped).is_err());

        let missing_eos = ["<unk>", "<pad>", "<bos>", "a", "b"]
            .map(String::from)
            .to_vec();
        assert!(Vocabulary::new(missing_eos).is_err());
    }

    #[test]
    fn lookups() {
        let vocab = Vocabulary::with_specials(["a", "b"]).unwrap();
        assert_eq!(vocab.len(), 6);
        assert!(!vocab.is_empty());
        assert_eq!(vocab.index("<bos>"), Some(BOS_IDX));
        assert_eq!(vocab.index("b"), Some(5));
        assert_eq!(vocab.index_or_unk("z"), UNK_IDX);
        assert_eq!(vocab.symbol(4), Some("a"));
        assert_eq!(vocab.symbol(40), None);
    }
}
