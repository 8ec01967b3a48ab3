//! Model, dataset and training parameters. Every network should come with a config detailing its
//! dimensions and input/output IDs so it can be rebuilt without digging through code, so this is
//! what gets written next to the weights on export and read back when loading them.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the config a training run saves beside its checkpoints
pub const TRAIN_CONFIG_FILE: &str = "train_config.json";

/// Everything needed to build a model and train it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct G2pConfig {
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    /// Maximum length of the decoded sequence, this includes the priming `<bos>`.
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Grapheme vocabulary, must start with the reserved symbols
    pub graphemes: Vec<String>,
    pub d_model: usize,
    /// Combined hidden size of both LSTM directions, each direction gets half
    pub d_hidden: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub dropout: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Phoneme vocabulary, must start with the reserved symbols
    pub phonemes: Vec<String>,
    pub d_model: usize,
    pub d_hidden: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub dropout: f32,
}

/// How a lexicon file is parsed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Lines starting with this are skipped
    pub comment_prefix: String,
    /// Strip `(1)` style homograph markers and trailing digits from words
    pub remove_word_digits: bool,
    /// Strip stress markers from phonemes, `AH0` becomes `AH`
    pub remove_phoneme_digits: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            comment_prefix: ";;;".to_string(),
            remove_word_digits: true,
            remove_phoneme_digits: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    /// The learning rate stops decaying once it's at or below this
    pub min_lr: f64,
    /// Multiplicative learning rate decay applied each epoch
    pub gamma: f64,
    /// Used both for the global gradient norm and clamping the loss gradient
    pub grad_clip: f64,
    pub seed: Option<u64>,
    pub checkpoint_dir: PathBuf,
    /// Save a numbered checkpoint every this many epochs
    pub checkpoint_every: usize,
    /// Number of lexicon entries decoded and logged after every epoch
    pub preview_count: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            epochs: 20,
            lr: 0.005,
            min_lr: 5e-5,
            gamma: 0.8,
            grad_clip: 2.0,
            seed: None,
            checkpoint_dir: PathBuf::from("."),
            checkpoint_every: 20,
            preview_count: 5,
        }
    }
}

fn default_max_len() -> usize {
    48
}

impl G2pConfig {
    /// Loads a JSON config
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// A setup for CMU dict style lexicons: upper case letters in, unstressed ARPAbet out.
    pub fn arpabet() -> Self {
        let graphemes = specials()
            .chain(["'", "-", "."].iter().map(|x| x.to_string()))
            .chain(('A'..='Z').map(|x| x.to_string()))
            .collect();

        let phones = [
            "AA", "AE", "AH", "AO", "AW", "AY", "B", "CH", "D", "DH", "EH", "ER", "EY", "F", "G",
            "HH", "IH", "IY", "JH", "K", "L", "M", "N", "NG", "OW", "OY", "P", "R", "S", "SH", "T",
            "TH", "UH", "UW", "V", "W", "Y", "Z", "ZH",
        ];
        let phonemes = specials()
            .chain(phones.iter().map(|x| x.to_string()))
            .collect();

        Self {
            encoder: EncoderConfig {
                graphemes,
                d_model: 128,
                d_hidden: 256,
                num_layers: 2,
                dropout: 0.1,
            },
            decoder: DecoderConfig {
                phonemes,
                d_model: 128,
                d_hidden: 256,
                num_layers: 1,
                dropout: 0.1,
            },
            max_len: default_max_len(),
            dataset: DatasetConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

fn specials() -> impl Iterator<Item = String> {
    crate::vocab::SPECIAL_SYMBOLS.iter().map(|x| x.to_string())
}

/// A very small model used across the unit tests, it trains in milliseconds.
#[cfg(test)]
pub(crate) fn tiny() -> G2pConfig {
    G2pConfig {
        encoder: EncoderConfig {
            graphemes: specials()
                .chain(["A", "B", "C", "D", "E"].iter().map(|x| x.to_string()))
                .collect(),
            d_model: 8,
            d_hidden: 8,
            num_layers: 2,
            dropout: 0.0,
        },
        decoder: DecoderConfig {
            phonemes: specials()
                .chain(["AH", "B", "K", "D"].iter().map(|x| x.to_string()))
                .collect(),
            d_model: 8,
            d_hidden: 8,
            num_layers: 1,
            dropout: 0.0,
        },
        max_len: 12,
        dataset: DatasetConfig::default(),
        training: TrainingConfig {
            batch_size: 4,
            epochs: 2,
            seed: Some(7),
            preview_count: 2,
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let json = r#"{
            "encoder": {"graphemes": ["<unk>", "<pad>", "<bos>", "<eos>", "a"], "d_model": 4, "d_hidden": 4, "num_layers": 1},
            "decoder": {"phonemes": ["<unk>", "<pad>", "<bos>", "<eos>", "AH"], "d_model": 4, "d_hidden": 4, "num_layers": 1},
            "training": {"epochs": 3}
        }"#;
        let config: G2pConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_len, 48);
        assert_eq!(config.dataset.comment_prefix, ";;;");
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 256);
        assert_eq!(config.training.checkpoint_every, 20);
    }

    #[test]
    fn arpabet_vocabularies_are_valid() {
        let config = G2pConfig::arpabet();
        assert!(crate::vocab::Vocabulary::new(config.encoder.graphemes.clone()).is_ok());
        assert!(crate::vocab::Vocabulary::new(config.decoder.phonemes.clone()).is_ok());
        assert_eq!(config.encoder.d_model, config.decoder.d_model);
    }
}
