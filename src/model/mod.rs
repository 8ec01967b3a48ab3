//! The transducer (RNN-T) grapheme-to-phoneme model.
//!
//! An RNN-T has three parts. The encoder reads the letters of the word, the decoder (or
//! prediction network) reads the phonemes emitted so far, and the joint network looks at one
//! letter position and one phoneme history and says what should happen next. Training produces
//! a whole `T x U` lattice of those predictions at once and the loss sums over every path through
//! it, so we never need to know which letters produced which phonemes.
//!
//! Decoding is greedy and walks two cursors:
//!
//! 1. `t` points at an encoder time step, `tgt` holds the phonemes emitted so far starting with
//!    `<bos>`.
//! 2. The joint network predicts a symbol for (`t`, `tgt`).
//! 3. If it's the blank (which is `<bos>` here) we move `t` on to the next letter.
//! 4. Otherwise the phoneme is appended to `tgt` and we stay on the same letter, one letter can
//!    produce several phonemes.
//!
//! This stops when we run out of letters or `tgt` reaches `max_len`.
//!
//! `G2p` runs this loop carrying the decoder's recurrent state between steps. `GreedyG2p` is the
//! stateless version: every call recomputes everything from `(src, tgt, t)` which is wasteful but
//! means a single step is a pure function, which is what gets exported and what other runtimes
//! call in a loop. Both must emit exactly the same phonemes.
use crate::config::G2pConfig;
use crate::vocab::*;
use anyhow::{ensure, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub mod decoder;
pub mod encoder;
pub mod joint;
pub mod lstm;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use joint::Joint;

/// Name of the weights file inside an exported model directory
pub const WEIGHTS_FILE: &str = "g2p.safetensors";
/// Name of the manifest inside an exported model directory
pub const MANIFEST_FILE: &str = "config.json";

/// One step of greedy decoding as a pure function of its inputs.
pub trait StepPredictor {
    fn graphemes(&self) -> &Vocabulary;

    fn phonemes(&self) -> &Vocabulary;

    /// Maximum decoded length including the priming `<bos>`
    fn max_len(&self) -> usize;

    /// Predicts the next symbol given the word, the phonemes so far (starting with `<bos>`) and
    /// the encoder time step being looked at.
    fn predict_step(&self, src: &[u32], tgt: &[u32], t: usize) -> anyhow::Result<u32>;
}

/// Drives a `StepPredictor` until it runs off the end of the input or hits the length limit. The
/// returned sequence starts with `<bos>`. At most `src.len()` blanks and `max_len - 1` phonemes
/// are produced so this always terminates.
pub fn greedy_decode<P: StepPredictor + ?Sized>(
    predictor: &P,
    src: &[u32],
) -> anyhow::Result<Vec<u32>> {
    let mut tgt = vec![BOS_IDX];
    let mut t = 0;
    while t < src.len() && tgt.len() < predictor.max_len() {
        let pred = predictor.predict_step(src, &tgt, t)?;
        if pred != BOS_IDX {
            tgt.push(pred);
        } else {
            t += 1;
        }
    }
    Ok(tgt)
}

fn decode_phonemes(phonemes: &Vocabulary, indexes: &[u32]) -> Vec<String> {
    indexes
        .iter()
        .map(|i| phonemes.symbol(*i).unwrap_or(SPECIAL_SYMBOLS[0]).to_string())
        .collect()
}

/// The full model used for training and reference decoding.
#[derive(Clone, Debug)]
pub struct G2p {
    config: G2pConfig,
    encoder: Encoder,
    decoder: Decoder,
    graphemes: Vocabulary,
    phonemes: Vocabulary,
    device: Device,
}

impl G2p {
    /// Builds the model, parameters are placed under `encoder.` and `decoder.`
    pub fn new(config: &G2pConfig, vb: VarBuilder) -> anyhow::Result<Self> {
        ensure!(
            config.encoder.d_model == config.decoder.d_model,
            "encoder and decoder must share d_model ({} != {})",
            config.encoder.d_model,
            config.decoder.d_model
        );
        ensure!(config.max_len > 1, "max_len must leave room for a phoneme");
        let graphemes = Vocabulary::new(config.encoder.graphemes.clone())?;
        let phonemes = Vocabulary::new(config.decoder.phonemes.clone())?;
        let encoder = Encoder::new(&config.encoder, vb.pp("encoder"))?;
        let decoder = Decoder::new(&config.decoder, vb.pp("decoder"))?;
        Ok(Self {
            config: config.clone(),
            encoder,
            decoder,
            graphemes,
            phonemes,
            device: vb.device().clone(),
        })
    }

    /// Creates a randomly initialised model along with the `VarMap` holding its parameters.
    pub fn init(config: &G2pConfig, device: &Device) -> anyhow::Result<(VarMap, Self)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vb)?;
        Ok((varmap, model))
    }

    /// Creates a model and fills it with the parameters from a safetensors checkpoint.
    pub fn load(
        config: &G2pConfig,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> anyhow::Result<(VarMap, Self)> {
        let path = path.as_ref();
        let (mut varmap, model) = Self::init(config, device)?;
        varmap
            .load(path)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;
        info!("Loaded weights from {}", path.display());
        Ok((varmap, model))
    }

    pub fn config(&self) -> &G2pConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn graphemes(&self) -> &Vocabulary {
        &self.graphemes
    }

    pub fn phonemes(&self) -> &Vocabulary {
        &self.phonemes
    }

    /// Teacher forced pass. `src` is `[batch, T]`, `tgt` is `[batch, U + 1]` starting with
    /// `<bos>`. Returns raw logits `[batch, T, U + 1, vocab]`.
    pub fn forward(&self, src: &Tensor, tgt: &Tensor, train: bool) -> anyhow::Result<Tensor> {
        let memory = self.encoder.forward(src, train)?;
        self.decoder.forward(tgt, &memory, train)
    }

    /// Greedy decoding of a single word carrying the decoder state between steps. The result
    /// starts with `<bos>`.
    pub fn predict(&self, src: &[u32]) -> anyhow::Result<Vec<u32>> {
        let mut tgt = vec![BOS_IDX];
        if src.is_empty() {
            return Ok(tgt);
        }
        let src_tensor = Tensor::from_slice(src, (1, src.len()), &self.device)?;
        let memory = self.encoder.forward(&src_tensor, false)?;

        let mut state = self.decoder.zero_state(1, &self.device)?;
        let mut t = 0;
        while t < src.len() && tgt.len() < self.config.max_len {
            let last = Tensor::new(&[[tgt[tgt.len() - 1]]], &self.device)?;
            let (pred, next_state) = self.decoder.step(&last, &memory, t, &state)?;
            if pred[0] != BOS_IDX {
                tgt.push(pred[0]);
                state = next_state;
            } else {
                t += 1;
            }
        }
        debug!("Decoded {:?} to {:?}", src, tgt);
        Ok(tgt)
    }

    /// Maps a word to grapheme indexes, unknown graphemes become `<unk>`.
    pub fn encode_word(&self, word: &str) -> Vec<u32> {
        use unicode_segmentation::UnicodeSegmentation;
        word.graphemes(true)
            .map(|g| self.graphemes.index_or_unk(g))
            .collect()
    }

    /// Predicts the pronunciation of a word
    pub fn predict_str(&self, word: &str) -> anyhow::Result<Vec<String>> {
        let tgt = self.predict(&self.encode_word(word))?;
        Ok(decode_phonemes(&self.phonemes, &tgt[1..]))
    }
}

/// Description of an exported model. The weights are stored alongside in `g2p.safetensors`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub config: G2pConfig,
    /// Input names in call order
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Axes of each input whose length changes between calls
    pub dynamic_axes: BTreeMap<String, BTreeMap<usize, String>>,
}

impl ExportManifest {
    pub fn new(config: G2pConfig) -> Self {
        let dynamic_axes = BTreeMap::from([
            ("src".to_string(), BTreeMap::from([(1, "T".to_string())])),
            ("tgt".to_string(), BTreeMap::from([(1, "U".to_string())])),
        ]);
        Self {
            config,
            inputs: vec!["src".to_string(), "tgt".to_string(), "t".to_string()],
            outputs: vec!["pred".to_string()],
            dynamic_axes,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing manifest {}", path.display()))
    }
}

/// Stateless single step model, see the module docs.
#[derive(Clone, Debug)]
pub struct GreedyG2p {
    config: G2pConfig,
    encoder: Encoder,
    decoder: Decoder,
    graphemes: Vocabulary,
    phonemes: Vocabulary,
    device: Device,
}

impl GreedyG2p {
    /// Shares the weights of a trained model
    pub fn from_model(model: &G2p) -> Self {
        Self {
            config: model.config.clone(),
            encoder: model.encoder.clone(),
            decoder: model.decoder.clone(),
            graphemes: model.graphemes.clone(),
            phonemes: model.phonemes.clone(),
            device: model.device.clone(),
        }
    }

    /// `src` is `[1, T]`, `tgt` is `[1, U]` starting with `<bos>`. Returns the predicted symbol
    /// for encoder step `t` after the whole of `tgt`.
    pub fn forward(&self, src: &Tensor, tgt: &Tensor, t: usize) -> anyhow::Result<u32> {
        let memory = self.encoder.forward(src, false)?;
        let (_, memory_len, _) = memory.dims3()?;
        ensure!(t < memory_len, "time step {} is past the encoder output", t);
        let mem = memory.narrow(1, t, 1)?;

        let x = self.decoder.encode_full(tgt, false)?;
        let (_, u, _) = x.dims3()?;
        let x = x.narrow(1, u - 1, 1)?;

        let logits = self.decoder.joint().forward(&mem, &x)?;
        Ok(logits.flatten_all()?.argmax(0)?.to_scalar::<u32>()?)
    }

    pub fn predict(&self, src: &[u32]) -> anyhow::Result<Vec<u32>> {
        greedy_decode(self, src)
    }

    pub fn predict_str(&self, word: &str) -> anyhow::Result<Vec<String>> {
        use unicode_segmentation::UnicodeSegmentation;
        let src = word
            .graphemes(true)
            .map(|g| self.graphemes.index_or_unk(g))
            .collect::<Vec<_>>();
        let tgt = self.predict(&src)?;
        Ok(decode_phonemes(&self.phonemes, &tgt[1..]))
    }

    /// Writes the weights and a manifest describing the inputs and outputs into `dir`.
    pub fn export(&self, varmap: &VarMap, dir: impl AsRef<Path>) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("creating export directory {}", dir.display()))?;
        varmap.save(dir.join(WEIGHTS_FILE))?;
        let manifest = ExportManifest::new(self.config.clone());
        fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        info!("Exported model to {}", dir.display());
        Ok(())
    }

    /// Loads a model written by `export`
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let manifest = ExportManifest::open(dir.join(MANIFEST_FILE))?;
        let (_, model) = G2p::load(&manifest.config, dir.join(WEIGHTS_FILE), device)?;
        Ok(Self::from_model(&model))
    }
}

impl StepPredictor for GreedyG2p {
    fn graphemes(&self) -> &Vocabulary {
        &self.graphemes
    }

    fn phonemes(&self) -> &Vocabulary {
        &self.phonemes
    }

    fn max_len(&self) -> usize {
        self.config.max_len
    }

    fn predict_step(&self, src: &[u32], tgt: &[u32], t: usize) -> anyhow::Result<u32> {
        let src = Tensor::from_slice(src, (1, src.len()), &self.device)?;
        let tgt = Tensor::from_slice(tgt, (1, tgt.len()), &self.device)?;
        self.forward(&src, &tgt, t)
    }
}
