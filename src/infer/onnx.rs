//! Runs an exported single step model through ONNX Runtime. The model directory holds the
//! `config.json` manifest written by `GreedyG2p::export` and a `g2p.onnx` graph converted from the
//! same weights. The graph takes `src` `[1, T]`, `tgt` `[1, U]` and `t` `[1]`, all `int32`, and
//! outputs the predicted symbol as `pred`. Decoding is the same greedy loop used by the candle
//! model, it's just each step that runs somewhere else.
use crate::model::{greedy_decode, ExportManifest, StepPredictor, MANIFEST_FILE};
use crate::vocab::Vocabulary;
use anyhow::{ensure, Context};
use ndarray::{Array1, Array2};
use ort::{inputs, CPUExecutionProvider, GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::info;

/// Name of the ONNX graph inside a model directory
pub const ONNX_FILE: &str = "g2p.onnx";

pub struct OnnxG2p {
    session: Session,
    graphemes: Vocabulary,
    phonemes: Vocabulary,
    max_len: usize,
}

impl OnnxG2p {
    pub fn load(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        // Read the manifest before starting up the runtime, it's the cheaper thing to get wrong
        let manifest = ExportManifest::open(dir.join(MANIFEST_FILE))?;
        ensure!(
            manifest.inputs == ["src", "tgt", "t"] && manifest.outputs == ["pred"],
            "unexpected model signature {:?} -> {:?}",
            manifest.inputs,
            manifest.outputs
        );
        let graphemes = Vocabulary::new(manifest.config.encoder.graphemes.clone())?;
        let phonemes = Vocabulary::new(manifest.config.decoder.phonemes.clone())?;

        // ort has its own global initialisation, it's fine to call this more than once
        ort::init()
            .with_name("xd_g2p")
            .with_execution_providers(&[CPUExecutionProvider::default().build()])
            .commit()?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(dir.join(ONNX_FILE))
            .context("converting g2p to runnable model")?;
        info!("Loaded ONNX model from {}", dir.display());

        Ok(Self {
            session,
            graphemes,
            phonemes,
            max_len: manifest.config.max_len,
        })
    }

    pub fn predict(&self, src: &[u32]) -> anyhow::Result<Vec<u32>> {
        greedy_decode(self, src)
    }
}

impl StepPredictor for OnnxG2p {
    fn graphemes(&self) -> &Vocabulary {
        &self.graphemes
    }

    fn phonemes(&self) -> &Vocabulary {
        &self.phonemes
    }

    fn max_len(&self) -> usize {
        self.max_len
    }

    fn predict_step(&self, src: &[u32], tgt: &[u32], t: usize) -> anyhow::Result<u32> {
        let (src, tgt, t) = step_inputs(src, tgt, t)?;
        let outputs = self.session.run(inputs![
            "src" => src,
            "tgt" => tgt,
            "t" => t,
        ]?)?;
        let pred = outputs["pred"]
            .extract_tensor::<i32>()?
            .view()
            .iter()
            .next()
            .copied();
        prediction_index(pred)
    }
}

fn to_i32(ids: &[u32]) -> anyhow::Result<Vec<i32>> {
    ids.iter()
        .map(|x| i32::try_from(*x).with_context(|| format!("index {} doesn't fit in an int32", x)))
        .collect()
}

/// Builds the `[1, T]`, `[1, U]` and `[1]` int32 inputs for one step
fn step_inputs(
    src: &[u32],
    tgt: &[u32],
    t: usize,
) -> anyhow::Result<(Array2<i32>, Array2<i32>, Array1<i32>)> {
    let src = Array2::from_shape_vec((1, src.len()), to_i32(src)?)
        .context("failed to make src tensor")?;
    let tgt = Array2::from_shape_vec((1, tgt.len()), to_i32(tgt)?)
        .context("failed to make tgt tensor")?;
    let t = i32::try_from(t).context("time step doesn't fit in an int32")?;
    Ok((src, tgt, Array1::from_vec(vec![t])))
}

fn prediction_index(pred: Option<i32>) -> anyhow::Result<u32> {
    let pred = pred.context("model gave no prediction")?;
    ensure!(pred >= 0, "model predicted a negative index {}", pred);
    Ok(pred as u32)
}
