use super::lstm::Lstm;
use crate::config::EncoderConfig;
use candle_core::{Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

/// Embeds the graphemes, runs them through a bidirectional LSTM and projects both directions back
/// down to the model width. Each direction gets half of `d_hidden`.
#[derive(Clone, Debug)]
pub struct Encoder {
    emb: Embedding,
    lstm: Lstm,
    fc: Linear,
}

impl Encoder {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> anyhow::Result<Self> {
        let emb = candle_nn::embedding(config.graphemes.len(), config.d_model, vb.pp("emb"))?;
        let lstm = Lstm::new(
            config.d_model,
            config.d_hidden / 2,
            config.num_layers,
            true,
            config.dropout,
            vb.pp("lstm"),
        )?;
        let fc = candle_nn::linear(lstm.output_size(), config.d_model, vb.pp("fc"))?;
        Ok(Self { emb, lstm, fc })
    }

    /// `src` is `[batch, T]` grapheme indexes, the output is `[batch, T, d_model]`.
    pub fn forward(&self, src: &Tensor, train: bool) -> anyhow::Result<Tensor> {
        let x = self.emb.forward(src)?;
        let x = self.lstm.seq(&x, train)?;
        Ok(self.fc.forward(&x)?)
    }
}
