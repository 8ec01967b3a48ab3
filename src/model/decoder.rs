use super::joint::Joint;
use super::lstm::{Lstm, LstmState};
use crate::config::DecoderConfig;
use anyhow::ensure;
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder};

/// The prediction network of the transducer, a unidirectional LSTM over the phonemes emitted so
/// far. It also owns the joint network as that's where its output goes.
///
/// There are two ways to drive it. `encode_full` takes the whole history at once, this is what
/// training and the stateless exported model use. `step` takes just the newest phoneme and the
/// recurrent state from the previous call which is what makes decoding cheap. Both go through the
/// same `Lstm` cells so feeding a history one phoneme at a time gives the same result as handing
/// it over in one go.
#[derive(Clone, Debug)]
pub struct Decoder {
    emb: Embedding,
    lstm: Lstm,
    fc: Linear,
    joint: Joint,
}

impl Decoder {
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> anyhow::Result<Self> {
        let emb = candle_nn::embedding(config.phonemes.len(), config.d_model, vb.pp("emb"))?;
        let lstm = Lstm::new(
            config.d_model,
            config.d_hidden,
            config.num_layers,
            false,
            config.dropout,
            vb.pp("lstm"),
        )?;
        let fc = candle_nn::linear(config.d_hidden, config.d_model, vb.pp("fc"))?;
        let joint = Joint::new(
            config.d_model,
            config.d_hidden,
            config.phonemes.len(),
            vb.pp("joint"),
        )?;
        Ok(Self {
            emb,
            lstm,
            fc,
            joint,
        })
    }

    pub fn joint(&self) -> &Joint {
        &self.joint
    }

    /// Decoder state for every prefix of `tgt` (`[batch, U]`, already starting with `<bos>`).
    /// Returns `[batch, U, d_model]`.
    pub fn encode_full(&self, tgt: &Tensor, train: bool) -> anyhow::Result<Tensor> {
        let x = self.emb.forward(tgt)?;
        let x = self.lstm.seq(&x, train)?;
        Ok(self.fc.forward(&x)?)
    }

    /// Teacher forced pass producing the full `[batch, T, U, vocab]` logit lattice against the
    /// encoder output `memory`.
    pub fn forward(&self, tgt: &Tensor, memory: &Tensor, train: bool) -> anyhow::Result<Tensor> {
        let x = self.encode_full(tgt, train)?;
        Ok(self.joint.forward(memory, &x)?)
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> candle_core::Result<LstmState> {
        self.lstm.zero_state(batch, device)
    }

    /// Feeds one phoneme per batch entry (`[batch]`) into the recurrence, returning the decoder
    /// state vector `[batch, d_model]` and the updated LSTM state.
    pub fn advance(&self, token: &Tensor, state: &LstmState) -> anyhow::Result<(Tensor, LstmState)> {
        let x = self.emb.forward(token)?;
        let (x, state) = self.lstm.step(&x, state)?;
        Ok((self.fc.forward(&x)?, state))
    }

    /// Single streaming step. Only the last phoneme of `tgt` (`[batch, U]`) is consumed, the rest
    /// of the history is carried by `state`. `memory` is the full encoder output and `t` selects
    /// the time step to join against. Returns the predicted phoneme for every batch entry and the
    /// state after consuming the last phoneme, only keep that state if the prediction isn't blank.
    pub fn step(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        t: usize,
        state: &LstmState,
    ) -> anyhow::Result<(Vec<u32>, LstmState)> {
        let (_, u) = tgt.dims2()?;
        let (_, memory_len, _) = memory.dims3()?;
        ensure!(u > 0, "decoder needs at least the <bos> token");
        ensure!(t < memory_len, "time step {} is past the encoder output", t);

        let last = tgt.narrow(1, u - 1, 1)?.squeeze(1)?;
        let (x, state) = self.advance(&last, state)?;
        let mem = memory.narrow(1, t, 1)?;
        let logits = self.joint.forward(&mem, &x.unsqueeze(1)?)?;
        // softmax doesn't change the argmax so it's skipped
        let pred = logits.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?;
        Ok((pred, state))
    }
}
