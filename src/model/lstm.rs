//! A multi-layer LSTM written out cell by cell. candle has an LSTM but we need two things from
//! ours: a single step with an explicit state for streaming decoding, and a guarantee that running
//! the whole sequence is nothing more than that same step folded over time. Having both paths call
//! `LstmCell::step` is what keeps training and inference from drifting apart.
//!
//! Parameter names follow the PyTorch convention (`weight_ih_l0`, `bias_hh_l1_reverse`, ...) so
//! weights exported from a torch state dict to safetensors load without renaming.
//!
//! For each step:
//!
//! ```text
//! gates = x @ W_ih^T + b_ih + h @ W_hh^T + b_hh
//! i, f, g, o = gates.chunk(4)
//! c' = sigmoid(f) * c + sigmoid(i) * tanh(g)
//! h' = sigmoid(o) * tanh(c')
//! ```
use anyhow::ensure;
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

#[derive(Clone, Debug)]
struct LstmCell {
    weight_ih: Tensor,
    weight_hh: Tensor,
    bias_ih: Tensor,
    bias_hh: Tensor,
    hidden_size: usize,
}

impl LstmCell {
    fn new(input_size: usize, hidden_size: usize, suffix: &str, vb: &VarBuilder) -> Result<Self> {
        // Same initialisation torch uses for its recurrent layers
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let gate_size = 4 * hidden_size;
        Ok(Self {
            weight_ih: vb.get_with_hints(
                (gate_size, input_size),
                &format!("weight_ih_{suffix}"),
                init,
            )?,
            weight_hh: vb.get_with_hints(
                (gate_size, hidden_size),
                &format!("weight_hh_{suffix}"),
                init,
            )?,
            bias_ih: vb.get_with_hints(gate_size, &format!("bias_ih_{suffix}"), init)?,
            bias_hh: vb.get_with_hints(gate_size, &format!("bias_hh_{suffix}"), init)?,
            hidden_size,
        })
    }

    /// `x` is `[batch, input]`, `h` and `c` are `[batch, hidden]`
    fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = x
            .matmul(&self.weight_ih.t()?)?
            .broadcast_add(&self.bias_ih)?
            .add(&h.matmul(&self.weight_hh.t()?)?.broadcast_add(&self.bias_hh)?)?;
        let gates = gates.chunk(4, D::Minus1)?;

        let i = candle_nn::ops::sigmoid(&gates[0])?;
        let f = candle_nn::ops::sigmoid(&gates[1])?;
        let g = gates[2].tanh()?;
        let o = candle_nn::ops::sigmoid(&gates[3])?;

        let c = f.mul(c)?.add(&i.mul(&g)?)?;
        let h = o.mul(&c.tanh()?)?;
        Ok((h, c))
    }

    fn zeros(&self, batch: usize, device: &Device) -> Result<Tensor> {
        Tensor::zeros((batch, self.hidden_size), DType::F32, device)
    }

    /// Runs the cell over a whole sequence from a zero state, in reverse if asked. The outputs are
    /// always returned in input order.
    fn run(&self, xs: &[Tensor], reverse: bool) -> Result<Vec<Tensor>> {
        let batch = xs[0].dim(0)?;
        let mut h = self.zeros(batch, xs[0].device())?;
        let mut c = h.clone();
        let mut outputs = Vec::with_capacity(xs.len());
        let order: Box<dyn Iterator<Item = &Tensor>> = if reverse {
            Box::new(xs.iter().rev())
        } else {
            Box::new(xs.iter())
        };
        for x in order {
            let (h_next, c_next) = self.step(x, &h, &c)?;
            outputs.push(h_next.clone());
            h = h_next;
            c = c_next;
        }
        if reverse {
            outputs.reverse();
        }
        Ok(outputs)
    }
}

/// Hidden and cell state of every layer, each `[batch, hidden]`.
#[derive(Clone, Debug)]
pub struct LstmState {
    pub h: Vec<Tensor>,
    pub c: Vec<Tensor>,
}

#[derive(Clone, Debug)]
pub struct Lstm {
    forward: Vec<LstmCell>,
    backward: Option<Vec<LstmCell>>,
    hidden_size: usize,
    dropout: f32,
}

impl Lstm {
    /// Dropout is applied to the output of every layer but the last and only while training.
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        dropout: f32,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        ensure!(num_layers > 0, "an LSTM needs at least one layer");
        let directions = if bidirectional { 2 } else { 1 };
        let mut forward = vec![];
        let mut backward = vec![];
        for layer in 0..num_layers {
            let layer_input = if layer == 0 {
                input_size
            } else {
                hidden_size * directions
            };
            forward.push(LstmCell::new(
                layer_input,
                hidden_size,
                &format!("l{layer}"),
                &vb,
            )?);
            if bidirectional {
                backward.push(LstmCell::new(
                    layer_input,
                    hidden_size,
                    &format!("l{layer}_reverse"),
                    &vb,
                )?);
            }
        }
        Ok(Self {
            forward,
            backward: bidirectional.then_some(backward),
            hidden_size,
            dropout,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.forward.len()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Size of the feature dimension coming out of `seq`
    pub fn output_size(&self) -> usize {
        match self.backward {
            Some(_) => 2 * self.hidden_size,
            None => self.hidden_size,
        }
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<LstmState> {
        let zeros = (0..self.num_layers())
            .map(|_| Tensor::zeros((batch, self.hidden_size), DType::F32, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(LstmState {
            h: zeros.clone(),
            c: zeros,
        })
    }

    /// Advances a unidirectional LSTM by one time step. `x` is `[batch, input]` and the returned
    /// tensor is the last layer's hidden state.
    pub fn step(&self, x: &Tensor, state: &LstmState) -> anyhow::Result<(Tensor, LstmState)> {
        ensure!(
            self.backward.is_none(),
            "a bidirectional LSTM can't be stepped"
        );
        let mut x = x.clone();
        let mut h = Vec::with_capacity(self.num_layers());
        let mut c = Vec::with_capacity(self.num_layers());
        for (layer, cell) in self.forward.iter().enumerate() {
            let (h_next, c_next) = cell.step(&x, &state.h[layer], &state.c[layer])?;
            x = h_next.clone();
            h.push(h_next);
            c.push(c_next);
        }
        Ok((x, LstmState { h, c }))
    }

    /// Runs the full `[batch, seq, input]` sequence from a zero state returning
    /// `[batch, seq, output_size]`.
    pub fn seq(&self, input: &Tensor, train: bool) -> anyhow::Result<Tensor> {
        let (_, seq_len, _) = input.dims3()?;
        ensure!(seq_len > 0, "can't run an LSTM over an empty sequence");

        let mut xs = (0..seq_len)
            .map(|t| input.narrow(1, t, 1)?.squeeze(1))
            .collect::<Result<Vec<_>>>()?;

        for layer in 0..self.num_layers() {
            let forward = self.forward[layer].run(&xs, false)?;
            let mut outputs = match &self.backward {
                Some(backward) => {
                    let backward = backward[layer].run(&xs, true)?;
                    forward
                        .iter()
                        .zip(backward.iter())
                        .map(|(f, b)| Tensor::cat(&[f, b], 1))
                        .collect::<Result<Vec<_>>>()?
                }
                None => forward,
            };
            if train && self.dropout > 0.0 && layer + 1 < self.num_layers() {
                outputs = outputs
                    .iter()
                    .map(|x| candle_nn::ops::dropout(x, self.dropout))
                    .collect::<Result<Vec<_>>>()?;
            }
            xs = outputs;
        }
        Ok(Tensor::stack(&xs, 1)?)
    }
}
