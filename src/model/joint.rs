use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

/// The transducer joint network. Every encoder step is paired with every decoder step, the pair is
/// concatenated and pushed through a tanh hidden layer before projecting to phoneme logits.
#[derive(Clone, Debug)]
pub struct Joint {
    forward_layer: Linear,
    project_layer: Linear,
}

impl Joint {
    pub fn new(d_model: usize, d_hidden: usize, d_output: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            forward_layer: candle_nn::linear(d_model * 2, d_hidden, vb.pp("forward_layer"))?,
            project_layer: candle_nn::linear(d_hidden, d_output, vb.pp("project_layer"))?,
        })
    }

    /// Takes encoder states `[batch, T, d_model]` and decoder states `[batch, U, d_model]` and
    /// returns logits `[batch, T, U, vocab]`. No softmax, the loss wants raw logits.
    pub fn forward(&self, enc_state: &Tensor, dec_state: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, t, d_model) = enc_state.dims3()?;
        let (_, u, _) = dec_state.dims3()?;
        let enc_state = enc_state
            .unsqueeze(2)?
            .broadcast_as((batch, t, u, d_model))?
            .contiguous()?;
        let dec_state = dec_state
            .unsqueeze(1)?
            .broadcast_as((batch, t, u, d_model))?
            .contiguous()?;
        let concat_state = Tensor::cat(&[&enc_state, &dec_state], 3)?;

        let outputs = self.forward_layer.forward(&concat_state)?.tanh()?;
        self.project_layer.forward(&outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn lattice_pairs_every_step() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let joint = Joint::new(4, 6, 7, vb).unwrap();

        let enc = Tensor::randn(0f32, 1.0, (2, 5, 4), &Device::Cpu).unwrap();
        let dec = Tensor::randn(0f32, 1.0, (2, 3, 4), &Device::Cpu).unwrap();
        let lattice = joint.forward(&enc, &dec).unwrap();
        assert_eq!(lattice.dims(), &[2, 5, 3, 7]);

        // A single cell of the lattice is the joint of that encoder and decoder step
        let single = joint
            .forward(
                &enc.narrow(1, 3, 1).unwrap(),
                &dec.narrow(1, 2, 1).unwrap(),
            )
            .unwrap();
        let expected = lattice
            .narrow(1, 3, 1)
            .unwrap()
            .narrow(2, 2, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let single = single.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in single.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
