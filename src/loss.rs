//! The RNN-T loss. For each word this is the negative log of the total probability of every
//! alignment of the phonemes to the letters. An alignment is a walk through the `T x (U + 1)`
//! lattice from `(0, 0)` that either emits the next phoneme (moving `u` on) or emits a blank
//! (moving `t` on), finishing with a blank out of `(T - 1, U)`.
//!
//! The log softmax is fused into the loss so the model hands over raw logits. Costs are computed
//! per word and averaged over the batch. The alpha and beta recursions are done in `f64` on the
//! CPU, the lattices here are tiny (a word is rarely more than 20 letters) so that's never where
//! the time goes.
//!
//! candle has no transducer loss so it's implemented as a custom op. The backward pass uses the
//! usual closed form for the gradient with respect to the logits:
//!
//! ```text
//! grad(t, u, v) = exp(log_softmax(t, u, v) + alpha(t, u) + beta(t, u) - ll)
//!               - [v == blank] exp(alpha(t, u) + log_softmax(t, u, blank) + beta(t + 1, u) - ll)
//!               - [v == y(u)]  exp(alpha(t, u) + log_softmax(t, u, y(u)) + beta(t, u + 1) - ll)
//! ```
//!
//! which is then optionally clamped element-wise.
use anyhow::ensure;
use candle_core::{bail, CpuStorage, CustomOp1, Device, Layout, Shape, Tensor};

const NEG_INFINITY: f64 = f64::NEG_INFINITY;

fn log_add(a: f64, b: f64) -> f64 {
    if a == NEG_INFINITY {
        b
    } else if b == NEG_INFINITY {
        a
    } else {
        let max = a.max(b);
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

/// The part of a padded `[T_max, U_max + 1, vocab]` logit block that belongs to one word.
struct SequenceLattice<'a> {
    logits: &'a [f32],
    max_u: usize,
    vocab: usize,
    targets: &'a [u32],
    t_len: usize,
    blank: usize,
    /// log-sum-exp of the logits at each `(t, u)` of the valid region
    denominators: Vec<f64>,
}

impl<'a> SequenceLattice<'a> {
    fn new(
        logits: &'a [f32],
        max_u: usize,
        vocab: usize,
        targets: &'a [u32],
        t_len: usize,
        blank: usize,
    ) -> Self {
        let u_len = targets.len() + 1;
        let mut denominators = Vec::with_capacity(t_len * u_len);
        for t in 0..t_len {
            for u in 0..u_len {
                let start = (t * max_u + u) * vocab;
                let row = &logits[start..start + vocab];
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
                let sum: f64 = row.iter().map(|x| (*x as f64 - max).exp()).sum();
                denominators.push(max + sum.ln());
            }
        }
        Self {
            logits,
            max_u,
            vocab,
            targets,
            t_len,
            blank,
            denominators,
        }
    }

    fn u_len(&self) -> usize {
        self.targets.len() + 1
    }

    fn offset(&self, t: usize, u: usize) -> usize {
        (t * self.max_u + u) * self.vocab
    }

    fn log_prob(&self, t: usize, u: usize, v: usize) -> f64 {
        self.logits[self.offset(t, u) + v] as f64 - self.denominators[t * self.u_len() + u]
    }

    fn blank(&self, t: usize, u: usize) -> f64 {
        self.log_prob(t, u, self.blank)
    }

    fn emit(&self, t: usize, u: usize) -> f64 {
        self.log_prob(t, u, self.targets[u] as usize)
    }

    /// Log probability of reaching each node, `[t_len * u_len]`
    fn alphas(&self) -> Vec<f64> {
        let u_len = self.u_len();
        let mut alpha = vec![NEG_INFINITY; self.t_len * u_len];
        for t in 0..self.t_len {
            for u in 0..u_len {
                alpha[t * u_len + u] = if t == 0 && u == 0 {
                    0.0
                } else {
                    let from_blank = if t > 0 {
                        alpha[(t - 1) * u_len + u] + self.blank(t - 1, u)
                    } else {
                        NEG_INFINITY
                    };
                    let from_emit = if u > 0 {
                        alpha[t * u_len + u - 1] + self.emit(t, u - 1)
                    } else {
                        NEG_INFINITY
                    };
                    log_add(from_blank, from_emit)
                };
            }
        }
        alpha
    }

    /// Log probability of finishing from each node, `[t_len * u_len]`
    fn betas(&self) -> Vec<f64> {
        let u_len = self.u_len();
        let last_t = self.t_len - 1;
        let last_u = u_len - 1;
        let mut beta = vec![NEG_INFINITY; self.t_len * u_len];
        for t in (0..self.t_len).rev() {
            for u in (0..u_len).rev() {
                beta[t * u_len + u] = if t == last_t && u == last_u {
                    self.blank(t, u)
                } else {
                    let via_blank = if t < last_t {
                        beta[(t + 1) * u_len + u] + self.blank(t, u)
                    } else {
                        NEG_INFINITY
                    };
                    let via_emit = if u < last_u {
                        beta[t * u_len + u + 1] + self.emit(t, u)
                    } else {
                        NEG_INFINITY
                    };
                    log_add(via_blank, via_emit)
                };
            }
        }
        beta
    }

    fn log_likelihood(&self, alpha: &[f64]) -> f64 {
        let last = self.t_len * self.u_len() - 1;
        alpha[last] + self.blank(self.t_len - 1, self.u_len() - 1)
    }

    fn cost(&self) -> f64 {
        -self.log_likelihood(&self.alphas())
    }

    /// Gradient of the cost over the whole padded block, zero outside the valid region. A `clamp`
    /// of zero or less disables clamping.
    fn grad(&self, clamp: f32) -> Vec<f32> {
        let alpha = self.alphas();
        let beta = self.betas();
        let ll = self.log_likelihood(&alpha);
        let u_len = self.u_len();
        let last_t = self.t_len - 1;
        let last_u = u_len - 1;

        let mut grad = vec![0.0f32; self.logits.len()];
        for t in 0..self.t_len {
            for u in 0..u_len {
                let node = alpha[t * u_len + u];
                let occupancy = node + beta[t * u_len + u] - ll;
                let offset = self.offset(t, u);
                for v in 0..self.vocab {
                    let mut g = (self.log_prob(t, u, v) + occupancy).exp();
                    if v == self.blank {
                        let next = if t < last_t {
                            beta[(t + 1) * u_len + u]
                        } else if u == last_u {
                            0.0
                        } else {
                            NEG_INFINITY
                        };
                        g -= (node + self.blank(t, u) + next - ll).exp();
                    }
                    if u < last_u && v == self.targets[u] as usize {
                        g -= (node + self.emit(t, u) + beta[t * u_len + u + 1] - ll).exp();
                    }
                    let mut g = g as f32;
                    if clamp > 0.0 {
                        g = g.clamp(-clamp, clamp);
                    }
                    grad[offset + v] = g;
                }
            }
        }
        grad
    }
}

/// Per word costs of a padded batch of lattices. The extra inputs live on the op itself so it can
/// be applied to the logits alone.
struct TransducerCosts {
    targets: Vec<Vec<u32>>,
    src_lengths: Vec<usize>,
    blank: usize,
    clamp: f32,
}

impl TransducerCosts {
    fn lattices<'a>(
        &'a self,
        logits: &'a [f32],
        dims: (usize, usize, usize, usize),
    ) -> Vec<SequenceLattice<'a>> {
        let (batch, max_t, max_u, vocab) = dims;
        let block = max_t * max_u * vocab;
        (0..batch)
            .map(|b| {
                SequenceLattice::new(
                    &logits[b * block..(b + 1) * block],
                    max_u,
                    vocab,
                    &self.targets[b],
                    self.src_lengths[b],
                    self.blank,
                )
            })
            .collect()
    }
}

impl CustomOp1 for TransducerCosts {
    fn name(&self) -> &'static str {
        "rnnt-loss"
    }

    fn cpu_fwd(
        &self,
        storage: &CpuStorage,
        layout: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let logits = match storage {
            CpuStorage::F32(data) => data,
            _ => bail!("rnnt loss expects f32 logits"),
        };
        let logits = match layout.contiguous_offsets() {
            Some((start, end)) => &logits[start..end],
            None => bail!("rnnt loss expects contiguous logits"),
        };
        let dims = layout.shape().dims4()?;
        let costs = self
            .lattices(logits, dims)
            .iter()
            .map(|lattice| lattice.cost() as f32)
            .collect::<Vec<_>>();
        Ok((CpuStorage::F32(costs), Shape::from(dims.0)))
    }

    fn bwd(
        &self,
        arg: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<Option<Tensor>> {
        let dims = arg.dims4()?;
        let logits = arg.flatten_all()?.to_vec1::<f32>()?;
        let grads = self
            .lattices(&logits, dims)
            .iter()
            .flat_map(|lattice| lattice.grad(self.clamp))
            .collect::<Vec<_>>();
        let grads = Tensor::from_vec(grads, arg.shape(), arg.device())?;
        let scale = grad_res.reshape((dims.0, 1, 1, 1))?;
        Ok(Some(grads.broadcast_mul(&scale)?))
    }
}

/// Transducer loss with a fused log softmax and a mean over the batch.
#[derive(Clone, Copy, Debug)]
pub struct RnntLoss {
    blank: u32,
    clamp: f32,
}

impl RnntLoss {
    /// A `clamp` of zero or less leaves the gradient unclamped.
    pub fn new(blank: u32, clamp: f32) -> Self {
        Self { blank, clamp }
    }

    /// `logits` is `[batch, T, U + 1, vocab]`, `targets` is `[batch, U]` padded and both length
    /// tensors are `[batch]`. Returns a scalar tensor on the CPU.
    pub fn forward(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        src_lengths: &Tensor,
        tgt_lengths: &Tensor,
    ) -> anyhow::Result<Tensor> {
        let (batch, max_t, max_u, vocab) = logits.dims4()?;
        let src_lengths = src_lengths.to_vec1::<u32>()?;
        let tgt_lengths = tgt_lengths.to_vec1::<u32>()?;
        let padded_targets = targets.to_vec2::<u32>()?;
        ensure!(
            src_lengths.len() == batch && tgt_lengths.len() == batch && padded_targets.len() == batch,
            "loss inputs disagree on batch size"
        );
        ensure!((self.blank as usize) < vocab, "blank is outside the vocabulary");

        let mut targets = Vec::with_capacity(batch);
        for (b, row) in padded_targets.into_iter().enumerate() {
            let (t_len, u_len) = (src_lengths[b] as usize, tgt_lengths[b] as usize);
            ensure!(
                t_len > 0 && t_len <= max_t,
                "source length {} doesn't fit {} frames",
                t_len,
                max_t
            );
            ensure!(
                u_len < max_u && u_len <= row.len(),
                "target length {} doesn't fit the lattice",
                u_len
            );
            let row = row[..u_len].to_vec();
            ensure!(
                row.iter().all(|x| (*x as usize) < vocab),
                "target outside the vocabulary"
            );
            targets.push(row);
        }

        let op = TransducerCosts {
            targets,
            src_lengths: src_lengths.iter().map(|x| *x as usize).collect(),
            blank: self.blank as usize,
            clamp: self.clamp,
        };
        let costs = logits
            .to_device(&Device::Cpu)?
            .contiguous()?
            .apply_op1(op)?;
        Ok(costs.mean(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::BOS_IDX;
    use candle_core::Var;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_logits(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len).map(|_| rng.gen_range(-2.0f32..2.0)).collect()
    }

    /// Sums the probability of every alignment by walking them one at a time
    fn brute_force(lattice: &SequenceLattice, t: usize, u: usize, acc: f64, paths: &mut Vec<f64>) {
        let last_t = lattice.t_len - 1;
        let last_u = lattice.u_len() - 1;
        if t == last_t && u == last_u {
            paths.push(acc + lattice.blank(t, u));
            return;
        }
        if t < last_t {
            brute_force(lattice, t + 1, u, acc + lattice.blank(t, u), paths);
        }
        if u < last_u {
            brute_force(lattice, t, u + 1, acc + lattice.emit(t, u), paths);
        }
    }

    #[test]
    fn cost_sums_every_alignment() {
        let mut rng = StdRng::seed_from_u64(3);
        let (t_len, vocab) = (4, 6);
        let targets = [4u32, 5, 4];
        let max_u = targets.len() + 1;
        let logits = random_logits(&mut rng, t_len * max_u * vocab);
        let lattice = SequenceLattice::new(&logits, max_u, vocab, &targets, t_len, 2);

        let mut paths = vec![];
        brute_force(&lattice, 0, 0, 0.0, &mut paths);
        // C(T - 1 + U, U) ways to interleave the moves
        assert_eq!(paths.len(), 20);
        let total: f64 = paths.iter().map(|x| x.exp()).sum();
        assert!((lattice.cost() + total.ln()).abs() < 1e-9);

        // both recursions agree on the total
        assert!((lattice.cost() + lattice.betas()[0]).abs() < 1e-9);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let (t_len, vocab) = (3, 5);
        let targets = [4u32, 3];
        let max_u = targets.len() + 1;
        let logits = random_logits(&mut rng, t_len * max_u * vocab);
        let grad = SequenceLattice::new(&logits, max_u, vocab, &targets, t_len, 2).grad(0.0);

        let eps = 1e-3;
        for i in 0..logits.len() {
            let mut plus = logits.clone();
            plus[i] += eps;
            let mut minus = logits.clone();
            minus[i] -= eps;
            let cost_plus = SequenceLattice::new(&plus, max_u, vocab, &targets, t_len, 2).cost();
            let cost_minus = SequenceLattice::new(&minus, max_u, vocab, &targets, t_len, 2).cost();
            let numeric = (cost_plus - cost_minus) / (2.0 * eps as f64);
            assert!(
                (numeric - grad[i] as f64).abs() < 5e-3,
                "index {}: numeric {} analytic {}",
                i,
                numeric,
                grad[i]
            );
        }
    }

    #[test]
    fn empty_target_is_all_blanks() {
        let mut rng = StdRng::seed_from_u64(5);
        let (t_len, vocab) = (3, 5);
        let logits = random_logits(&mut rng, t_len * vocab);
        let lattice = SequenceLattice::new(&logits, 1, vocab, &[], t_len, 2);
        let expected: f64 = (0..t_len).map(|t| -lattice.blank(t, 0)).sum();
        assert!((lattice.cost() - expected).abs() < 1e-9);
    }

    #[test]
    fn clamped_gradient() {
        let mut rng = StdRng::seed_from_u64(9);
        let logits = random_logits(&mut rng, 4 * 3 * 6);
        let lattice = SequenceLattice::new(&logits, 3, 6, &[4, 5], 4, 2);
        let free = lattice.grad(0.0);
        assert!(free.iter().any(|x| x.abs() > 0.1));
        let clamped = lattice.grad(0.1);
        assert!(clamped.iter().all(|x| x.abs() <= 0.1));

        // softmax is shift invariant so the unclamped gradient at each node sums to zero
        for node in free.chunks(6) {
            assert!(node.iter().sum::<f32>().abs() < 1e-5);
        }
    }

    #[test]
    fn padded_batch_backward() {
        let mut rng = StdRng::seed_from_u64(1);
        let (batch, max_t, max_u, vocab) = (2, 4, 3, 7);
        let data = random_logits(&mut rng, batch * max_t * max_u * vocab);
        let logits = Var::from_tensor(
            &Tensor::from_vec(data.clone(), (batch, max_t, max_u, vocab), &Device::Cpu).unwrap(),
        )
        .unwrap();

        let targets = Tensor::new(&[[4u32, 6], [5, 1]], &Device::Cpu).unwrap();
        let src_lengths = Tensor::new(&[4u32, 2], &Device::Cpu).unwrap();
        let tgt_lengths = Tensor::new(&[2u32, 1], &Device::Cpu).unwrap();

        let loss = RnntLoss::new(BOS_IDX, 0.0)
            .forward(logits.as_tensor(), &targets, &src_lengths, &tgt_lengths)
            .unwrap();
        assert_eq!(loss.dims(), &[] as &[usize]);

        let block = max_t * max_u * vocab;
        let first = SequenceLattice::new(&data[..block], max_u, vocab, &[4, 6], 4, 2);
        let second = SequenceLattice::new(&data[block..], max_u, vocab, &[5], 2, 2);
        let expected = (first.cost() + second.cost()) / 2.0;
        let loss_value = loss.to_scalar::<f32>().unwrap() as f64;
        assert!((loss_value - expected).abs() < 1e-4);

        let grads = loss.backward().unwrap();
        let grad = grads
            .get(logits.as_tensor())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let expected = first
            .grad(0.0)
            .into_iter()
            .chain(second.grad(0.0))
            .map(|x| x / 2.0)
            .collect::<Vec<_>>();
        for (a, b) in grad.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        // frames and targets past the lengths get nothing
        let second_block = &grad[block..];
        assert!(second_block[2 * max_u * vocab..].iter().all(|x| *x == 0.0));
        assert!(second_block[2 * vocab..3 * vocab].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn rejects_bad_lengths() {
        let logits = Tensor::zeros((1, 2, 2, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[4u32]], &Device::Cpu).unwrap();
        let loss = RnntLoss::new(BOS_IDX, 0.0);
        let too_long = Tensor::new(&[3u32], &Device::Cpu).unwrap();
        let ok = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        assert!(loss.forward(&logits, &targets, &too_long, &ok).is_err());
        let zero = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        assert!(loss.forward(&logits, &targets, &zero, &ok).is_err());
        assert!(loss.forward(&logits, &targets, &ok, &ok).is_ok());
    }
}
