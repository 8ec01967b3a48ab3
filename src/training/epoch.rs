//! What happens at the end of an epoch. This is kept apart from the trainer so the rules can be
//! checked without training anything:
//!
//! 1. A NaN training or validation loss stops training there and then. No decay, no checkpoints.
//! 2. The learning rate decays while it's still above the floor.
//! 3. A strictly better validation loss saves the `best` checkpoint.
//! 4. Every `checkpoint_every` epochs a numbered checkpoint is saved.
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointLabel {
    Best,
    /// One based epoch number
    Epoch(usize),
}

impl fmt::Display for CheckpointLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Best => write!(f, "best"),
            Self::Epoch(epoch) => write!(f, "{:03}", epoch),
        }
    }
}

/// Where a checkpoint with the given label lives, e.g. `g2p-best.safetensors`
pub fn checkpoint_path(dir: impl AsRef<Path>, label: CheckpointLabel) -> PathBuf {
    dir.as_ref().join(format!("g2p-{}.safetensors", label))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EpochDecision {
    Stop,
    Continue {
        decay_lr: bool,
        checkpoints: Vec<CheckpointLabel>,
    },
}

#[derive(Clone, Debug)]
pub struct EpochTracker {
    best_eval_loss: f64,
    min_lr: f64,
    checkpoint_every: usize,
}

impl EpochTracker {
    /// A `checkpoint_every` of zero disables numbered checkpoints
    pub fn new(min_lr: f64, checkpoint_every: usize) -> Self {
        Self {
            best_eval_loss: f64::INFINITY,
            min_lr,
            checkpoint_every,
        }
    }

    pub fn best_eval_loss(&self) -> f64 {
        self.best_eval_loss
    }

    /// `epoch` counts from zero, `lr` is the rate the epoch was trained with.
    pub fn observe(&mut self, epoch: usize, lr: f64, loss: f64, eval_loss: f64) -> EpochDecision {
        if loss.is_nan() || eval_loss.is_nan() {
            return EpochDecision::Stop;
        }
        let mut checkpoints = vec![];
        if self.best_eval_loss > eval_loss {
            self.best_eval_loss = eval_loss;
            checkpoints.push(CheckpointLabel::Best);
        }
        if self.checkpoint_every > 0 && (epoch + 1) % self.checkpoint_every == 0 {
            checkpoints.push(CheckpointLabel::Epoch(epoch + 1));
        }
        EpochDecision::Continue {
            decay_lr: lr > self.min_lr,
            checkpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert_eq!(CheckpointLabel::Best.to_string(), "best");
        assert_eq!(CheckpointLabel::Epoch(20).to_string(), "020");
        assert_eq!(
            checkpoint_path("runs", CheckpointLabel::Epoch(140)),
            Path::new("runs/g2p-140.safetensors")
        );
    }

    #[test]
    fn numbered_checkpoints() {
        let mut tracker = EpochTracker::new(5e-5, 20);
        let mut saved = vec![];
        for epoch in 0..41 {
            // only improves on the first epoch
            let eval_loss = if epoch == 0 { 1.0 } else { 2.0 };
            match tracker.observe(epoch, 0.005, 3.0, eval_loss) {
                EpochDecision::Continue { checkpoints, .. } => saved.extend(checkpoints),
                EpochDecision::Stop => panic!("stopped at {}", epoch),
            }
        }
        assert_eq!(
            saved,
            vec![
                CheckpointLabel::Best,
                CheckpointLabel::Epoch(20),
                CheckpointLabel::Epoch(40)
            ]
        );
    }

    #[test]
    fn best_needs_strict_improvement() {
        let mut tracker = EpochTracker::new(5e-5, 0);
        let decisions = [1.0, 1.0, 0.5]
            .iter()
            .enumerate()
            .map(|(epoch, eval)| tracker.observe(epoch, 0.005, 1.0, *eval))
            .collect::<Vec<_>>();
        let bests = decisions
            .iter()
            .map(|d| match d {
                EpochDecision::Continue { checkpoints, .. } => {
                    checkpoints.contains(&CheckpointLabel::Best)
                }
                EpochDecision::Stop => false,
            })
            .collect::<Vec<_>>();
        assert_eq!(bests, vec![true, false, true]);
        assert_eq!(tracker.best_eval_loss(), 0.5);
    }

    #[test]
    fn nan_stops_without_decay() {
        let mut tracker = EpochTracker::new(5e-5, 1);
        assert_eq!(tracker.observe(0, 0.005, 1.0, f64::NAN), EpochDecision::Stop);
        assert_eq!(tracker.observe(0, 0.005, f64::NAN, 1.0), EpochDecision::Stop);
        // nothing was recorded by the failed epochs
        assert_eq!(tracker.best_eval_loss(), f64::INFINITY);
    }

    #[test]
    fn decay_stops_at_floor() {
        let mut tracker = EpochTracker::new(1e-3, 0);
        let decay = |d: EpochDecision| match d {
            EpochDecision::Continue { decay_lr, .. } => decay_lr,
            EpochDecision::Stop => panic!("unexpected stop"),
        };
        assert!(decay(tracker.observe(0, 2e-3, 1.0, 1.0)));
        assert!(!decay(tracker.observe(1, 1e-3, 1.0, 1.0)));
        assert!(!decay(tracker.observe(2, 5e-4, 1.0, 1.0)));
    }
}
