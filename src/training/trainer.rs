use super::epoch::*;
use super::metrics::ErrorRates;
use crate::config::TrainingConfig;
use crate::dataset::{Batch, Dataset, Entry, Split};
use crate::loss::RnntLoss;
use crate::model::G2p;
use crate::vocab::BOS_IDX;
use anyhow::{ensure, Context};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Multiplies the learning rate by `gamma` on every step
#[derive(Clone, Debug)]
pub struct ExponentialLr {
    lr: f64,
    gamma: f64,
}

impl ExponentialLr {
    pub fn new(lr: f64, gamma: f64) -> Self {
        Self { lr, gamma }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn step(&mut self) -> f64 {
        self.lr *= self.gamma;
        self.lr
    }
}

/// Everything that changes as training goes on, apart from the weights themselves.
pub struct TrainContext {
    pub optimizer: AdamW,
    pub scheduler: ExponentialLr,
    pub rng: StdRng,
    pub split: Split,
    pub tracker: EpochTracker,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrainOutcome {
    /// All epochs ran
    Completed { best_eval_loss: f64 },
    /// A NaN loss ended training at this zero based epoch
    Diverged { epoch: usize },
}

/// Scales the gradients down so their combined L2 norm is at most `max_norm`. Returns the norm
/// before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> anyhow::Result<f64> {
    let mut total = 0.0;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, grad.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

fn lengths_tensor(lengths: &[usize]) -> candle_core::Result<Tensor> {
    let len = lengths.len();
    let lengths = lengths.iter().map(|x| *x as u32).collect::<Vec<_>>();
    Tensor::from_vec(lengths, len, &Device::Cpu)
}

pub struct G2pTrainer {
    config: TrainingConfig,
    model: G2p,
    varmap: VarMap,
    dataset: Dataset,
    loss_fn: RnntLoss,
    ctx: TrainContext,
}

impl G2pTrainer {
    /// Sets up training of `model` (whose parameters live in `varmap`) on `dataset`. A tenth of
    /// the dataset is held back for validation, so it needs at least ten entries.
    pub fn new(model: G2p, varmap: VarMap, dataset: Dataset) -> anyhow::Result<Self> {
        let config = model.config().training.clone();
        ensure!(config.batch_size > 0, "batch size must be positive");
        ensure!(
            dataset.graphemes() == model.graphemes() && dataset.phonemes() == model.phonemes(),
            "dataset and model vocabularies differ"
        );

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let split = dataset.split(&mut rng);
        ensure!(
            !split.train.is_empty() && !split.valid.is_empty(),
            "{} entries isn't enough to make training and validation sets",
            dataset.len()
        );
        info!(
            "Training on {} entries, validating on {}",
            split.train.len(),
            split.valid.len()
        );

        let params = ParamsAdamW {
            lr: config.lr,
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-9,
            // Without weight decay this is plain Adam
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        let ctx = TrainContext {
            optimizer,
            scheduler: ExponentialLr::new(config.lr, config.gamma),
            rng,
            split,
            tracker: EpochTracker::new(config.min_lr, config.checkpoint_every),
        };

        Ok(Self {
            loss_fn: RnntLoss::new(BOS_IDX, config.grad_clip as f32),
            config,
            model,
            varmap,
            dataset,
            ctx,
        })
    }

    pub fn model(&self) -> &G2p {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn context(&self) -> &TrainContext {
        &self.ctx
    }

    fn batch_loss(&self, batch: &Batch, train: bool) -> anyhow::Result<Tensor> {
        let logits = self
            .model
            .forward(&batch.src, &batch.decoder_input()?, train)?;
        self.loss_fn.forward(
            &logits,
            &batch.tgt.to_device(&Device::Cpu)?,
            &lengths_tensor(&batch.src_lengths)?,
            &lengths_tensor(&batch.tgt_lengths)?,
        )
    }

    /// One shuffled pass over the training set, returns the mean batch loss
    pub fn train_epoch(&mut self) -> anyhow::Result<f64> {
        let mut order = self.ctx.split.train.clone();
        order.shuffle(&mut self.ctx.rng);

        let vars = self.varmap.all_vars();
        let device = self.model.device().clone();
        let mut losses = 0.0;
        let mut count = 0;
        for indexes in order.chunks(self.config.batch_size) {
            let batch = self.dataset.batch(indexes, &device)?;
            let loss = self.batch_loss(&batch, true)?;
            let mut grads = loss.backward()?;
            let norm = clip_grad_norm(&vars, &mut grads, self.config.grad_clip)?;
            self.ctx.optimizer.step(&grads)?;

            losses += loss.to_scalar::<f32>()? as f64;
            count += 1;
            debug!(
                "batch {}: loss: {:.4} grad norm: {:.4}",
                count,
                losses / count as f64,
                norm
            );
        }
        Ok(losses / count as f64)
    }

    /// Mean batch loss over the validation set
    pub fn eval(&self) -> anyhow::Result<f64> {
        let device = self.model.device();
        let mut losses = 0.0;
        let mut count = 0;
        for indexes in self.ctx.split.valid.chunks(self.config.batch_size) {
            let batch = self.dataset.batch(indexes, device)?;
            losses += self.batch_loss(&batch, false)?.to_scalar::<f32>()? as f64;
            count += 1;
        }
        Ok(losses / count as f64)
    }

    pub fn save_checkpoint(&self, label: CheckpointLabel) -> anyhow::Result<PathBuf> {
        let dir = &self.config.checkpoint_dir;
        fs::create_dir_all(dir)
            .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
        let path = checkpoint_path(dir, label);
        self.varmap
            .save(&path)
            .with_context(|| format!("saving checkpoint {}", path.display()))?;
        Ok(path)
    }

    pub fn load_checkpoint(&mut self, label: CheckpointLabel) -> anyhow::Result<()> {
        let path = checkpoint_path(&self.config.checkpoint_dir, label);
        self.varmap
            .load(&path)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;
        info!("Loaded checkpoint {}", path.display());
        Ok(())
    }

    fn preview(&self, entry: &Entry) -> anyhow::Result<()> {
        let predicted = self.model.predict_str(&entry.word)?;
        info!(
            "{}: [{}] [{}]",
            entry.word,
            entry.pronunciation.join("-"),
            predicted.join("-")
        );
        Ok(())
    }

    pub fn train(&mut self) -> anyhow::Result<TrainOutcome> {
        let previews = (0..self.config.preview_count)
            .map(|_| self.ctx.rng.gen_range(0..self.dataset.len()))
            .collect::<Vec<_>>();

        for epoch in 0..self.config.epochs {
            let loss = self.train_epoch()?;
            let eval_loss = self.eval()?;
            let lr = self.ctx.scheduler.lr();
            info!(
                "epoch: {} - lr: {:.2e} - loss: {:.4} - eval_loss: {:.4}",
                epoch, lr, loss, eval_loss
            );

            match self.ctx.tracker.observe(epoch, lr, loss, eval_loss) {
                EpochDecision::Stop => {
                    error!("Loss is NaN at epoch {}, stopping training", epoch);
                    return Ok(TrainOutcome::Diverged { epoch });
                }
                EpochDecision::Continue {
                    decay_lr,
                    checkpoints,
                } => {
                    if decay_lr {
                        let lr = self.ctx.scheduler.step();
                        self.ctx.optimizer.set_learning_rate(lr);
                    }
                    for label in checkpoints {
                        if label == CheckpointLabel::Best {
                            info!("saving new best at epoch {}", epoch);
                        }
                        let path = self.save_checkpoint(label)?;
                        debug!("Wrote {}", path.display());
                    }
                }
            }

            for idx in &previews {
                self.preview(&self.dataset.entries()[*idx])?;
            }
        }
        Ok(TrainOutcome::Completed {
            best_eval_loss: self.ctx.tracker.best_eval_loss(),
        })
    }

    /// Scores the model over the whole dataset, see [`test_model`]
    pub fn test(&self, test_log: Option<&Path>) -> anyhow::Result<ErrorRates> {
        test_model(&self.model, &self.dataset, test_log)
    }
}

/// Greedily decodes every entry in the lexicon and scores it against the reference. This is slow.
/// Mismatches can be written to `test_log`, each one as the word followed by the reference and
/// predicted pronunciations on tab indented lines.
pub fn test_model(
    model: &G2p,
    dataset: &Dataset,
    test_log: Option<&Path>,
) -> anyhow::Result<ErrorRates> {
    let mut log = match test_log {
        Some(path) => Some(BufWriter::new(
            fs::File::create(path)
                .with_context(|| format!("creating test log {}", path.display()))?,
        )),
        None => None,
    };

    let mut rates = ErrorRates::default();
    for entry in dataset.entries() {
        let predicted = model.predict_str(&entry.word)?;
        let distance = rates.observe(&entry.pronunciation, &predicted);
        if distance > 0 {
            if let Some(log) = log.as_mut() {
                write!(
                    log,
                    "{}\n\t{}\n\t{}\n",
                    entry.word,
                    entry.pronunciation.join(" "),
                    predicted.join(" ")
                )?;
            }
        }
        debug!("wer = {:.4} per = {:.4}", rates.wer(), rates.per());
    }
    if let Some(mut log) = log {
        log.flush()?;
    }
    info!(
        "Tested {} words: wer = {:.4} per = {:.4}",
        rates.words,
        rates.wer(),
        rates.per()
    );
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tiny;
    use std::io::Cursor;

    const LEXICON: &str = ";;; tiny lexicon
A  AH0
AB  AH0 B
ABE  AH0 B
BAD  B AH1 D
CAB  K AH1 B
CAD  K AH1 D
DAB  D AH1 B
DEB  D AH1 B
BED  B AH1 D
ACE  AH0 K
ACED  AH0 K D
BEAD  B AH1 D
DEAD  D AH1 D
DECADE  D AH0 K AH1 D
CEDE(1)  K AH1 D
EBB  AH1 B
";

    fn trainer(name: &str) -> G2pTrainer {
        let mut config = tiny();
        config.training.checkpoint_dir =
            std::env::temp_dir().join(format!("xd-g2p-{}-{}", name, std::process::id()));
        let dataset = Dataset::from_reader(Cursor::new(LEXICON), &config).unwrap();
        let (varmap, model) = G2p::init(&config, &Device::Cpu).unwrap();
        G2pTrainer::new(model, varmap, dataset).unwrap()
    }

    #[test]
    fn needs_validation_data() {
        let config = tiny();
        let dataset = Dataset::from_reader(Cursor::new("AB  AH B\nBAD  B AH D\n"), &config).unwrap();
        let (varmap, model) = G2p::init(&config, &Device::Cpu).unwrap();
        assert!(G2pTrainer::new(model, varmap, dataset).is_err());
    }

    #[test]
    fn clipping_bounds_norm() {
        let a = Var::from_tensor(&Tensor::new(&[3.0f32, 0.0], &Device::Cpu).unwrap()).unwrap();
        let b = Var::from_tensor(&Tensor::new(&[4.0f32], &Device::Cpu).unwrap()).unwrap();
        // gradient of sum(x^2) / 2 is x, so the gradient norm is 5
        let loss = (a.sqr().unwrap().sum_all().unwrap() + b.sqr().unwrap().sum_all().unwrap())
            .unwrap()
            .affine(0.5, 0.0)
            .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];
        let norm = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);

        let clipped = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!((clipped - 1.0).abs() < 1e-4);
        let a_grad = grads.get(&a).unwrap().to_vec1::<f32>().unwrap();
        assert!((a_grad[0] - 0.6).abs() < 1e-4);
    }

    #[test]
    fn schedule() {
        let mut scheduler = ExponentialLr::new(0.005, 0.8);
        assert_eq!(scheduler.lr(), 0.005);
        assert!((scheduler.step() - 0.004).abs() < 1e-12);
        assert!((scheduler.step() - 0.0032).abs() < 1e-12);
    }

    #[test]
    fn train_and_reload() {
        let mut trainer = trainer("train");
        assert_eq!(trainer.context().split.valid.len(), 1);

        let outcome = trainer.train().unwrap();
        let best_eval_loss = match outcome {
            TrainOutcome::Completed { best_eval_loss } => best_eval_loss,
            TrainOutcome::Diverged { epoch } => panic!("diverged at {}", epoch),
        };
        assert!(best_eval_loss.is_finite());
        // two decays from the starting rate
        assert!((trainer.context().scheduler.lr() - 0.005 * 0.8 * 0.8).abs() < 1e-12);

        let best = checkpoint_path(&trainer.config.checkpoint_dir, CheckpointLabel::Best);
        assert!(best.exists());

        // the best checkpoint gives the same validation loss when loaded back
        trainer.load_checkpoint(CheckpointLabel::Best).unwrap();
        assert!((trainer.eval().unwrap() - best_eval_loss).abs() < 1e-4);

        fs::remove_dir_all(&trainer.config.checkpoint_dir).unwrap();
    }

    #[test]
    fn test_log_lists_mismatches() {
        let trainer = trainer("test");
        let log = trainer.config.checkpoint_dir.with_extension("log");
        let rates = trainer.test(Some(&log)).unwrap();
        assert_eq!(rates.words, trainer.dataset().len());
        assert_eq!(rates.phonemes, 44);

        let contents = fs::read_to_string(&log).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3 * rates.word_errors);
        for mismatch in lines.chunks(3) {
            assert!(trainer.dataset().entries().iter().any(|e| e.word == mismatch[0]));
            assert!(mismatch[1].starts_with('\t'));
            assert!(mismatch[2].starts_with('\t'));
        }
        fs::remove_file(&log).unwrap();
    }

    #[test]
    fn small_lexicon_can_be_tested() {
        let config = tiny();
        let dataset =
            Dataset::from_reader(Cursor::new("AB  AH B\nBAD  B AH D\nCAB  K AH B\n"), &config)
                .unwrap();
        let (_, model) = G2p::init(&config, &Device::Cpu).unwrap();

        let rates = test_model(&model, &dataset, None).unwrap();
        assert_eq!(rates.words, 3);
        assert_eq!(rates.phonemes, 8);
        assert!(rates.word_errors <= 3);
        assert!((0.0..=1.0).contains(&rates.wer()));
    }
}
