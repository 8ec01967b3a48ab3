use anyhow::Context;
use candle_core::Device;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use xd_g2p::config::TRAIN_CONFIG_FILE;
use xd_g2p::dataset::Dataset;
use xd_g2p::dictionary::Dictionary;
use xd_g2p::infer::{OnnxG2p, PhoneSet, Phonemizer};
use xd_g2p::model::{ExportManifest, MANIFEST_FILE};
use xd_g2p::training::*;
use xd_g2p::*;

#[derive(Parser, Debug)]
pub struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model on a pronunciation lexicon
    Train {
        /// Model and training config, an ARPAbet setup is used if not provided
        #[clap(long)]
        config: Option<PathBuf>,
        #[clap(long)]
        lexicon: PathBuf,
        #[clap(long)]
        epochs: Option<usize>,
        #[clap(long)]
        seed: Option<u64>,
        /// Where checkpoints are written, overrides the config
        #[clap(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Writes the vocabulary coverage of the lexicon as JSON
        #[clap(long)]
        report: Option<PathBuf>,
    },
    /// Work out the word and phoneme error rates over a whole lexicon
    Test {
        #[clap(long)]
        config: Option<PathBuf>,
        #[clap(long)]
        lexicon: PathBuf,
        #[clap(long)]
        checkpoint: PathBuf,
        /// Every mispredicted word is written here
        #[clap(long)]
        log: Option<PathBuf>,
    },
    /// Write a checkpoint out as a model directory for inference
    Export {
        #[clap(long)]
        config: Option<PathBuf>,
        #[clap(long)]
        checkpoint: PathBuf,
        #[clap(long)]
        out: PathBuf,
    },
    /// Print pronunciations for words
    Predict {
        /// Exported model directory
        #[clap(long)]
        model: PathBuf,
        /// Dictionary consulted before the model
        #[clap(long)]
        dict: Option<PathBuf>,
        /// Phone set, symbols missing from it are left out of the output
        #[clap(long)]
        phones: Option<PathBuf>,
        /// Run the `g2p.onnx` graph in the model directory instead of the safetensors weights
        #[clap(long)]
        onnx: bool,
        words: Vec<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<G2pConfig> {
    match path {
        Some(path) => G2pConfig::open(path),
        None => Ok(G2pConfig::arpabet()),
    }
}

fn main() -> anyhow::Result<()> {
    xd_g2p::setup_logging()?;
    let args = Args::parse();
    let device = Device::Cpu;

    match args.command {
        Command::Train {
            config,
            lexicon,
            epochs,
            seed,
            checkpoint_dir,
            report,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if seed.is_some() {
                config.training.seed = seed;
            }
            if let Some(dir) = checkpoint_dir {
                config.training.checkpoint_dir = dir;
            }

            let dataset = Dataset::open(&lexicon, &config)?;
            if let Some(report) = report {
                fs::write(&report, serde_json::to_string_pretty(dataset.report())?)
                    .with_context(|| format!("writing report {}", report.display()))?;
            }

            fs::create_dir_all(&config.training.checkpoint_dir)?;
            config.save(config.training.checkpoint_dir.join(TRAIN_CONFIG_FILE))?;

            let (varmap, model) = G2p::init(&config, &device)?;
            let mut trainer = G2pTrainer::new(model, varmap, dataset)?;
            match trainer.train()? {
                TrainOutcome::Completed { best_eval_loss } => {
                    info!("Training finished, best eval loss: {:.4}", best_eval_loss)
                }
                TrainOutcome::Diverged { epoch } => info!("Training stopped at epoch {}", epoch),
            }
        }
        Command::Test {
            config,
            lexicon,
            checkpoint,
            log,
        } => {
            let config = load_config(config.as_ref())?;
            let dataset = Dataset::open(&lexicon, &config)?;
            let (_, model) = G2p::load(&config, &checkpoint, &device)?;
            let rates = test_model(&model, &dataset, log.as_deref())?;
            println!("wer = {:.4} per = {:.4}", rates.wer(), rates.per());
        }
        Command::Export {
            config,
            checkpoint,
            out,
        } => {
            let config = load_config(config.as_ref())?;
            let (varmap, model) = G2p::load(&config, &checkpoint, &device)?;
            GreedyG2p::from_model(&model).export(&varmap, &out)?;
        }
        Command::Predict {
            model,
            dict,
            phones,
            onnx,
            words,
        } => {
            let manifest = ExportManifest::open(model.join(MANIFEST_FILE))?;
            let mut builder = Phonemizer::create();
            if let Some(dict) = dict {
                builder = builder.add_dictionary(Dictionary::open(dict, &manifest.config.dataset)?);
            }
            if let Some(phones) = phones {
                builder = builder.add_phone_set(PhoneSet::open(phones)?);
            }
            builder = if onnx {
                builder.add_model(OnnxG2p::load(&model)?)
            } else {
                builder.add_model(GreedyG2p::load(&model, &device)?)
            };
            let mut phonemizer = builder.build()?;

            for word in &words {
                match phonemizer.query(word)? {
                    Some(pronunciation) => println!("{}: {}", word, pronunciation.join(" ")),
                    None => println!("{}:", word),
                }
            }
        }
    }
    Ok(())
}
