//! Grapheme to phoneme conversion with an RNN transducer. Words are read letter by letter by an
//! LSTM encoder, a second LSTM tracks the phonemes emitted so far and a joint network decides at
//! each step whether to emit another phoneme or move on to the next letter. This is trained on a
//! pronunciation lexicon like CMU dict and is meant to fill in the words a dictionary is missing.
use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod config;
pub mod dataset;
pub mod dictionary;
pub mod infer;
pub mod loss;
pub mod model;
pub mod training;
pub mod vocab;

pub use config::G2pConfig;
pub use model::{G2p, GreedyG2p};

pub fn setup_logging() -> anyhow::Result<()> {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("xd_g2p=info,g2p=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
