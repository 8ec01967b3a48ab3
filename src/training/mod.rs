//! Training of the transducer model on a pronunciation lexicon. `G2pTrainer` owns the model, the
//! dataset and the mutable training state, the decisions made at the end of every epoch live in
//! `EpochTracker` and evaluation metrics in `metrics`.

pub mod epoch;
pub mod metrics;
pub mod trainer;

pub use epoch::*;
pub use metrics::*;
pub use trainer::*;
