//! Using a trained model. `Phonemizer` is the entry point, it combines a pronunciation dictionary
//! with any `StepPredictor`: the candle `GreedyG2p` or an ONNX export run through `OnnxG2p`. An
//! optional `PhoneSet` limits the symbols handed back.
pub mod g2p;
pub mod onnx;
pub mod phones;

pub use g2p::*;
pub use onnx::*;
pub use phones::*;
