//! seqmodel-core
//!
//! Variable-order back-off joint-sequence model: multigram inventory,
//! estimation-graph EM training, and stack decoding.
//!
//! A joint-sequence model pairs two alphabets (for example, letters and
//! phonemes) and learns a single n-gram-style sequence model over jointly
//! segmented "multigrams", `(left-slice, right-slice)` pairs, rather than
//! over either alphabet alone. Training alternates an estimation-graph pass
//! (forward-backward evidence collection under the current model) with a
//! Kneser-Ney-style discounting and compilation pass, iterating to
//! convergence. Decoding runs a stack-based best-first search over the
//! trained model to translate a left-side sequence into its most likely
//! right-side sequence, or to enumerate the `n` best segmentations.
//!
//! Public API:
//! - [`Model`] / [`Sequitur`] - trained model aggregate: symbol inventories,
//!   multigram inventory, sequence model, discount adjuster
//! - [`TrainingContext`] / [`Trainer`] - the EM training loop
//! - [`translate`] / [`NBestSearch`] - first-best and n-best decoding
//! - [`Error`] / [`Result`] - the crate's error kinds

pub mod error;
pub use error::{Error, PersistenceError, Result};

pub mod symbol;
pub use symbol::{SymbolId, SymbolInventory, TERM, VOID as SYMBOL_VOID};

pub mod multigram;
pub use multigram::{Multigram, MultigramId, MultigramInventory, SizeTemplate};

pub mod sequence_model;
pub use sequence_model::{History, NodeId, SequenceModel, ROOT};

pub mod graph;
pub use graph::{Edge, Emergence, EstimationGraph, GraphNodeId};

pub mod accumulator;
pub use accumulator::{accumulate, log_likelihood, AccumulatorKind};

pub mod evidence;
pub use evidence::{compile, kneser_ney_discount, DiscountedLevel, EvidenceStore};

pub mod minimization;
pub use minimization::{
    bracket_minimum, direction_set_minimization, has_significant_decrease,
    linear_minimization, StartPoint,
};

pub mod discount;
pub use discount::{DiscountAdjuster, FixedDiscounts, OptimizingDiscountAdjuster, StaticDiscounts};

pub mod config;
pub use config::{DiscountConfig, SizeConstraints, TrainingConfig};

pub mod training;
pub use training::{skeleton_for, Sample, Trainer, TrainingContext};

pub mod decoder;
pub use decoder::{translate, Hypothesis, NBestSearch};

pub mod model;
pub use model::{Model, Sequitur};
