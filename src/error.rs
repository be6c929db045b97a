//! Library-wide error type.
//!
//! One variant per error kind named by the training/decoding design: config
//! problems are caught before a run starts, sample and numeric issues are
//! recoverable mid-run (logged and skipped), translation and convergence
//! failures are local to one call, and persistence failures are fatal for
//! the current run but never corrupt the last published best model.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("sample has no segmentation under the current templates/emergence mode: {0}")]
    SampleUnreachable(String),

    #[error("translation failed: {0}")]
    TranslationFailure(String),

    #[error("numeric underflow: zero direct probability for {0}")]
    NumericUnderflow(String),

    #[error("discount adjustment did not converge after {0} iterations")]
    ConvergenceFailure(usize),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("(de)serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("config deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("mixture models with {0} components are not supported, only single-component artifacts")]
    UnsupportedMixture(usize),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
