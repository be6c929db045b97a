//! Training configuration: serde structs covering the CLI/config flag
//! surface a training run is driven by, with TOML load/save, following the
//! teacher's `Config::{from_toml_str, to_toml_string}` pattern.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, PersistenceError, Result};
use crate::graph::Emergence;

/// `(|L|,|R|)` size templates, either an explicit list or a rectangle
/// `(l1..l2) x (r1..r2)` excluding `(0,0)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SizeConstraints {
    Rectangle { l: (usize, usize), r: (usize, usize) },
    Explicit(Vec<(usize, usize)>),
}

impl Default for SizeConstraints {
    fn default() -> Self {
        SizeConstraints::Explicit(vec![(1, 1), (1, 0), (0, 1)])
    }
}

impl SizeConstraints {
    pub fn templates(&self) -> Vec<(usize, usize)> {
        match self {
            SizeConstraints::Rectangle { l, r } => {
                let mut out = Vec::new();
                for a in l.0..=l.1 {
                    for b in r.0..=r.1 {
                        if (a, b) != (0, 0) {
                            out.push((a, b));
                        }
                    }
                }
                out
            }
            SizeConstraints::Explicit(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscountConfig {
    Fixed(Vec<f64>),
    Static,
    Optimizing { eager: bool },
}

impl Default for DiscountConfig {
    fn default() -> Self {
        DiscountConfig::Optimizing { eager: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub size_constraints: SizeConstraints,
    pub min_iterations: usize,
    pub max_iterations: usize,
    /// `--viterbi`: maximum-approximation accumulator instead of sum.
    pub use_viterbi: bool,
    /// Emergence policy for training samples (`--no-emergence` selects Suppress).
    pub emergence: Emergence,
    pub discount: DiscountConfig,
    /// `--ramp-up`: grow one order before training starts.
    pub ramp_up: bool,
    /// `--wipe-out`: reset to a zerogram before training starts.
    pub wipe_out: bool,
    pub checkpoint_interval_secs: Option<u64>,
    pub max_stored_graphs: usize,
    /// Decoder stack-depth bound shared by first-best and n-best search.
    pub stack_limit: usize,
    pub variants_mass: Option<f64>,
    pub variants_number: Option<usize>,
    /// `--transpose`: swap left/right (P2G direction).
    pub transpose: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            size_constraints: SizeConstraints::default(),
            min_iterations: 1,
            max_iterations: 100,
            use_viterbi: false,
            emergence: Emergence::Emerge,
            discount: DiscountConfig::default(),
            ramp_up: false,
            wipe_out: false,
            checkpoint_interval_secs: None,
            max_stored_graphs: 5000,
            stack_limit: 1000,
            variants_mass: None,
            variants_number: None,
            transpose: false,
        }
    }
}

impl TrainingConfig {
    /// Catches incompatible flags before a run starts (`Error::Config`,
    /// exit code 1 at the CLI boundary this crate does not own).
    pub fn validate(&self) -> Result<()> {
        if self.min_iterations > self.max_iterations {
            return Err(Error::Config(format!(
                "min_iterations ({}) is greater than max_iterations ({})",
                self.min_iterations, self.max_iterations
            )));
        }
        if self.size_constraints.templates().is_empty() {
            return Err(Error::Config("size_constraints produced no templates".into()));
        }
        Ok(())
    }

    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(PersistenceError::from)?;
        Self::from_toml_str(&content)
    }

    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(PersistenceError::from)?;
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(PersistenceError::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self).map_err(PersistenceError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn min_greater_than_max_is_a_config_error() {
        let mut cfg = TrainingConfig::default();
        cfg.min_iterations = 10;
        cfg.max_iterations = 5;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rectangle_excludes_zero_zero() {
        let sc = SizeConstraints::Rectangle { l: (0, 1), r: (0, 1) };
        let templates = sc.templates();
        assert!(!templates.contains(&(0, 0)));
        assert_eq!(templates.len(), 3);
    }

    #[test]
    fn toml_round_trip_preserves_settings() {
        let mut cfg = TrainingConfig::default();
        cfg.max_iterations = 42;
        cfg.discount = DiscountConfig::Fixed(vec![0.1, 0.2]);
        let toml_str = cfg.to_toml_string().unwrap();
        let restored = TrainingConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(restored.max_iterations, 42);
        assert!(matches!(restored.discount, DiscountConfig::Fixed(ref d) if d == &vec![0.1, 0.2]));
    }
}
