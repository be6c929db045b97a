//! Discount adjustment (Component G): deciding the Kneser-Ney discount
//! vector `D` each training iteration, by one of three strategies.
//!
//! `score`, the parameter every adjuster takes, maps a candidate discount
//! vector to the log-likelihood it would produce on the adjudication
//! sample (held-out if configured, otherwise train). Building the
//! candidate sequence model and running the accumulator over that sample
//! is the training driver's job; this module only owns the search over
//! `D` and the guardrails around it.

use crate::error::Result;
use crate::minimization::{direction_set_minimization, linear_minimization, StartPoint};
use tracing::info;

const MAXIMUM_REASONABLE_DISCOUNT: f64 = 10.0;
const TOLERANCE: f64 = 1.0e-4;
const MAX_ITERATIONS: usize = 100;

/// Extend `discount` to `order + 1` entries by repeating its last element,
/// the common behaviour shared by [`FixedDiscounts`] and [`StaticDiscounts`].
fn extend_to_order(discount: &mut Vec<f64>, order: usize) {
    if discount.len() < order + 1 {
        let last = *discount.last().unwrap_or(&0.0);
        discount.resize(order + 1, last);
    }
}

pub trait DiscountAdjuster {
    /// Decide the discount vector to use for order `order` this iteration.
    /// `evidence_maximum` caps the guardrail interval; `last_devel_log_lik`
    /// is the adjudication log-likelihood recorded after the previous
    /// iteration, if any.
    fn adjust(
        &mut self,
        order: usize,
        evidence_maximum: f64,
        last_devel_log_lik: Option<f64>,
        score: &dyn Fn(&[f64]) -> f64,
    ) -> Result<Vec<f64>>;
}

/// Keeps a configured discount vector unchanged across the whole run,
/// lengthening it as the order grows.
pub struct FixedDiscounts {
    discount: Vec<f64>,
}

impl FixedDiscounts {
    pub fn new(discount: Vec<f64>) -> Self {
        Self {
            discount: if discount.is_empty() { vec![0.0] } else { discount },
        }
    }
}

impl DiscountAdjuster for FixedDiscounts {
    fn adjust(
        &mut self,
        order: usize,
        _evidence_maximum: f64,
        _last_devel_log_lik: Option<f64>,
        _score: &dyn Fn(&[f64]) -> f64,
    ) -> Result<Vec<f64>> {
        extend_to_order(&mut self.discount, order);
        info!(discount = ?self.discount, "fixed discount");
        Ok(self.discount.clone())
    }
}

/// Retains whatever discount the incoming model already carried, only
/// lengthening it as the order grows. Distinct from `FixedDiscounts` only
/// in where its initial vector comes from (the model being resumed, rather
/// than a config entry); their per-iteration behaviour is identical.
pub struct StaticDiscounts {
    discount: Vec<f64>,
}

impl StaticDiscounts {
    pub fn new(discount: Vec<f64>) -> Self {
        Self {
            discount: if discount.is_empty() { vec![0.0] } else { discount },
        }
    }
}

impl DiscountAdjuster for StaticDiscounts {
    fn adjust(
        &mut self,
        order: usize,
        _evidence_maximum: f64,
        _last_devel_log_lik: Option<f64>,
        _score: &dyn Fn(&[f64]) -> f64,
    ) -> Result<Vec<f64>> {
        extend_to_order(&mut self.discount, order);
        info!(discount = ?self.discount, "keeping static discount");
        Ok(self.discount.clone())
    }
}

/// Minimises `-logLik(adjudication)` over `D`, guarded to
/// `[0, min(evidence_maximum, 10)]` by a penalty added outside that
/// interval. Order 0 is a scalar Brent search; higher orders use Powell's
/// method seeded from the previous discount, optionally along the
/// direction the discount last moved.
pub struct OptimizingDiscountAdjuster {
    eager: bool,
    previous: Option<Vec<f64>>,
    current: Option<Vec<f64>>,
}

impl OptimizingDiscountAdjuster {
    /// `eager = false` reproduces the "adjust only when needed" default;
    /// `eager = true` reproduces the eager variant that re-optimises every
    /// iteration regardless of trend.
    pub fn new(eager: bool, initial_discount: Option<Vec<f64>>) -> Self {
        Self {
            eager,
            previous: None,
            current: initial_discount,
        }
    }

    fn should_adjust(&self, last_devel_log_lik: Option<f64>, score: &dyn Fn(&[f64]) -> f64) -> bool {
        match (last_devel_log_lik, &self.current) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(last), Some(current)) => score(current) <= last,
        }
    }

    fn adjust_order_zero(
        &self,
        max_discount: f64,
        score: &dyn Fn(&[f64]) -> f64,
    ) -> Result<(Vec<f64>, f64)> {
        let criterion = |d: f64| {
            let ll = score(&[d.max(0.0)]);
            -ll - d.min(0.0) + (d - max_discount).max(0.0)
        };
        let initial_guess = self.current.as_ref().map(|c| c[0]).unwrap_or(0.1);
        let (d, neg_ll) =
            linear_minimization(&criterion, StartPoint::Point(initial_guess), TOLERANCE, MAX_ITERATIONS)?;
        Ok((vec![d.max(0.0)], neg_ll))
    }

    fn adjust_higher_order(
        &self,
        order: usize,
        max_discount: f64,
        score: &dyn Fn(&[f64]) -> f64,
    ) -> Result<(Vec<f64>, f64)> {
        let k = order + 1;
        let criterion = |d: &[f64]| {
            let clamped: Vec<f64> = d.iter().map(|&x| x.max(0.0)).collect();
            let ll = score(&clamped);
            let below: f64 = d.iter().map(|&x| x.min(0.0)).sum();
            let above: f64 = d.iter().map(|&x| (x - max_discount).max(0.0)).sum();
            -ll - below + above
        };

        let mut first_direction: Option<Vec<f64>> = None;
        let initial_guess: Vec<f64> = match &self.current {
            None => (1..=k).map(|i| 0.1 * i as f64).collect(),
            Some(current) if current.len() < k => {
                let last = *current.last().unwrap();
                let mut guess = current.clone();
                guess.resize(k, last);
                guess
            }
            Some(current) if current.len() > k => current[..k].to_vec(),
            Some(current) => {
                if let Some(previous) = &self.previous {
                    if previous.len() == k {
                        let direction: Vec<f64> =
                            current.iter().zip(previous).map(|(c, p)| c - p).collect();
                        if direction.iter().any(|v| v.abs() > TOLERANCE) {
                            first_direction = Some(direction);
                        }
                    }
                }
                current.clone()
            }
        };

        let mut directions: Vec<Vec<f64>> = (0..k)
            .map(|i| {
                let mut v = vec![0.0; k];
                v[k - 1 - i] = 1.0;
                v
            })
            .collect();
        if let Some(direction) = first_direction {
            directions.insert(0, direction);
        }
        for d in directions.iter_mut() {
            for v in d.iter_mut() {
                *v *= 0.1;
            }
        }

        let (discount, neg_ll) = direction_set_minimization(
            &criterion,
            &initial_guess,
            Some(directions),
            TOLERANCE,
            MAX_ITERATIONS,
        )?;
        let discount: Vec<f64> = discount.into_iter().map(|x| x.max(0.0)).collect();
        Ok((discount, neg_ll))
    }
}

impl DiscountAdjuster for OptimizingDiscountAdjuster {
    fn adjust(
        &mut self,
        order: usize,
        evidence_maximum: f64,
        last_devel_log_lik: Option<f64>,
        score: &dyn Fn(&[f64]) -> f64,
    ) -> Result<Vec<f64>> {
        if !self.eager && !self.should_adjust(last_devel_log_lik, score) {
            let kept = self.current.clone().unwrap_or_else(|| vec![0.0]);
            info!(discount = ?kept, "keeping discount, adjudication score still improving");
            return Ok(kept);
        }

        let max_discount = evidence_maximum.min(MAXIMUM_REASONABLE_DISCOUNT);
        let (discount, neg_ll) = if order == 0 {
            self.adjust_order_zero(max_discount, score)?
        } else {
            self.adjust_higher_order(order, max_discount, score)?
        };
        info!(discount = ?discount, neg_log_lik = neg_ll, "optimised discount");
        self.previous = self.current.take();
        self.current = Some(discount.clone());
        Ok(discount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_discounts_extends_by_repeating_last() {
        let mut adj = FixedDiscounts::new(vec![0.3, 0.7]);
        let d = adj.adjust(4, 100.0, None, &|_| 0.0).unwrap();
        assert_eq!(d, vec![0.3, 0.7, 0.7, 0.7, 0.7]);
    }

    #[test]
    fn static_discounts_extends_by_repeating_last() {
        let mut adj = StaticDiscounts::new(vec![1.0]);
        let d = adj.adjust(2, 100.0, None, &|_| 0.0).unwrap();
        assert_eq!(d, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn optimizing_order_zero_converges_near_peak() {
        // score peaks (ll = 0) at d = 2.0.
        let score = |d: &[f64]| -(d[0] - 2.0).powi(2);
        let mut adj = OptimizingDiscountAdjuster::new(true, None);
        let d = adj.adjust(0, 10.0, None, &score).unwrap();
        assert_eq!(d.len(), 1);
        assert!((d[0] - 2.0).abs() < 1e-2);
    }

    #[test]
    fn optimizing_higher_order_converges_near_peak() {
        // score peaks at d = [1.0, 3.0].
        let score = |d: &[f64]| -((d[0] - 1.0).powi(2) + (d[1] - 3.0).powi(2));
        let mut adj = OptimizingDiscountAdjuster::new(true, None);
        let d = adj.adjust(1, 10.0, None, &score).unwrap();
        assert_eq!(d.len(), 2);
        assert!((d[0] - 1.0).abs() < 1e-2);
        assert!((d[1] - 3.0).abs() < 1e-2);
    }

    #[test]
    fn non_eager_skips_adjustment_when_trend_is_improving() {
        let score = |d: &[f64]| -(d[0] - 2.0).powi(2);
        let mut adj = OptimizingDiscountAdjuster::new(false, Some(vec![5.0]));
        // last devel log-lik is far below what `current` (5.0) would score,
        // so the trend still looks improving and no re-optimisation fires.
        let d = adj.adjust(0, 10.0, Some(-1000.0), &score).unwrap();
        assert_eq!(d, vec![5.0]);
    }

    #[test]
    fn eager_adjusts_even_when_trend_is_improving() {
        let score = |d: &[f64]| -(d[0] - 2.0).powi(2);
        let mut adj = OptimizingDiscountAdjuster::new(true, Some(vec![5.0]));
        let d = adj.adjust(0, 10.0, Some(-1000.0), &score).unwrap();
        assert!((d[0] - 2.0).abs() < 1e-2);
    }
}
