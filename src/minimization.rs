//! Numerical minimization (ported from an external golden-section/Brent/
//! Powell implementation used to fit the discount vector in Component G).
//!
//! `bracket_minimum` and `linear_minimization` implement Brent's method of
//! parabolic interpolation (Numerical Recipes section 10.2); bracketing
//! follows Numerical Recipes 10.1. `direction_set_minimization` is Powell's
//! method (Numerical Recipes 10.5), used when more than one discount needs
//! joint optimization. `has_significant_decrease` is a one-sided z-test on
//! the slope of a short series, used to decide when an EM run has stopped
//! improving.

use crate::error::{Error, Result};

const MAX_ITERATIONS: usize = 100;
const Z_EPSILON: f64 = 1.0e-18;

fn gold() -> f64 {
    (1.0 + 5.0_f64.sqrt()) / 2.0
}

fn c_gold() -> f64 {
    (3.0 - 5.0_f64.sqrt()) / 2.0
}

/// Where to start Brent's search from: a single point (a bracket is found
/// by downhill search first) or an already-known bracket.
#[derive(Debug, Clone, Copy)]
pub enum StartPoint {
    Point(f64),
    Bracket(f64, f64),
}

/// Search in the downhill direction from `xa`, `xb` and return `(xa, xb,
/// xc, fa, fb, fc)` bracketing a minimum, with `xb` strictly between `xa`
/// and `xc` and `fb` the smallest of the three.
#[allow(clippy::float_cmp)]
pub fn bracket_minimum(
    f: &impl Fn(f64) -> f64,
    xa: f64,
    xb: f64,
) -> (f64, f64, f64, f64, f64, f64) {
    let gold = gold();
    let (mut xa, mut xb) = (xa, xb);
    let mut fa = f(xa);
    let mut fb = f(xb);
    if fb > fa {
        std::mem::swap(&mut xa, &mut xb);
        std::mem::swap(&mut fa, &mut fb);
    }
    let mut xc = xb + gold * (xb - xa);
    let mut fc = f(xc);

    while fb >= fc {
        let xu_limit = xb + 100.0 * (xc - xb);
        let r = (xb - xa) * (fb - fc);
        let q = (xb - xc) * (fb - fa);
        let mut xu = xb - (xb - xc) * q - (xb - xa) * r;
        if q != r {
            xu /= 2.0 * (q - r);
        } else {
            xu = xu_limit;
        }

        let mut fu;
        if (xb - xu) * (xu - xc) > 0.0 {
            fu = f(xu);
            if fu < fc {
                xa = xb;
                fa = fb;
                xb = xu;
                fb = fu;
                break;
            } else if fu > fb {
                xc = xu;
                fc = fu;
                break;
            }
            xu = xc + gold * (xc - xb);
            fu = f(xu);
        } else if (xc - xu) * (xu - xu_limit) > 0.0 {
            fu = f(xu);
            if fu < fc {
                xb = xc;
                fb = fc;
                xc = xu;
                fc = fu;
                xu = xc + gold * (xc - xb);
                fu = f(xu);
            }
        } else if (xu - xu_limit) * (xu_limit - xc) >= 0.0 {
            xu = xu_limit;
            fu = f(xu);
        } else {
            xu = xc + gold * (xc - xb);
            fu = f(xu);
        }

        xa = xb;
        xb = xc;
        xc = xu;
        fa = fb;
        fb = fc;
        fc = fu;
    }

    (xa, xb, xc, fa, fb, fc)
}

/// Brent's method of parabolic interpolation, falling back to golden
/// section steps when the parabolic step is unsafe. Returns `(x, f(x))` at
/// the minimum, or `Error::ConvergenceFailure` if `max_iterations` is
/// exhausted first.
pub fn linear_minimization(
    f: &impl Fn(f64) -> f64,
    start: StartPoint,
    tolerance: f64,
    max_iterations: usize,
) -> Result<(f64, f64)> {
    let c_gold = c_gold();
    let (mut a, mut b, mut x, mut fx) = match start {
        StartPoint::Point(x0) => {
            let (xa, xb, xc, _fa, fb, _fc) = bracket_minimum(f, x0, x0 + 1.0);
            let (a, b) = if xa < xc { (xa, xc) } else { (xc, xa) };
            (a, b, xb, fb)
        }
        StartPoint::Bracket(lower, upper) => {
            let x = lower + c_gold * (upper - lower);
            let fx = f(x);
            (lower, upper, x, fx)
        }
    };

    let mut d = 0.0_f64;
    let mut e = 0.0_f64;
    let (mut v, mut fv) = (x, fx);
    let (mut w, mut fw) = (x, fx);

    for _ in 0..max_iterations {
        let xm = (a + b) / 2.0;
        let tol = tolerance * x.abs() + Z_EPSILON;
        if (x - xm).abs() <= 2.0 * tol - (b - a) / 2.0 {
            return Ok((x, fx));
        }

        if e.abs() > tol {
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() >= (0.5 * q * etemp).abs() || p <= q * (a - x) || p >= q * (b - x) {
                e = if x >= xm { a - x } else { b - x };
                d = c_gold * e;
            } else {
                d = p / q;
                let u = x + d;
                if u - a < 2.0 * tol || b - u < 2.0 * tol {
                    d = if xm >= x { tol } else { -tol };
                }
            }
        } else {
            e = if x >= xm { a - x } else { b - x };
            d = c_gold * e;
        }

        let u = if d.abs() > tol {
            x + d
        } else if d > 0.0 {
            x + tol
        } else {
            x - tol
        };
        let fu = f(u);

        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu < fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }

    Err(Error::ConvergenceFailure(max_iterations))
}

fn has_converged(f_current: f64, f_old: f64, tolerance: f64) -> bool {
    2.0 * (f_old - f_current) <= tolerance * (f_old.abs() + f_current.abs() + Z_EPSILON)
}

/// Powell's method: minimize `f` over a vector starting at `initial_point`,
/// along `directions` (defaulting to the coordinate axes), replacing the
/// direction of largest decrease with the net step taken each iteration
/// when that step looks non-degenerate. Returns the minimizing point and
/// its value, or `Error::ConvergenceFailure` if `max_iterations` elapses.
pub fn direction_set_minimization(
    f: &impl Fn(&[f64]) -> f64,
    initial_point: &[f64],
    directions: Option<Vec<Vec<f64>>>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<(Vec<f64>, f64)> {
    let n = initial_point.len();
    let mut directions = directions.unwrap_or_else(|| {
        (0..n)
            .map(|i| {
                let mut v = vec![0.0; n];
                v[i] = 1.0;
                v
            })
            .collect()
    });
    let mut current = initial_point.to_vec();
    let mut f_current = f(&current);

    for _ in 0..max_iterations {
        let old = current.clone();
        let f_old = f_current;
        let mut largest_decrease = 0.0;
        let mut direction_of_largest_decrease: Option<usize> = None;

        for dir in 0..directions.len() {
            let base = current.clone();
            let dir_vector = directions[dir].clone();
            let line = move |x: f64| {
                let point: Vec<f64> =
                    base.iter().zip(&dir_vector).map(|(c, d)| c + x * d).collect();
                f(&point)
            };
            let (x_min, f_min) =
                linear_minimization(&line, StartPoint::Point(0.0), tolerance, max_iterations)?;

            let decrease = f_current - f_min;
            if decrease > largest_decrease {
                largest_decrease = decrease;
                direction_of_largest_decrease = Some(dir);
            }
            for (c, d) in current.iter_mut().zip(&directions[dir]) {
                *c += x_min * d;
            }
            f_current = f_min;
            if x_min.abs() > Z_EPSILON {
                for v in directions[dir].iter_mut() {
                    *v *= x_min;
                }
            }
        }

        if has_converged(f_current, f_old, tolerance) {
            return Ok((current, f_current));
        }

        let average_direction: Vec<f64> =
            current.iter().zip(&old).map(|(c, o)| c - o).collect();
        let extrapolated: Vec<f64> = current
            .iter()
            .zip(&average_direction)
            .map(|(c, a)| c + a)
            .collect();
        let f_extrapolated = f(&extrapolated);
        if f_extrapolated < f_current {
            if let Some(dir_idx) = direction_of_largest_decrease {
                let lhs = 2.0
                    * (f_old - 2.0 * f_current + f_extrapolated)
                    * (f_old - f_current - largest_decrease).powi(2);
                let rhs = (f_old - f_extrapolated).powi(2) * largest_decrease;
                if lhs < rhs {
                    directions[dir_idx] = directions[0].clone();
                    directions[0] = average_direction;
                }
            }
        }
    }

    Err(Error::ConvergenceFailure(max_iterations))
}

/// One-sided z-test: true if the slope of `series` (evenly spaced, oldest
/// first) is significantly negative at 99% confidence, i.e. the run is
/// still improving. Needs at least two points; fewer always returns false.
pub fn has_significant_decrease(series: &[f64]) -> bool {
    let len = series.len();
    if len < 2 {
        return false;
    }
    let n = len as f64;
    let start = (1.0 - n) / 2.0;
    let x: Vec<f64> = (0..len).map(|i| start + i as f64).collect();
    let xx = (n - 1.0) * n * (n + 1.0) / 12.0;

    let mean: f64 = series.iter().sum::<f64>() / n;
    let slope: f64 = x.iter().zip(series).map(|(&xi, &yi)| xi * yi).sum::<f64>() / xx;

    let sum_sq_delta: f64 = x
        .iter()
        .zip(series)
        .map(|(&xi, &yi)| {
            let d = yi - mean - slope * xi;
            d * d
        })
        .sum();
    let sigma = (sum_sq_delta / (n * (n - 1.0))).sqrt();
    let sigma_slope = sigma / xx.sqrt();

    slope < -2.326348 * sigma_slope
}
