//! Goal-count sampling.
//!
//! Poisson draws use the product-of-uniforms method. Negative binomial draws
//! are generated as a gamma–Poisson mixture whose shape comes from the
//! team's own goal series, which widens the tails for over-dispersed teams.

use rand::Rng;
use rand_distr::{Distribution, Gamma};
use serde::{Deserialize, Serialize};

use crate::engine::settings::DistributionKind;

/// Non-positive rates are clamped to this instead of erroring.
pub const LAMBDA_EPSILON: f64 = 1e-6;

/// Largest rate handled by a single product-of-uniforms pass. e^-λ stays
/// well clear of underflow below this; bigger rates are split and summed.
const POISSON_CHUNK: f64 = 30.0;

/// Variance-to-mean ratio above which negative binomial is recommended.
const OVERDISPERSION_RATIO: f64 = 1.2;

/// Gamma shape of a negative binomial goal law (the `r`/`n` parameter).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dispersion {
    pub shape: f64,
}

fn mean_and_variance(series: &[u32]) -> Option<(f64, f64)> {
    if series.len() < 3 {
        return None;
    }
    let n = series.len() as f64;
    let mean = series.iter().map(|&g| g as f64).sum::<f64>() / n;
    let var = series
        .iter()
        .map(|&g| (g as f64 - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    Some((mean, var))
}

/// Method-of-moments shape estimate. `None` when the series is too short or
/// not over-dispersed, in which case callers fall back to Poisson.
pub fn estimate_dispersion(series: &[u32]) -> Option<Dispersion> {
    let (mean, var) = mean_and_variance(series)?;
    if mean <= 0.0 || var <= mean {
        return None;
    }
    let shape = mean * mean / (var - mean);
    if shape.is_finite() && shape > 0.0 {
        Some(Dispersion { shape })
    } else {
        None
    }
}

/// Suggest a law for a goal series from its variance-to-mean ratio.
pub fn recommend_distribution(series: &[u32]) -> DistributionKind {
    match mean_and_variance(series) {
        Some((mean, var)) if mean > 0.0 && var > OVERDISPERSION_RATIO * mean => {
            DistributionKind::NegativeBinomial
        }
        _ => DistributionKind::Poisson,
    }
}

/// Draw one goal count.
///
/// A negative binomial request without a dispersion estimate degrades to
/// Poisson with the same mean.
pub fn sample<R: Rng + ?Sized>(
    lambda: f64,
    kind: DistributionKind,
    dispersion: Option<Dispersion>,
    rng: &mut R,
) -> u32 {
    let lambda = clamp_lambda(lambda);
    match (kind, dispersion) {
        (DistributionKind::NegativeBinomial, Some(d)) => {
            match Gamma::new(d.shape, lambda / d.shape) {
                Ok(gamma) => sample_poisson(gamma.sample(rng), rng),
                Err(_) => sample_poisson(lambda, rng),
            }
        }
        _ => sample_poisson(lambda, rng),
    }
}

fn clamp_lambda(lambda: f64) -> f64 {
    if lambda.is_finite() && lambda > LAMBDA_EPSILON {
        lambda
    } else {
        LAMBDA_EPSILON
    }
}

/// Product-of-uniforms Poisson draw.
pub fn sample_poisson<R: Rng + ?Sized>(lambda: f64, rng: &mut R) -> u32 {
    let mut remaining = clamp_lambda(lambda);
    let mut total = 0u32;
    while remaining > POISSON_CHUNK {
        total = total.saturating_add(poisson_small(POISSON_CHUNK, rng));
        remaining -= POISSON_CHUNK;
    }
    total.saturating_add(poisson_small(remaining, rng))
}

fn poisson_small<R: Rng + ?Sized>(lambda: f64, rng: &mut R) -> u32 {
    let limit = (-lambda).exp();
    let mut k = 0u32;
    let mut p: f64 = rng.gen();
    while p > limit {
        k += 1;
        p *= rng.gen::<f64>();
    }
    k
}
