//! Per-trial chaos perturbation.
//!
//! Three independent components are combined into an additive lambda delta:
//! - a heavy-tailed (Lévy-style) kick, drawn separately for each side
//! - a fractal rhythm term shared by both sides
//! - rare discrete shocks (red card, penalty, momentum swing)
//!
//! Every component is centred, so over many trials the central prediction
//! does not move; only spread and tail mass change.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::str::FromStr;

use crate::engine::settings::ChaosConfig;
use crate::error::EngineError;

/// Heavy-tail draws are clipped to this magnitude before scaling.
const LEVY_CLAMP: f64 = 0.8;
const LEVY_SCALE: f64 = 3.0;
/// Kicks smaller than this (after intensity) are dropped.
const LEVY_FLOOR: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosPreset {
    Conservative,
    Moderate,
    Aggressive,
    Extreme,
    Maximum,
}

impl ChaosPreset {
    pub fn config(self) -> ChaosConfig {
        let (levy_intensity, levy_alpha, fractal_intensity, red, pen, mom) = match self {
            ChaosPreset::Conservative => (0.03, 1.8, 0.08, 0.08, 0.15, 0.2),
            ChaosPreset::Moderate => (0.08, 1.7, 0.12, 0.12, 0.25, 0.4),
            ChaosPreset::Aggressive => (0.15, 1.5, 0.20, 0.18, 0.35, 0.6),
            ChaosPreset::Extreme => (0.35, 1.3, 0.50, 0.30, 0.50, 0.8),
            ChaosPreset::Maximum => (0.50, 1.1, 1.0, 0.50, 1.0, 1.0),
        };
        ChaosConfig {
            enabled: true,
            levy_intensity,
            levy_alpha,
            fractal_intensity,
            red_card_rate: red,
            penalty_rate: pen,
            momentum_rate: mom,
        }
    }
}

impl FromStr for ChaosPreset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(ChaosPreset::Conservative),
            "moderate" => Ok(ChaosPreset::Moderate),
            "aggressive" => Ok(ChaosPreset::Aggressive),
            "extreme" => Ok(ChaosPreset::Extreme),
            "maximum" => Ok(ChaosPreset::Maximum),
            other => Err(EngineError::invalid(format!("unknown chaos preset '{}'", other))),
        }
    }
}

/// Additive lambda deltas for one trial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChaosPerturbation {
    pub home: f64,
    pub away: f64,
}

/// A discrete shock kind: the side it happens to gets `primary`, the other
/// side gets `secondary`. Each side is hit with probability `rate / 2`,
/// home checked first.
#[derive(Debug, Clone, Copy)]
struct Shock {
    chance: f64,
    primary: f64,
    secondary: f64,
}

impl Shock {
    /// Expected (home, away) multipliers under the home-first check order.
    fn expected(&self) -> (f64, f64) {
        let q = self.chance;
        let none = (1.0 - q) * (1.0 - q);
        let home = q * self.primary + (1.0 - q) * q * self.secondary + none;
        let away = q * self.secondary + (1.0 - q) * q * self.primary + none;
        (home, away)
    }
}

/// Chaos sampler prepared once per run.
#[derive(Debug, Clone)]
pub struct ChaosModel {
    config: ChaosConfig,
    shocks: [Shock; 3],
    expected_home: f64,
    expected_away: f64,
}

impl ChaosModel {
    pub fn new(config: &ChaosConfig) -> Self {
        let shocks = [
            // red card against the side
            Shock {
                chance: (config.red_card_rate / 2.0).clamp(0.0, 1.0),
                primary: 0.65,
                secondary: 1.15,
            },
            // penalty awarded to the side
            Shock {
                chance: (config.penalty_rate / 2.0).clamp(0.0, 1.0),
                primary: 1.6,
                secondary: 0.95,
            },
            // momentum surge for the side
            Shock {
                chance: (config.momentum_rate * 0.5).clamp(0.0, 1.0),
                primary: 1.2,
                secondary: 0.85,
            },
        ];
        let (expected_home, expected_away) = shocks
            .iter()
            .map(Shock::expected)
            .fold((1.0, 1.0), |(h, a), (eh, ea)| (h * eh, a * ea));
        ChaosModel {
            config: config.clone(),
            shocks,
            expected_home,
            expected_away,
        }
    }

    /// Draw a fresh perturbation for one trial.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        home_lambda: f64,
        away_lambda: f64,
        rng: &mut R,
    ) -> ChaosPerturbation {
        if !self.config.enabled {
            return ChaosPerturbation::default();
        }

        let (mut m_home, mut m_away) = (1.0, 1.0);
        for shock in &self.shocks {
            if rng.gen::<f64>() < shock.chance {
                m_home *= shock.primary;
                m_away *= shock.secondary;
            } else if rng.gen::<f64>() < shock.chance {
                m_away *= shock.primary;
                m_home *= shock.secondary;
            }
        }

        let fractal = fractal_noise(rng.gen(), self.config.fractal_intensity);

        let home = home_lambda * (m_home - self.expected_home)
            + home_lambda * fractal
            + self.levy_kick(rng);
        let away = away_lambda * (m_away - self.expected_away)
            + away_lambda * fractal
            + self.levy_kick(rng);
        ChaosPerturbation { home, away }
    }

    fn levy_kick<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let intensity = self.config.levy_intensity;
        if intensity <= 0.0 {
            return 0.0;
        }
        let levy = levy_flight(self.config.levy_alpha, rng);
        if levy.abs() * intensity > LEVY_FLOOR {
            levy * intensity * LEVY_SCALE
        } else {
            0.0
        }
    }
}

/// Symmetric heavy-tailed draw, clipped to ±0.8.
pub fn levy_flight<R: Rng + ?Sized>(alpha: f64, rng: &mut R) -> f64 {
    let z: f64 = StandardNormal.sample(rng);
    if z == 0.0 {
        return 0.0;
    }
    let magnitude = z.abs().powf(-1.0 / alpha).min(LEVY_CLAMP);
    magnitude * z.signum()
}

/// Superposed match rhythms at three time scales. Zero mean for `s ~ U[0,1)`.
pub fn fractal_noise(s: f64, intensity: f64) -> f64 {
    if intensity <= 0.0 {
        return 0.0;
    }
    let match_scale = (s * PI * 2.0).sin() * 0.5;
    let period_scale = (s * PI * 8.0).sin() * 0.3;
    let moment_scale = (s * PI * 16.0).sin() * 0.2;
    (match_scale + period_scale + moment_scale) * intensity
}
