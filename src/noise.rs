//! Noise ratio of the Wiener update
//!
//! The Wiener denominator is regularized by `beta = 1/SNR`. The ratio is
//! either given directly, given as `beta`, or estimated from the image by a
//! `NoiseEstimator` as `signal / noise_deviation`.

use serde::{Deserialize, Serialize};

use crate::error::{DeconvError, Result};
use crate::volume::RealVolume;

/// Supplies the two scalars of a signal-to-noise estimate
pub trait NoiseEstimator {
    /// Representative signal level of an amplitude volume
    fn signal(&self, amplitude: &RealVolume) -> Result<f64>;

    /// Standard deviation of the noise floor of an amplitude volume
    fn noise_deviation(&self, amplitude: &RealVolume) -> Result<f64>;
}

/// Where the Wiener noise ratio comes from
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnrSource {
    Snr(f64),
    Beta(f64),
    Estimated { signal: f64, noise_deviation: f64 },
}

impl Default for SnrSource {
    fn default() -> Self {
        SnrSource::Beta(0.01)
    }
}

impl SnrSource {
    /// Measure the ratio of `amplitude` with `estimator`
    pub fn estimate(estimator: &dyn NoiseEstimator, amplitude: &RealVolume) -> Result<Self> {
        let source = SnrSource::Estimated {
            signal: estimator.signal(amplitude)?,
            noise_deviation: estimator.noise_deviation(amplitude)?,
        };
        source.validate()?;
        log::info!("Estimated SNR {:.4}", source.snr());
        Ok(source)
    }

    pub fn snr(&self) -> f64 {
        match *self {
            SnrSource::Snr(snr) => snr,
            SnrSource::Beta(beta) => 1.0 / beta,
            SnrSource::Estimated { signal, noise_deviation } => signal / noise_deviation,
        }
    }

    /// Regularization constant added to the Wiener denominator
    pub fn beta(&self) -> f64 {
        1.0 / self.snr()
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &'static str, v: f64| -> Result<()> {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(DeconvError::invalid(name, format!("must be finite and > 0, got {}", v)))
            }
        };
        match *self {
            SnrSource::Snr(snr) => positive("snr", snr),
            SnrSource::Beta(beta) => positive("beta", beta),
            SnrSource::Estimated { signal, noise_deviation } => {
                positive("signal", signal)?;
                positive("noise_deviation", noise_deviation)
            }
        }
    }
}

/// Region-based estimate: mean amplitude inside `signal_mask`, standard
/// deviation inside `background_mask` (masks are 1 = inside, 0 = outside)
#[derive(Clone, Debug)]
pub struct MaskedNoiseEstimator {
    pub signal_mask: Vec<u8>,
    pub background_mask: Vec<u8>,
}

impl MaskedNoiseEstimator {
    pub fn new(signal_mask: Vec<u8>, background_mask: Vec<u8>) -> Self {
        Self { signal_mask, background_mask }
    }

    fn masked(mask: &[u8], amplitude: &RealVolume) -> Result<Vec<f64>> {
        if mask.len() != amplitude.dims().len() {
            return Err(DeconvError::BufferLength { dims: amplitude.dims(), len: mask.len() });
        }
        let values: Vec<f64> = amplitude.as_slice().iter().zip(mask)
            .filter(|(_, &m)| m != 0)
            .map(|(&v, _)| v)
            .collect();
        if values.is_empty() {
            return Err(DeconvError::EmptyInput);
        }
        Ok(values)
    }
}

impl NoiseEstimator for MaskedNoiseEstimator {
    fn signal(&self, amplitude: &RealVolume) -> Result<f64> {
        let values = Self::masked(&self.signal_mask, amplitude)?;
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }

    fn noise_deviation(&self, amplitude: &RealVolume) -> Result<f64> {
        let values = Self::masked(&self.background_mask, amplitude)?;
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        Ok(var.sqrt())
    }
}
