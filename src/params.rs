//! Run configuration and input encodings

use serde::{Deserialize, Serialize};

use crate::error::{DeconvError, Result};
use crate::noise::SnrSource;
use crate::volume::{ComplexVolume, RealVolume};

/// How a pair of real volumes is packed into complex samples
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputEncoding {
    /// Real samples only, zero imaginary channel
    #[default]
    Standard,
    /// Amplitude and phase
    Polar,
    /// Real and imaginary channels
    Rectangular,
}

impl InputEncoding {
    /// Host-side code: 0 Standard, 1 Polar, 2 Rectangular
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(InputEncoding::Standard),
            1 => Ok(InputEncoding::Polar),
            2 => Ok(InputEncoding::Rectangular),
            other => Err(DeconvError::invalid("encoding", format!("unknown code {}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InputEncoding::Standard => "standard",
            InputEncoding::Polar => "polar",
            InputEncoding::Rectangular => "rectangular",
        }
    }

    /// Whether a second (phase or imaginary) channel is part of the data
    pub fn is_complex(&self) -> bool {
        !matches!(self, InputEncoding::Standard)
    }

    /// Pack `primary` (and `secondary` for complex encodings) into one volume.
    ///
    /// Standard ignores `secondary`.
    pub fn pack(&self, primary: &RealVolume, secondary: Option<&RealVolume>) -> Result<ComplexVolume> {
        match self {
            InputEncoding::Standard => Ok(ComplexVolume::from_real(primary)),
            InputEncoding::Polar => ComplexVolume::from_polar(primary, self.require(secondary)?),
            InputEncoding::Rectangular => ComplexVolume::from_rectangular(primary, self.require(secondary)?),
        }
    }

    /// Pack a PSF, optionally normalizing it to unit total.
    ///
    /// Standard PSFs are normalized on the real channel, complex PSFs on the
    /// summed modulus.
    pub fn pack_psf(
        &self,
        primary: &RealVolume,
        secondary: Option<&RealVolume>,
        normalize: bool,
    ) -> Result<ComplexVolume> {
        let mut psf = self.pack(primary, secondary)?;
        if normalize {
            match self {
                InputEncoding::Standard => psf.normalize_real()?,
                InputEncoding::Polar | InputEncoding::Rectangular => psf.normalize_complex_amplitude()?,
            }
        }
        Ok(psf)
    }

    /// Amplitude for Standard and Polar, real channel for Rectangular
    pub fn primary_view(&self, v: &ComplexVolume) -> RealVolume {
        match self {
            InputEncoding::Standard | InputEncoding::Polar => v.amplitude(),
            InputEncoding::Rectangular => v.real(),
        }
    }

    /// Phase for Polar, imaginary channel for Rectangular, nothing for Standard
    pub fn secondary_view(&self, v: &ComplexVolume) -> Option<RealVolume> {
        match self {
            InputEncoding::Standard => None,
            InputEncoding::Polar => Some(v.phase()),
            InputEncoding::Rectangular => Some(v.imag()),
        }
    }

    fn require<'a>(&self, secondary: Option<&'a RealVolume>) -> Result<&'a RealVolume> {
        secondary.ok_or(DeconvError::MissingSecondaryChannel { encoding: self.name() })
    }
}

/// Parameters shared by the Wiener and regularized deconvolvers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvParams {
    /// Number of iterations (0 returns the starting estimate)
    pub iterations: usize,
    /// Wiener noise ratio
    pub snr: SnrSource,
    /// Regularization weight
    pub smooth: f64,
    /// Floor of the edge-adaptive weight denominator, bounds W by 1/nonlinearity
    pub nonlinearity: f64,
    /// Step multiplier of a regularized proposal, in (0, 1]
    pub damping: f64,
    /// Lateral voxel spacing
    pub dx: f64,
    /// Axial voxel spacing
    pub dz: f64,
    pub encoding: InputEncoding,
    pub normalize_psf: bool,
    /// Record the per-iteration error diagnostic
    pub track_error: bool,
}

impl Default for DeconvParams {
    fn default() -> Self {
        Self {
            iterations: 3,
            snr: SnrSource::default(),
            smooth: 0.01,
            nonlinearity: 0.1,
            damping: 0.8,
            dx: 1.0,
            dz: 1.0,
            encoding: InputEncoding::Standard,
            normalize_psf: true,
            track_error: false,
        }
    }
}

impl DeconvParams {
    /// Anisotropy ratio `dx / dz` of the regularization filters
    pub fn spacing_ratio(&self) -> f64 {
        self.dx / self.dz
    }

    pub fn validate(&self) -> Result<()> {
        self.snr.validate()?;

        if !(self.smooth >= 0.0 && self.smooth.is_finite()) {
            return Err(DeconvError::invalid("smooth", format!("must be finite and >= 0, got {}", self.smooth)));
        }
        if !(self.nonlinearity > 0.0 && self.nonlinearity.is_finite()) {
            return Err(DeconvError::invalid("nonlinearity", format!("must be finite and > 0, got {}", self.nonlinearity)));
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(DeconvError::invalid("damping", format!("must lie in (0, 1], got {}", self.damping)));
        }
        for (name, v) in [("dx", self.dx), ("dz", self.dz)] {
            if !(v > 0.0 && v.is_finite()) {
                return Err(DeconvError::invalid(name, format!("must be finite and > 0, got {}", v)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Dims;

    #[test]
    fn test_defaults_are_valid() {
        let p = DeconvParams::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.iterations, 3);
        assert!((p.snr.beta() - 0.01).abs() < 1e-12);
        assert!((p.spacing_ratio() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_validate_ranges() {
        let base = DeconvParams::default();

        let p = DeconvParams { nonlinearity: 0.0, ..base.clone() };
        assert!(matches!(p.validate(), Err(DeconvError::InvalidParameter { name: "nonlinearity", .. })));

        let p = DeconvParams { damping: 1.5, ..base.clone() };
        assert!(matches!(p.validate(), Err(DeconvError::InvalidParameter { name: "damping", .. })));

        let p = DeconvParams { smooth: -0.1, ..base.clone() };
        assert!(p.validate().is_err());

        let p = DeconvParams { dz: 0.0, ..base.clone() };
        assert!(matches!(p.validate(), Err(DeconvError::InvalidParameter { name: "dz", .. })));

        let p = DeconvParams { smooth: 0.0, damping: 1.0, ..base };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip_and_partial_config() {
        let p = DeconvParams {
            iterations: 7,
            snr: SnrSource::Snr(40.0),
            encoding: InputEncoding::Polar,
            track_error: true,
            ..DeconvParams::default()
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: DeconvParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);

        // Missing fields fall back to defaults
        let partial: DeconvParams =
            serde_json::from_str(r#"{"iterations": 5, "encoding": "rectangular", "snr": {"beta": 0.02}}"#).unwrap();
        assert_eq!(partial.iterations, 5);
        assert_eq!(partial.encoding, InputEncoding::Rectangular);
        assert_eq!(partial.snr, SnrSource::Beta(0.02));
        assert!((partial.damping - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_encoding_codes() {
        assert_eq!(InputEncoding::from_code(0).unwrap(), InputEncoding::Standard);
        assert_eq!(InputEncoding::from_code(1).unwrap(), InputEncoding::Polar);
        assert_eq!(InputEncoding::from_code(2).unwrap(), InputEncoding::Rectangular);
        assert!(InputEncoding::from_code(3).is_err());
    }

    #[test]
    fn test_complex_encoding_requires_secondary() {
        let a = RealVolume::zeros(Dims::new(2, 2, 2));
        let err = InputEncoding::Polar.pack(&a, None).unwrap_err();
        assert_eq!(err, DeconvError::MissingSecondaryChannel { encoding: "polar" });
        assert!(InputEncoding::Standard.pack(&a, None).is_ok());
    }

    #[test]
    fn test_polar_psf_normalization_matches_amplitude_normalization() {
        let dims = Dims::new(3, 1, 1);
        let amp = RealVolume::from_vec(dims, vec![1.0, 2.0, 5.0]).unwrap();
        let phase = RealVolume::from_vec(dims, vec![0.2, -1.0, 2.5]).unwrap();
        let psf = InputEncoding::Polar.pack_psf(&amp, Some(&phase), true).unwrap();

        let amps = InputEncoding::Polar.primary_view(&psf);
        let expected = [0.125, 0.25, 0.625];
        for i in 0..3 {
            assert!((amps.as_slice()[i] - expected[i]).abs() < 1e-12, "Mismatch at {}", i);
        }
        let phases = InputEncoding::Polar.secondary_view(&psf).unwrap();
        for i in 0..3 {
            assert!((phases.as_slice()[i] - phase.as_slice()[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_standard_psf_normalization_uses_real_sum() {
        let dims = Dims::new(2, 1, 1);
        let amp = RealVolume::from_vec(dims, vec![1.0, 3.0]).unwrap();
        let psf = InputEncoding::Standard.pack_psf(&amp, None, true).unwrap();
        assert!((psf.real().sum() - 1.0).abs() < 1e-12);
        assert!(InputEncoding::Standard.secondary_view(&psf).is_none());
    }
}
