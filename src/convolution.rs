//! Circular convolution through the FFT
//!
//! `FourierConvolver::convolve` forward-transforms both operands, multiplies
//! the spectra, inverse-transforms and reformats. No zero-padding is done:
//! callers own the linear-vs-circular padding policy.

use num_complex::Complex64;

use crate::complex_ops;
use crate::error::{DeconvError, Result};
use crate::fft::Fft3dWorkspace;
use crate::volume::{ComplexVolume, Dims};

/// Convolution engine bound to one grid
pub struct FourierConvolver {
    workspace: Fft3dWorkspace,
}

impl FourierConvolver {
    pub fn new(dims: Dims) -> Self {
        Self { workspace: Fft3dWorkspace::new(dims) }
    }

    pub fn dims(&self) -> Dims {
        self.workspace.dims()
    }

    /// Spectrum of `v` (fresh volume)
    pub fn spectrum(&mut self, v: &ComplexVolume) -> Result<ComplexVolume> {
        self.workspace.forward(v)
    }

    /// Spatial volume of a spectrum, centred on the convolution origin
    /// (fresh volume).
    ///
    /// `convolve(x, spatial(K))` multiplies the spectrum of `x` by exactly
    /// `K` on even and odd grids alike.
    pub fn spatial(&mut self, spectrum: &ComplexVolume) -> Result<ComplexVolume> {
        self.workspace.inverse_centered(spectrum)
    }

    /// `a ⊛ b` (fresh volume; inputs untouched)
    pub fn convolve(&mut self, a: &ComplexVolume, b: &ComplexVolume) -> Result<ComplexVolume> {
        a.ensure_same_dims(b)?;
        let b_hat = self.spectrum(b)?;
        self.convolve_with_spectrum(a, &b_hat)
    }

    /// `a ⊛ k` where `kernel_hat` is the already-transformed `k`.
    ///
    /// Lets a run transform a fixed kernel once and reuse it every iteration.
    pub fn convolve_with_spectrum(
        &mut self,
        a: &ComplexVolume,
        kernel_hat: &ComplexVolume,
    ) -> Result<ComplexVolume> {
        let mut out = self.spectrum(a)?;
        complex_ops::multiply_assign(&mut out, kernel_hat)?;
        self.workspace.ifft3d_reformatted(out.as_mut_slice());
        Ok(out)
    }
}

/// Rescale `convolved` in place so its amplitude range matches `original`'s.
///
/// The amplitude of every sample is remapped linearly from convolved's
/// `[min, max]` onto original's `[min, max]`, then both channels are scaled
/// by `new / old`, keeping the phase. A flat convolved amplitude (zero
/// range) leaves the volume unchanged; samples of zero amplitude stay zero.
pub fn fit_convolution(convolved: &mut ComplexVolume, original: &ComplexVolume) -> Result<()> {
    convolved.ensure_same_dims(original)?;

    let original_amps = original.amplitude();
    let target_min = original_amps.min();
    let target_max = original_amps.max();

    let old_amps = convolved.amplitude();
    let min = old_amps.min();
    let max = old_amps.max();
    let range = max - min;
    if !(range > 0.0) || !range.is_finite() {
        log::debug!("fit_convolution: flat amplitude ({}), left unchanged", min);
        return Ok(());
    }

    let gain = (target_max - target_min) / range;
    for (c, &old) in convolved.as_mut_slice().iter_mut().zip(old_amps.as_slice()) {
        if old == 0.0 {
            continue;
        }
        let new = (old - min) * gain + target_min;
        *c = Complex64::new(c.re * new / old, c.im * new / old);
    }
    Ok(())
}

/// `Σ | |e| - |r| | / Σ |r|` over all samples of all frame pairs.
///
/// Both sides must hold the same, non-zero number of frames. Returns 0 when
/// the references carry no amplitude at all.
pub fn relative_amplitude_error(estimates: &[ComplexVolume], references: &[ComplexVolume]) -> Result<f64> {
    if references.is_empty() {
        return Err(DeconvError::EmptyInput);
    }
    if estimates.len() != references.len() {
        return Err(DeconvError::FrameCountMismatch {
            estimates: estimates.len(),
            references: references.len(),
        });
    }

    let mut difference = 0.0;
    let mut total = 0.0;
    for (e, r) in estimates.iter().zip(references) {
        e.ensure_same_dims(r)?;
        for (a, b) in e.as_slice().iter().zip(r.as_slice()) {
            let rb = b.norm();
            total += rb;
            difference += (a.norm() - rb).abs();
        }
    }
    Ok(if total > 0.0 { difference / total } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(dims: Dims, seed: f64) -> ComplexVolume {
        let data = (0..dims.len())
            .map(|i| {
                let t = i as f64 + seed;
                Complex64::new((t * 0.9).sin() + 1.5, (t * 0.4).cos() * 0.5)
            })
            .collect();
        ComplexVolume::from_vec(dims, data).unwrap()
    }

    fn assert_close(a: &ComplexVolume, b: &ComplexVolume, tol: f64) {
        for (i, (x, y)) in a.as_slice().iter().zip(b.as_slice()).enumerate() {
            assert!((x - y).norm() < tol, "Mismatch at {}: {} vs {}", i, x, y);
        }
    }

    #[test]
    fn test_impulse_is_identity_even() {
        let dims = Dims::new(4, 6, 2);
        let mut conv = FourierConvolver::new(dims);
        let v = pattern(dims, 0.0);
        let out = conv.convolve(&v, &ComplexVolume::impulse(dims)).unwrap();
        assert_close(&out, &v, 1e-10);
    }

    #[test]
    fn test_impulse_is_identity_odd() {
        let dims = Dims::new(5, 3, 7);
        let mut conv = FourierConvolver::new(dims);
        let v = pattern(dims, 2.0);
        let out = conv.convolve(&v, &ComplexVolume::impulse(dims)).unwrap();
        assert_close(&out, &v, 1e-10);
    }

    #[test]
    fn test_convolution_commutes() {
        let dims = Dims::new(4, 3, 3);
        let mut conv = FourierConvolver::new(dims);
        let a = pattern(dims, 0.5);
        let b = pattern(dims, 7.0);
        let ab = conv.convolve(&a, &b).unwrap();
        let ba = conv.convolve(&b, &a).unwrap();
        assert_close(&ab, &ba, 1e-9);
    }

    #[test]
    fn test_shifted_impulse_shifts_volume() {
        let dims = Dims::new(6, 1, 1);
        let mut conv = FourierConvolver::new(dims);
        let v = pattern(dims, 1.0);
        // One past the origin shifts every sample by +1
        let mut kernel = ComplexVolume::zeros(dims);
        let (ox, _, _) = dims.origin();
        kernel.set(ox + 1, 0, 0, Complex64::new(1.0, 0.0));
        let out = conv.convolve(&v, &kernel).unwrap();
        for i in 0..6 {
            let expected = v.get((i + 5) % 6, 0, 0);
            assert!((out.get(i, 0, 0) - expected).norm() < 1e-10, "Mismatch at {}", i);
        }
    }

    #[test]
    fn test_convolve_with_spectrum_matches_convolve() {
        let dims = Dims::new(3, 4, 2);
        let mut conv = FourierConvolver::new(dims);
        let a = pattern(dims, 0.0);
        let k = pattern(dims, 3.0);
        let k_hat = conv.spectrum(&k).unwrap();
        let direct = conv.convolve(&a, &k).unwrap();
        let cached = conv.convolve_with_spectrum(&a, &k_hat).unwrap();
        assert_close(&direct, &cached, 1e-12);
    }

    #[test]
    fn test_spatial_kernel_applies_its_spectrum_on_odd_grid() {
        let dims = Dims::new(5, 3, 7);
        let mut conv = FourierConvolver::new(dims);
        let x = pattern(dims, 1.0);
        let k_hat = pattern(dims, 4.0);

        let kernel = conv.spatial(&k_hat).unwrap();
        let out = conv.convolve(&x, &kernel).unwrap();

        let mut expected = complex_ops::multiply(&conv.spectrum(&x).unwrap(), &k_hat).unwrap();
        let mut ws = Fft3dWorkspace::new(dims);
        ws.ifft3d(expected.as_mut_slice());
        assert_close(&out, &expected, 1e-9);
    }

    #[test]
    fn test_spatial_of_flat_spectrum_is_impulse() {
        for dims in [Dims::new(4, 2, 6), Dims::new(7, 1, 3)] {
            let mut conv = FourierConvolver::new(dims);
            let kernel = conv.spatial(&ComplexVolume::filled(dims, Complex64::new(1.0, 0.0))).unwrap();
            assert_close(&kernel, &ComplexVolume::impulse(dims), 1e-12);
        }
    }

    #[test]
    fn test_convolve_rejects_mismatched_dims() {
        let mut conv = FourierConvolver::new(Dims::new(2, 2, 2));
        let a = ComplexVolume::zeros(Dims::new(2, 2, 2));
        let b = ComplexVolume::zeros(Dims::new(2, 2, 1));
        assert!(conv.convolve(&a, &b).is_err());
    }

    #[test]
    fn test_fit_convolution_matches_range_and_phase() {
        let dims = Dims::new(4, 2, 1);
        let original = pattern(dims, 0.0);
        let mut convolved = ComplexVolume::from_vec(
            dims,
            (0..8).map(|i| Complex64::from_polar(0.1 + 0.05 * i as f64, 0.3 * i as f64)).collect(),
        )
        .unwrap();
        let phase_before = convolved.phase();

        fit_convolution(&mut convolved, &original).unwrap();

        let amps = convolved.amplitude();
        let target = original.amplitude();
        assert!((amps.min() - target.min()).abs() < 1e-12);
        assert!((amps.max() - target.max()).abs() < 1e-12);

        let phase_after = convolved.phase();
        for i in 0..8 {
            assert!(
                (phase_after.as_slice()[i] - phase_before.as_slice()[i]).abs() < 1e-12,
                "Phase changed at {}", i
            );
        }
    }

    #[test]
    fn test_fit_convolution_flat_volume_unchanged() {
        let dims = Dims::new(3, 1, 1);
        let original = pattern(dims, 0.0);
        let flat = ComplexVolume::filled(dims, Complex64::new(2.0, 0.0));
        let mut convolved = flat.clone();
        fit_convolution(&mut convolved, &original).unwrap();
        assert_eq!(convolved, flat);
    }

    #[test]
    fn test_fit_convolution_keeps_zero_samples() {
        let dims = Dims::new(3, 1, 1);
        let original = pattern(dims, 0.0);
        let mut convolved = ComplexVolume::from_vec(
            dims,
            vec![Complex64::new(0.0, 0.0), Complex64::new(1.0, 0.0), Complex64::new(2.0, 0.0)],
        )
        .unwrap();
        fit_convolution(&mut convolved, &original).unwrap();
        assert_eq!(convolved.as_slice()[0], Complex64::new(0.0, 0.0));
        assert!(convolved.as_slice()[2].re > convolved.as_slice()[1].re);
    }

    #[test]
    fn test_relative_amplitude_error() {
        let dims = Dims::new(2, 1, 1);
        let r = ComplexVolume::from_vec(dims, vec![Complex64::new(3.0, 4.0), Complex64::new(1.0, 0.0)]).unwrap();
        let e = ComplexVolume::from_vec(dims, vec![Complex64::new(0.0, 4.0), Complex64::new(-2.0, 0.0)]).unwrap();
        // | 4 - 5 | + | 2 - 1 | over 6
        let err = relative_amplitude_error(&[e], &[r.clone()]).unwrap();
        assert!((err - 2.0 / 6.0).abs() < 1e-12, "error was {}", err);
        assert_eq!(relative_amplitude_error(&[r.clone()], &[r]).unwrap(), 0.0);
    }

    #[test]
    fn test_relative_amplitude_error_requires_matching_frames() {
        let dims = Dims::new(2, 1, 1);
        let r = pattern(dims, 0.0);
        assert_eq!(
            relative_amplitude_error(&[r.clone()], &[r.clone(), r.clone()]),
            Err(DeconvError::FrameCountMismatch { estimates: 1, references: 2 })
        );
        assert_eq!(
            relative_amplitude_error(&[r.clone(), r.clone()], &[r]),
            Err(DeconvError::FrameCountMismatch { estimates: 2, references: 1 })
        );
        assert_eq!(relative_amplitude_error(&[], &[]), Err(DeconvError::EmptyInput));
    }
}
