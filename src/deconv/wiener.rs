//! Iterative Wiener deconvolution
//!
//! Per frame, starting from the observed image `y`:
//!
//! ```text
//! b      = g ⊛ h
//! g_next = (g · y · conj(b)) / (fit(b) · conj(b) + 1/SNR)
//! ```
//!
//! where `fit` rescales the blurred estimate's amplitude range onto the
//! image's (`convolution::fit_convolution`) and `1/SNR` is added to the real
//! channel only. All products and the quotient use the soft-fail arithmetic.

use std::ops::ControlFlow;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::complex_ops;
use crate::convolution::{fit_convolution, relative_amplitude_error, FourierConvolver};
use crate::error::Result;
use crate::params::DeconvParams;
use crate::volume::ComplexVolume;

use super::check_frames;

/// Final estimates of a Wiener run
#[derive(Clone, Debug)]
pub struct WienerOutcome {
    pub frames: Vec<ComplexVolume>,
    /// Relative amplitude error between the re-blurred estimate and the
    /// image after each iteration, when tracking was requested
    pub errors: Option<Vec<f64>>,
    /// Iterations completed (less than requested after cancellation)
    pub iterations_run: usize,
}

/// Wiener deconvolver bound to one PSF
pub struct WienerDeconvolver {
    psf: ComplexVolume,
    beta: f64,
    iterations: usize,
    track_error: bool,
}

impl WienerDeconvolver {
    /// `psf` is used as given; pack and normalize it beforehand
    /// (`InputEncoding::pack_psf`).
    pub fn new(psf: ComplexVolume, params: &DeconvParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            psf,
            beta: params.snr.beta(),
            iterations: params.iterations,
            track_error: params.track_error,
        })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn deconvolve(&self, images: &[ComplexVolume]) -> Result<WienerOutcome> {
        self.deconvolve_with_progress(images, |_, _| ControlFlow::Continue(()))
    }

    /// Deconvolve every frame, reporting `(done, total)` after each iteration.
    ///
    /// Returning `ControlFlow::Break` from `progress` stops the run with the
    /// estimates reached so far.
    pub fn deconvolve_with_progress<F>(&self, images: &[ComplexVolume], mut progress: F) -> Result<WienerOutcome>
    where
        F: FnMut(usize, usize) -> ControlFlow<()>,
    {
        let dims = check_frames(images, &self.psf)?;
        log::info!(
            "Wiener deconvolution: {} frame(s) of {}, {} iterations, beta={:.4e}",
            images.len(), dims, self.iterations, self.beta
        );

        let mut conv = FourierConvolver::new(dims);
        let psf_hat = conv.spectrum(&self.psf)?;

        let mut guesses: Vec<ComplexVolume> = images.to_vec();
        let mut errors = self.track_error.then(Vec::new);
        let mut iterations_run = 0;

        for t in 0..self.iterations {
            self.step_all(&mut conv, &psf_hat, images, &mut guesses)?;
            iterations_run = t + 1;

            if let Some(errors) = errors.as_mut() {
                let err = self.reblurred_error(&mut conv, &psf_hat, images, &guesses)?;
                log::debug!("Wiener iteration {}: error {:.6}", t + 1, err);
                errors.push(err);
            } else {
                log::debug!("Wiener iteration {}", t + 1);
            }

            if progress(t + 1, self.iterations).is_break() {
                log::info!("Wiener deconvolution cancelled after {} iteration(s)", t + 1);
                break;
            }
        }

        Ok(WienerOutcome { frames: guesses, errors, iterations_run })
    }

    #[cfg(not(feature = "parallel"))]
    fn step_all(
        &self,
        conv: &mut FourierConvolver,
        psf_hat: &ComplexVolume,
        images: &[ComplexVolume],
        guesses: &mut [ComplexVolume],
    ) -> Result<()> {
        for (guess, image) in guesses.iter_mut().zip(images) {
            *guess = wiener_step(conv, psf_hat, image, guess, self.beta)?;
        }
        Ok(())
    }

    // Frames are independent: every worker owns its FFT workspace
    #[cfg(feature = "parallel")]
    fn step_all(
        &self,
        conv: &mut FourierConvolver,
        psf_hat: &ComplexVolume,
        images: &[ComplexVolume],
        guesses: &mut [ComplexVolume],
    ) -> Result<()> {
        let dims = conv.dims();
        let beta = self.beta;
        guesses.par_iter_mut().zip(images.par_iter()).try_for_each_init(
            || FourierConvolver::new(dims),
            |worker, (guess, image)| {
                *guess = wiener_step(worker, psf_hat, image, guess, beta)?;
                Ok(())
            },
        )
    }

    /// Blur the current estimates, fit them to the images and compare
    fn reblurred_error(
        &self,
        conv: &mut FourierConvolver,
        psf_hat: &ComplexVolume,
        images: &[ComplexVolume],
        guesses: &[ComplexVolume],
    ) -> Result<f64> {
        let mut reblurred = Vec::with_capacity(guesses.len());
        for (guess, image) in guesses.iter().zip(images) {
            let mut blurred = conv.convolve_with_spectrum(guess, psf_hat)?;
            fit_convolution(&mut blurred, image)?;
            reblurred.push(blurred);
        }
        relative_amplitude_error(&reblurred, images)
    }
}

/// One Wiener update of a single frame (fresh volume)
pub fn wiener_step(
    conv: &mut FourierConvolver,
    psf_hat: &ComplexVolume,
    image: &ComplexVolume,
    guess: &ComplexVolume,
    beta: f64,
) -> Result<ComplexVolume> {
    let mut blurred = conv.convolve_with_spectrum(guess, psf_hat)?;
    let blurred_conj = complex_ops::conj(&blurred);

    let mut numerator = complex_ops::multiply(guess, image)?;
    complex_ops::multiply_assign(&mut numerator, &blurred_conj)?;

    fit_convolution(&mut blurred, image)?;

    let mut denominator = complex_ops::multiply(&blurred, &blurred_conj)?;
    complex_ops::increment_real(&mut denominator, beta);

    complex_ops::divide_assign(&mut numerator, &denominator)?;
    Ok(numerator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deconv::testdata;
    use crate::noise::SnrSource;
    use crate::volume::Dims;
    use num_complex::Complex64;

    fn params(iterations: usize) -> DeconvParams {
        DeconvParams { iterations, snr: SnrSource::Beta(0.01), ..DeconvParams::default() }
    }

    #[test]
    fn test_zero_iterations_returns_input() {
        let image = testdata::observed();
        let wiener = WienerDeconvolver::new(testdata::psf(), &params(0)).unwrap();
        let out = wiener.deconvolve(&[image.clone()]).unwrap();
        assert_eq!(out.iterations_run, 0);
        assert_eq!(out.frames, vec![image]);
        assert!(out.errors.is_none());
    }

    #[test]
    fn test_reduces_error_against_ground_truth() {
        let truth = testdata::truth();
        let image = testdata::observed();

        let before = relative_amplitude_error(&[image.clone()], &[truth.clone()]).unwrap();

        let wiener = WienerDeconvolver::new(testdata::psf(), &params(5)).unwrap();
        let out = wiener.deconvolve(&[image]).unwrap();
        let after = relative_amplitude_error(&out.frames, &[truth]).unwrap();

        assert_eq!(out.iterations_run, 5);
        assert!(
            after < 0.7 * before,
            "Error should drop by at least 30%: before {:.4}, after {:.4}", before, after
        );
    }

    #[test]
    fn test_tracks_error_per_iteration() {
        let image = testdata::observed();
        let p = DeconvParams { track_error: true, ..params(3) };
        let wiener = WienerDeconvolver::new(testdata::psf(), &p).unwrap();
        let out = wiener.deconvolve(&[image.clone(), image]).unwrap();

        let errors = out.errors.unwrap();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.is_finite() && *e >= 0.0));
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.frames[0], out.frames[1]);
    }

    #[test]
    fn test_high_snr_reblurred_error_falls_on_noiseless_blur() {
        let p = DeconvParams { snr: SnrSource::Beta(1e-8), track_error: true, ..params(6) };
        let wiener = WienerDeconvolver::new(testdata::psf(), &p).unwrap();
        let out = wiener.deconvolve(&[testdata::blurred()]).unwrap();

        let errors = out.errors.unwrap();
        assert_eq!(errors.len(), 6);
        for w in errors.windows(2) {
            assert!(w[1] < w[0], "Reblurred error rose: {:?}", errors);
        }
        assert!(errors[5] < 0.5 * errors[0], "Errors: {:?}", errors);
    }

    #[test]
    fn test_cancellation_stops_early() {
        let image = testdata::observed();
        let wiener = WienerDeconvolver::new(testdata::psf(), &params(10)).unwrap();
        let mut calls = Vec::new();
        let out = wiener
            .deconvolve_with_progress(&[image], |done, total| {
                calls.push((done, total));
                if done == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
            })
            .unwrap();
        assert_eq!(out.iterations_run, 2);
        assert_eq!(calls, vec![(1, 10), (2, 10)]);
    }

    #[test]
    fn test_rejects_mismatched_frame() {
        let wiener = WienerDeconvolver::new(testdata::psf(), &params(1)).unwrap();
        let frame = ComplexVolume::zeros(Dims::new(4, 4, 4));
        assert!(wiener.deconvolve(&[frame]).is_err());
        assert!(wiener.deconvolve(&[]).is_err());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let p = DeconvParams { snr: SnrSource::Beta(-1.0), ..params(1) };
        assert!(WienerDeconvolver::new(testdata::psf(), &p).is_err());
    }

    #[test]
    fn test_step_keeps_flat_image_under_impulse_psf() {
        // Impulse PSF and flat image: b = g, the fit leaves a flat b alone,
        // and g·y·conj(b) / |b|² returns y
        let dims = Dims::new(4, 4, 2);
        let mut conv = FourierConvolver::new(dims);
        let psf_hat = conv.spectrum(&ComplexVolume::impulse(dims)).unwrap();
        let image = ComplexVolume::filled(dims, Complex64::new(2.0, 0.0));
        let next = wiener_step(&mut conv, &psf_hat, &image, &image, 0.0).unwrap();
        for (i, c) in next.as_slice().iter().enumerate() {
            assert!((c - Complex64::new(2.0, 0.0)).norm() < 1e-10, "Mismatch at {}: {}", i, c);
        }
    }
}
