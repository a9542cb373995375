//! Regularized nonlinear deconvolution
//!
//! Minimizes a data term plus an edge-adaptive smoothness term and a
//! negativity penalty by damped, preconditioned residual steps that are only
//! kept when they lower the energy.
//!
//! Run-wide, read-only data (filters, `P`, `Pi`, `H0`, PSF spectra) lives in
//! `RegularizationContext`. Each frame owns a committed `FrameState` and a
//! tentative ("tilde") one. The per-iteration primitives are exposed so a
//! caller can drive its own accept/reject loop; `run` is the built-in loop.
//!
//! Reference:
//! Arigovindan M, Fung JC, Elnatan D, et al. High-resolution restoration of
//! 3D structures from widefield images with extreme low signal-to-noise-ratio.
//! PNAS 2013;110(43):17344-9.

use std::ops::ControlFlow;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::complex_ops;
use crate::convolution::FourierConvolver;
use crate::error::{DeconvError, Result};
use crate::fft::mirror;
use crate::kernels::RegularizationFilterBank;
use crate::params::DeconvParams;
use crate::volume::{ComplexVolume, Dims};

use super::check_frames;

/// Weight of the negativity penalty relative to `smooth`
const NEGATIVITY_WEIGHT: f64 = 100.0;

/// What the built-in loop does after a rejected proposal
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectionPolicy {
    /// Damping is multiplied by this after every rejection
    pub damping_decay: f64,
    /// Stop after this many rejections in a row
    pub max_consecutive_rejections: usize,
    /// Stop once damping falls below this
    pub min_damping: f64,
}

impl Default for RejectionPolicy {
    fn default() -> Self {
        Self {
            damping_decay: 0.5,
            max_consecutive_rejections: 8,
            min_damping: 1e-6,
        }
    }
}

impl RejectionPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(self.damping_decay > 0.0 && self.damping_decay < 1.0) {
            return Err(DeconvError::invalid(
                "damping_decay",
                format!("must lie in (0, 1), got {}", self.damping_decay),
            ));
        }
        if self.max_consecutive_rejections == 0 {
            return Err(DeconvError::invalid("max_consecutive_rejections", "must be at least 1"));
        }
        if !(self.min_damping > 0.0 && self.min_damping.is_finite()) {
            return Err(DeconvError::invalid(
                "min_damping",
                format!("must be finite and > 0, got {}", self.min_damping),
            ));
        }
        Ok(())
    }
}

/// Result of `RegularizedDeconvolver::run`
#[derive(Clone, Debug)]
pub struct RegularizedOutcome {
    pub frames: Vec<ComplexVolume>,
    /// Committed energy before the first proposal and after every proposal
    pub errors: Vec<f64>,
    pub accepted: usize,
    pub rejected: usize,
}

/// Read-only data shared by every frame of a run
pub struct RegularizationContext {
    dims: Dims,
    smooth: f64,
    nonlinearity: f64,
    h0: f64,
    filters: RegularizationFilterBank,
    /// `P = conj(Ĥ)·Ĥ + smooth·Σ conj(L̂k)·L̂k`
    p: ComplexVolume,
    /// Spatial preconditioner `Pi = IFFT(1/√P)`
    pi: ComplexVolume,
    psf_hat: ComplexVolume,
    mirrored_psf_hat: ComplexVolume,
    pi_hat: ComplexVolume,
    filter_hats: Vec<ComplexVolume>,
    mirrored_filter_hats: Vec<ComplexVolume>,
    squared_mirror_hats: Vec<ComplexVolume>,
}

impl RegularizationContext {
    pub fn new(conv: &mut FourierConvolver, psf: &ComplexVolume, params: &DeconvParams) -> Result<Self> {
        params.validate()?;
        let dims = conv.dims();
        dims.ensure_eq(&psf.dims())?;

        let smooth = params.smooth;
        let filters = RegularizationFilterBank::new(dims, params.spacing_ratio())?;

        let h0 = complex_ops::sum_squared_magnitude(psf);

        // Pre-compute kernels (done once)
        let psf_hat = conv.spectrum(psf)?;
        let mut p = complex_ops::multiply(&complex_ops::conj(&psf_hat), &psf_hat)?;
        complex_ops::add_assign(&mut p, &complex_ops::scale(&filters.power(), smooth))?;

        let inv_sqrt_p = complex_ops::reciprocal(&complex_ops::sqrt_principal(&p));
        let pi = conv.spatial(&inv_sqrt_p)?;
        let pi_hat = conv.spectrum(&pi)?;

        let mirrored_psf_hat = conv.spectrum(&mirror(psf))?;

        let mut filter_hats = Vec::with_capacity(filters.spatial().len());
        let mut mirrored_filter_hats = Vec::with_capacity(filters.spatial().len());
        let mut squared_mirror_hats = Vec::with_capacity(filters.spatial().len());
        for (l, ml) in filters.spatial().iter().zip(filters.mirrored()) {
            filter_hats.push(conv.spectrum(l)?);
            mirrored_filter_hats.push(conv.spectrum(ml)?);
            squared_mirror_hats.push(conv.spectrum(&complex_ops::multiply(ml, ml)?)?);
        }

        log::debug!("Regularization context on {}: H0={:.6e}, smooth={}, nonlinearity={}",
                    dims, h0, smooth, params.nonlinearity);

        Ok(Self {
            dims,
            smooth,
            nonlinearity: params.nonlinearity,
            h0,
            filters,
            p,
            pi,
            psf_hat,
            mirrored_psf_hat,
            pi_hat,
            filter_hats,
            mirrored_filter_hats,
            squared_mirror_hats,
        })
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// `Σ |psf|²`
    pub fn h0(&self) -> f64 {
        self.h0
    }

    pub fn filters(&self) -> &RegularizationFilterBank {
        &self.filters
    }

    pub fn p(&self) -> &ComplexVolume {
        &self.p
    }

    pub fn pi(&self) -> &ComplexVolume {
        &self.pi
    }

    /// Tikhonov-style starting estimate `IFFT((1/P)·conj(Ĥ)·Ŷ)`
    pub fn initial_guess(&self, conv: &mut FourierConvolver, image: &ComplexVolume) -> Result<ComplexVolume> {
        let mut g = complex_ops::reciprocal(&self.p);
        complex_ops::multiply_assign(&mut g, &complex_ops::conj(&self.psf_hat))?;
        complex_ops::multiply_assign(&mut g, &conv.spectrum(image)?)?;
        conv.spatial(&g)
    }

    /// `mirror(psf) ⊛ image`, the fixed part of the residual
    pub fn data_term(&self, conv: &mut FourierConvolver, image: &ComplexVolume) -> Result<ComplexVolume> {
        conv.convolve_with_spectrum(image, &self.mirrored_psf_hat)
    }

    /// Weights, negativity mask, residual and energy of `guess`
    pub fn energy_measure(
        &self,
        conv: &mut FourierConvolver,
        data_term: &ComplexVolume,
        guess: ComplexVolume,
    ) -> Result<FrameState> {
        let responses = self.filter_hats.iter()
            .map(|l_hat| conv.convolve_with_spectrum(&guess, l_hat))
            .collect::<Result<Vec<_>>>()?;

        // W = 1 / (Σ|Lk ⊛ g|² + nonlinearity)
        let mut weight_denominator = ComplexVolume::filled(self.dims, Complex64::new(self.nonlinearity, 0.0));
        for response in &responses {
            for (w, r) in weight_denominator.as_mut_slice().iter_mut().zip(response.as_slice()) {
                w.re += r.norm_sqr();
            }
        }
        let weights = complex_ops::reciprocal(&weight_denominator);

        let negativity = guess.map(|c| Complex64::new(if c.re < 0.0 { 1.0 } else { 0.0 }, 0.0));

        // Σ mirror(Lk) ⊛ (W · (Lk ⊛ g))
        let mut smoothness = ComplexVolume::zeros(self.dims);
        for (response, ml_hat) in responses.iter().zip(&self.mirrored_filter_hats) {
            let weighted = complex_ops::multiply(&weights, response)?;
            complex_ops::add_assign(&mut smoothness, &conv.convolve_with_spectrum(&weighted, ml_hat)?)?;
        }

        let reblurred = conv.convolve_with_spectrum(&guess, &self.psf_hat)?;
        let normal = conv.convolve_with_spectrum(&reblurred, &self.mirrored_psf_hat)?;

        let mut residual = complex_ops::subtract(data_term, &normal)?;
        let penalty = complex_ops::multiply(&negativity, &guess)?;
        complex_ops::subtract_assign(&mut residual, &complex_ops::scale(&penalty, NEGATIVITY_WEIGHT * self.smooth))?;
        let damped = complex_ops::multiply(&weights, &guess)?;
        complex_ops::subtract_assign(&mut residual, &complex_ops::scale(&damped, self.smooth))?;
        complex_ops::subtract_assign(&mut residual, &complex_ops::scale(&smoothness, self.smooth))?;

        let error = complex_ops::sum_squared_magnitude(&residual);

        Ok(FrameState { guess, weights, negativity, residual, error })
    }

    /// Diagonal curvature `D` of a committed state
    pub fn curvature(&self, conv: &mut FourierConvolver, state: &FrameState) -> Result<ComplexVolume> {
        let mut d = complex_ops::scale(&state.negativity, NEGATIVITY_WEIGHT * self.smooth);
        complex_ops::add_assign(&mut d, &complex_ops::scale(&state.weights, self.smooth))?;

        let mut spread = ComplexVolume::zeros(self.dims);
        for sq_hat in &self.squared_mirror_hats {
            complex_ops::add_assign(&mut spread, &conv.convolve_with_spectrum(&state.weights, sq_hat)?)?;
        }
        complex_ops::add_assign(&mut d, &complex_ops::scale(&spread, self.smooth))?;

        complex_ops::increment_real(&mut d, self.h0);
        Ok(d)
    }

    /// Preconditioned step `U = Pi ⊛ (Pi ⊛ (R / D))`
    pub fn step_direction(
        &self,
        conv: &mut FourierConvolver,
        residual: &ComplexVolume,
        curvature: &ComplexVolume,
    ) -> Result<ComplexVolume> {
        let scaled = complex_ops::divide(residual, curvature)?;
        let once = conv.convolve_with_spectrum(&scaled, &self.pi_hat)?;
        conv.convolve_with_spectrum(&once, &self.pi_hat)
    }
}

/// Per-frame iteration state
#[derive(Clone, Debug)]
pub struct FrameState {
    pub guess: ComplexVolume,
    /// Edge-adaptive weight `W` (real channel)
    pub weights: ComplexVolume,
    /// `N'`: 1 on the real channel where `guess.re < 0`
    pub negativity: ComplexVolume,
    /// Energy gradient `R`
    pub residual: ComplexVolume,
    /// `Σ |R|²`
    pub error: f64,
}

/// Regularized deconvolution of a set of frames sharing one PSF
pub struct RegularizedDeconvolver {
    context: RegularizationContext,
    conv: FourierConvolver,
    data_terms: Vec<ComplexVolume>,
    committed: Vec<FrameState>,
    tilde: Vec<FrameState>,
    curvatures: Vec<ComplexVolume>,
    directions: Vec<ComplexVolume>,
    damping: f64,
    iterations: usize,
}

impl RegularizedDeconvolver {
    /// Build filters and preconditioner, start every frame from its
    /// Tikhonov estimate and evaluate the committed energy once.
    pub fn new(images: &[ComplexVolume], psf: &ComplexVolume, params: &DeconvParams) -> Result<Self> {
        let dims = check_frames(images, psf)?;
        let mut conv = FourierConvolver::new(dims);
        let context = RegularizationContext::new(&mut conv, psf, params)?;

        let mut data_terms = Vec::with_capacity(images.len());
        let mut committed = Vec::with_capacity(images.len());
        for image in images {
            let data_term = context.data_term(&mut conv, image)?;
            let guess = context.initial_guess(&mut conv, image)?;
            committed.push(context.energy_measure(&mut conv, &data_term, guess)?);
            data_terms.push(data_term);
        }

        let tilde = committed.clone();
        let zeros = vec![ComplexVolume::zeros(dims); images.len()];

        let deconv = Self {
            context,
            conv,
            data_terms,
            committed,
            tilde,
            curvatures: zeros.clone(),
            directions: zeros,
            damping: params.damping,
            iterations: params.iterations,
        };
        log::info!(
            "Regularized deconvolution: {} frame(s) of {}, initial energy {:.6e}",
            images.len(), dims, deconv.error()
        );
        Ok(deconv)
    }

    pub fn context(&self) -> &RegularizationContext {
        &self.context
    }

    pub fn frames(&self) -> &[FrameState] {
        &self.committed
    }

    pub fn tilde_frames(&self) -> &[FrameState] {
        &self.tilde
    }

    /// Committed energy summed over frames
    pub fn error(&self) -> f64 {
        self.committed.iter().map(|s| s.error).sum()
    }

    /// Tentative energy summed over frames
    pub fn error_tilde(&self) -> f64 {
        self.tilde.iter().map(|s| s.error).sum()
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// Replace the step damping; must lie in `(0, 1]`
    pub fn set_damping(&mut self, damping: f64) -> Result<()> {
        if !(damping > 0.0 && damping <= 1.0) {
            return Err(DeconvError::invalid("damping", format!("must lie in (0, 1], got {}", damping)));
        }
        self.damping = damping;
        Ok(())
    }

    /// Current committed estimates
    pub fn guesses(&self) -> Vec<ComplexVolume> {
        self.committed.iter().map(|s| s.guess.clone()).collect()
    }

    /// Recompute W, N', R and the energy of the committed guesses, or of the
    /// tentative guesses when `tilde` is set. Returns the summed energy.
    pub fn energy_measure(&mut self, tilde: bool) -> Result<f64> {
        let states = if tilde { &mut self.tilde } else { &mut self.committed };
        for (state, data_term) in states.iter_mut().zip(&self.data_terms) {
            let next = self.context.energy_measure(&mut self.conv, data_term, state.guess.clone())?;
            *state = next;
        }
        Ok(states.iter().map(|s| s.error).sum())
    }

    /// `D` for every frame from the committed state
    pub fn curvature(&mut self) -> Result<()> {
        for (d, state) in self.curvatures.iter_mut().zip(&self.committed) {
            *d = self.context.curvature(&mut self.conv, state)?;
        }
        Ok(())
    }

    /// `U` for every frame from the committed residual and the last `D`
    pub fn step_direction(&mut self) -> Result<()> {
        for ((u, state), d) in self.directions.iter_mut().zip(&self.committed).zip(&self.curvatures) {
            *u = self.context.step_direction(&mut self.conv, &state.residual, d)?;
        }
        Ok(())
    }

    /// `guess~ = guess + damping·U` for every frame
    pub fn propose(&mut self) -> Result<()> {
        for ((t, state), u) in self.tilde.iter_mut().zip(&self.committed).zip(&self.directions) {
            t.guess = complex_ops::add(&state.guess, &complex_ops::scale(u, self.damping))?;
        }
        Ok(())
    }

    /// Whether the tentative energy is strictly lower than the committed one
    pub fn accepts(&self) -> bool {
        self.error_tilde() < self.error()
    }

    /// Make the tentative state (guess, W, N', R, energy) the committed one
    pub fn commit(&mut self) {
        self.committed.clone_from(&self.tilde);
    }

    /// One proposal: D, U, guess~, energy~, and commit when it improves.
    /// Returns whether the proposal was accepted.
    pub fn iterate(&mut self) -> Result<bool> {
        self.curvature()?;
        self.step_direction()?;
        self.propose()?;
        self.energy_measure(true)?;

        let accepted = self.accepts();
        if accepted {
            self.commit();
        }
        Ok(accepted)
    }

    pub fn run(self, policy: RejectionPolicy) -> Result<RegularizedOutcome> {
        self.run_with_progress(policy, |_, _| ControlFlow::Continue(()))
    }

    /// Built-in accept/reject loop.
    ///
    /// Rejections multiply damping by `policy.damping_decay`; acceptances keep
    /// it. Stops after `iterations` proposals, after
    /// `policy.max_consecutive_rejections` rejections in a row, when damping
    /// drops below `policy.min_damping`, or when `progress` breaks.
    pub fn run_with_progress<F>(mut self, policy: RejectionPolicy, mut progress: F) -> Result<RegularizedOutcome>
    where
        F: FnMut(usize, usize) -> ControlFlow<()>,
    {
        policy.validate()?;

        let mut errors = vec![self.error()];
        let mut accepted = 0;
        let mut rejected = 0;
        let mut consecutive = 0;

        for t in 0..self.iterations {
            if self.iterate()? {
                accepted += 1;
                consecutive = 0;
                log::debug!("Iteration {}: accepted, energy {:.6e} (damping {})", t + 1, self.error(), self.damping);
            } else {
                rejected += 1;
                consecutive += 1;
                log::debug!(
                    "Iteration {}: rejected ({:.6e} >= {:.6e}), damping {} -> {}",
                    t + 1, self.error_tilde(), self.error(), self.damping, self.damping * policy.damping_decay
                );
                self.damping *= policy.damping_decay;
            }
            errors.push(self.error());

            if consecutive >= policy.max_consecutive_rejections {
                log::warn!("Stopping after {} consecutive rejections", consecutive);
                break;
            }
            if self.damping < policy.min_damping {
                log::warn!("Stopping: damping {} below {}", self.damping, policy.min_damping);
                break;
            }
            if progress(t + 1, self.iterations).is_break() {
                log::info!("Regularized deconvolution cancelled after {} iteration(s)", t + 1);
                break;
            }
        }

        log::info!(
            "Regularized deconvolution finished: {} accepted, {} rejected, energy {:.6e}",
            accepted, rejected, self.error()
        );

        Ok(RegularizedOutcome {
            frames: self.guesses(),
            errors,
            accepted,
            rejected,
        })
    }
}
