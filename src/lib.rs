//! Deconv-WASM: Fourier-domain deconvolution of 3D image stacks in WebAssembly
//!
//! Frames of a 3D(+time) acquisition are restored against a known point
//! spread function with either an iterative Wiener filter or a regularized
//! nonlinear scheme (edge-adaptive smoothing, negativity penalty, damped
//! preconditioned steps).
//!
//! # Modules
//! - `volume`: grid dimensions and real/complex volumes (x fastest)
//! - `complex_ops`: elementwise complex arithmetic with extended-precision fallback
//! - `fft`: 3D FFT workspace, reformat and mirror
//! - `convolution`: spectral convolution and amplitude fitting
//! - `kernels`: directional difference filters
//! - `noise`: SNR sources and masked noise estimation
//! - `params`: input encodings and run parameters
//! - `deconv`: Wiener and regularized deconvolvers
//! - `pipeline`: flat-buffer front end used by the exports below

// Core modules
pub mod error;
pub mod volume;
pub mod complex_ops;
pub mod fft;

// Algorithm modules
pub mod convolution;
pub mod kernels;
pub mod noise;
pub mod params;
pub mod deconv;

// Host-facing
pub mod pipeline;

pub use deconv::{RegularizedDeconvolver, RejectionPolicy, WienerDeconvolver};
pub use error::{DeconvError, Result};
pub use params::{DeconvParams, InputEncoding};
pub use volume::{ComplexVolume, Dims, RealVolume};

use std::ops::ControlFlow;

use wasm_bindgen::prelude::*;

use crate::noise::{MaskedNoiseEstimator, SnrSource};
use crate::pipeline::RunConfig;

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console, js_name = log)]
    fn console_log_raw(s: &str);
}

macro_rules! console_log {
    ($($t:tt)*) => (console_log_raw(&format_args!($($t)*).to_string()))
}

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn to_js(e: DeconvError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// Wrap a JS progress callback `(done, total) => bool | undefined`.
///
/// Returning `false` from the callback cancels the run.
fn js_progress(callback: &js_sys::Function) -> impl FnMut(usize, usize) -> ControlFlow<()> + '_ {
    move |current, total| {
        let this = JsValue::null();
        let reply = callback.call2(&this,
            &JsValue::from(current as u32),
            &JsValue::from(total as u32));
        match reply {
            Ok(v) if v.as_bool() == Some(false) => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }
}

fn continue_always(_: usize, _: usize) -> ControlFlow<()> {
    ControlFlow::Continue(())
}

fn wiener_params(encoding: u8, iterations: usize, beta: f64, normalize_psf: bool) -> Result<DeconvParams> {
    Ok(DeconvParams {
        iterations,
        snr: SnrSource::Beta(beta),
        encoding: InputEncoding::from_code(encoding)?,
        normalize_psf,
        ..DeconvParams::default()
    })
}

#[allow(clippy::too_many_arguments)]
fn regularized_params(
    encoding: u8,
    iterations: usize,
    beta: f64,
    smooth: f64,
    nonlinearity: f64,
    damping: f64,
    dx: f64,
    dz: f64,
    normalize_psf: bool,
) -> Result<DeconvParams> {
    Ok(DeconvParams {
        iterations,
        snr: SnrSource::Beta(beta),
        smooth,
        nonlinearity,
        damping,
        dx,
        dz,
        encoding: InputEncoding::from_code(encoding)?,
        normalize_psf,
        ..DeconvParams::default()
    })
}

// ============================================================================
// WASM Exports: Wiener Deconvolution
// ============================================================================

/// Iterative Wiener deconvolution
///
/// # Arguments
/// * `image_primary` - Amplitude (standard, polar) or real part (rectangular)
///   of every frame, concatenated (nx * ny * nz * frames)
/// * `image_secondary` - Phase (polar) or imaginary part (rectangular);
///   empty for standard input
/// * `psf_primary`, `psf_secondary` - One PSF frame in the same encoding,
///   centred on voxel (nx - nx/2, ny - ny/2, nz - nz/2)
/// * `nx`, `ny`, `nz` - Frame dimensions
/// * `encoding` - 0 = standard, 1 = polar, 2 = rectangular
/// * `iterations` - Number of Wiener updates
/// * `beta` - Regularization 1/SNR
/// * `normalize_psf` - Scale the PSF to unit sum first
///
/// # Returns
/// Primary view of every frame followed by the secondary view of every frame
/// (the latter only for complex encodings)
#[wasm_bindgen]
#[allow(clippy::too_many_arguments)]
pub fn wiener_deconvolve_wasm(
    image_primary: &[f64],
    image_secondary: &[f64],
    psf_primary: &[f64],
    psf_secondary: &[f64],
    nx: usize, ny: usize, nz: usize,
    encoding: u8,
    iterations: usize,
    beta: f64,
    normalize_psf: bool,
) -> Result<Vec<f64>, JsValue> {
    console_log!("WASM Wiener: {}x{}x{}, {} iterations, beta={:.4e}", nx, ny, nz, iterations, beta);

    let params = wiener_params(encoding, iterations, beta, normalize_psf).map_err(to_js)?;
    let result = pipeline::wiener_from_buffers(
        image_primary, image_secondary, psf_primary, psf_secondary,
        Dims::new(nx, ny, nz), &params, continue_always,
    ).map_err(to_js)?;

    console_log!("WASM Wiener complete");
    Ok(result)
}

/// Wiener deconvolution with progress callback
///
/// The callback receives `(done, total)` iterations; returning `false`
/// stops early with the estimates reached so far.
#[wasm_bindgen]
#[allow(clippy::too_many_arguments)]
pub fn wiener_deconvolve_wasm_with_progress(
    image_primary: &[f64],
    image_secondary: &[f64],
    psf_primary: &[f64],
    psf_secondary: &[f64],
    nx: usize, ny: usize, nz: usize,
    encoding: u8,
    iterations: usize,
    beta: f64,
    normalize_psf: bool,
    progress_callback: &js_sys::Function,
) -> Result<Vec<f64>, JsValue> {
    console_log!("WASM Wiener with progress: {}x{}x{}, {} iterations", nx, ny, nz, iterations);

    let params = wiener_params(encoding, iterations, beta, normalize_psf).map_err(to_js)?;
    let result = pipeline::wiener_from_buffers(
        image_primary, image_secondary, psf_primary, psf_secondary,
        Dims::new(nx, ny, nz), &params, js_progress(progress_callback),
    ).map_err(to_js)?;

    console_log!("WASM Wiener complete");
    Ok(result)
}

// ============================================================================
// WASM Exports: Regularized Deconvolution
// ============================================================================

/// Regularized nonlinear deconvolution
///
/// # Arguments
/// * Buffers, dimensions and `encoding` as for `wiener_deconvolve_wasm`
/// * `iterations` - Number of proposed steps
/// * `beta` - Regularization 1/SNR
/// * `smooth` - Smoothing weight
/// * `nonlinearity` - Edge sensitivity of the adaptive weights (> 0)
/// * `damping` - Initial step damping in (0, 1]
/// * `dx`, `dz` - Lateral and axial voxel spacing
/// * `normalize_psf` - Scale the PSF to unit sum first
///
/// # Returns
/// Same layout as `wiener_deconvolve_wasm`
#[wasm_bindgen]
#[allow(clippy::too_many_arguments)]
pub fn regularized_deconvolve_wasm(
    image_primary: &[f64],
    image_secondary: &[f64],
    psf_primary: &[f64],
    psf_secondary: &[f64],
    nx: usize, ny: usize, nz: usize,
    encoding: u8,
    iterations: usize,
    beta: f64,
    smooth: f64,
    nonlinearity: f64,
    damping: f64,
    dx: f64,
    dz: f64,
    normalize_psf: bool,
) -> Result<Vec<f64>, JsValue> {
    console_log!("WASM regularized: {}x{}x{}, {} iterations, smooth={:.4}, damping={:.2}",
                 nx, ny, nz, iterations, smooth, damping);

    let params = regularized_params(
        encoding, iterations, beta, smooth, nonlinearity, damping, dx, dz, normalize_psf,
    ).map_err(to_js)?;
    let result = pipeline::regularized_from_buffers(
        image_primary, image_secondary, psf_primary, psf_secondary,
        Dims::new(nx, ny, nz), &params, RejectionPolicy::default(), continue_always,
    ).map_err(to_js)?;

    console_log!("WASM regularized complete");
    Ok(result)
}

/// Regularized deconvolution with progress callback
#[wasm_bindgen]
#[allow(clippy::too_many_arguments)]
pub fn regularized_deconvolve_wasm_with_progress(
    image_primary: &[f64],
    image_secondary: &[f64],
    psf_primary: &[f64],
    psf_secondary: &[f64],
    nx: usize, ny: usize, nz: usize,
    encoding: u8,
    iterations: usize,
    beta: f64,
    smooth: f64,
    nonlinearity: f64,
    damping: f64,
    dx: f64,
    dz: f64,
    normalize_psf: bool,
    progress_callback: &js_sys::Function,
) -> Result<Vec<f64>, JsValue> {
    console_log!("WASM regularized with progress: {}x{}x{}, {} iterations", nx, ny, nz, iterations);

    let params = regularized_params(
        encoding, iterations, beta, smooth, nonlinearity, damping, dx, dz, normalize_psf,
    ).map_err(to_js)?;
    let result = pipeline::regularized_from_buffers(
        image_primary, image_secondary, psf_primary, psf_secondary,
        Dims::new(nx, ny, nz), &params, RejectionPolicy::default(), js_progress(progress_callback),
    ).map_err(to_js)?;

    console_log!("WASM regularized complete");
    Ok(result)
}

// ============================================================================
// WASM Exports: Configuration and Noise
// ============================================================================

/// Run either deconvolver from a JSON configuration
///
/// `config_json` holds `{"method": "wiener" | "regularized", "params": {...},
/// "rejection": {...}}`; every field is optional.
#[wasm_bindgen]
#[allow(clippy::too_many_arguments)]
pub fn deconvolve_json_wasm(
    config_json: &str,
    image_primary: &[f64],
    image_secondary: &[f64],
    psf_primary: &[f64],
    psf_secondary: &[f64],
    nx: usize, ny: usize, nz: usize,
    progress_callback: Option<js_sys::Function>,
) -> Result<Vec<f64>, JsValue> {
    let config = RunConfig::from_json(config_json).map_err(to_js)?;
    console_log!("WASM deconvolve ({:?}): {}x{}x{}, {} iterations",
                 config.method, nx, ny, nz, config.params.iterations);

    let dims = Dims::new(nx, ny, nz);
    let result = match &progress_callback {
        Some(callback) => pipeline::run_from_buffers(
            &config, image_primary, image_secondary, psf_primary, psf_secondary, dims,
            js_progress(callback),
        ),
        None => pipeline::run_from_buffers(
            &config, image_primary, image_secondary, psf_primary, psf_secondary, dims,
            continue_always,
        ),
    }.map_err(to_js)?;

    console_log!("WASM deconvolve complete");
    Ok(result)
}

/// Estimate 1/SNR from an amplitude frame and signal/background masks
///
/// # Returns
/// The `beta` to pass to the deconvolution exports
#[wasm_bindgen]
pub fn estimate_beta_wasm(
    amplitude: &[f64],
    signal_mask: &[u8],
    background_mask: &[u8],
    nx: usize, ny: usize, nz: usize,
) -> Result<f64, JsValue> {
    let amplitude = RealVolume::from_slice(Dims::new(nx, ny, nz), amplitude).map_err(to_js)?;
    let estimator = MaskedNoiseEstimator::new(signal_mask.to_vec(), background_mask.to_vec());
    let source = SnrSource::estimate(&estimator, &amplitude).map_err(to_js)?;

    console_log!("WASM estimated SNR {:.3}", source.snr());
    Ok(source.beta())
}
