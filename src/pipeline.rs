//! Flat-buffer front end shared by the WASM exports
//!
//! Hosts hand over frames concatenated in one `f64` buffer per channel
//! (x fastest within a frame, frames back to back) and receive the
//! extraction views in the same layout: the primary view of every frame,
//! followed by the secondary view of every frame for complex encodings.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

use crate::deconv::{RegularizedDeconvolver, RejectionPolicy, WienerDeconvolver};
use crate::error::{DeconvError, Result};
use crate::params::{DeconvParams, InputEncoding};
use crate::volume::{ComplexVolume, Dims, RealVolume};

/// Which deconvolver a run uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Wiener,
    Regularized,
}

/// Complete host-side description of a run, as passed in JSON
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub method: Method,
    pub params: DeconvParams,
    pub rejection: RejectionPolicy,
}

impl RunConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RunConfig = serde_json::from_str(json).map_err(|e| DeconvError::Config(e.to_string()))?;
        config.params.validate()?;
        config.rejection.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DeconvError::Config(e.to_string()))
    }
}

/// Run the configured deconvolver on flat buffers
pub fn run_from_buffers<F>(
    config: &RunConfig,
    image_primary: &[f64],
    image_secondary: &[f64],
    psf_primary: &[f64],
    psf_secondary: &[f64],
    dims: Dims,
    progress: F,
) -> Result<Vec<f64>>
where
    F: FnMut(usize, usize) -> ControlFlow<()>,
{
    match config.method {
        Method::Wiener => wiener_from_buffers(
            image_primary, image_secondary, psf_primary, psf_secondary, dims, &config.params, progress,
        ),
        Method::Regularized => regularized_from_buffers(
            image_primary, image_secondary, psf_primary, psf_secondary, dims, &config.params,
            config.rejection, progress,
        ),
    }
}

/// Split concatenated channel buffers into packed frames.
///
/// An empty `secondary` slice counts as absent.
pub fn unpack_frames(
    primary: &[f64],
    secondary: &[f64],
    dims: Dims,
    encoding: InputEncoding,
) -> Result<Vec<ComplexVolume>> {
    let n = dims.len();
    if n == 0 || primary.is_empty() {
        return Err(DeconvError::EmptyInput);
    }
    if primary.len() % n != 0 {
        return Err(DeconvError::BufferLength { dims, len: primary.len() });
    }
    let secondary = channel(secondary, primary.len(), dims, encoding)?;

    (0..primary.len() / n)
        .map(|f| {
            let range = f * n..(f + 1) * n;
            let p = RealVolume::from_slice(dims, &primary[range.clone()])?;
            let s = secondary.map(|s| RealVolume::from_slice(dims, &s[range])).transpose()?;
            encoding.pack(&p, s.as_ref())
        })
        .collect()
}

/// Pack (and optionally normalize) a single-frame PSF
pub fn unpack_psf(
    primary: &[f64],
    secondary: &[f64],
    dims: Dims,
    encoding: InputEncoding,
    normalize: bool,
) -> Result<ComplexVolume> {
    if primary.len() != dims.len() {
        return Err(DeconvError::BufferLength { dims, len: primary.len() });
    }
    let p = RealVolume::from_slice(dims, primary)?;
    let s = channel(secondary, primary.len(), dims, encoding)?
        .map(|s| RealVolume::from_slice(dims, s))
        .transpose()?;
    encoding.pack_psf(&p, s.as_ref(), normalize)
}

fn channel<'a>(
    secondary: &'a [f64],
    expected: usize,
    dims: Dims,
    encoding: InputEncoding,
) -> Result<Option<&'a [f64]>> {
    if !encoding.is_complex() {
        return Ok(None);
    }
    if secondary.is_empty() {
        return Err(DeconvError::MissingSecondaryChannel { encoding: encoding.name() });
    }
    if secondary.len() != expected {
        return Err(DeconvError::BufferLength { dims, len: secondary.len() });
    }
    Ok(Some(secondary))
}

/// Primary views of all frames, then secondary views for complex encodings
pub fn export_frames(frames: &[ComplexVolume], encoding: InputEncoding) -> Vec<f64> {
    let mut out: Vec<f64> = frames.iter()
        .flat_map(|f| encoding.primary_view(f).into_vec())
        .collect();
    for f in frames {
        if let Some(view) = encoding.secondary_view(f) {
            out.extend(view.into_vec());
        }
    }
    out
}

/// Wiener deconvolution of flat buffers
#[allow(clippy::too_many_arguments)]
pub fn wiener_from_buffers<F>(
    image_primary: &[f64],
    image_secondary: &[f64],
    psf_primary: &[f64],
    psf_secondary: &[f64],
    dims: Dims,
    params: &DeconvParams,
    progress: F,
) -> Result<Vec<f64>>
where
    F: FnMut(usize, usize) -> ControlFlow<()>,
{
    let frames = unpack_frames(image_primary, image_secondary, dims, params.encoding)?;
    let psf = unpack_psf(psf_primary, psf_secondary, dims, params.encoding, params.normalize_psf)?;

    let outcome = WienerDeconvolver::new(psf, params)?.deconvolve_with_progress(&frames, progress)?;
    if let Some(errors) = &outcome.errors {
        log::info!("Wiener error per iteration: {:?}", errors);
    }
    Ok(export_frames(&outcome.frames, params.encoding))
}

/// Regularized deconvolution of flat buffers
#[allow(clippy::too_many_arguments)]
pub fn regularized_from_buffers<F>(
    image_primary: &[f64],
    image_secondary: &[f64],
    psf_primary: &[f64],
    psf_secondary: &[f64],
    dims: Dims,
    params: &DeconvParams,
    policy: RejectionPolicy,
    progress: F,
) -> Result<Vec<f64>>
where
    F: FnMut(usize, usize) -> ControlFlow<()>,
{
    let frames = unpack_frames(image_primary, image_secondary, dims, params.encoding)?;
    let psf = unpack_psf(psf_primary, psf_secondary, dims, params.encoding, params.normalize_psf)?;

    let outcome = RegularizedDeconvolver::new(&frames, &psf, params)?.run_with_progress(policy, progress)?;
    if params.track_error {
        log::info!("Regularized energy per iteration: {:?}", outcome.errors);
    }
    Ok(export_frames(&outcome.frames, params.encoding))
}
