//! Kernel functions for regularized deconvolution
//!
//! - Directional difference filters L1..L6 (k-space, closed form)
//! - `RegularizationFilterBank`: the filters in every form a run needs

pub mod difference;

pub use difference::*;

use crate::error::Result;
use crate::fft::{mirror, Fft3dWorkspace};
use crate::volume::{ComplexVolume, Dims};

/// L1..L6 in k-space, in natural spatial order, and mirrored
///
/// Built once per run and read-only afterwards.
pub struct RegularizationFilterBank {
    dims: Dims,
    spacing_ratio: f64,
    frequency: Vec<ComplexVolume>,
    spatial: Vec<ComplexVolume>,
    mirrored: Vec<ComplexVolume>,
}

impl RegularizationFilterBank {
    pub fn new(dims: Dims, spacing_ratio: f64) -> Result<Self> {
        let mut workspace = Fft3dWorkspace::new(dims);
        Self::with_workspace(&mut workspace, spacing_ratio)
    }

    /// Build the bank reusing an existing FFT workspace for the grid
    pub fn with_workspace(workspace: &mut Fft3dWorkspace, spacing_ratio: f64) -> Result<Self> {
        let dims = workspace.dims();
        let frequency = difference_filters(dims, spacing_ratio);

        let spatial = frequency.iter()
            .map(|f| workspace.inverse_centered(f))
            .collect::<Result<Vec<_>>>()?;
        let mirrored = spatial.iter().map(mirror).collect();

        log::debug!("Built {} regularization filters on a {} grid (ratio {})", FILTER_COUNT, dims, spacing_ratio);

        Ok(Self { dims, spacing_ratio, frequency, spatial, mirrored })
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn spacing_ratio(&self) -> f64 {
        self.spacing_ratio
    }

    /// `Lk` in k-space (zero frequency at index 0)
    pub fn frequency(&self) -> &[ComplexVolume] {
        &self.frequency
    }

    /// `Lk` in image space, centred on the convolution origin
    pub fn spatial(&self) -> &[ComplexVolume] {
        &self.spatial
    }

    /// `mirror(Lk)` of the spatial filters
    pub fn mirrored(&self) -> &[ComplexVolume] {
        &self.mirrored
    }

    /// `Σ_k conj(Lk)·Lk` in k-space (real, non-negative)
    pub fn power(&self) -> ComplexVolume {
        let mut total = ComplexVolume::zeros(self.dims);
        for f in &self.frequency {
            for (t, c) in total.as_mut_slice().iter_mut().zip(f.as_slice()) {
                t.re += c.norm_sqr();
            }
        }
        total
    }
}
