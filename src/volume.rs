//! In-memory volumes for deconvolution
//!
//! A volume is a flat buffer over a `(nx, ny, nz)` grid (columns, rows,
//! slices) stored with x fastest, matching `fft::idx3d`. Complex volumes hold
//! one `Complex64` per voxel: the real channel is the "even column" and the
//! imaginary channel the "odd column" of the interleaved packing used by
//! image stacks.

use std::fmt;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{DeconvError, Result};
use crate::fft::idx3d;

/// Grid extent of a volume
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dims {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

impl Dims {
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Self { nx, ny, nz }
    }

    /// Total number of voxels
    #[inline]
    pub fn len(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        idx3d(i, j, k, self.nx, self.ny)
    }

    /// Voxel at which a unit impulse acts as the identity kernel of
    /// `FourierConvolver::convolve` (`n - n/2` on every axis)
    pub fn origin(&self) -> (usize, usize, usize) {
        (origin_index(self.nx), origin_index(self.ny), origin_index(self.nz))
    }

    pub fn ensure_eq(&self, other: &Dims) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(DeconvError::DimensionMismatch { left: *self, right: *other })
        }
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.nx, self.ny, self.nz)
    }
}

#[inline]
fn origin_index(n: usize) -> usize {
    if n == 0 { 0 } else { (n - n / 2) % n }
}

/// Real-valued volume (amplitude, phase, or a single channel)
#[derive(Clone, Debug, PartialEq)]
pub struct RealVolume {
    dims: Dims,
    data: Vec<f64>,
}

impl RealVolume {
    pub fn zeros(dims: Dims) -> Self {
        Self { dims, data: vec![0.0; dims.len()] }
    }

    pub fn from_vec(dims: Dims, data: Vec<f64>) -> Result<Self> {
        if data.len() != dims.len() {
            return Err(DeconvError::BufferLength { dims, len: data.len() });
        }
        Ok(Self { dims, data })
    }

    pub fn from_slice(dims: Dims, data: &[f64]) -> Result<Self> {
        Self::from_vec(dims, data.to_vec())
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> f64 {
        self.data[self.dims.index(i, j, k)]
    }

    /// Smallest sample (`+inf` for an empty volume)
    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Largest sample (`-inf` for an empty volume)
    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Returns a new volume with `inc` added to every sample
    pub fn increment(&self, inc: f64) -> RealVolume {
        RealVolume {
            dims: self.dims,
            data: self.data.iter().map(|&v| v + inc).collect(),
        }
    }
}

/// Complex-valued volume, the working type of every FFT-domain operation
#[derive(Clone, Debug, PartialEq)]
pub struct ComplexVolume {
    dims: Dims,
    data: Vec<Complex64>,
}

impl ComplexVolume {
    pub fn zeros(dims: Dims) -> Self {
        Self { dims, data: vec![Complex64::new(0.0, 0.0); dims.len()] }
    }

    /// Volume with every sample equal to `value`
    pub fn filled(dims: Dims, value: Complex64) -> Self {
        Self { dims, data: vec![value; dims.len()] }
    }

    /// Unit real impulse at `Dims::origin`
    pub fn impulse(dims: Dims) -> Self {
        let mut v = Self::zeros(dims);
        if !dims.is_empty() {
            let (i, j, k) = dims.origin();
            v.data[dims.index(i, j, k)] = Complex64::new(1.0, 0.0);
        }
        v
    }

    pub fn from_vec(dims: Dims, data: Vec<Complex64>) -> Result<Self> {
        if data.len() != dims.len() {
            return Err(DeconvError::BufferLength { dims, len: data.len() });
        }
        Ok(Self { dims, data })
    }

    /// Standard packing: real samples, zero imaginary channel
    pub fn from_real(real: &RealVolume) -> Self {
        Self {
            dims: real.dims,
            data: real.data.iter().map(|&r| Complex64::new(r, 0.0)).collect(),
        }
    }

    /// Polar packing: `re = amp·cos(phase)`, `im = amp·sin(phase)`
    pub fn from_polar(amplitude: &RealVolume, phase: &RealVolume) -> Result<Self> {
        amplitude.dims.ensure_eq(&phase.dims)?;
        let data = amplitude.data.iter().zip(phase.data.iter())
            .map(|(&a, &p)| Complex64::new(a * p.cos(), a * p.sin()))
            .collect();
        Ok(Self { dims: amplitude.dims, data })
    }

    /// Rectangular packing: channels taken directly
    pub fn from_rectangular(real: &RealVolume, imag: &RealVolume) -> Result<Self> {
        real.dims.ensure_eq(&imag.dims)?;
        let data = real.data.iter().zip(imag.data.iter())
            .map(|(&re, &im)| Complex64::new(re, im))
            .collect();
        Ok(Self { dims: real.dims, data })
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[Complex64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [Complex64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<Complex64> {
        self.data
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> Complex64 {
        self.data[self.dims.index(i, j, k)]
    }

    pub fn set(&mut self, i: usize, j: usize, k: usize, value: Complex64) {
        let idx = self.dims.index(i, j, k);
        self.data[idx] = value;
    }

    pub fn ensure_same_dims(&self, other: &ComplexVolume) -> Result<()> {
        self.dims.ensure_eq(&other.dims)
    }

    /// Returns a new volume with `f` applied to every sample
    pub fn map<F>(&self, f: F) -> ComplexVolume
    where
        F: Fn(Complex64) -> Complex64,
    {
        ComplexVolume {
            dims: self.dims,
            data: self.data.iter().map(|&c| f(c)).collect(),
        }
    }

    fn project<F>(&self, f: F) -> RealVolume
    where
        F: Fn(&Complex64) -> f64,
    {
        RealVolume {
            dims: self.dims,
            data: self.data.iter().map(f).collect(),
        }
    }

    /// Modulus of every sample
    pub fn amplitude(&self) -> RealVolume {
        self.project(|c| c.norm())
    }

    /// `atan2(im, re)` of every sample
    pub fn phase(&self) -> RealVolume {
        self.project(|c| c.im.atan2(c.re))
    }

    pub fn real(&self) -> RealVolume {
        self.project(|c| c.re)
    }

    pub fn imag(&self) -> RealVolume {
        self.project(|c| c.im)
    }

    /// Scale both channels so the real channel sums to one (in place)
    pub fn normalize_real(&mut self) -> Result<()> {
        let total: f64 = self.data.iter().map(|c| c.re).sum();
        self.divide_by_total(total)
    }

    /// Scale both channels so the moduli sum to one (in place)
    pub fn normalize_complex_amplitude(&mut self) -> Result<()> {
        let total: f64 = self.data.iter().map(|c| c.norm()).sum();
        self.divide_by_total(total)
    }

    fn divide_by_total(&mut self, total: f64) -> Result<()> {
        if total == 0.0 || !total.is_finite() {
            return Err(DeconvError::DegenerateNormalization { total });
        }
        for c in self.data.iter_mut() {
            *c /= total;
        }
        Ok(())
    }
}
