//! FFT wrapper for 3D transforms using rustfft
//!
//! Forward transforms are unnormalized and inverse transforms are scaled by
//! `1/N`, matching NumPy's FFT conventions. Indexing is x fastest
//! (`idx3d`), the layout used by every volume in the crate.
//!
//! Index permutations live next to the transforms:
//! - `reformat` undoes the quadrant swap of an inverse transform (circular
//!   shift by `floor(n/2)` along every axis);
//! - `center_on_origin` places a kernel built from a spectrum at the
//!   convolution origin (`Dims::origin`, shift by `n - floor(n/2)`), so
//!   convolving with it applies exactly that spectrum on odd axes too;
//! - `mirror` reflects every axis about index `n - 1`, which turns a
//!   convolution into a correlation.

use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;

use crate::error::Result;
use crate::volume::{ComplexVolume, Dims};

/// FFT workspace that caches plans and scratch buffers for reuse
pub struct Fft3dWorkspace {
    dims: Dims,
    // Forward FFT plans
    fft_x: Arc<dyn Fft<f64>>,
    fft_y: Arc<dyn Fft<f64>>,
    fft_z: Arc<dyn Fft<f64>>,
    // Inverse FFT plans
    ifft_x: Arc<dyn Fft<f64>>,
    ifft_y: Arc<dyn Fft<f64>>,
    ifft_z: Arc<dyn Fft<f64>>,
    // Scratch buffers
    scratch_x: Vec<Complex64>,
    scratch_y: Vec<Complex64>,
    scratch_z: Vec<Complex64>,
    buffer_y: Vec<Complex64>,
    buffer_z: Vec<Complex64>,
}

impl Fft3dWorkspace {
    /// Create a new FFT workspace for the given grid
    pub fn new(dims: Dims) -> Self {
        let Dims { nx, ny, nz } = dims;
        let mut planner = FftPlanner::new();

        let fft_x = planner.plan_fft(nx, FftDirection::Forward);
        let fft_y = planner.plan_fft(ny, FftDirection::Forward);
        let fft_z = planner.plan_fft(nz, FftDirection::Forward);

        let ifft_x = planner.plan_fft(nx, FftDirection::Inverse);
        let ifft_y = planner.plan_fft(ny, FftDirection::Inverse);
        let ifft_z = planner.plan_fft(nz, FftDirection::Inverse);

        let scratch_x = vec![Complex64::new(0.0, 0.0); fft_x.get_inplace_scratch_len().max(ifft_x.get_inplace_scratch_len())];
        let scratch_y = vec![Complex64::new(0.0, 0.0); fft_y.get_inplace_scratch_len().max(ifft_y.get_inplace_scratch_len())];
        let scratch_z = vec![Complex64::new(0.0, 0.0); fft_z.get_inplace_scratch_len().max(ifft_z.get_inplace_scratch_len())];

        Self {
            dims,
            fft_x, fft_y, fft_z,
            ifft_x, ifft_y, ifft_z,
            scratch_x, scratch_y, scratch_z,
            buffer_y: vec![Complex64::new(0.0, 0.0); ny],
            buffer_z: vec![Complex64::new(0.0, 0.0); nz],
        }
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// In-place forward 3D FFT
    pub fn fft3d(&mut self, data: &mut [Complex64]) {
        self.transform(data, FftDirection::Forward);
    }

    /// In-place inverse 3D FFT (with normalization)
    pub fn ifft3d(&mut self, data: &mut [Complex64]) {
        self.transform(data, FftDirection::Inverse);

        let n_total = self.dims.len() as f64;
        for val in data.iter_mut() {
            *val /= n_total;
        }
    }

    /// In-place inverse 3D FFT followed by `reformat`
    pub fn ifft3d_reformatted(&mut self, data: &mut [Complex64]) {
        self.ifft3d(data);
        let shifted = reformat_slice(data, self.dims);
        data.copy_from_slice(&shifted);
    }

    /// In-place inverse 3D FFT followed by `center_on_origin`
    pub fn ifft3d_centered(&mut self, data: &mut [Complex64]) {
        self.ifft3d(data);
        let shifted = roll_slice(data, self.dims, self.dims.origin());
        data.copy_from_slice(&shifted);
    }

    /// Spectrum of `v` (fresh volume)
    pub fn forward(&mut self, v: &ComplexVolume) -> Result<ComplexVolume> {
        self.dims.ensure_eq(&v.dims())?;
        let mut out = v.clone();
        self.fft3d(out.as_mut_slice());
        Ok(out)
    }

    /// Spatial volume of spectrum `v` in natural order (fresh volume)
    pub fn inverse_reformatted(&mut self, v: &ComplexVolume) -> Result<ComplexVolume> {
        self.dims.ensure_eq(&v.dims())?;
        let mut out = v.clone();
        self.ifft3d_reformatted(out.as_mut_slice());
        Ok(out)
    }

    /// Spatial kernel of spectrum `v`, centred on the convolution origin
    /// (fresh volume)
    pub fn inverse_centered(&mut self, v: &ComplexVolume) -> Result<ComplexVolume> {
        self.dims.ensure_eq(&v.dims())?;
        let mut out = v.clone();
        self.ifft3d_centered(out.as_mut_slice());
        Ok(out)
    }

    fn transform(&mut self, data: &mut [Complex64], direction: FftDirection) {
        let Dims { nx, ny, nz } = self.dims;
        let (plan_x, plan_y, plan_z) = match direction {
            FftDirection::Forward => (&self.fft_x, &self.fft_y, &self.fft_z),
            FftDirection::Inverse => (&self.ifft_x, &self.ifft_y, &self.ifft_z),
        };

        // Transform along x-axis
        for k in 0..nz {
            for j in 0..ny {
                let start = idx3d(0, j, k, nx, ny);
                plan_x.process_with_scratch(&mut data[start..start + nx], &mut self.scratch_x);
            }
        }

        // Transform along y-axis
        for k in 0..nz {
            for i in 0..nx {
                for j in 0..ny {
                    self.buffer_y[j] = data[idx3d(i, j, k, nx, ny)];
                }
                plan_y.process_with_scratch(&mut self.buffer_y, &mut self.scratch_y);
                for j in 0..ny {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_y[j];
                }
            }
        }

        // Transform along z-axis
        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    self.buffer_z[k] = data[idx3d(i, j, k, nx, ny)];
                }
                plan_z.process_with_scratch(&mut self.buffer_z, &mut self.scratch_z);
                for k in 0..nz {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_z[k];
                }
            }
        }
    }
}

/// Calculate linear index for 3D array in Fortran order (x fastest)
/// index = i + j*nx + k*nx*ny
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// Restore natural spatial order after an inverse transform.
///
/// Sample `i` moves to `(i + floor(n/2)) mod n` on every axis, so for an odd
/// axis the upper samples land at `i - floor(n/2) - 1`. Returns a fresh
/// volume.
pub fn reformat(v: &ComplexVolume) -> ComplexVolume {
    let dims = v.dims();
    let data = reformat_slice(v.as_slice(), dims);
    // Lengths match by construction
    ComplexVolume::from_vec(dims, data).unwrap_or_else(|_| ComplexVolume::zeros(dims))
}

/// Move sample 0 of every axis to the convolution origin `n - floor(n/2)`.
///
/// Same as `reformat` on even axes; one voxel further on odd axes. A kernel
/// placed this way satisfies `convolve(x, k) = IFFT(FFT(x) · K)` for its
/// spectrum `K`. Returns a fresh volume.
pub fn center_on_origin(v: &ComplexVolume) -> ComplexVolume {
    let dims = v.dims();
    let data = roll_slice(v.as_slice(), dims, dims.origin());
    // Lengths match by construction
    ComplexVolume::from_vec(dims, data).unwrap_or_else(|_| ComplexVolume::zeros(dims))
}

fn reformat_slice(data: &[Complex64], dims: Dims) -> Vec<Complex64> {
    roll_slice(data, dims, (dims.nx / 2, dims.ny / 2, dims.nz / 2))
}

/// Circular shift: sample `i` moves to `(i + shift) mod n` on every axis
fn roll_slice(data: &[Complex64], dims: Dims, shift: (usize, usize, usize)) -> Vec<Complex64> {
    let Dims { nx, ny, nz } = dims;
    let (sx, sy, sz) = shift;
    let mut out = vec![Complex64::new(0.0, 0.0); data.len()];

    for k in 0..nz {
        let kk = (k + sz) % nz;
        for j in 0..ny {
            let jj = (j + sy) % ny;
            for i in 0..nx {
                let ii = (i + sx) % nx;
                out[idx3d(ii, jj, kk, nx, ny)] = data[idx3d(i, j, k, nx, ny)];
            }
        }
    }
    out
}

/// Reflect every axis about index `n - 1`: `out[i, j, k] = v[nx-1-i, ny-1-j, nz-1-k]`.
///
/// Both channels move together. Returns a fresh volume.
pub fn mirror(v: &ComplexVolume) -> ComplexVolume {
    let Dims { nx, ny, nz } = v.dims();
    let src = v.as_slice();
    let mut out = ComplexVolume::zeros(v.dims());
    let dst = out.as_mut_slice();

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                dst[idx3d(i, j, k, nx, ny)] = src[idx3d(nx - 1 - i, ny - 1 - j, nz - 1 - k, nx, ny)];
            }
        }
    }
    out
}

/// Generate FFT frequency values
/// Matches numpy.fft.fftfreq(n, d)
pub fn fftfreq(n: usize, d: f64) -> Vec<f64> {
    let mut freq = vec![0.0; n];
    let val = 1.0 / (n as f64 * d);

    if n % 2 == 0 {
        // Even: [0, 1, ..., n/2-1, -n/2, ..., -1]
        for i in 0..n / 2 {
            freq[i] = (i as f64) * val;
        }
        for i in n / 2..n {
            freq[i] = ((i as i64) - (n as i64)) as f64 * val;
        }
    } else {
        // Odd: [0, 1, ..., (n-1)/2, -(n-1)/2, ..., -1]
        for i in 0..=(n - 1) / 2 {
            freq[i] = (i as f64) * val;
        }
        for i in (n + 1) / 2..n {
            freq[i] = ((i as i64) - (n as i64)) as f64 * val;
        }
    }
    freq
}
