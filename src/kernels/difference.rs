//! Directional finite-difference filters for regularized deconvolution
//!
//! Six filters in k-space: second differences along x, y and z, and three
//! mixed cross terms (xy, yz, xz) scaled by √2. The axial terms carry the
//! anisotropy ratio `dx/dz`: squared for the pure z term, linear for the
//! cross terms that involve z.
//!
//! With per-axis angular frequency `w = 2π·fftfreq(n, 1)`:
//!
//! ```text
//! L1 = 2cos(wx) - 2
//! L2 = 2cos(wy) - 2
//! L3 = r²(2cos(wz) - 2)
//! L4 = √2 (1 - cos wx - cos wy + cos(wx+wy)) + i √2 (sin wx + sin wy - sin(wx+wy))
//! L5 = r √2 (...same form in wy, wz...)
//! L6 = r √2 (...same form in wx, wz...)
//! ```

use std::f64::consts::{PI, SQRT_2};

use num_complex::Complex64;

use crate::fft::fftfreq;
use crate::volume::{ComplexVolume, Dims};

/// Number of directional filters
pub const FILTER_COUNT: usize = 6;

/// Mixed second difference along two axes in k-space
#[inline]
fn cross_term(a: f64, b: f64, scale: f64) -> Complex64 {
    Complex64::new(
        scale * SQRT_2 * (1.0 - a.cos() - b.cos() + (a + b).cos()),
        scale * SQRT_2 * (a.sin() + b.sin() - (a + b).sin()),
    )
}

/// Generate the six directional filters in k-space
///
/// Filters are not shifted: the zero frequency sits at index (0, 0, 0),
/// where every filter vanishes.
///
/// # Arguments
/// * `dims` - Grid extent
/// * `spacing_ratio` - Anisotropy ratio `dx / dz`
///
/// # Returns
/// `[L1, L2, L3, L4, L5, L6]`, each a volume over `dims`
pub fn difference_filters(dims: Dims, spacing_ratio: f64) -> Vec<ComplexVolume> {
    let Dims { nx, ny, nz } = dims;
    let r = spacing_ratio;

    let wx: Vec<f64> = fftfreq(nx, 1.0).into_iter().map(|f| 2.0 * PI * f).collect();
    let wy: Vec<f64> = fftfreq(ny, 1.0).into_iter().map(|f| 2.0 * PI * f).collect();
    let wz: Vec<f64> = fftfreq(nz, 1.0).into_iter().map(|f| 2.0 * PI * f).collect();

    let mut filters: Vec<ComplexVolume> = (0..FILTER_COUNT).map(|_| ComplexVolume::zeros(dims)).collect();

    for k in 0..nz {
        let z = wz[k];
        for j in 0..ny {
            let y = wy[j];
            for i in 0..nx {
                let x = wx[i];
                let values = [
                    Complex64::new(2.0 * x.cos() - 2.0, 0.0),
                    Complex64::new(2.0 * y.cos() - 2.0, 0.0),
                    Complex64::new(r * r * (2.0 * z.cos() - 2.0), 0.0),
                    cross_term(x, y, 1.0),
                    cross_term(y, z, r),
                    cross_term(x, z, r),
                ];
                for (filter, value) in filters.iter_mut().zip(values) {
                    filter.set(i, j, k, value);
                }
            }
        }
    }

    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_vanish_at_dc() {
        let filters = difference_filters(Dims::new(6, 5, 4), 0.7);
        assert_eq!(filters.len(), FILTER_COUNT);
        for (n, f) in filters.iter().enumerate() {
            assert!(f.get(0, 0, 0).norm() < 1e-12, "L{} non-zero at DC", n + 1);
        }
    }

    #[test]
    fn test_axial_filters_at_nyquist() {
        let dims = Dims::new(4, 4, 4);
        let r = 0.5;
        let filters = difference_filters(dims, r);
        // Nyquist bin of an even axis: w = -π, 2cos(w) - 2 = -4
        assert!((filters[0].get(2, 0, 0).re + 4.0).abs() < 1e-12);
        assert!((filters[1].get(0, 2, 0).re + 4.0).abs() < 1e-12);
        assert!((filters[2].get(0, 0, 2).re + 4.0 * r * r).abs() < 1e-12);
        // Pure axial filters are real
        for f in &filters[..3] {
            assert!(f.as_slice().iter().all(|c| c.im == 0.0));
        }
    }

    #[test]
    fn test_cross_filter_depends_on_both_axes() {
        let filters = difference_filters(Dims::new(8, 8, 8), 1.0);
        // Along a single axis the xy cross term collapses to zero
        for i in 0..8 {
            assert!(filters[3].get(i, 0, 0).norm() < 1e-12, "L4 non-zero at ({}, 0, 0)", i);
            assert!(filters[3].get(0, i, 0).norm() < 1e-12, "L4 non-zero at (0, {}, 0)", i);
        }
        // w = π/2 on both axes: √2 (1 - 0 - 0 - 1) + i √2 (1 + 1 - 0)
        let v = filters[3].get(2, 2, 0);
        assert!(v.re.abs() < 1e-12);
        assert!((v.im - 2.0 * SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn test_spacing_ratio_scales_cross_terms() {
        let a = difference_filters(Dims::new(4, 4, 4), 1.0);
        let b = difference_filters(Dims::new(4, 4, 4), 2.0);
        let va = a[4].get(0, 1, 1);
        let vb = b[4].get(0, 1, 1);
        assert!((vb - va * 2.0).norm() < 1e-12);
        // xy term has no z dependence
        assert_eq!(a[3], b[3]);
    }
}
