//! Elementwise complex arithmetic over volumes
//!
//! Every binary operation is "try fast path → extended precision → sentinel":
//! the `f64` result is used when finite, otherwise the operation is redone in
//! arbitrary-precision decimal arithmetic (division rounded half-up), and if
//! that cannot produce a finite `f64` either the sample becomes `0 + 0i`.
//! Non-finite values therefore never leave this module.
//!
//! Allocation is explicit in the name: `add`/`subtract`/`multiply`/`divide`
//! return a fresh volume, the `*_assign` forms overwrite their left operand,
//! and `apply` writes into a caller-supplied output buffer.

use std::num::NonZeroU64;

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive, Zero};
use num_complex::Complex64;

use crate::error::Result;
use crate::volume::{ComplexVolume, RealVolume};

const ZERO: Complex64 = Complex64::new(0.0, 0.0);
const ONE: Complex64 = Complex64::new(1.0, 0.0);

/// Significant digits kept by an extended-precision quotient
const DIVISION_PRECISION: NonZeroU64 = match NonZeroU64::new(34) {
    Some(p) => p,
    None => panic!("precision must be non-zero"),
};

/// Binary elementwise operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementwiseOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ElementwiseOp {
    /// Evaluate `a op b` with the soft-fail policy
    pub fn eval(self, a: Complex64, b: Complex64) -> Complex64 {
        self.eval_tracked(a, b).0
    }

    /// Like `eval`, also reporting whether the fast path was abandoned
    fn eval_tracked(self, a: Complex64, b: Complex64) -> (Complex64, bool) {
        let fast = self.fast(a, b);
        if fast.re.is_finite() && fast.im.is_finite() {
            (fast, false)
        } else {
            (self.exact(a, b).unwrap_or(ZERO), true)
        }
    }

    #[inline]
    fn fast(self, a: Complex64, b: Complex64) -> Complex64 {
        match self {
            ElementwiseOp::Add => a + b,
            ElementwiseOp::Subtract => a - b,
            ElementwiseOp::Multiply => Complex64::new(
                a.re * b.re - a.im * b.im,
                a.re * b.im + a.im * b.re,
            ),
            ElementwiseOp::Divide => {
                let denom = b.re * b.re + b.im * b.im;
                Complex64::new(
                    (a.re * b.re + a.im * b.im) / denom,
                    (a.im * b.re - a.re * b.im) / denom,
                )
            }
        }
    }

    /// Arbitrary-precision recomputation; `None` when an input is not finite,
    /// the divisor is zero, or the result does not fit an `f64`
    fn exact(self, a: Complex64, b: Complex64) -> Option<Complex64> {
        let c = BigDecimal::try_from(a.re).ok()?;
        let d = BigDecimal::try_from(a.im).ok()?;
        let e = BigDecimal::try_from(b.re).ok()?;
        let f = BigDecimal::try_from(b.im).ok()?;

        let (re, im) = match self {
            ElementwiseOp::Add => (c + e, d + f),
            ElementwiseOp::Subtract => (c - e, d - f),
            ElementwiseOp::Multiply => (&c * &e - &d * &f, &c * &f + &d * &e),
            ElementwiseOp::Divide => {
                let denom = &e * &e + &f * &f;
                if denom.is_zero() {
                    return None;
                }
                let re = (&c * &e + &d * &f) / &denom;
                let im = (&d * &e - &c * &f) / &denom;
                (
                    re.with_precision_round(DIVISION_PRECISION, RoundingMode::HalfUp),
                    im.with_precision_round(DIVISION_PRECISION, RoundingMode::HalfUp),
                )
            }
        };

        let re = re.to_f64()?;
        let im = im.to_f64()?;
        (re.is_finite() && im.is_finite()).then(|| Complex64::new(re, im))
    }
}

/// `out = a op b`, elementwise
pub fn apply(
    op: ElementwiseOp,
    a: &ComplexVolume,
    b: &ComplexVolume,
    out: &mut ComplexVolume,
) -> Result<()> {
    a.ensure_same_dims(b)?;
    a.ensure_same_dims(out)?;

    let mut fallbacks = 0usize;
    for ((o, &x), &y) in out.as_mut_slice().iter_mut()
        .zip(a.as_slice().iter())
        .zip(b.as_slice().iter())
    {
        let (v, slow) = op.eval_tracked(x, y);
        *o = v;
        fallbacks += slow as usize;
    }
    report_fallbacks(op, fallbacks);
    Ok(())
}

/// `a = a op b`, elementwise, in place on `a`
pub fn apply_assign(op: ElementwiseOp, a: &mut ComplexVolume, b: &ComplexVolume) -> Result<()> {
    a.ensure_same_dims(b)?;

    let mut fallbacks = 0usize;
    for (x, &y) in a.as_mut_slice().iter_mut().zip(b.as_slice().iter()) {
        let (v, slow) = op.eval_tracked(*x, y);
        *x = v;
        fallbacks += slow as usize;
    }
    report_fallbacks(op, fallbacks);
    Ok(())
}

fn report_fallbacks(op: ElementwiseOp, count: usize) {
    if count > 0 {
        log::warn!("{:?}: {} samples recomputed in extended precision", op, count);
    }
}

fn binary(op: ElementwiseOp, a: &ComplexVolume, b: &ComplexVolume) -> Result<ComplexVolume> {
    let mut out = ComplexVolume::zeros(a.dims());
    apply(op, a, b, &mut out)?;
    Ok(out)
}

/// Fresh `a + b`
pub fn add(a: &ComplexVolume, b: &ComplexVolume) -> Result<ComplexVolume> {
    binary(ElementwiseOp::Add, a, b)
}

/// Fresh `a - b`
pub fn subtract(a: &ComplexVolume, b: &ComplexVolume) -> Result<ComplexVolume> {
    binary(ElementwiseOp::Subtract, a, b)
}

/// Fresh `a * b`
pub fn multiply(a: &ComplexVolume, b: &ComplexVolume) -> Result<ComplexVolume> {
    binary(ElementwiseOp::Multiply, a, b)
}

/// Fresh `a / b`
pub fn divide(a: &ComplexVolume, b: &ComplexVolume) -> Result<ComplexVolume> {
    binary(ElementwiseOp::Divide, a, b)
}

pub fn add_assign(a: &mut ComplexVolume, b: &ComplexVolume) -> Result<()> {
    apply_assign(ElementwiseOp::Add, a, b)
}

pub fn subtract_assign(a: &mut ComplexVolume, b: &ComplexVolume) -> Result<()> {
    apply_assign(ElementwiseOp::Subtract, a, b)
}

pub fn multiply_assign(a: &mut ComplexVolume, b: &ComplexVolume) -> Result<()> {
    apply_assign(ElementwiseOp::Multiply, a, b)
}

pub fn divide_assign(a: &mut ComplexVolume, b: &ComplexVolume) -> Result<()> {
    apply_assign(ElementwiseOp::Divide, a, b)
}

/// Fresh `1 / v`, using the soft-fail divide (zero samples map to zero)
pub fn reciprocal(v: &ComplexVolume) -> ComplexVolume {
    v.map(|c| ElementwiseOp::Divide.eval(ONE, c))
}

/// Fresh complex conjugate
pub fn conj(v: &ComplexVolume) -> ComplexVolume {
    v.map(|c| c.conj())
}

/// Fresh `s · v`
pub fn scale(v: &ComplexVolume, s: f64) -> ComplexVolume {
    v.map(|c| c * s)
}

/// In-place `v = s · v`
pub fn scale_assign(v: &mut ComplexVolume, s: f64) {
    for c in v.as_mut_slice().iter_mut() {
        *c *= s;
    }
}

/// Fresh real volume with `inc` added to every sample
pub fn increment(v: &RealVolume, inc: f64) -> RealVolume {
    v.increment(inc)
}

/// In-place: add `inc` to the real channel only
pub fn increment_real(v: &mut ComplexVolume, inc: f64) {
    for c in v.as_mut_slice().iter_mut() {
        c.re += inc;
    }
}

/// Principal square root `r^½ (cos θ/2 + i sin θ/2)` of every sample (fresh)
pub fn sqrt_principal(v: &ComplexVolume) -> ComplexVolume {
    v.map(|c| {
        let theta = c.im.atan2(c.re);
        let root = c.norm_sqr().powf(0.25);
        Complex64::new(root * (theta / 2.0).cos(), root * (theta / 2.0).sin())
    })
}

/// `Σ |v|²` over all samples
pub fn sum_squared_magnitude(v: &ComplexVolume) -> f64 {
    v.as_slice().iter().map(|c| c.norm_sqr()).sum()
}
