//! Pure geometry and unit arithmetic.
//!
//! Everything here is I/O-free and testable without images: rational
//! approximation, physical-unit conversion, display-size sanity clamping,
//! scale-factor derivation, and crop-window arithmetic.
//!
//! Sizes and resolutions are exact rationals, not floats. Derivation keys
//! are persisted and compared structurally, so two requests for "6.5 inches
//! at 300 DPI" must produce byte-identical keys on every machine and every
//! run; binary floats drift, `Ratio<i64>` does not. [`approx`] keeps the
//! rationals small (denominator at most [`MAX_DENOMINATOR`], roughly four
//! significant digits) so equivalent requests collapse onto one key.

use crate::error::{Error, Result};
use crate::types::{Dim, ImageCrop, ImageSize, Units};
use num_rational::Ratio;
use num_traits::{One, Signed, ToPrimitive, Zero};

/// Exact rational used for sizes, resolutions, and scale factors.
pub type Rational = Ratio<i64>;

/// Largest denominator kept by [`approx`].
pub const MAX_DENOMINATOR: i64 = 10_000;

/// Centimetres per inch, exactly.
pub fn cm_per_inch() -> Rational {
    Ratio::new(254, 100)
}

/// Printer's points per inch (TeX convention), exactly.
pub fn points_per_inch() -> Rational {
    Ratio::new(7227, 100)
}

/// Best rational approximation with denominator at most [`MAX_DENOMINATOR`].
///
/// Uses continued-fraction convergents, taking the final semiconvergent
/// when it lands closer than the last full convergent. Values whose
/// (reduced) denominator is already small pass through unchanged.
///
/// # Examples
/// ```
/// # use darkroom::geometry::{approx, Rational};
/// // 355/113 is already small
/// assert_eq!(approx(Rational::new(355, 113)), Rational::new(355, 113));
/// // pi to four significant digits stays within the denominator bound
/// let r = approx(Rational::new(3_141_592_653, 1_000_000_000));
/// assert!(*r.denom() <= 10_000);
/// ```
pub fn approx(r: Rational) -> Rational {
    if *r.denom() <= MAX_DENOMINATOR {
        return r;
    }
    let negative = r.is_negative();
    let x = r.abs();

    // Convergents p/q of the continued fraction of x, in i128 to dodge
    // intermediate overflow; q never exceeds MAX_DENOMINATOR on exit.
    let (mut p0, mut q0, mut p1, mut q1) = (1i128, 0i128, *x.trunc().numer() as i128, 1i128);
    let mut n = *x.fract().numer() as i128;
    let mut d = *x.fract().denom() as i128;

    while n != 0 {
        let a = d / n;
        let (next_n, next_d) = (d - a * n, n);
        let p2 = a * p1 + p0;
        let q2 = a * q1 + q0;
        if q2 > MAX_DENOMINATOR as i128 {
            // Best semiconvergent under the bound, if closer than p1/q1.
            let k = (MAX_DENOMINATOR as i128 - q0) / q1;
            let candidate = Ratio::new((k * p1 + p0) as i64, (k * q1 + q0) as i64);
            let convergent = Ratio::new(p1 as i64, q1 as i64);
            let best = if (x - candidate).abs() < (x - convergent).abs() {
                candidate
            } else {
                convergent
            };
            return if negative { -best } else { best };
        }
        (p0, q0, p1, q1) = (p1, q1, p2, q2);
        (n, d) = (next_n, next_d);
    }

    let exact = Ratio::new(p1 as i64, q1 as i64);
    if negative { -exact } else { exact }
}

/// Approximate a binary float as a small rational.
///
/// `None` for non-finite input or values outside `i64` range. This is the
/// migration path for resolutions that were stored as floats before they
/// became rationals.
pub fn approx_f64(x: f64) -> Option<Rational> {
    Rational::approximate_float(x).map(approx)
}

/// A size expressed in inches (squared inches when the dimension is area).
pub fn inches(size: &ImageSize) -> Rational {
    let per_inch = match size.units {
        Units::Inches => Rational::one(),
        Units::Cm => cm_per_inch(),
        Units::Points => points_per_inch(),
    };
    match size.dim {
        Dim::Area => size.size / (per_inch * per_inch),
        Dim::Height | Dim::Width => size.size / per_inch,
    }
}

/// Clamp a requested display size to something printable.
///
/// Linear dimensions clamp to [1/4, 25] inches; areas clamp to
/// [1/16, 625] square inches (the same bounds, squared).
pub fn sane_inches(size: &ImageSize) -> Rational {
    let value = inches(size);
    let (lo, hi) = match size.dim {
        Dim::Area => (Ratio::new(1, 16), Ratio::from_integer(625)),
        Dim::Height | Dim::Width => (Ratio::new(1, 4), Ratio::from_integer(25)),
    };
    value.clamp(lo, hi)
}

/// Scale factor that renders an image at `size` when displayed at `dpi`.
///
/// For height/width the factor is exact; for area it is the square root of
/// the pixel-area ratio, computed in floating point and re-approximated as
/// a small rational.
pub fn scale_from_dpi(dpi: Rational, size: &ImageSize, width: u32, height: u32) -> Result<Rational> {
    if !dpi.is_positive() {
        return Err(Error::caller(format!("non-positive dpi: {dpi}")));
    }
    if width == 0 || height == 0 {
        return Err(Error::caller(format!(
            "degenerate image dimensions: {width}x{height}"
        )));
    }
    let target = sane_inches(size);
    match size.dim {
        Dim::Height => Ok(target * dpi / Ratio::from_integer(height as i64)),
        Dim::Width => Ok(target * dpi / Ratio::from_integer(width as i64)),
        Dim::Area => {
            let pixels = Ratio::from_integer(width as i64 * height as i64);
            let ratio = target * dpi * dpi / pixels;
            sqrt_rational(ratio)
        }
    }
}

fn sqrt_rational(r: Rational) -> Result<Rational> {
    if r.is_negative() {
        return Err(Error::caller(format!("square root of negative ratio: {r}")));
    }
    if r.is_zero() {
        return Ok(Rational::zero());
    }
    let x = r
        .to_f64()
        .ok_or_else(|| Error::caller(format!("ratio out of float range: {r}")))?;
    approx_f64(x.sqrt()).ok_or_else(|| Error::caller(format!("no rational near sqrt of {r}")))
}

/// Format a scale factor the way `pnmscale` expects it: fixed point with
/// six fractional digits.
pub fn format_scale(scale: Rational) -> String {
    format!("{:.6}", scale.to_f64().unwrap_or(0.0))
}

/// Inclusive pixel window selected by a crop, in `pnmcut` coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutWindow {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// Translate crop margins into an inclusive cut window for a `width` ×
/// `height` image.
///
/// `None` when every margin is zero (nothing to cut). An error when the
/// margins swallow the whole image in either axis.
pub fn cut_window(crop: &ImageCrop, width: u32, height: u32) -> Result<Option<CutWindow>> {
    if crop.top == 0 && crop.bottom == 0 && crop.left == 0 && crop.right == 0 {
        return Ok(None);
    }
    if crop.left as u64 + crop.right as u64 >= width as u64
        || crop.top as u64 + crop.bottom as u64 >= height as u64
    {
        return Err(Error::caller(format!(
            "crop margins ({} left, {} right, {} top, {} bottom) exceed {}x{}",
            crop.left, crop.right, crop.top, crop.bottom, width, height
        )));
    }
    Ok(Some(CutWindow {
        left: crop.left,
        right: width - crop.right - 1,
        top: crop.top,
        bottom: height - crop.bottom - 1,
    }))
}
