//! Saturating Q15/Q31 arithmetic.
//!
//! Nothing in here wraps around. Results outside the representable range are clamped to the nearest extreme, and
//! the `checked_*` variants report that as [`Error::OverflowSaturated`].
//!
//! The multiply-high primitives map to `SMMUL`/`SMMULR` on Cortex-M cores with the DSP extension. On other targets
//! (Cortex-M0+, host tests), equivalent pure-Rust implementations are used.
use crate::Error;

/// Clip a Q63 intermediate to the Q31 range.
#[inline(always)]
pub fn clip_q63_to_q31(value: i64) -> i32 {
    if (value >> 32) as i32 != (value as i32) >> 31 {
        0x7FFFFFFF ^ ((value >> 63) as i32)
    } else {
        value as i32
    }
}

/// Like [`clip_q63_to_q31`], but fails if clipping was necessary.
pub fn checked_q63_to_q31(value: i64) -> Result<i32, Error> {
    i32::try_from(value).map_err(|_| Error::OverflowSaturated)
}

/// Saturate an `i32` to the Q15 (`i16`) range.
#[inline(always)]
pub fn saturate_q15(value: i32) -> i16 {
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Like [`saturate_q15`], but fails if clamping was necessary.
pub fn checked_q15(value: i32) -> Result<i16, Error> {
    i16::try_from(value).map_err(|_| Error::OverflowSaturated)
}

#[inline(always)]
pub fn add_q15(a: i16, b: i16) -> i16 {
    a.saturating_add(b)
}

#[inline(always)]
pub fn sub_q15(a: i16, b: i16) -> i16 {
    a.saturating_sub(b)
}

#[inline(always)]
pub fn add_q31(a: i32, b: i32) -> i32 {
    a.saturating_add(b)
}

#[inline(always)]
pub fn sub_q31(a: i32, b: i32) -> i32 {
    a.saturating_sub(b)
}

/// Q15 product, truncated. Only `-1 * -1` saturates.
#[inline(always)]
pub fn mul_q15(a: i16, b: i16) -> i16 {
    saturate_q15((a as i32 * b as i32) >> 15)
}

/// Q31 product, truncated. Only `-1 * -1` saturates.
#[inline(always)]
pub fn mul_q31(a: i32, b: i32) -> i32 {
    clip_q63_to_q31((a as i64 * b as i64) >> 31)
}

/// Multiply two 32-bit values, return the upper 32 bits.
///
/// Computes `(a * b) >> 32`, which truncates towards negative infinity. Maps to ARM `SMMUL`.
#[inline(always)]
pub fn mul_high(a: i32, b: i32) -> i32 {
    #[cfg(all(target_arch = "arm", target_feature = "dsp"))]
    {
        let out: i32;
        unsafe {
            core::arch::asm!(
                "smmul {out}, {a}, {b}",
                out = out(reg) out,
                a = in(reg) a,
                b = in(reg) b,
            );
        }
        out
    }
    #[cfg(not(all(target_arch = "arm", target_feature = "dsp")))]
    {
        ((a as i64 * b as i64) >> 32) as i32
    }
}

/// Multiply two 32-bit values, return the upper 32 bits rounded to nearest.
///
/// Computes `(a * b + 2^31) >> 32`, so ties round towards positive infinity. Maps to ARM `SMMULR`.
///
/// The result never overflows: the largest product magnitude is `2^62`.
#[inline(always)]
pub fn mul_high_rounded(a: i32, b: i32) -> i32 {
    #[cfg(all(target_arch = "arm", target_feature = "dsp"))]
    {
        let out: i32;
        unsafe {
            core::arch::asm!(
                "smmulr {out}, {a}, {b}",
                out = out(reg) out,
                a = in(reg) a,
                b = in(reg) b,
            );
        }
        out
    }
    #[cfg(not(all(target_arch = "arm", target_feature = "dsp")))]
    {
        ((a as i64 * b as i64 + 0x8000_0000) >> 32) as i32
    }
}

/// Arithmetic left shift that saturates instead of shifting bits out.
#[inline(always)]
pub fn shl_saturate(value: i32, shift: u32) -> i32 {
    clip_q63_to_q31((value as i64) << shift)
}

/// Widen a Q15 sample to Q31. Exact.
#[inline(always)]
pub fn q15_to_q31(sample: i16) -> i32 {
    (sample as i32) << 16
}

/// Narrow a Q31 sample to Q15, rounding to nearest and saturating.
#[inline(always)]
pub fn q31_to_q15(sample: i32) -> i16 {
    saturate_q15(((sample as i64 + 0x8000) >> 16) as i32)
}
