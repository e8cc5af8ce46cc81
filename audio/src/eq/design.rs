//! Peaking filter design, after the Audio EQ Cookbook (bilinear transform).
//!
//! Coefficients are designed in double precision, then quantized to the Q28 fixed-point format of the kernel. The
//! double-precision set is kept in the `biquad` crate's representation, which also serves as the reference when
//! validating the quantized stage.
use biquad::Coefficients;
use core::f64::consts::PI;

use super::stage::{BiquadStage, COEFFICIENT_SHIFT};
use crate::Error;

const COEFFICIENT_SCALE: f64 = (1u64 << COEFFICIENT_SHIFT) as f64;

/// The largest acceptable deviation of a quantized coefficient from its double-precision value.
///
/// Half an LSB from rounding, plus slack for the double-precision arithmetic.
const QUANTIZATION_TOLERANCE: f64 = 0.5001 / COEFFICIENT_SCALE;

/// Cookbook peaking filter coefficients in double precision.
///
/// The result uses the common convention `y = b0 x + b1 x1 + b2 x2 - a1 y1 - a2 y2`, which is also the one of
/// `biquad::DirectForm1`.
///
/// # Arguments
///
/// * `q` - The quality factor of the band.
/// * `gain_db` - The boost (positive) or cut (negative) at the center frequency.
/// * `center_hz` - The center frequency.
/// * `sample_rate_hz` - The sample rate.
pub fn peaking_coefficients(q: f64, gain_db: f64, center_hz: f64, sample_rate_hz: f64) -> Coefficients<f64> {
    let v = libm::pow(10.0, libm::fabs(gain_db) / 20.0);
    let k = libm::tan(PI * center_hz / sample_rate_hz);
    let kk = k * k;

    // Boost and cut normalize differently, each keeps the denominator well away from zero at its extreme.
    if gain_db >= 0.0 {
        let norm = 1.0 / (1.0 + k / q + kk);

        Coefficients {
            b0: (1.0 + v * k / q + kk) * norm,
            b1: 2.0 * (kk - 1.0) * norm,
            b2: (1.0 - v * k / q + kk) * norm,
            a1: 2.0 * (kk - 1.0) * norm,
            a2: (1.0 - k / q + kk) * norm,
        }
    } else {
        let norm = 1.0 / (1.0 + v * k / q + kk);

        Coefficients {
            b0: (1.0 + k / q + kk) * norm,
            b1: 2.0 * (kk - 1.0) * norm,
            b2: (1.0 - k / q + kk) * norm,
            a1: 2.0 * (kk - 1.0) * norm,
            a2: (1.0 - v * k / q + kk) * norm,
        }
    }
}

/// Quantize to Q28, rounding to nearest. The flag is set if the value had to be clamped.
fn quantize(value: f64) -> (i32, bool) {
    let scaled = libm::round(value * COEFFICIENT_SCALE);

    if scaled >= i32::MAX as f64 {
        (i32::MAX, scaled > i32::MAX as f64)
    } else if scaled <= i32::MIN as f64 {
        (i32::MIN, scaled < i32::MIN as f64)
    } else {
        (scaled as i32, false)
    }
}

impl BiquadStage {
    /// Quantize double-precision coefficients, negating the feedback terms.
    ///
    /// Out-of-range coefficients are clamped, and the returned flag is set.
    pub fn quantize(coefficients: &Coefficients<f64>) -> (Self, bool) {
        let (b0, s0) = quantize(coefficients.b0);
        let (b1, s1) = quantize(coefficients.b1);
        let (b2, s2) = quantize(coefficients.b2);
        let (a1, s3) = quantize(-coefficients.a1);
        let (a2, s4) = quantize(-coefficients.a2);

        (Self { b0, b1, b2, a1, a2 }, s0 || s1 || s2 || s3 || s4)
    }

    /// The represented coefficients, in the common convention.
    pub fn to_coefficients(&self) -> Coefficients<f64> {
        Coefficients {
            b0: self.b0 as f64 / COEFFICIENT_SCALE,
            b1: self.b1 as f64 / COEFFICIENT_SCALE,
            b2: self.b2 as f64 / COEFFICIENT_SCALE,
            a1: -(self.a1 as f64) / COEFFICIENT_SCALE,
            a2: -(self.a2 as f64) / COEFFICIENT_SCALE,
        }
    }

    /// Largest absolute difference to a double-precision reference.
    pub fn deviation(&self, reference: &Coefficients<f64>) -> f64 {
        let c = self.to_coefficients();

        [
            c.b0 - reference.b0,
            c.b1 - reference.b1,
            c.b2 - reference.b2,
            c.a1 - reference.a1,
            c.a2 - reference.a2,
        ]
        .iter()
        .fold(0.0, |max, d| libm::fmax(max, libm::fabs(*d)))
    }
}

fn validate(q: f64, gain_db: f64, center_hz: f64, sample_rate_hz: f64) -> Result<(), Error> {
    let finite = q.is_finite() && gain_db.is_finite() && center_hz.is_finite() && sample_rate_hz.is_finite();

    if !finite || q <= 0.0 || center_hz <= 0.0 || center_hz >= sample_rate_hz / 2.0 {
        return Err(Error::InvalidParameter);
    }

    Ok(())
}

/// Design a peaking band, reporting any problem.
///
/// Fails with [`Error::InvalidParameter`] for non-finite values, a non-positive `q`, or a center frequency outside
/// `(0, fs/2)`. Fails with [`Error::OverflowSaturated`] if the quantized stage does not represent the
/// double-precision design within rounding, which happens when a coefficient leaves the Q28 range.
pub fn try_design_peaking_band(
    q: f64,
    gain_db: f64,
    center_hz: f64,
    sample_rate_hz: f64,
) -> Result<BiquadStage, Error> {
    validate(q, gain_db, center_hz, sample_rate_hz)?;

    let reference = peaking_coefficients(q, gain_db, center_hz, sample_rate_hz);
    let (stage, saturated) = BiquadStage::quantize(&reference);

    if saturated || stage.deviation(&reference) > QUANTIZATION_TOLERANCE {
        return Err(Error::OverflowSaturated);
    }

    Ok(stage)
}

/// Design a peaking band.
///
/// Invalid parameters yield the identity stage. Coefficients outside the Q28 range are clamped.
pub fn design_peaking_band(q: f64, gain_db: f64, center_hz: f64, sample_rate_hz: f64) -> BiquadStage {
    if validate(q, gain_db, center_hz, sample_rate_hz).is_err() {
        warn!("Invalid band at {} Hz, passing through.", center_hz);
        return BiquadStage::IDENTITY;
    }

    let (stage, saturated) = BiquadStage::quantize(&peaking_coefficients(q, gain_db, center_hz, sample_rate_hz));
    if saturated {
        warn!("Band at {} Hz saturated.", center_hz);
    }

    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BAND_CENTERS_HZ, BAND_Q, SUPPORTED_SAMPLE_RATES_HZ};

    #[test]
    fn zero_gain_is_identity() {
        for fs in SUPPORTED_SAMPLE_RATES_HZ {
            for fc in BAND_CENTERS_HZ {
                let stage = design_peaking_band(BAND_Q, 0.0, fc, fs as f64);

                assert_eq!(stage.b0, 1 << COEFFICIENT_SHIFT);
                assert_eq!(stage.b1, -stage.a1);
                assert_eq!(stage.b2, -stage.a2);
            }
        }
    }

    #[test]
    fn feedback_terms_are_negated() {
        let reference = peaking_coefficients(BAND_Q, 6.0, 1000.0, 48_000.0);
        let stage = design_peaking_band(BAND_Q, 6.0, 1000.0, 48_000.0);

        assert!(reference.a1 < 0.0);
        assert!(stage.a1 > 0);
        assert!(reference.a2 > 0.0);
        assert!(stage.a2 < 0);
    }

    #[test]
    fn quantization_matches_reference() {
        for fs in SUPPORTED_SAMPLE_RATES_HZ {
            for fc in BAND_CENTERS_HZ {
                for gain in [-20.0, -7.5, 3.0, 20.0] {
                    let reference = peaking_coefficients(BAND_Q, gain, fc, fs as f64);
                    let stage = try_design_peaking_band(BAND_Q, gain, fc, fs as f64).unwrap();

                    assert!(stage.deviation(&reference) <= QUANTIZATION_TOLERANCE);
                }
            }
        }
    }

    #[test]
    fn gain_at_center_frequency() {
        // |H(e^jw)| at the center frequency equals the requested gain.
        for gain_db in [-12.0f64, 9.0] {
            let c = peaking_coefficients(2.0, gain_db, 1000.0, 48_000.0);
            let w = 2.0 * PI * 1000.0 / 48_000.0;
            let (cos1, sin1) = (libm::cos(w), libm::sin(w));
            let (cos2, sin2) = (libm::cos(2.0 * w), libm::sin(2.0 * w));

            let num = libm::hypot(c.b0 + c.b1 * cos1 + c.b2 * cos2, c.b1 * sin1 + c.b2 * sin2);
            let den = libm::hypot(1.0 + c.a1 * cos1 + c.a2 * cos2, c.a1 * sin1 + c.a2 * sin2);
            let measured_db = 20.0 * libm::log10(num / den);

            assert!(libm::fabs(measured_db - gain_db) < 1e-9);
        }
    }

    #[test]
    fn invalid_parameters() {
        assert_eq!(
            try_design_peaking_band(0.0, 3.0, 1000.0, 48_000.0),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            try_design_peaking_band(BAND_Q, 3.0, 24_000.0, 48_000.0),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            try_design_peaking_band(BAND_Q, f64::NAN, 1000.0, 48_000.0),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            design_peaking_band(BAND_Q, 3.0, -1.0, 48_000.0),
            BiquadStage::IDENTITY
        );
    }

    #[test]
    fn out_of_range_coefficients_saturate() {
        // A wide +20 dB boost at fs/4 needs b0 > 8.
        let reference = peaking_coefficients(0.1, 20.0, 12_000.0, 48_000.0);
        assert!(reference.b0 > 8.0);

        assert_eq!(
            try_design_peaking_band(0.1, 20.0, 12_000.0, 48_000.0),
            Err(Error::OverflowSaturated)
        );

        let stage = design_peaking_band(0.1, 20.0, 12_000.0, 48_000.0);
        assert_eq!(stage.b0, i32::MAX);
    }
}
