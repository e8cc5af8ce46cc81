//! Fixed-point direct form I biquad kernel.
//!
//! # Number formats
//!
//! * Coefficients: Q28 (`1.0 = 2^28`), so that the range is `[-8, 8)`. Feedback coefficients are stored negated, so
//!   that all five terms are added: `y = b0 x + b1 x1 + b2 x2 + a1 y1 + a2 y2`.
//! * Samples: Q15 audio placed into a 32 bit word with 4 bits of headroom (`WORKING_SHIFT`), so that a +20 dB band
//!   at full scale does not clip inside the cascade.
//! * Each product is taken with the rounding multiply-high primitive (`(c * x) >> 32`), which leaves the sum
//!   `POST_SHIFT` bits below the sample scale. The sum is shifted back up with saturation.
//!
//! # Accuracy
//!
//! Each product keeps 8 fractional bits below the Q15 LSB. The feedback path amplifies that rounding error by the
//! inverse of the denominator, which grows as the poles approach `z = 1`. Against a floating point filter, the mid
//! bands stay within about 2 LSB, while the 64 Hz band at 96 kHz deviates by up to about 16 LSB.
use crate::fixed::{add_q31, mul_high_rounded, saturate_q15, shl_saturate};

/// Fractional bits of the coefficients.
pub const COEFFICIENT_SHIFT: u32 = 28;

/// Restores the sample scale after a multiply-high.
pub const POST_SHIFT: u32 = 32 - COEFFICIENT_SHIFT;

/// Position of the Q15 sample within the working word.
pub const WORKING_SHIFT: u32 = 12;

/// Which samples of a block belong to the filtered channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelSelect {
    /// Even samples of an interleaved stereo block.
    Left,
    /// Odd samples of an interleaved stereo block.
    Right,
    /// Every sample; the block holds a single channel.
    Contiguous,
}

impl ChannelSelect {
    /// Offset and stride within the block.
    pub const fn layout(self) -> (usize, usize) {
        match self {
            ChannelSelect::Left => (0, 2),
            ChannelSelect::Right => (1, 2),
            ChannelSelect::Contiguous => (0, 1),
        }
    }
}

/// Q15 sample to working format. Exact.
#[inline(always)]
pub fn to_working(sample: i16) -> i32 {
    (sample as i32) << WORKING_SHIFT
}

/// Working format to Q15, rounded to nearest and saturated.
#[inline(always)]
pub fn from_working(value: i32) -> i16 {
    saturate_q15(value.saturating_add(1 << (WORKING_SHIFT - 1)) >> WORKING_SHIFT)
}

/// Coefficients of one second order section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BiquadStage {
    pub b0: i32,
    pub b1: i32,
    pub b2: i32,
    /// Negated feedback coefficient.
    pub a1: i32,
    /// Negated feedback coefficient.
    pub a2: i32,
}

impl BiquadStage {
    /// Passes samples through unchanged.
    pub const IDENTITY: Self = Self {
        b0: 1 << COEFFICIENT_SHIFT,
        b1: 0,
        b2: 0,
        a1: 0,
        a2: 0,
    };

    /// Run one sample through the section.
    #[inline(always)]
    pub fn tick(&self, state: &mut BiquadState, x: i32) -> i32 {
        let mut acc = mul_high_rounded(self.b0, x);
        acc = add_q31(acc, mul_high_rounded(self.b1, state.x1));
        acc = add_q31(acc, mul_high_rounded(self.b2, state.x2));
        acc = add_q31(acc, mul_high_rounded(self.a1, state.y1));
        acc = add_q31(acc, mul_high_rounded(self.a2, state.y2));

        let y = shl_saturate(acc, POST_SHIFT);

        state.x2 = state.x1;
        state.x1 = x;
        state.y2 = state.y1;
        state.y1 = y;

        y
    }
}

/// Filter memory of one section, for one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BiquadState {
    pub x1: i32,
    pub x2: i32,
    pub y1: i32,
    pub y2: i32,
}

impl BiquadState {
    pub const fn new() -> Self {
        Self {
            x1: 0,
            x2: 0,
            y1: 0,
            y2: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Run one section over the selected channel of a block of working-format samples, in place.
///
/// The state is carried over to the next call.
pub fn process(samples: &mut [i32], stage: &BiquadStage, state: &mut BiquadState, channel: ChannelSelect) {
    let (offset, stride) = channel.layout();

    for sample in samples.iter_mut().skip(offset).step_by(stride) {
        *sample = stage.tick(state, *sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_format_round_trip() {
        for sample in [i16::MIN, -1234, -1, 0, 1, 4321, i16::MAX] {
            assert_eq!(from_working(to_working(sample)), sample);
        }

        // Values beyond the Q15 range saturate.
        assert_eq!(from_working(i32::MAX), i16::MAX);
        assert_eq!(from_working(i32::MIN), i16::MIN);
        assert_eq!(from_working(to_working(i16::MAX) * 2), i16::MAX);
    }

    #[test]
    fn identity_stage() {
        let mut state = BiquadState::new();
        let mut samples = [to_working(100), to_working(-200), to_working(i16::MAX), to_working(i16::MIN)];
        let expected = samples;

        process(&mut samples, &BiquadStage::IDENTITY, &mut state, ChannelSelect::Contiguous);
        assert_eq!(samples, expected);
    }

    #[test]
    fn channel_selection() {
        // Half gain
        let stage = BiquadStage {
            b0: 1 << (COEFFICIENT_SHIFT - 1),
            ..BiquadStage::IDENTITY
        };

        let mut samples = [4096, 4096, 4096, 4096];
        let mut state = BiquadState::new();
        process(&mut samples, &stage, &mut state, ChannelSelect::Right);
        assert_eq!(samples, [4096, 2048, 4096, 2048]);

        let mut state = BiquadState::new();
        process(&mut samples, &stage, &mut state, ChannelSelect::Left);
        assert_eq!(samples, [2048, 2048, 2048, 2048]);
    }

    #[test]
    fn state_is_carried() {
        // One sample delay: y = x[n-1]
        let stage = BiquadStage {
            b0: 0,
            b1: 1 << COEFFICIENT_SHIFT,
            ..BiquadStage::IDENTITY
        };
        let mut state = BiquadState::new();

        let mut first = [16, 32];
        process(&mut first, &stage, &mut state, ChannelSelect::Contiguous);
        assert_eq!(first, [0, 16]);

        let mut second = [48];
        process(&mut second, &stage, &mut state, ChannelSelect::Contiguous);
        assert_eq!(second, [32]);
        assert_eq!(state, BiquadState { x1: 48, x2: 32, y1: 32, y2: 16 });

        state.reset();
        assert_eq!(state, BiquadState::default());
    }

    #[test]
    fn feedback_saturates() {
        // A gain of 7.99 applied twice overflows the working format.
        let stage = BiquadStage {
            b0: i32::MAX,
            ..BiquadStage::IDENTITY
        };
        let mut state = BiquadState::new();

        let mut samples = [to_working(i16::MAX), to_working(i16::MIN)];
        process(&mut samples, &stage, &mut state, ChannelSelect::Contiguous);
        process(&mut samples, &stage, &mut state, ChannelSelect::Contiguous);

        assert_eq!(samples, [i32::MAX, i32::MIN]);
        assert_eq!(from_working(samples[0]), i16::MAX);
        assert_eq!(from_working(samples[1]), i16::MIN);
    }
}
