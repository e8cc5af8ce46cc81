//! IEC 60958 (S/PDIF) consumer format encoder.
//!
//! Each stereo frame is two subframes of 32 time slots:
//!
//! | Slots | Content                                   |
//! |-------|-------------------------------------------|
//! | 0-3   | Preamble (B, M or W)                      |
//! | 4-7   | Auxiliary, zero                           |
//! | 8-27  | 20 bit audio, LSB first, 16 bit left aligned |
//! | 28    | Validity                                  |
//! | 29    | User data                                 |
//! | 30    | Channel status                            |
//! | 31    | Even parity over slots 4-31               |
//!
//! Slots are biphase-mark coded into two line cells each, giving 64 cells per subframe. The cells are packed into two
//! 32 bit words, first cell in the least significant bit, for a shifter that outputs one cell per clock.
use crate::SampleRate;

/// Frames per channel status block.
pub const BLOCK_FRAMES: usize = 192;

/// Output words per stereo frame.
pub const WORDS_PER_FRAME: usize = 4;

/// Subframe synchronization patterns, first cell in the most significant bit.
///
/// Each pattern starts after a low cell, and ends low.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Preamble {
    /// Left subframe, first frame of a block.
    B = 0b1110_1000,
    /// Left subframe.
    M = 0b1110_0010,
    /// Right subframe.
    W = 0b1110_0100,
}

/// Sampling frequency code in channel status bits 24-27.
pub const fn rate_code(rate: SampleRate) -> u8 {
    match rate {
        SampleRate::Hz44100 => 0b0000,
        SampleRate::Hz48000 => 0b0010,
        SampleRate::Hz96000 => 0b1010,
    }
}

/// Consumer channel status block: PCM audio, copying permitted, no emphasis, with the sampling frequency.
pub const fn channel_status(rate: SampleRate) -> [u8; BLOCK_FRAMES / 8] {
    let mut status = [0u8; BLOCK_FRAMES / 8];

    // Bit 2: copyright not asserted.
    status[0] = 1 << 2;
    // Bits 24-27, the first bit in the least significant position.
    status[3] = rate_code(rate);

    status
}

/// Assemble the time slots of a subframe. The preamble slots are left zero.
pub fn subframe(sample: i16, channel_status_bit: bool) -> u32 {
    let mut slots = (sample as u16 as u32) << 12;
    slots |= (channel_status_bit as u32) << 30;

    // Even parity, the preamble does not count.
    let parity = (slots >> 4).count_ones() & 1;
    slots | (parity << 31)
}

/// Biphase-mark code a subframe to 64 line cells.
///
/// The line is assumed low before the subframe. With even parity, it is low again after it.
pub fn biphase_mark(preamble: Preamble, slots: u32) -> [u32; 2] {
    let mut cells: u64 = 0;
    let pattern = preamble as u8;

    for cell in 0..8 {
        let level = (pattern >> (7 - cell)) & 1;
        cells |= (level as u64) << cell;
    }

    // The preamble ends low.
    let mut level = 0u64;
    for slot in 4..32 {
        let bit = (slots >> slot) & 1;

        level ^= 1;
        cells |= level << (2 * slot);
        level ^= bit as u64;
        cells |= level << (2 * slot + 1);
    }

    [cells as u32, (cells >> 32) as u32]
}

/// Encodes a stream of interleaved stereo samples, keeping track of the channel status block.
pub struct SpdifEncoder {
    status: [u8; BLOCK_FRAMES / 8],
    frame: usize,
}

impl SpdifEncoder {
    pub const fn new(rate: SampleRate) -> Self {
        Self {
            status: channel_status(rate),
            frame: 0,
        }
    }

    /// Change the announced rate. Restarts the channel status block.
    pub fn set_rate(&mut self, rate: SampleRate) {
        self.status = channel_status(rate);
        self.frame = 0;
    }

    /// Position within the channel status block.
    pub fn frame(&self) -> usize {
        self.frame
    }

    fn status_bit(&self) -> bool {
        (self.status[self.frame / 8] >> (self.frame % 8)) & 1 != 0
    }

    pub fn encode_frame(&mut self, left: i16, right: i16) -> [u32; WORDS_PER_FRAME] {
        let preamble = if self.frame == 0 { Preamble::B } else { Preamble::M };
        let status_bit = self.status_bit();

        let [l0, l1] = biphase_mark(preamble, subframe(left, status_bit));
        let [r0, r1] = biphase_mark(Preamble::W, subframe(right, status_bit));

        self.frame = (self.frame + 1) % BLOCK_FRAMES;

        [l0, l1, r0, r1]
    }

    /// Encode interleaved stereo samples into line words.
    ///
    /// Stops at whichever of the two runs out first. Returns the number of encoded frames.
    pub fn encode(&mut self, samples: &[i16], words: &mut [u32]) -> usize {
        let mut frames = 0;

        for (frame, output) in samples.chunks_exact(2).zip(words.chunks_exact_mut(WORDS_PER_FRAME)) {
            output.copy_from_slice(&self.encode_frame(frame[0], frame[1]));
            frames += 1;
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(words: &[u32; 2], index: usize) -> u32 {
        (words[index / 32] >> (index % 32)) & 1
    }

    /// Recover the slots 4-31 from the line cells.
    fn decode(words: &[u32; 2]) -> u32 {
        let mut slots = 0;
        for slot in 4..32 {
            let bit = cell(words, 2 * slot) ^ cell(words, 2 * slot + 1);
            slots |= bit << slot;
        }
        slots
    }

    #[test]
    fn subframe_layout() {
        let slots = subframe(-2, true);

        assert_eq!((slots >> 12) & 0xFFFF, 0xFFFE);
        assert_eq!((slots >> 4) & 0xFF, 0);
        assert_eq!((slots >> 28) & 1, 0);
        assert_eq!((slots >> 30) & 1, 1);
        assert_eq!(slots.count_ones() % 2, 0);

        let slots = subframe(1, false);
        assert_eq!(slots >> 31, 1);
    }

    #[test]
    fn preambles() {
        for (preamble, pattern) in [
            (Preamble::B, [1, 1, 1, 0, 1, 0, 0, 0]),
            (Preamble::M, [1, 1, 1, 0, 0, 0, 1, 0]),
            (Preamble::W, [1, 1, 1, 0, 0, 1, 0, 0]),
        ] {
            let words = biphase_mark(preamble, subframe(0, false));
            for (index, level) in pattern.iter().enumerate() {
                assert_eq!(cell(&words, index), *level);
            }
        }
    }

    #[test]
    fn biphase_mark_coding() {
        for sample in [0, 1, -1, 0x1234, i16::MIN, i16::MAX] {
            let slots = subframe(sample, sample < 0);
            let words = biphase_mark(Preamble::M, slots);

            // A transition at every slot boundary
            let mut previous = cell(&words, 7);
            for slot in 4..32 {
                assert_ne!(cell(&words, 2 * slot), previous);
                previous = cell(&words, 2 * slot + 1);
            }

            // Ends low, so the next preamble can follow without inversion.
            assert_eq!(cell(&words, 63), 0);
            assert_eq!(decode(&words), slots & !0xF);
        }
    }

    #[test]
    fn channel_status_rate_codes() {
        assert_eq!(channel_status(SampleRate::Hz44100)[3], 0);
        assert_eq!(channel_status(SampleRate::Hz48000)[3], 2);
        assert_eq!(channel_status(SampleRate::Hz96000)[3], 10);
    }

    #[test]
    fn block_structure() {
        let mut encoder = SpdifEncoder::new(SampleRate::Hz96000);
        let mut status = [0u8; BLOCK_FRAMES / 8];

        for frame in 0..BLOCK_FRAMES + 1 {
            let words = encoder.encode_frame(100, -100);
            let left = [words[0], words[1]];
            let right = [words[2], words[3]];

            let expected = if frame % BLOCK_FRAMES == 0 { Preamble::B } else { Preamble::M };
            assert_eq!(left[0] & 0xFF, biphase_mark(expected, 0)[0] & 0xFF);
            assert_eq!(right[0] & 0xFF, biphase_mark(Preamble::W, 0)[0] & 0xFF);

            let left_slots = decode(&left);
            let right_slots = decode(&right);
            assert_eq!((left_slots >> 12) & 0xFFFF, 100);
            assert_eq!((right_slots >> 12) & 0xFFFF, (-100i16) as u16 as u32);
            assert_eq!((left_slots >> 30) & 1, (right_slots >> 30) & 1);

            if frame < BLOCK_FRAMES {
                status[frame / 8] |= (((left_slots >> 30) & 1) as u8) << (frame % 8);
            }
        }

        assert_eq!(status, channel_status(SampleRate::Hz96000));
        assert_eq!(encoder.frame(), 1);
    }

    #[test]
    fn encode_stops_at_shorter_side() {
        let mut encoder = SpdifEncoder::new(SampleRate::Hz48000);
        let mut words = [0u32; 3 * WORDS_PER_FRAME];

        assert_eq!(encoder.encode(&[1, 2, 3, 4, 5, 6, 7, 8], &mut words), 3);
        assert_eq!(encoder.encode(&[1, 2], &mut words), 1);
        assert_eq!(encoder.frame(), 4);

        encoder.set_rate(SampleRate::Hz44100);
        assert_eq!(encoder.frame(), 0);
    }
}
