#![no_std]

// Must come first, so that the logging macros are visible to all other modules.
#[macro_use]
mod fmt;

pub mod clock;
pub mod eq;
pub mod error;
pub mod feedback;
pub mod fixed;
pub mod pool;
pub mod spdif;
pub mod splitter;
pub mod stream;
pub mod uac1;

pub use error::Error;

use static_assertions::const_assert;

// Interleaved stereo input, 16 bit per sample.
pub const CHANNEL_COUNT: usize = 2;
pub const SAMPLE_SIZE: usize = core::mem::size_of::<i16>();
pub const FRAME_SIZE: usize = CHANNEL_COUNT * SAMPLE_SIZE;

pub const SUPPORTED_SAMPLE_RATES_HZ: [u32; 3] = [44_100, 48_000, 96_000];

// Pool geometry: eight blocks of 192 stereo frames (one S/PDIF channel-status block each).
pub const BUFFER_COUNT: usize = 8;
pub const BUFFER_FRAMES: usize = 192;

// The largest nominal packet at 96 kHz, plus one frame of feedback slack.
pub const MAX_PACKET_FRAMES: usize = SampleRate::Hz96000.max_packet_size() / FRAME_SIZE + 1;
pub const MAX_PACKET_SIZE: usize = MAX_PACKET_FRAMES * FRAME_SIZE;

// Equalizer layout
pub const BAND_COUNT: usize = 8;
pub const BAND_CENTERS_HZ: [f64; BAND_COUNT] = [64.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0];
pub const BAND_Q: f64 = 0.707;
pub const MAX_BAND_GAIN_DB: f64 = 20.0;
pub const MIN_BAND_GAIN_DB: f64 = -20.0;

// Volume settings go from -91 dB to 0 dB, in steps of 1 dB.
// The values are 8q8 numbers in units of dB.
pub const VOLUME_STEPS_PER_DB: i16 = 256;
pub const MIN_VOLUME_DB: i16 = -91;
pub const MAX_VOLUME_DB: i16 = 0;
pub const VOLUME_INDEX_COUNT: u8 = 91;

// Sliding window of per-SOF measurements for the feedback value.
pub const FEEDBACK_WINDOW: usize = 50;

const_assert!(MAX_PACKET_FRAMES <= BUFFER_FRAMES);
const_assert!(BUFFER_COUNT.is_power_of_two());

/// A sample rate that the device can run at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleRate {
    #[default]
    Hz44100,
    Hz48000,
    Hz96000,
}

impl SampleRate {
    /// Look up a supported rate.
    pub const fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            44_100 => Some(SampleRate::Hz44100),
            48_000 => Some(SampleRate::Hz48000),
            96_000 => Some(SampleRate::Hz96000),
            _ => None,
        }
    }

    /// Look up a supported rate, falling back to 44.1 kHz for anything else.
    pub fn from_hz_or_default(hz: u32) -> Self {
        match Self::from_hz(hz) {
            Some(rate) => rate,
            None => {
                warn!("Unsupported sample rate {} Hz, using 44100 Hz.", hz);
                SampleRate::default()
            }
        }
    }

    pub const fn hz(self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44_100,
            SampleRate::Hz48000 => 48_000,
            SampleRate::Hz96000 => 96_000,
        }
    }

    /// Maximum isochronous packet size in bytes, for one 1 ms USB frame.
    pub const fn max_packet_size(self) -> usize {
        ((self.hz() as usize + 999) / 1000) * FRAME_SIZE
    }

    /// Nominal samples per USB frame, in 10.14 format.
    pub const fn nominal_feedback(self) -> u32 {
        (self.hz() << 14) / 1000
    }
}

/// Volume and mute, as forwarded to the amplifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VolumeSetting {
    pub muted: bool,
    /// Volume in 8.8 format (in dB).
    pub volume_8q8_db: i16,
}

impl Default for VolumeSetting {
    fn default() -> Self {
        VolumeSetting {
            muted: false,
            volume_8q8_db: MAX_VOLUME_DB * VOLUME_STEPS_PER_DB,
        }
    }
}

impl VolumeSetting {
    /// Attenuation step from 0 (-91 dB) to 90 (-1 dB and above).
    pub fn index(&self) -> u8 {
        let shifted = self.volume_8q8_db as i32 + VOLUME_INDEX_COUNT as i32 * VOLUME_STEPS_PER_DB as i32;
        (shifted >> 8).clamp(0, VOLUME_INDEX_COUNT as i32 - 1) as u8
    }
}
