//! Multi-band graphic equalizer with fixed-point peaking filters.
//!
//! All bands share one sample rate. Any change of gain, sample rate or enabled state recomputes every band and
//! clears all filter memory before the next block is filtered.
mod design;
mod stage;

pub use design::{design_peaking_band, peaking_coefficients, try_design_peaking_band};
pub use stage::{
    from_working, process, to_working, BiquadStage, BiquadState, ChannelSelect, COEFFICIENT_SHIFT, POST_SHIFT,
    WORKING_SHIFT,
};

use crate::{
    Error, SampleRate, BAND_CENTERS_HZ, BAND_COUNT, BAND_Q, BUFFER_FRAMES, CHANNEL_COUNT, MAX_BAND_GAIN_DB,
    MIN_BAND_GAIN_DB,
};

/// Change requests for the equalizer, e.g. queued by the user interface on the other core.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EqCommand {
    SetBandGain { band: usize, gain_db: f32 },
    SetSampleRate(SampleRate),
    SetEnabled(bool),
}

/// The chain of band filters for one audio channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cascade {
    stages: [BiquadStage; BAND_COUNT],
    states: [BiquadState; BAND_COUNT],
}

impl Default for Cascade {
    fn default() -> Self {
        Self::new()
    }
}

impl Cascade {
    pub const fn new() -> Self {
        Self {
            stages: [BiquadStage::IDENTITY; BAND_COUNT],
            states: [BiquadState::new(); BAND_COUNT],
        }
    }

    /// Install new coefficients, and clear the filter memory.
    pub fn configure(&mut self, stages: &[BiquadStage; BAND_COUNT]) {
        self.stages = *stages;
        self.reset();
    }

    pub fn reset(&mut self) {
        for state in self.states.iter_mut() {
            state.reset();
        }
    }

    pub fn stages(&self) -> &[BiquadStage; BAND_COUNT] {
        &self.stages
    }

    pub fn states(&self) -> &[BiquadState; BAND_COUNT] {
        &self.states
    }

    /// Filter the selected channel of a block in place, band after band.
    ///
    /// Blocks longer than [`BUFFER_FRAMES`] frames are filtered in pieces of that size.
    pub fn process(&mut self, samples: &mut [i16], channel: ChannelSelect) {
        let (offset, stride) = channel.layout();
        let mut work = [0i32; BUFFER_FRAMES];
        let mut start = offset;

        while start < samples.len() {
            let piece = &mut samples[start..];

            let mut count = 0;
            for (w, sample) in work.iter_mut().zip(piece.iter().step_by(stride)) {
                *w = to_working(*sample);
                count += 1;
            }

            for (stage, state) in self.stages.iter().zip(self.states.iter_mut()) {
                process(&mut work[..count], stage, state, ChannelSelect::Contiguous);
            }

            for (sample, w) in piece.iter_mut().step_by(stride).zip(work[..count].iter()) {
                *sample = from_working(*w);
            }

            start += count * stride;
        }
    }
}

pub struct EqualizerBank {
    gains_db: [f32; BAND_COUNT],
    sample_rate: SampleRate,
    enabled: bool,
    generation: u32,
    channels: [Cascade; CHANNEL_COUNT],
}

impl EqualizerBank {
    /// Create a flat, enabled equalizer.
    pub fn new(sample_rate: SampleRate) -> Self {
        let mut bank = Self {
            gains_db: [0.0; BAND_COUNT],
            sample_rate,
            enabled: true,
            generation: 0,
            channels: [Cascade::new(); CHANNEL_COUNT],
        };
        bank.recompute();
        bank
    }

    /// Create an equalizer with stored band gains.
    pub fn with_gains(sample_rate: SampleRate, gains_db: &[f32; BAND_COUNT]) -> Result<Self, Error> {
        let mut bank = Self::new(sample_rate);

        for gain_db in gains_db {
            check_gain(*gain_db)?;
        }

        bank.gains_db = *gains_db;
        bank.recompute();
        Ok(bank)
    }

    fn recompute(&mut self) {
        let fs = self.sample_rate.hz() as f64;
        let mut stages = [BiquadStage::IDENTITY; BAND_COUNT];

        for ((stage, center_hz), gain_db) in stages.iter_mut().zip(BAND_CENTERS_HZ).zip(self.gains_db) {
            *stage = design_peaking_band(BAND_Q, gain_db as f64, center_hz, fs);
        }

        for channel in self.channels.iter_mut() {
            channel.configure(&stages);
        }
        self.generation = self.generation.wrapping_add(1);

        // Coefficients must be visible to the other core before it filters the next block.
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);

        debug!("Equalizer recomputed for {} Hz.", self.sample_rate.hz());
    }

    /// Set the gain of one band.
    ///
    /// Fails with [`Error::InvalidParameter`] for an unknown band, or a gain outside +-20 dB, keeping the previous
    /// settings.
    pub fn set_band_gain(&mut self, band: usize, gain_db: f32) -> Result<(), Error> {
        if band >= BAND_COUNT {
            return Err(Error::InvalidParameter);
        }
        check_gain(gain_db)?;

        self.gains_db[band] = gain_db;
        self.recompute();
        Ok(())
    }

    pub fn band_gain(&self, band: usize) -> Option<f32> {
        self.gains_db.get(band).copied()
    }

    pub fn gains(&self) -> &[f32; BAND_COUNT] {
        &self.gains_db
    }

    pub fn set_sample_rate(&mut self, sample_rate: SampleRate) {
        self.sample_rate = sample_rate;
        self.recompute();
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Enable or bypass the equalizer. Filter memory is cleared either way.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.recompute();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn apply(&mut self, command: EqCommand) -> Result<(), Error> {
        match command {
            EqCommand::SetBandGain { band, gain_db } => self.set_band_gain(band, gain_db),
            EqCommand::SetSampleRate(sample_rate) => {
                self.set_sample_rate(sample_rate);
                Ok(())
            }
            EqCommand::SetEnabled(enabled) => {
                self.set_enabled(enabled);
                Ok(())
            }
        }
    }

    /// Counts recomputes. A cascade taken out before the last change is stale.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn channel(&self, index: usize) -> &Cascade {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut Cascade {
        &mut self.channels[index]
    }

    /// Swap out the cascade of one channel, e.g. for processing on another core.
    pub fn replace_channel(&mut self, index: usize, cascade: Cascade) -> Cascade {
        core::mem::replace(&mut self.channels[index], cascade)
    }

    /// Filter an interleaved stereo block in place, both channels on this core.
    ///
    /// Passes the block through untouched while bypassed.
    pub fn process(&mut self, samples: &mut [i16]) {
        if !self.enabled {
            return;
        }

        self.channels[0].process(samples, ChannelSelect::Left);
        self.channels[1].process(samples, ChannelSelect::Right);
    }
}

fn check_gain(gain_db: f32) -> Result<(), Error> {
    let gain_db = gain_db as f64;

    if !gain_db.is_finite() || !(MIN_BAND_GAIN_DB..=MAX_BAND_GAIN_DB).contains(&gain_db) {
        return Err(Error::InvalidParameter);
    }

    Ok(())
}

/// Source of rotary encoder movement, e.g. a PIO quadrature decoder.
pub trait EncoderInput {
    /// Detents turned since the last call. Positive is clockwise.
    fn take_delta(&mut self) -> i32;
}

/// Edits band gains in steps of 1 dB per encoder detent.
pub struct BandEditor {
    band: usize,
    gains_db: [f32; BAND_COUNT],
}

impl BandEditor {
    pub fn new(gains_db: &[f32; BAND_COUNT]) -> Self {
        Self {
            band: 0,
            gains_db: *gains_db,
        }
    }

    pub fn band(&self) -> usize {
        self.band
    }

    pub fn select_band(&mut self, band: usize) -> Result<(), Error> {
        if band >= BAND_COUNT {
            return Err(Error::InvalidParameter);
        }

        self.band = band;
        Ok(())
    }

    /// Turn encoder movement into a gain change for the selected band.
    ///
    /// Returns `None`, if the gain does not change (no movement, or already at the limit).
    pub fn turn(&mut self, detents: i32) -> Option<EqCommand> {
        let current = self.gains_db[self.band];
        let target = (current as f64 + detents as f64).clamp(MIN_BAND_GAIN_DB, MAX_BAND_GAIN_DB) as f32;

        if target == current {
            return None;
        }

        self.gains_db[self.band] = target;
        Some(EqCommand::SetBandGain {
            band: self.band,
            gain_db: target,
        })
    }

    /// Read the encoder, and turn its movement into a gain change.
    pub fn poll(&mut self, encoder: &mut impl EncoderInput) -> Option<EqCommand> {
        let detents = encoder.take_delta();
        self.turn(detents)
    }
}
