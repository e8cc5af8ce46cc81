//! System clock selection, and the stop-reconfigure-restart sequence for sample rate changes.
//!
//! The S/PDIF output is clocked from the system clock by an integer-plus-fraction divider, so the system clock must
//! be close to a multiple of the sample rate family. 44.1 kHz runs at 176.57 MHz, 48 kHz and 96 kHz at 192 MHz.
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::eq::EqualizerBank;
use crate::feedback::FeedbackEstimator;
use crate::pool::BufferPool;
use crate::{Error, SampleRate};

/// Line cells per stereo frame of the S/PDIF output (two subframes of 32 biphase-mark coded slots).
pub const CELLS_PER_FRAME: u32 = 128;

/// System PLL settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PllConfig {
    pub vco_hz: u32,
    pub post_div1: u8,
    pub post_div2: u8,
}

impl PllConfig {
    /// 176.57 MHz, the closest PLL frequency to 4000 times 44.1 kHz.
    pub const SYS_176MHZ: Self = Self {
        vco_hz: 1_236_000_000,
        post_div1: 7,
        post_div2: 1,
    };

    /// 192 MHz, for 48 kHz and 96 kHz.
    pub const SYS_192MHZ: Self = Self {
        vco_hz: 1_536_000_000,
        post_div1: 4,
        post_div2: 2,
    };

    pub const fn for_rate(rate: SampleRate) -> Self {
        match rate {
            SampleRate::Hz44100 => Self::SYS_176MHZ,
            SampleRate::Hz48000 | SampleRate::Hz96000 => Self::SYS_192MHZ,
        }
    }

    pub const fn sys_hz(&self) -> u32 {
        self.vco_hz / (self.post_div1 as u32 * self.post_div2 as u32)
    }

    /// The PLL feedback divider for a reference clock, with a reference divider of one.
    pub const fn feedback_divider(&self, reference_hz: u32) -> u16 {
        (self.vco_hz / reference_hz) as u16
    }

    /// Clock divider of the S/PDIF shifter in 24.8 format, rounded up.
    ///
    /// Rounding up keeps the output at or just below the nominal rate.
    pub const fn spdif_clock_divider(&self, rate: SampleRate) -> u32 {
        let cell_hz = rate.hz() as u64 * CELLS_PER_FRAME as u64;
        let scaled = (self.sys_hz() as u64) << 8;

        scaled.div_ceil(cell_hz) as u32
    }
}

/// Access to the system PLL.
pub trait SystemClock {
    /// Switch the system clock to the PLL settings.
    fn set_sys_pll(&mut self, config: &PllConfig) -> Result<(), Error>;
}

pub struct ClockReconfigurator<C: SystemClock> {
    clock: C,
    current: Option<PllConfig>,
}

impl<C: SystemClock> ClockReconfigurator<C> {
    /// Create a reconfigurator. `current` is the PLL setting at boot, if known.
    pub fn new(clock: C, current: Option<PllConfig>) -> Self {
        Self { clock, current }
    }

    pub fn current(&self) -> Option<PllConfig> {
        self.current
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Run the sample rate change sequence, before the next packet is processed.
    ///
    /// Drops all queued audio, moves the system clock to the rate family (if it changed), retunes the equalizer and
    /// restarts the feedback measurement. Returns the active PLL settings.
    pub fn reconfigure<M: RawMutex, const N: usize>(
        &mut self,
        rate: SampleRate,
        pool: &BufferPool<'_, M, N>,
        bank: &mut EqualizerBank,
        feedback: &mut FeedbackEstimator,
    ) -> Result<PllConfig, Error> {
        let flushed = pool.flush();
        debug!("Flushed {} buffers.", flushed);

        let config = PllConfig::for_rate(rate);

        if self.current != Some(config) {
            self.clock.set_sys_pll(&config)?;
            self.current = Some(config);
            info!("System clock now {} Hz.", config.sys_hz());
        }

        bank.set_sample_rate(rate);
        feedback.reset(rate);

        Ok(config)
    }
}
