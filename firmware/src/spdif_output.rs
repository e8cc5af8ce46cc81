//! S/PDIF line output through a PIO state machine.
//!
//! The state machine shifts out one biphase-mark cell per cycle, so its clock divider sets the sample rate. Encoded
//! words are fed by DMA from two buffers in turn: one is on its way to the FIFO, while the other is being encoded
//! from the next pool buffer.
use core::mem;
use core::sync::atomic::Ordering;

use audio::clock::PllConfig;
use audio::pool::AudioBufferPool;
use audio::spdif::{SpdifEncoder, WORDS_PER_FRAME};
use audio::{SampleRate, BUFFER_FRAMES, CHANNEL_COUNT};
use defmt::{debug, info};
use embassy_rp::dma::{AnyChannel, Channel, Transfer};
use embassy_rp::peripherals::PIO0;
use embassy_rp::pio::{
    Common, Config, Direction, FifoJoin, Instance, PioPin, ShiftConfig, ShiftDirection, StateMachine,
};
use embassy_rp::{into_ref, Peripheral, PeripheralRef};
use fixed::types::U24F8;

use crate::{OUTPUT_FRAMES, OUTPUT_RATE_SIGNAL};

/// Words in one output buffer, a full pool buffer worth of frames.
pub const OUTPUT_BUFFER_WORDS: usize = BUFFER_FRAMES * WORDS_PER_FRAME;

// Silence sent when no audio is queued, about 0.7 ms at 48 kHz.
const UNDERRUN_FRAMES: usize = 32;
const SILENCE: [i16; UNDERRUN_FRAMES * CHANNEL_COUNT] = [0; UNDERRUN_FRAMES * CHANNEL_COUNT];

pub struct SpdifOutput<'d, P: Instance, const S: usize> {
    sm: StateMachine<'d, P, S>,
    config: Config<'d, P>,
    dma: PeripheralRef<'d, AnyChannel>,
}

impl<'d, P: Instance, const S: usize> SpdifOutput<'d, P, S> {
    pub fn new(
        common: &mut Common<'d, P>,
        mut sm: StateMachine<'d, P, S>,
        dma: impl Peripheral<P = impl Channel> + 'd,
        pin: impl Peripheral<P = impl PioPin + 'd> + 'd,
        rate: SampleRate,
        pll: &PllConfig,
    ) -> Self {
        into_ref!(dma);

        let program = pio_proc::pio_asm!(".wrap_target", "out pins, 1", ".wrap");
        let pin = common.make_pio_pin(pin);

        let mut config = Config::default();
        config.use_program(&common.load_program(&program.program), &[]);
        config.set_out_pins(&[&pin]);
        config.clock_divider = U24F8::from_bits(pll.spdif_clock_divider(rate));
        config.shift_out = ShiftConfig {
            auto_fill: true,
            threshold: 32,
            direction: ShiftDirection::Right,
        };
        config.fifo_join = FifoJoin::TxOnly;

        sm.set_config(&config);
        sm.set_pin_dirs(Direction::Out, &[&pin]);
        sm.set_enable(true);

        Self {
            sm,
            config,
            dma: dma.map_into(),
        }
    }

    /// Set the cell clock for a sample rate, at the given system clock.
    pub fn retune(&mut self, rate: SampleRate, pll: &PllConfig) {
        self.config.clock_divider = U24F8::from_bits(pll.spdif_clock_divider(rate));

        self.sm.set_enable(false);
        self.sm.set_config(&self.config);
        self.sm.set_enable(true);

        info!("S/PDIF output at {} Hz, divider {}.", rate.hz(), self.config.clock_divider.to_bits());
    }

    /// Start feeding words to the line.
    pub fn push<'a>(&'a mut self, words: &'a [u32]) -> Transfer<'a, AnyChannel> {
        self.sm.tx().dma_push(self.dma.reborrow(), words)
    }
}

/// Encode the next queued buffer, or a short run of silence. Returns the number of frames.
fn fill(
    pool: &AudioBufferPool<'_>,
    encoder: &mut SpdifEncoder,
    words: &mut [u32],
    starved: &mut bool,
) -> usize {
    if let Some(buffer) = pool.try_acquire() {
        let frames = encoder.encode(buffer.samples(), words);
        pool.release(buffer);

        if frames > 0 {
            *starved = false;
            return frames;
        }
    }

    if !*starved {
        debug!("Output underrun.");
        *starved = true;
    }

    encoder.encode(&SILENCE, words)
}

/// Runs the S/PDIF output, forever.
#[embassy_executor::task]
pub async fn spdif_output_task(
    mut output: SpdifOutput<'static, PIO0, 0>,
    pool: &'static AudioBufferPool<'static>,
    buffers: &'static mut [u32; 2 * OUTPUT_BUFFER_WORDS],
    rate: SampleRate,
) {
    let mut encoder = SpdifEncoder::new(rate);
    let mut starved = false;

    let (mut front, mut back) = buffers.split_at_mut(OUTPUT_BUFFER_WORDS);
    let mut front_frames = fill(pool, &mut encoder, front, &mut starved);

    info!("Launch S/PDIF output task.");

    loop {
        let transfer = output.push(&front[..front_frames * WORDS_PER_FRAME]);
        let back_frames = fill(pool, &mut encoder, back, &mut starved);
        transfer.await;

        let sent = OUTPUT_FRAMES.load(Ordering::Relaxed).wrapping_add(front_frames as u32);
        OUTPUT_FRAMES.store(sent, Ordering::Relaxed);

        if let Some((rate, pll)) = OUTPUT_RATE_SIGNAL.try_take() {
            output.retune(rate, &pll);
            encoder.set_rate(rate);
        }

        mem::swap(&mut front, &mut back);
        front_frames = back_frames;
    }
}
