#![no_std]
#![no_main]

use audio::clock::{ClockReconfigurator, PllConfig};
use audio::eq::{BandEditor, EqualizerBank};
use audio::pool::{AudioBlock, AudioBufferPool};
use audio::splitter::{DualCoreEqSplitter, EqWorker};
use audio::stream::StreamEngine;
use audio::uac1;
use audio::{SampleRate, BAND_COUNT, BUFFER_COUNT};
use defmt::{info, unwrap, warn};
use embassy_executor::Executor;
use embassy_futures::select::{select3, Either3};
use embassy_rp::gpio::{Input, Pull};
use embassy_rp::multicore::{spawn_core1, Stack};
use embassy_rp::pio::{self, Pio};
use embassy_rp::{bind_interrupts, peripherals, usb};
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Ticker};
use spdif_dac_fw::clock::{boot_config, Rp2040Clock};
use spdif_dac_fw::encoder::QuadratureEncoder;
use spdif_dac_fw::spdif_output::{spdif_output_task, SpdifOutput, OUTPUT_BUFFER_WORDS};
use spdif_dac_fw::usb_audio::{usb_audio_task, EngineMutex};
use spdif_dac_fw::*;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => usb::InterruptHandler<peripherals::USB>;
    PIO0_IRQ_0 => pio::InterruptHandler<peripherals::PIO0>;
});

// Encoder polls per detent check.
const ENCODER_POLL_INTERVAL: Duration = Duration::from_millis(1);
const ENCODER_POLLS_PER_UPDATE: u32 = 20;

static mut CORE1_STACK: Stack<8192> = Stack::new();
static EXECUTOR0: StaticCell<Executor> = StaticCell::new();
static EXECUTOR1: StaticCell<Executor> = StaticCell::new();

/// Filters the right channel of every block.
#[embassy_executor::task]
async fn eq_worker_task() {
    info!("Launch equalizer worker.");
    EqWorker::new(&CORE_LINK).run().await
}

/// Reads the encoder and the band button, and reports volume changes.
#[embassy_executor::task]
async fn control_task(mut encoder: QuadratureEncoder<'static>, mut button: Input<'static>) {
    let mut editor = BandEditor::new(&[0.0; BAND_COUNT]);
    let mut ticker = Ticker::every(ENCODER_POLL_INTERVAL);
    let mut polls = 0;

    loop {
        match select3(ticker.next(), button.wait_for_falling_edge(), VOLUME_SIGNAL.wait()).await {
            Either3::First(_) => {
                encoder.sample();
                polls += 1;

                if polls < ENCODER_POLLS_PER_UPDATE {
                    continue;
                }
                polls = 0;

                if let Some(command) = editor.poll(&mut encoder) {
                    if EQ_COMMANDS.try_send(command).is_err() {
                        warn!("Equalizer command queue full.");
                    }
                }
            }
            Either3::Second(_) => {
                let band = (editor.band() + 1) % BAND_COUNT;
                unwrap!(editor.select_band(band));
                info!("Editing band {}.", band);
            }
            Either3::Third(volume) => {
                info!("Volume index {}, muted: {}.", volume.index(), volume.muted);
            }
        }
    }
}

#[cortex_m_rt::entry]
fn main() -> ! {
    let rate = SampleRate::default();
    let pll = PllConfig::for_rate(rate);
    let p = embassy_rp::init(boot_config(rate, XOSC_HZ));

    info!("System clock at {} Hz.", pll.sys_hz());

    // Audio buffers
    static BLOCKS: StaticCell<[AudioBlock; BUFFER_COUNT]> = StaticCell::new();
    let blocks = BLOCKS.init_with(|| core::array::from_fn(|_| AudioBlock::new()));

    static POOL: StaticCell<AudioBufferPool<'static>> = StaticCell::new();
    let pool: &'static AudioBufferPool<'static> = POOL.init(AudioBufferPool::new(blocks));

    static OUTPUT_BUFFERS: StaticCell<[u32; 2 * OUTPUT_BUFFER_WORDS]> = StaticCell::new();
    let output_buffers = OUTPUT_BUFFERS.init([0; 2 * OUTPUT_BUFFER_WORDS]);

    // S/PDIF output
    let Pio { mut common, sm0, .. } = Pio::new(p.PIO0, Irqs);
    let output = SpdifOutput::new(&mut common, sm0, p.DMA_CH0, p.PIN_0, rate, &pll);

    // Stream engine
    let splitter = DualCoreEqSplitter::new(&CORE_LINK, EqualizerBank::new(rate));
    let clock = ClockReconfigurator::new(Rp2040Clock::new(XOSC_HZ), Some(pll));

    static ENGINE: StaticCell<EngineMutex> = StaticCell::new();
    let engine: &'static EngineMutex = ENGINE.init(Mutex::new(StreamEngine::new(pool, splitter, clock, VolumeForwarder)));

    // USB
    static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    let config_descriptor = CONFIG_DESCRIPTOR.init([0; 256]);

    static BOS_DESCRIPTOR: StaticCell<[u8; 16]> = StaticCell::new();
    let bos_descriptor = BOS_DESCRIPTOR.init([0; 16]);

    static CONTROL_BUF: StaticCell<[u8; 64]> = StaticCell::new();
    let control_buf = CONTROL_BUF.init([0; 64]);

    static STATE: StaticCell<uac1::State> = StaticCell::new();
    let state = STATE.init(uac1::State::new());

    let usb_driver = usb::Driver::new(p.USB, Irqs);

    // Basic USB device configuration
    let mut config = embassy_usb::Config::new(0x1209, 0xaf10);
    config.manufacturer = Some("spdif-dac");
    config.product = Some("USB S/PDIF DAC");
    config.self_powered = false;
    config.max_power = 100;

    // Required for windows compatibility.
    config.device_class = 0xEF;
    config.device_sub_class = 0x02;
    config.device_protocol = 0x01;
    config.composite_with_iads = true;

    let mut builder = embassy_usb::Builder::new(
        usb_driver,
        config,
        config_descriptor,
        bos_descriptor,
        &mut [], // no msos descriptors
        control_buf,
    );

    let class = uac1::Uac1::new(&mut builder, state, USB_PACKET_SIZE as u16, FEEDBACK_REFRESH_PERIOD);
    let (stream, feedback, control_changed) = class.split();
    let usb_device = builder.build();

    // Encoder and band button
    let encoder = QuadratureEncoder::new(Input::new(p.PIN_19, Pull::Up), Input::new(p.PIN_20, Pull::Up));
    let button = Input::new(p.PIN_21, Pull::Up);

    spawn_core1(
        p.CORE1,
        unsafe { &mut *core::ptr::addr_of_mut!(CORE1_STACK) },
        move || {
            let executor1 = EXECUTOR1.init(Executor::new());
            executor1.run(|spawner| {
                unwrap!(spawner.spawn(eq_worker_task()));
                unwrap!(spawner.spawn(control_task(encoder, button)));
            });
        },
    );

    let executor0 = EXECUTOR0.init(Executor::new());
    executor0.run(|spawner| {
        unwrap!(spawner.spawn(spdif_output_task(output, pool, output_buffers, rate)));
        unwrap!(spawner.spawn(usb_audio_task(stream, feedback, control_changed, usb_device, engine)));
    })
}
