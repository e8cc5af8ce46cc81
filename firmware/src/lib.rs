#![no_std]

pub mod clock;
pub mod encoder;
pub mod spdif_output;
pub mod usb_audio;

use core::sync::atomic::AtomicU32;

use audio::clock::PllConfig;
use audio::eq::EqCommand;
use audio::splitter::CoreLink;
use audio::stream::VolumeSink;
use audio::uac1::FeedbackRefreshPeriod;
use audio::{SampleRate, VolumeSetting};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

// Crystal oscillator, the reference of both PLLs.
pub const XOSC_HZ: u32 = 12_000_000;

// Room for the largest packet at 96 kHz, with feedback slack.
pub const USB_PACKET_SIZE: usize = audio::MAX_PACKET_SIZE;

// Full-speed feedback every 4 ms.
pub const FEEDBACK_REFRESH_PERIOD: FeedbackRefreshPeriod = FeedbackRefreshPeriod::Period4ms;

// Capacity of the queue between the encoder control and the USB task.
pub const EQ_COMMAND_DEPTH: usize = 4;

// Frames sent to the S/PDIF line since boot. Written by the output task only.
pub static OUTPUT_FRAMES: AtomicU32 = AtomicU32::new(0);

// Signals and channels for task communication
pub static VOLUME_SIGNAL: Signal<CriticalSectionRawMutex, VolumeSetting> = Signal::new();
pub static OUTPUT_RATE_SIGNAL: Signal<CriticalSectionRawMutex, (SampleRate, PllConfig)> = Signal::new();
pub static EQ_COMMANDS: Channel<CriticalSectionRawMutex, EqCommand, EQ_COMMAND_DEPTH> = Channel::new();

// Job exchange between the USB task (core 0) and the right channel equalizer (core 1).
pub static CORE_LINK: CoreLink = CoreLink::new();

/// Forwards host volume changes to the control core.
pub struct VolumeForwarder;

impl VolumeSink for VolumeForwarder {
    fn set_volume(&mut self, volume: VolumeSetting) {
        VOLUME_SIGNAL.signal(volume);
    }
}
