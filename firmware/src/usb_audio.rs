use core::sync::atomic::Ordering;

use audio::splitter::{DualCoreEqSplitter, EqStage};
use audio::stream::StreamEngine;
use audio::uac1::{ControlChanged, Feedback, Stream};
use defmt::{info, panic, warn};
use embassy_futures::join::join4;
use embassy_rp::{pac, peripherals, usb};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_usb::driver::EndpointError;

use crate::clock::Rp2040Clock;
use crate::*;

pub type UsbDriver = usb::Driver<'static, peripherals::USB>;
pub type Engine = StreamEngine<'static, 'static, DualCoreEqSplitter<'static>, Rp2040Clock, VolumeForwarder>;
pub type EngineMutex = Mutex<NoopRawMutex, Engine>;

struct Disconnected {}

impl From<EndpointError> for Disconnected {
    fn from(val: EndpointError) -> Self {
        match val {
            EndpointError::BufferOverflow => panic!("Buffer overflow"),
            EndpointError::Disabled => Disconnected {},
        }
    }
}

/// Current USB frame number, from the last start-of-frame.
fn frame_number() -> u16 {
    pac::USBCTRL_REGS.sof_rd().read().count()
}

async fn feedback_handler(feedback: &mut Feedback<'static, UsbDriver>, engine: &EngineMutex) -> Result<(), Disconnected> {
    loop {
        let packet = {
            let mut engine = engine.lock().await;
            engine.on_sof(frame_number(), OUTPUT_FRAMES.load(Ordering::Relaxed));
            engine.feedback_packet()
        };

        // Completes when the host polls the endpoint, once per refresh period.
        feedback.write_packet(&packet).await?;
    }
}

async fn stream_handler(stream: &mut Stream<'static, UsbDriver>, engine: &EngineMutex) -> Result<(), Disconnected> {
    let mut usb_data = [0u8; USB_PACKET_SIZE];

    loop {
        let data_size = stream.read_packet(&mut usb_data).await?;
        let mut engine = engine.lock().await;

        // Equalizer edits from the control core apply between packets.
        while let Ok(command) = EQ_COMMANDS.try_receive() {
            if let Err(e) = engine.eq().bank().apply(command) {
                warn!("Rejected equalizer command: {}", e);
            }
        }

        engine.on_packet(&usb_data[..data_size]).await;
    }
}

async fn control_handler(control_changed: &ControlChanged<'static>, engine: &EngineMutex) {
    loop {
        control_changed.control_changed().await;
        let settings = control_changed.settings();

        let mut engine = engine.lock().await;
        if let Some(pll) = engine.handle_control(settings) {
            OUTPUT_RATE_SIGNAL.signal((settings.sample_rate, pll));
        }

        info!("Engine state: {}", engine.state());
    }
}

/// Runs handlers for USB communication.
#[embassy_executor::task]
pub async fn usb_audio_task(
    mut stream: Stream<'static, UsbDriver>,
    mut feedback: Feedback<'static, UsbDriver>,
    control_changed: ControlChanged<'static>,
    mut usb_device: embassy_usb::UsbDevice<'static, UsbDriver>,
    engine: &'static EngineMutex,
) {
    let feedback_fut = async {
        loop {
            feedback.wait_connection().await;
            _ = feedback_handler(&mut feedback, engine).await;
        }
    };

    let stream_fut = async {
        loop {
            stream.wait_connection().await;

            info!("Stream connected");
            _ = stream_handler(&mut stream, engine).await;
            info!("Stream disconnected, stats: {}", engine.lock().await.stats());
        }
    };

    let control_fut = control_handler(&control_changed, engine);

    let usb_fut = async {
        loop {
            usb_device.run_until_suspend().await;
            info!("USB suspended");
            usb_device.wait_resume().await;
        }
    };
    info!("Launch USB task.");

    // Run everything concurrently.
    join4(usb_fut, feedback_fut, stream_fut, control_fut).await;
}
