//! USB Audio Class 1.0 speaker function, for the DAC.
//!
//! Implements "Universal Serial Bus Device Class Definition for Audio Devices", Release 1.0, for a single output
//! streaming interface: 16 bit stereo PCM at 44.1, 48 or 96 kHz, with asynchronous synchronization through a feedback
//! endpoint. Mute and volume are master controls of the feature unit.
use class_codes::*;
use core::cell::{Cell, RefCell};
use core::future::poll_fn;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;
use embassy_sync::blocking_mutex::CriticalSectionMutex;
use embassy_sync::waitqueue::WakerRegistration;
use embassy_usb::control::{self, InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::descriptor::{SynchronizationType, UsageType};
use embassy_usb::driver::{Driver, Endpoint, EndpointError, EndpointIn, EndpointOut, EndpointType};
use embassy_usb::types::InterfaceNumber;
use embassy_usb::{Builder, Handler};

use crate::{
    SampleRate, VolumeSetting, CHANNEL_COUNT, MAX_VOLUME_DB, MIN_VOLUME_DB, SAMPLE_SIZE, SUPPORTED_SAMPLE_RATES_HZ,
    VOLUME_STEPS_PER_DB,
};

mod class_codes;

mod terminal_type;
pub use terminal_type::TerminalType;

/// Arbitrary unique identifier for the input terminal
const INPUT_UNIT_ID: u8 = 0x01;

/// Arbitrary unique identifier for the feature unit
const FEATURE_UNIT_ID: u8 = 0x02;

/// Arbitrary unique identifier for the output terminal
const OUTPUT_UNIT_ID: u8 = 0x03;

/// The feature unit exposes its controls on the master channel only.
const MASTER_CHANNEL: u8 = 0;

/// Zero-bandwidth, and operational.
const ALTERNATE_SETTING_COUNT: u8 = 2;

/// Full-speed feedback packets hold a 10.14 value in three bytes.
const FEEDBACK_PACKET_SIZE: u16 = 3;

/// Internal state for the USB Audio Class
pub struct State<'a> {
    control: MaybeUninit<Control<'a>>,
    shared: SharedControl,
}

impl<'a> Default for State<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> State<'a> {
    pub fn new() -> Self {
        Self {
            control: MaybeUninit::uninit(),
            shared: SharedControl::default(),
        }
    }
}

/// Feedback bRefresh [UAC 3.7.2.2]
///
/// A new feedback value is available every 2^(10 - P) frames. The descriptor reports the exponent, from 1 (2 ms) to
/// 9 (512 ms).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedbackRefreshPeriod {
    Period2ms = 1,
    Period4ms = 2,
    Period8ms = 3,
    Period16ms = 4,
    Period32ms = 5,
    Period64ms = 6,
    Period128ms = 7,
    Period256ms = 8,
    Period512ms = 9,
}

impl FeedbackRefreshPeriod {
    /// USB frames between two feedback packets.
    pub const fn frames(self) -> u32 {
        1 << self as u8
    }
}

impl From<FeedbackRefreshPeriod> for u8 {
    fn from(p: FeedbackRefreshPeriod) -> u8 {
        p as u8
    }
}

/// Host-controlled settings of the function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlSettings {
    /// Master mute and volume.
    pub volume: VolumeSetting,
    /// The sampling frequency of the streaming endpoint.
    pub sample_rate: SampleRate,
    /// The alternate setting of the streaming interface. Zero is the zero-bandwidth setting.
    pub alternate_setting: u8,
}

pub struct Uac1<'d, D: Driver<'d>> {
    streaming_endpoint: D::EndpointOut,
    feedback_endpoint: D::EndpointIn,
    control: &'d SharedControl,
}

impl<'d, D: Driver<'d>> Uac1<'d, D> {
    /// Creates a new `Uac1` (USB audio class 1.0) speaker function.
    ///
    /// Use `split` afterwards, in order to obtain the usable `Stream`, `Feedback` and `ControlChanged` instances.
    ///
    /// # Arguments
    ///
    /// * `builder` - The builder for the class.
    /// * `state` - The internal state of the class.
    /// * `max_packet_size` - The maximum packet size per frame, for the highest sample rate.
    /// * `feedback_refresh_period` - The refresh period for the feedback value.
    pub fn new(
        builder: &mut Builder<'d, D>,
        state: &'d mut State<'d>,
        max_packet_size: u16,
        feedback_refresh_period: FeedbackRefreshPeriod,
    ) -> Self {
        let mut func = builder.function(AUDIO_FUNCTION, FUNCTION_SUBCLASS_UNDEFINED, PROTOCOL_NONE);

        // Audio control interface (mandatory) [UAC 4.3.1]
        let mut interface = func.interface();
        let control_interface = interface.interface_number();
        let streaming_interface = u8::from(control_interface) + 1;
        let mut alt = interface.alt_setting(USB_AUDIO_CLASS, USB_AUDIOCONTROL_SUBCLASS, PROTOCOL_NONE, None);

        // Terminal topology:
        // Input terminal (USB stream) -> Feature Unit (master mute and volume) -> Output terminal (S/PDIF)

        // =======================================
        // Input Terminal Descriptor [UAC 4.3.2.1]
        let terminal_type: u16 = TerminalType::UsbStreaming.into();
        let channel_config = LEFT_FRONT | RIGHT_FRONT;

        let input_terminal_descriptor = [
            INPUT_TERMINAL, // bDescriptorSubtype
            INPUT_UNIT_ID,  // bTerminalID
            terminal_type as u8,
            (terminal_type >> 8) as u8, // wTerminalType
            0x00,                       // bAssocTerminal (none)
            CHANNEL_COUNT as u8,        // bNrChannels
            channel_config as u8,
            (channel_config >> 8) as u8, // wChannelConfig
            0x00,                        // iChannelNames (none)
            0x00,                        // iTerminal (none)
        ];

        // ========================================
        // Output Terminal Descriptor [UAC 4.3.2.2]
        let terminal_type: u16 = TerminalType::OutSpeaker.into();
        let output_terminal_descriptor = [
            OUTPUT_TERMINAL, // bDescriptorSubtype
            OUTPUT_UNIT_ID,  // bTerminalID
            terminal_type as u8,
            (terminal_type >> 8) as u8, // wTerminalType
            0x00,                       // bAssocTerminal (none)
            FEATURE_UNIT_ID,            // bSourceID (the feature unit)
            0x00,                       // iTerminal (none)
        ];

        // =====================================
        // Feature Unit Descriptor [UAC 4.3.2.5]
        let feature_unit_descriptor = [
            FEATURE_UNIT,                 // bDescriptorSubtype (Feature Unit)
            FEATURE_UNIT_ID,              // bUnitID
            INPUT_UNIT_ID,                // bSourceID
            1,                            // bControlSize (one byte per control)
            MUTE_CONTROL | VOLUME_CONTROL, // bmaControls(0), master
            FU_CONTROL_UNDEFINED,         // bmaControls(1), left
            FU_CONTROL_UNDEFINED,         // bmaControls(2), right
            0x00,                         // iFeature (none)
        ];

        // ===============================================
        // Format descriptor [UAC Formats 2.2.5]
        // Used later, for the operational streaming interface
        const FORMAT_DESCRIPTOR_SIZE: usize = 6 + 3 * SUPPORTED_SAMPLE_RATES_HZ.len();
        let mut format_descriptor = [0u8; FORMAT_DESCRIPTOR_SIZE];
        format_descriptor[..6].copy_from_slice(&[
            FORMAT_TYPE,                           // bDescriptorSubtype
            FORMAT_TYPE_I,                         // bFormatType
            CHANNEL_COUNT as u8,                   // bNrChannels
            SAMPLE_SIZE as u8,                     // bSubframeSize (16 bit)
            8 * SAMPLE_SIZE as u8,                 // bBitResolution
            SUPPORTED_SAMPLE_RATES_HZ.len() as u8, // bSamFreqType (discrete)
        ]);

        for (sample_rate_hz, bytes) in SUPPORTED_SAMPLE_RATES_HZ
            .iter()
            .zip(format_descriptor[6..].chunks_exact_mut(3))
        {
            bytes.copy_from_slice(&sample_rate_hz.to_le_bytes()[..3]);
        }

        // ==================================================
        // Class-specific AC Interface Descriptor [UAC 4.3.2]
        // The total length covers the class-specific descriptors of the audio control interface.
        const DESCRIPTOR_HEADER_SIZE: usize = 2;
        const INTERFACE_DESCRIPTOR_SIZE: usize = 7;

        let total_descriptor_length = DESCRIPTOR_HEADER_SIZE + INTERFACE_DESCRIPTOR_SIZE
            + DESCRIPTOR_HEADER_SIZE + input_terminal_descriptor.len()
            + DESCRIPTOR_HEADER_SIZE + feature_unit_descriptor.len()
            + DESCRIPTOR_HEADER_SIZE + output_terminal_descriptor.len();

        let interface_descriptor: [u8; INTERFACE_DESCRIPTOR_SIZE] = [
            HEADER_SUBTYPE, // bDescriptorSubtype (Header)
            ADC_VERSION as u8,
            (ADC_VERSION >> 8) as u8, // bcdADC
            total_descriptor_length as u8,
            (total_descriptor_length >> 8) as u8, // wTotalLength
            0x01,                                 // bInCollection (1 streaming interface)
            streaming_interface,                  // baInterfaceNr
        ];

        alt.descriptor(CS_INTERFACE, &interface_descriptor);
        alt.descriptor(CS_INTERFACE, &input_terminal_descriptor);
        alt.descriptor(CS_INTERFACE, &feature_unit_descriptor);
        alt.descriptor(CS_INTERFACE, &output_terminal_descriptor);

        // =====================================================
        // Audio streaming interface, zero bandwidth [UAC 4.5.1]
        let mut interface = func.interface();
        let streaming_interface_number = interface.interface_number();
        let alt = interface.alt_setting(USB_AUDIO_CLASS, USB_AUDIOSTREAMING_SUBCLASS, PROTOCOL_NONE, None);
        drop(alt);

        // ==================================================
        // Audio streaming interface, operational [UAC 4.5.1]
        let mut alt = interface.alt_setting(USB_AUDIO_CLASS, USB_AUDIOSTREAMING_SUBCLASS, PROTOCOL_NONE, None);

        alt.descriptor(
            CS_INTERFACE,
            &[
                AS_GENERAL,    // bDescriptorSubtype
                INPUT_UNIT_ID, // bTerminalLink
                0x01,          // bDelay (one frame)
                PCM as u8,
                (PCM >> 8) as u8, // wFormatTag (PCM format)
            ],
        );

        alt.descriptor(CS_INTERFACE, &format_descriptor);

        let streaming_endpoint = alt.alloc_endpoint_out(EndpointType::Isochronous, max_packet_size, 1);
        let feedback_endpoint = alt.alloc_endpoint_in(EndpointType::Isochronous, FEEDBACK_PACKET_SIZE, 1);

        // Write the descriptor for the streaming endpoint, after knowing the address of the feedback endpoint.
        alt.endpoint_descriptor(
            streaming_endpoint.info(),
            SynchronizationType::Asynchronous,
            UsageType::DataEndpoint,
            &[
                0x00,                                 // bRefresh (0)
                feedback_endpoint.info().addr.into(), // bSynchAddress (the feedback endpoint)
            ],
        );

        alt.descriptor(
            CS_ENDPOINT,
            &[
                AS_GENERAL, // bDescriptorSubtype (General)
                0x01,       // bmAttributes - support sampling frequency adjustment
                0x02,       // bLockDelayUnits (PCM sample count)
                0x0000 as u8,
                (0x0000 >> 8) as u8, // wLockDelay (0)
            ],
        );

        // The feedback endpoint descriptor must follow the streaming endpoint descriptor.
        alt.endpoint_descriptor(
            feedback_endpoint.info(),
            SynchronizationType::NoSynchronization,
            UsageType::FeedbackEndpoint,
            &[
                feedback_refresh_period.into(), // bRefresh
                0x00,                           // bSynchAddress (none)
            ],
        );

        // Free up the builder.
        drop(func);
        let control = state.control.write(Control {
            shared: &state.shared,
            streaming_endpoint_address: streaming_endpoint.info().addr.into(),
            control_interface_number: control_interface,
            streaming_interface_number,
        });
        builder.handler(control);

        let control = &state.shared;

        Uac1 {
            streaming_endpoint,
            feedback_endpoint,
            control,
        }
    }

    /// Split the class into stream, feedback, and control
    ///
    /// Allows concurrent streaming, feedback, and watching for control changes.
    pub fn split(self) -> (Stream<'d, D>, Feedback<'d, D>, ControlChanged<'d>) {
        (
            Stream {
                streaming_endpoint: self.streaming_endpoint,
            },
            Feedback {
                feedback_endpoint: self.feedback_endpoint,
            },
            ControlChanged { control: self.control },
        )
    }
}

struct Control<'a> {
    control_interface_number: InterfaceNumber,
    streaming_interface_number: InterfaceNumber,
    streaming_endpoint_address: u8,
    shared: &'a SharedControl,
}

/// Shared data between Control and the Audio Class
struct SharedControl {
    settings: CriticalSectionMutex<Cell<ControlSettings>>,
    waker: RefCell<WakerRegistration>,
    changed: AtomicBool,
}

impl Default for SharedControl {
    fn default() -> Self {
        SharedControl {
            settings: CriticalSectionMutex::new(Cell::new(ControlSettings::default())),
            waker: RefCell::new(WakerRegistration::new()),
            changed: AtomicBool::new(false),
        }
    }
}

impl SharedControl {
    fn settings(&self) -> ControlSettings {
        self.settings.lock(|x| x.get())
    }

    async fn changed(&self) {
        poll_fn(|context| {
            if self.changed.load(Ordering::Relaxed) {
                self.changed.store(false, Ordering::Relaxed);
                Poll::Ready(())
            } else {
                self.waker.borrow_mut().register(context.waker());
                Poll::Pending
            }
        })
        .await;
    }
}

/// UAC1 stream for reading audio packets
///
/// You can obtain a `Stream` with [`Uac1::split`]
pub struct Stream<'d, D: Driver<'d>> {
    streaming_endpoint: D::EndpointOut,
}

impl<'d, D: Driver<'d>> Stream<'d, D> {
    /// Reads a single packet from the streaming endpoint
    pub async fn read_packet(&mut self, data: &mut [u8]) -> Result<usize, EndpointError> {
        self.streaming_endpoint.read(data).await
    }

    /// Waits for the USB host to enable this interface
    pub async fn wait_connection(&mut self) {
        self.streaming_endpoint.wait_enabled().await;
    }

    /// Gets the maximum packet size in bytes for the streaming endpoint
    pub fn max_packet_size(&self) -> u16 {
        self.streaming_endpoint.info().max_packet_size
    }
}

/// UAC1 feedback endpoint, for reporting the rate at which samples are consumed
///
/// You can obtain a `Feedback` with [`Uac1::split`]
pub struct Feedback<'d, D: Driver<'d>> {
    feedback_endpoint: D::EndpointIn,
}

impl<'d, D: Driver<'d>> Feedback<'d, D> {
    /// Writes a single feedback packet
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        self.feedback_endpoint.write(data).await
    }

    /// Waits for the USB host to enable this interface
    pub async fn wait_connection(&mut self) {
        self.feedback_endpoint.wait_enabled().await;
    }
}

/// UAC1 control status change monitor
///
/// You can obtain a `ControlChanged` with [`Uac1::split`]
pub struct ControlChanged<'d> {
    control: &'d SharedControl,
}

impl<'d> ControlChanged<'d> {
    /// Return the current host settings
    pub fn settings(&self) -> ControlSettings {
        self.control.settings()
    }

    /// Return a future for when the control settings change
    pub async fn control_changed(&self) {
        self.control.changed().await;
    }
}

impl<'a> Control<'a> {
    fn shared(&mut self) -> &'a SharedControl {
        self.shared
    }

    fn update(&mut self, f: impl FnOnce(&mut ControlSettings)) {
        let shared = self.shared();
        shared.settings.lock(|x| {
            let mut settings = x.get();
            f(&mut settings);
            x.set(settings);
        });

        shared.changed.store(true, Ordering::Relaxed);
        shared.waker.borrow_mut().wake();
    }

    fn interface_set_request(&mut self, req: control::Request, data: &[u8]) -> Option<OutResponse> {
        let interface_number = req.index as u8;
        let entity_index = (req.index >> 8) as u8;
        let channel_index = req.value as u8;
        let control_unit = (req.value >> 8) as u8;

        if interface_number != self.control_interface_number.into() {
            trace!("Unhandled interface set request for interface {}", interface_number);
            return None;
        }

        if entity_index != FEATURE_UNIT_ID {
            trace!("Unsupported interface set request for entity {}", entity_index);
            return Some(OutResponse::Rejected);
        }

        if req.request != SET_CUR || channel_index != MASTER_CHANNEL {
            trace!(
                "Unsupported interface set request {} for channel {}",
                req.request,
                channel_index
            );
            return Some(OutResponse::Rejected);
        }

        match control_unit {
            MUTE_CONTROL => {
                let &[mute] = data else {
                    return Some(OutResponse::Rejected);
                };

                let muted = mute != 0;
                self.update(|settings| settings.volume.muted = muted);
                trace!("Set mute state: {}", muted);
            }
            VOLUME_CONTROL => {
                let &[low, high] = data else {
                    return Some(OutResponse::Rejected);
                };

                // Out-of-range requests land on the nearest advertised limit.
                let volume = i16::from_le_bytes([low, high])
                    .clamp(MIN_VOLUME_DB * VOLUME_STEPS_PER_DB, MAX_VOLUME_DB * VOLUME_STEPS_PER_DB);
                self.update(|settings| settings.volume.volume_8q8_db = volume);
                trace!("Set volume: {}", volume);
            }
            _ => {
                trace!("Unsupported feature unit control {}", control_unit);
                return Some(OutResponse::Rejected);
            }
        }

        Some(OutResponse::Accepted)
    }

    fn endpoint_set_request(&mut self, req: control::Request, data: &[u8]) -> Option<OutResponse> {
        let control_selector = (req.value >> 8) as u8;
        let endpoint_address = req.index as u8;

        if endpoint_address != self.streaming_endpoint_address {
            trace!(
                "Unhandled endpoint set request for endpoint {} and control {}",
                endpoint_address,
                control_selector
            );
            return None;
        }

        if req.request != SET_CUR || control_selector != SAMPLING_FREQ_CONTROL {
            trace!(
                "Unsupported endpoint set request {} for control selector {}",
                req.request,
                control_selector
            );
            return Some(OutResponse::Rejected);
        }

        let &[b0, b1, b2] = data else {
            return Some(OutResponse::Rejected);
        };

        let sample_rate_hz = u32::from_le_bytes([b0, b1, b2, 0]);
        let sample_rate = SampleRate::from_hz_or_default(sample_rate_hz);

        self.update(|settings| settings.sample_rate = sample_rate);
        trace!("Set sample rate to {} Hz", sample_rate.hz());

        Some(OutResponse::Accepted)
    }

    fn interface_get_request<'r>(&'r mut self, req: Request, buf: &'r mut [u8]) -> Option<InResponse<'r>> {
        let interface_number = req.index as u8;
        let entity_index = (req.index >> 8) as u8;
        let channel_index = req.value as u8;
        let control_unit = (req.value >> 8) as u8;

        if interface_number != self.control_interface_number.into() {
            trace!("Unhandled interface get request for interface {}.", interface_number);
            return None;
        }

        if entity_index != FEATURE_UNIT_ID || channel_index != MASTER_CHANNEL {
            trace!(
                "Unsupported interface get request for entity {}, channel {}.",
                entity_index,
                channel_index
            );
            return Some(InResponse::Rejected);
        }

        let settings = self.shared().settings();

        let volume = match (req.request, control_unit) {
            (GET_CUR, MUTE_CONTROL) => {
                buf[0] = settings.volume.muted.into();
                return Some(InResponse::Accepted(&buf[..1]));
            }
            (GET_CUR, VOLUME_CONTROL) => settings.volume.volume_8q8_db,
            (GET_MIN, VOLUME_CONTROL) => MIN_VOLUME_DB * VOLUME_STEPS_PER_DB,
            (GET_MAX, VOLUME_CONTROL) => MAX_VOLUME_DB * VOLUME_STEPS_PER_DB,
            (GET_RES, VOLUME_CONTROL) => VOLUME_STEPS_PER_DB,
            _ => return Some(InResponse::Rejected),
        };

        buf[..2].copy_from_slice(&volume.to_le_bytes());
        trace!("Got volume value {} for request {}.", volume, req.request);
        Some(InResponse::Accepted(&buf[..2]))
    }

    fn endpoint_get_request<'r>(&'r mut self, req: Request, buf: &'r mut [u8]) -> Option<InResponse<'r>> {
        let control_selector = (req.value >> 8) as u8;
        let endpoint_address = req.index as u8;

        if endpoint_address != self.streaming_endpoint_address {
            trace!("Unhandled endpoint get request for endpoint {}.", endpoint_address);
            return None;
        }

        if req.request != GET_CUR || control_selector != SAMPLING_FREQ_CONTROL {
            trace!(
                "Unsupported endpoint get request {} for control selector {}.",
                req.request,
                control_selector
            );
            return Some(InResponse::Rejected);
        }

        let sample_rate_hz = self.shared().settings().sample_rate.hz();
        buf[..3].copy_from_slice(&sample_rate_hz.to_le_bytes()[..3]);

        Some(InResponse::Accepted(&buf[..3]))
    }
}

impl<'d> Handler for Control<'d> {
    fn reset(&mut self) {
        self.update(|settings| *settings = ControlSettings::default());
    }

    // Suspend occurs, for example, when disconnecting the USB cable.
    fn suspended(&mut self, suspended: bool) {
        if suspended {
            self.reset()
        }
    }

    fn set_alternate_setting(&mut self, iface: InterfaceNumber, alternate_setting: u8) {
        if iface != self.streaming_interface_number || alternate_setting >= ALTERNATE_SETTING_COUNT {
            return;
        }

        info!("Streaming interface alternate setting {}.", alternate_setting);
        self.update(|settings| settings.alternate_setting = alternate_setting);
    }

    // Handle control set requests.
    fn control_out(&mut self, req: control::Request, data: &[u8]) -> Option<OutResponse> {
        match req.request_type {
            RequestType::Standard => match req.request {
                Request::SET_INTERFACE if req.value < ALTERNATE_SETTING_COUNT as u16 => Some(OutResponse::Accepted),
                _ => Some(OutResponse::Rejected),
            },
            RequestType::Class => match req.recipient {
                Recipient::Interface => self.interface_set_request(req, data),
                Recipient::Endpoint => self.endpoint_set_request(req, data),
                _ => Some(OutResponse::Rejected),
            },
            _ => None,
        }
    }

    // Handle control get requests.
    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        match req.request_type {
            RequestType::Class => match req.recipient {
                Recipient::Interface => self.interface_get_request(req, buf),
                Recipient::Endpoint => self.endpoint_get_request(req, buf),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    const STREAMING_ENDPOINT: u8 = 0x01;

    fn control(shared: &SharedControl) -> Control<'_> {
        Control {
            control_interface_number: InterfaceNumber(0),
            streaming_interface_number: InterfaceNumber(1),
            streaming_endpoint_address: STREAMING_ENDPOINT,
            shared,
        }
    }

    fn request(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Request {
        let [v0, v1] = value.to_le_bytes();
        let [i0, i1] = index.to_le_bytes();
        let [l0, l1] = length.to_le_bytes();

        Request::parse(&[request_type, request, v0, v1, i0, i1, l0, l1])
    }

    fn set_feature(control: &mut Control, selector: u8, channel: u8, data: &[u8]) -> Option<OutResponse> {
        let value = ((selector as u16) << 8) | channel as u16;
        let index = (FEATURE_UNIT_ID as u16) << 8;
        control.control_out(request(0x21, SET_CUR, value, index, data.len() as u16), data)
    }

    fn get_feature(control: &mut Control, request_code: u8, selector: u8, channel: u8) -> Option<Vec<u8>> {
        let value = ((selector as u16) << 8) | channel as u16;
        let index = (FEATURE_UNIT_ID as u16) << 8;
        let mut buf = [0u8; 8];

        match control.control_in(request(0xA1, request_code, value, index, 2), &mut buf) {
            Some(InResponse::Accepted(data)) => Some(data.to_vec()),
            _ => None,
        }
    }

    fn set_rate(control: &mut Control, data: &[u8]) -> Option<OutResponse> {
        let value = (SAMPLING_FREQ_CONTROL as u16) << 8;
        control.control_out(
            request(0x22, SET_CUR, value, STREAMING_ENDPOINT as u16, data.len() as u16),
            data,
        )
    }

    fn get_rate(control: &mut Control) -> Option<u32> {
        let value = (SAMPLING_FREQ_CONTROL as u16) << 8;
        let mut buf = [0u8; 8];

        match control.control_in(request(0xA2, GET_CUR, value, STREAMING_ENDPOINT as u16, 3), &mut buf) {
            Some(InResponse::Accepted(data)) => Some(u32::from_le_bytes([data[0], data[1], data[2], 0])),
            _ => None,
        }
    }

    #[test]
    fn rate_negotiation() {
        let shared = SharedControl::default();
        let mut control = control(&shared);

        assert_eq!(set_rate(&mut control, &48_000u32.to_le_bytes()[..3]), Some(OutResponse::Accepted));
        assert_eq!(get_rate(&mut control), Some(48_000));
        assert_eq!(shared.settings().sample_rate, SampleRate::Hz48000);

        assert_eq!(set_rate(&mut control, &22_050u32.to_le_bytes()[..3]), Some(OutResponse::Accepted));
        assert_eq!(get_rate(&mut control), Some(44_100));

        assert_eq!(set_rate(&mut control, &96_000u32.to_le_bytes()[..3]), Some(OutResponse::Accepted));
        assert_eq!(get_rate(&mut control), Some(96_000));
    }

    #[test]
    fn malformed_rate_requests_are_rejected() {
        let shared = SharedControl::default();
        let mut control = control(&shared);
        set_rate(&mut control, &48_000u32.to_le_bytes()[..3]);

        // Too short
        assert_eq!(set_rate(&mut control, &[0x44, 0xAC]), Some(OutResponse::Rejected));

        // Reserved control selector
        let req = request(0x22, SET_CUR, 0x0200, STREAMING_ENDPOINT as u16, 3);
        assert_eq!(control.control_out(req, &[0x44, 0xAC, 0x00]), Some(OutResponse::Rejected));

        // Another endpoint is not ours to answer.
        let req = request(0x22, SET_CUR, 0x0100, 0x05, 3);
        assert_eq!(control.control_out(req, &[0x44, 0xAC, 0x00]), None);

        assert_eq!(get_rate(&mut control), Some(48_000));
    }

    #[test]
    fn master_volume_and_mute() {
        let shared = SharedControl::default();
        let mut control = control(&shared);

        let volume: i16 = -20 * VOLUME_STEPS_PER_DB;
        assert_eq!(
            set_feature(&mut control, VOLUME_CONTROL, MASTER_CHANNEL, &volume.to_le_bytes()),
            Some(OutResponse::Accepted)
        );
        assert_eq!(set_feature(&mut control, MUTE_CONTROL, MASTER_CHANNEL, &[1]), Some(OutResponse::Accepted));

        let settings = shared.settings();
        assert!(settings.volume.muted);
        assert_eq!(settings.volume.volume_8q8_db, volume);
        assert_eq!(settings.volume.index(), 71);

        assert_eq!(
            get_feature(&mut control, GET_CUR, VOLUME_CONTROL, MASTER_CHANNEL),
            Some(volume.to_le_bytes().to_vec())
        );
        assert_eq!(get_feature(&mut control, GET_CUR, MUTE_CONTROL, MASTER_CHANNEL), Some([1].to_vec()));
        assert_eq!(
            get_feature(&mut control, GET_MIN, VOLUME_CONTROL, MASTER_CHANNEL),
            Some((-91i16 * 256).to_le_bytes().to_vec())
        );
        assert_eq!(
            get_feature(&mut control, GET_MAX, VOLUME_CONTROL, MASTER_CHANNEL),
            Some(0i16.to_le_bytes().to_vec())
        );
        assert_eq!(
            get_feature(&mut control, GET_RES, VOLUME_CONTROL, MASTER_CHANNEL),
            Some(256i16.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn malformed_feature_requests_are_rejected() {
        let shared = SharedControl::default();
        let mut control = control(&shared);
        let before = shared.settings();

        // Too short
        assert_eq!(set_feature(&mut control, VOLUME_CONTROL, MASTER_CHANNEL, &[0x00]), Some(OutResponse::Rejected));
        assert_eq!(set_feature(&mut control, MUTE_CONTROL, MASTER_CHANNEL, &[]), Some(OutResponse::Rejected));
        // Unknown channel
        assert_eq!(set_feature(&mut control, MUTE_CONTROL, 1, &[1]), Some(OutResponse::Rejected));
        // Reserved selector
        assert_eq!(set_feature(&mut control, 0x03, MASTER_CHANNEL, &[1]), Some(OutResponse::Rejected));
        // Unknown entity
        let req = request(0x21, SET_CUR, 0x0100, (OUTPUT_UNIT_ID as u16) << 8, 1);
        assert_eq!(control.control_out(req, &[1]), Some(OutResponse::Rejected));

        assert_eq!(get_feature(&mut control, GET_CUR, VOLUME_CONTROL, 2), None);
        assert_eq!(get_feature(&mut control, GET_MIN, MUTE_CONTROL, MASTER_CHANNEL), None);

        assert_eq!(shared.settings(), before);
        assert!(!shared.changed.load(Ordering::Relaxed));
    }

    #[test]
    fn wrong_length_requests_are_rejected() {
        let shared = SharedControl::default();
        let mut control = control(&shared);
        let before = shared.settings();

        // Too long
        assert_eq!(set_rate(&mut control, &[0x80, 0xBB, 0x00, 0x00]), Some(OutResponse::Rejected));
        assert_eq!(
            set_feature(&mut control, VOLUME_CONTROL, MASTER_CHANNEL, &[0x00, 0xEC, 0x00]),
            Some(OutResponse::Rejected)
        );
        assert_eq!(set_feature(&mut control, MUTE_CONTROL, MASTER_CHANNEL, &[1, 7]), Some(OutResponse::Rejected));

        assert_eq!(shared.settings(), before);
        assert!(!shared.changed.load(Ordering::Relaxed));
    }

    #[test]
    fn volume_is_clamped_to_advertised_range() {
        let shared = SharedControl::default();
        let mut control = control(&shared);

        let loud: i16 = 6 * VOLUME_STEPS_PER_DB;
        assert_eq!(
            set_feature(&mut control, VOLUME_CONTROL, MASTER_CHANNEL, &loud.to_le_bytes()),
            Some(OutResponse::Accepted)
        );
        assert_eq!(
            get_feature(&mut control, GET_CUR, VOLUME_CONTROL, MASTER_CHANNEL),
            Some(0i16.to_le_bytes().to_vec())
        );

        assert_eq!(
            set_feature(&mut control, VOLUME_CONTROL, MASTER_CHANNEL, &i16::MIN.to_le_bytes()),
            Some(OutResponse::Accepted)
        );
        assert_eq!(shared.settings().volume.volume_8q8_db, MIN_VOLUME_DB * VOLUME_STEPS_PER_DB);
        assert_eq!(shared.settings().volume.index(), 0);
    }

    #[test]
    fn alternate_settings() {
        let shared = SharedControl::default();
        let mut control = control(&shared);

        control.set_alternate_setting(InterfaceNumber(1), 1);
        assert_eq!(shared.settings().alternate_setting, 1);

        // Out of range, or another interface
        control.set_alternate_setting(InterfaceNumber(1), 2);
        control.set_alternate_setting(InterfaceNumber(0), 0);
        assert_eq!(shared.settings().alternate_setting, 1);

        let req = request(0x01, Request::SET_INTERFACE, 2, 1, 0);
        assert_eq!(control.control_out(req, &[]), Some(OutResponse::Rejected));

        control.set_alternate_setting(InterfaceNumber(1), 0);
        assert_eq!(shared.settings().alternate_setting, 0);
    }

    #[test]
    fn reset_restores_defaults() {
        let shared = SharedControl::default();
        let mut control = control(&shared);

        set_rate(&mut control, &96_000u32.to_le_bytes()[..3]);
        set_feature(&mut control, MUTE_CONTROL, MASTER_CHANNEL, &[1]);
        control.set_alternate_setting(InterfaceNumber(1), 1);
        assert!(shared.changed.load(Ordering::Relaxed));

        control.suspended(true);
        assert_eq!(shared.settings(), ControlSettings::default());
    }

    #[test]
    fn refresh_period() {
        assert_eq!(FeedbackRefreshPeriod::Period4ms.frames(), 4);
        assert_eq!(u8::from(FeedbackRefreshPeriod::Period4ms), 2);
    }
}
