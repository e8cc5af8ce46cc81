//! Codes from "Universal Serial Bus Device Class Definition for Audio Devices", Release 1.0, appendix A.
#![allow(dead_code)]

// Interface association [IAD]
pub const AUDIO_FUNCTION: u8 = USB_AUDIO_CLASS;
pub const FUNCTION_SUBCLASS_UNDEFINED: u8 = 0x00;

// Audio interface class, subclass and protocol codes [A.1 - A.3]
pub const USB_AUDIO_CLASS: u8 = 0x01;
pub const USB_AUDIOCONTROL_SUBCLASS: u8 = 0x01;
pub const USB_AUDIOSTREAMING_SUBCLASS: u8 = 0x02;
pub const PROTOCOL_NONE: u8 = 0x00;

// Class-specific descriptor types [A.4]
pub const CS_INTERFACE: u8 = 0x24;
pub const CS_ENDPOINT: u8 = 0x25;

// Audio control interface descriptor subtypes [A.5]
pub const HEADER_SUBTYPE: u8 = 0x01;
pub const INPUT_TERMINAL: u8 = 0x02;
pub const OUTPUT_TERMINAL: u8 = 0x03;
pub const FEATURE_UNIT: u8 = 0x06;

// Audio streaming interface descriptor subtypes [A.6]
pub const AS_GENERAL: u8 = 0x01;
pub const FORMAT_TYPE: u8 = 0x02;

// Request codes [A.9]
pub const SET_CUR: u8 = 0x01;
pub const GET_CUR: u8 = 0x81;
pub const SET_MIN: u8 = 0x02;
pub const GET_MIN: u8 = 0x82;
pub const SET_MAX: u8 = 0x03;
pub const GET_MAX: u8 = 0x83;
pub const SET_RES: u8 = 0x04;
pub const GET_RES: u8 = 0x84;

// Feature unit control selectors [A.10.2]
// These equal the bmaControls bits of the feature unit descriptor (D0 mute, D1 volume).
pub const FU_CONTROL_UNDEFINED: u8 = 0x00;
pub const MUTE_CONTROL: u8 = 0x01;
pub const VOLUME_CONTROL: u8 = 0x02;

// Endpoint control selectors [A.10.5]
pub const SAMPLING_FREQ_CONTROL: u8 = 0x01;

// Audio data format type I codes [Formats A.1.1]
pub const PCM: u16 = 0x0001;

// Format type codes [Formats A.1]
pub const FORMAT_TYPE_I: u8 = 0x01;

// Audio device class release number
pub const ADC_VERSION: u16 = 0x0100;

// Spatial locations in wChannelConfig [4.1.2]
pub const LEFT_FRONT: u16 = 0x0001;
pub const RIGHT_FRONT: u16 = 0x0002;
