//! USB audio terminal types, from "Universal Serial Bus Device Class Definition for Terminal Types", Release 1.0.

#[repr(u16)]
#[non_exhaustive]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TerminalType {
    // USB terminal types [2.1]
    UsbUndefined = 0x0100,
    UsbStreaming = 0x0101,
    UsbVendor = 0x01FF,

    // Output terminal types [2.3]
    OutUndefined = 0x0300,
    OutSpeaker = 0x0301,
    OutHeadphones = 0x0302,

    // External terminal types [2.6]
    ExtUndefined = 0x0600,
    ExtDigitalAudioInterface = 0x0602,
    ExtSpdifInterface = 0x0605,
}

impl From<TerminalType> for u16 {
    fn from(t: TerminalType) -> u16 {
        t as u16
    }
}
