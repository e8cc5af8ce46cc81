//! Error kinds of the audio core.
//!
//! None of these are fatal. Real-time paths count them, control paths turn them into request rejections.
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No free audio buffer was available.
    ResourceExhausted,
    /// An unsupported value or a malformed request.
    InvalidParameter,
    /// A fixed-point result was clamped to the representable range.
    OverflowSaturated,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted => f.write_str("no free audio buffer"),
            Error::InvalidParameter => f.write_str("invalid parameter"),
            Error::OverflowSaturated => f.write_str("fixed-point overflow, value saturated"),
        }
    }
}
