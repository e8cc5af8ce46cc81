//! Feedback value for asynchronous USB audio streaming.
//!
//! The host adapts its sample delivery to the reported value, so it must track the rate at which the S/PDIF output
//! actually consumes frames. At every USB start-of-frame, the estimator records how many USB frames and how many
//! output frames have elapsed. The ratio over a sliding window is reported in 10.14 format (samples per 1 ms frame).
use heapless::HistoryBuffer;

use crate::{SampleRate, FEEDBACK_WINDOW};

/// The USB frame number is an 11 bit counter.
const FRAME_NUMBER_MASK: u16 = 0x7FF;

/// Larger gaps between two start-of-frame events restart the measurement.
const MAX_FRAME_GAP: u16 = 16;

/// One sample of the output rate.
#[derive(Clone, Copy, Debug, Default)]
struct Measurement {
    usb_frames: u16,
    output_frames: u32,
}

pub struct FeedbackEstimator {
    rate: SampleRate,
    window: HistoryBuffer<Measurement, FEEDBACK_WINDOW>,
    last: Option<(u16, u32)>,
}

impl FeedbackEstimator {
    pub const fn new(rate: SampleRate) -> Self {
        Self {
            rate,
            window: HistoryBuffer::new(),
            last: None,
        }
    }

    /// Discard all measurements, and start over at a new nominal rate.
    pub fn reset(&mut self, rate: SampleRate) {
        self.rate = rate;
        self.window = HistoryBuffer::new();
        self.last = None;
    }

    pub fn rate(&self) -> SampleRate {
        self.rate
    }

    /// Record a USB start-of-frame.
    ///
    /// # Arguments
    ///
    /// * `frame_number` - The (11 bit) USB frame number.
    /// * `output_frames` - The free-running count of stereo frames consumed by the S/PDIF output.
    pub fn on_sof(&mut self, frame_number: u16, output_frames: u32) {
        let frame_number = frame_number & FRAME_NUMBER_MASK;

        if let Some((last_frame_number, last_output_frames)) = self.last {
            let usb_frames = frame_number.wrapping_sub(last_frame_number) & FRAME_NUMBER_MASK;

            if usb_frames == 0 {
                // Same frame, nothing elapsed.
                return;
            }

            if usb_frames <= MAX_FRAME_GAP {
                self.window.write(Measurement {
                    usb_frames,
                    output_frames: output_frames.wrapping_sub(last_output_frames),
                });
            } else {
                debug!("Feedback measurement gap of {} frames.", usb_frames);
            }
        }

        self.last = Some((frame_number, output_frames));
    }

    fn totals(&self) -> Option<(u64, u64)> {
        if self.window.len() < FEEDBACK_WINDOW {
            return None;
        }

        let (usb_frames, output_frames) = self.window.as_slice().iter().fold((0u64, 0u64), |(u, o), m| {
            (u + m.usb_frames as u64, o + m.output_frames as u64)
        });

        Some((usb_frames, output_frames))
    }

    /// The measured feedback value in 10.14 format, once the window is full.
    pub fn measured_feedback(&self) -> Option<u32> {
        let (usb_frames, output_frames) = self.totals()?;
        Some(((output_frames << 14) / usb_frames) as u32)
    }

    /// The measured output rate in Hz, once the window is full.
    pub fn measured_rate_hz(&self) -> Option<u32> {
        let (usb_frames, output_frames) = self.totals()?;
        Some(((output_frames * 1000) / usb_frames) as u32)
    }

    /// The value to report to the host.
    ///
    /// The measured value, limited to one sample per frame around the nominal rate. Before enough measurements exist,
    /// the nominal rate.
    pub fn feedback(&self) -> u32 {
        let nominal = self.rate.nominal_feedback();

        match self.measured_feedback() {
            Some(measured) => measured.clamp(nominal - (1 << 14), nominal + (1 << 14)),
            None => nominal,
        }
    }

    /// The feedback value, packed for the full-speed feedback endpoint.
    pub fn packet(&self) -> [u8; 3] {
        let value = self.feedback();
        [value as u8, (value >> 8) as u8, (value >> 16) as u8]
    }
}
