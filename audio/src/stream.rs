//! Isochronous audio stream handling: packet intake, feedback, and reaction to host control changes.
//!
//! The engine is driven by the USB tasks. Every packet is copied into a pool buffer, equalized in place and queued
//! for the S/PDIF output. A sample rate change runs the reconfiguration sequence before the next packet is accepted.
use crate::clock::{ClockReconfigurator, PllConfig, SystemClock};
use crate::feedback::FeedbackEstimator;
use crate::pool::AudioBufferPool;
use crate::splitter::EqStage;
use crate::uac1::ControlSettings;
use crate::{SampleRate, VolumeSetting, BUFFER_FRAMES, FRAME_SIZE};

/// Receives mute and volume changes, e.g. an amplifier or S/PDIF transmitter driver.
pub trait VolumeSink {
    fn set_volume(&mut self, volume: VolumeSetting);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineState {
    /// Zero-bandwidth alternate setting, packets are ignored.
    Idle,
    Streaming(SampleRate),
    /// The sample rate change sequence is running.
    Reconfiguring,
}

/// Host-negotiated stream parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamState {
    pub rate: SampleRate,
    pub volume: VolumeSetting,
    /// The rate at which the output consumes samples, once measured.
    pub measured_rate_hz: Option<u32>,
}

impl StreamState {
    /// Attenuation step of the volume, from 0 (-91 dB) to 90.
    pub fn volume_index(&self) -> u8 {
        self.volume.index()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamStats {
    /// Packets queued for output.
    pub packets: u32,
    /// Packets with a length that is not a whole number of frames, or too large.
    pub malformed: u32,
    /// Packets dropped for lack of a free buffer.
    pub overruns: u32,
    /// Packets received outside of streaming.
    pub ignored: u32,
}

pub struct StreamEngine<'p, 'b, E: EqStage, C: SystemClock, V: VolumeSink> {
    pool: &'p AudioBufferPool<'b>,
    eq: E,
    clock: ClockReconfigurator<C>,
    volume_sink: V,
    feedback: FeedbackEstimator,
    state: EngineState,
    stream: StreamState,
    stats: StreamStats,
}

impl<'p, 'b, E: EqStage, C: SystemClock, V: VolumeSink> StreamEngine<'p, 'b, E, C, V> {
    /// Create an idle engine at the default sample rate.
    pub fn new(pool: &'p AudioBufferPool<'b>, mut eq: E, clock: ClockReconfigurator<C>, volume_sink: V) -> Self {
        let stream = StreamState::default();

        if eq.bank().sample_rate() != stream.rate {
            eq.bank().set_sample_rate(stream.rate);
        }

        Self {
            pool,
            eq,
            clock,
            volume_sink,
            feedback: FeedbackEstimator::new(stream.rate),
            state: EngineState::Idle,
            stream,
            stats: StreamStats::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn eq(&mut self) -> &mut E {
        &mut self.eq
    }

    pub fn clock(&self) -> &ClockReconfigurator<C> {
        &self.clock
    }

    /// Apply changed host settings.
    ///
    /// Returns the PLL settings, if the sample rate changed. The output must then be retuned to the new rate.
    pub fn handle_control(&mut self, settings: ControlSettings) -> Option<PllConfig> {
        if settings.volume != self.stream.volume {
            self.stream.volume = settings.volume;
            self.volume_sink.set_volume(settings.volume);
            debug!("Volume index {}, muted: {}.", self.stream.volume_index(), settings.volume.muted);
        }

        let reconfigured = if settings.sample_rate != self.stream.rate {
            Some(self.reconfigure(settings.sample_rate))
        } else {
            None
        };

        self.state = match settings.alternate_setting {
            0 => EngineState::Idle,
            _ => EngineState::Streaming(self.stream.rate),
        };

        reconfigured
    }

    fn reconfigure(&mut self, rate: SampleRate) -> PllConfig {
        info!("Sample rate change from {} Hz to {} Hz.", self.stream.rate.hz(), rate.hz());
        self.state = EngineState::Reconfiguring;

        let config = match self
            .clock
            .reconfigure(rate, self.pool, self.eq.bank(), &mut self.feedback)
        {
            Ok(config) => config,
            Err(e) => {
                // Keep streaming on the old clock, the output runs slightly off-rate.
                error!("Clock reconfiguration failed: {}", e);
                self.eq.bank().set_sample_rate(rate);
                self.feedback.reset(rate);
                self.clock.current().unwrap_or(PllConfig::for_rate(rate))
            }
        };

        self.stream.rate = rate;
        self.stream.measured_rate_hz = None;

        config
    }

    /// Process one isochronous OUT packet.
    pub async fn on_packet(&mut self, payload: &[u8]) {
        if !matches!(self.state, EngineState::Streaming(_)) {
            self.stats.ignored = self.stats.ignored.wrapping_add(1);
            return;
        }

        if payload.is_empty() {
            return;
        }

        if payload.len() % FRAME_SIZE != 0 || payload.len() / FRAME_SIZE > BUFFER_FRAMES {
            debug!("Malformed packet of {} bytes.", payload.len());
            self.stats.malformed = self.stats.malformed.wrapping_add(1);
            return;
        }

        let mut buffer = match self.pool.try_take() {
            Ok(buffer) => buffer,
            Err(_) => {
                debug!("No free buffer, packet dropped.");
                self.stats.overruns = self.stats.overruns.wrapping_add(1);
                return;
            }
        };

        if buffer.fill_from_le_bytes(payload).is_err() {
            self.pool.discard(buffer);
            self.stats.malformed = self.stats.malformed.wrapping_add(1);
            return;
        }

        self.eq.process(buffer.samples_mut()).await;

        self.pool.give(buffer);
        self.stats.packets = self.stats.packets.wrapping_add(1);
    }

    /// Record a USB start-of-frame, for the feedback measurement.
    pub fn on_sof(&mut self, frame_number: u16, output_frames: u32) {
        self.feedback.on_sof(frame_number, output_frames);
        self.stream.measured_rate_hz = self.feedback.measured_rate_hz();
    }

    /// The packet for the feedback endpoint.
    pub fn feedback_packet(&self) -> [u8; 3] {
        self.feedback.packet()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use embassy_futures::block_on;
    use std::vec::Vec;

    use super::*;
    use crate::eq::EqualizerBank;
    use crate::pool::AudioBlock;
    use crate::{Error, BUFFER_COUNT, MAX_PACKET_SIZE};

    #[derive(Default)]
    struct FakeClock {
        writes: Vec<PllConfig>,
    }

    impl SystemClock for FakeClock {
        fn set_sys_pll(&mut self, config: &PllConfig) -> Result<(), Error> {
            self.writes.push(*config);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Amplifier {
        settings: Vec<VolumeSetting>,
    }

    impl VolumeSink for &mut Amplifier {
        fn set_volume(&mut self, volume: VolumeSetting) {
            self.settings.push(volume);
        }
    }

    fn blocks() -> [AudioBlock; BUFFER_COUNT] {
        core::array::from_fn(|_| AudioBlock::new())
    }

    fn engine<'p, 'b, V: VolumeSink>(
        pool: &'p AudioBufferPool<'b>,
        sink: V,
    ) -> StreamEngine<'p, 'b, EqualizerBank, FakeClock, V> {
        let clock = ClockReconfigurator::new(FakeClock::default(), Some(PllConfig::SYS_176MHZ));
        StreamEngine::new(pool, EqualizerBank::new(SampleRate::Hz44100), clock, sink)
    }

    fn streaming(rate: SampleRate) -> ControlSettings {
        ControlSettings {
            sample_rate: rate,
            alternate_setting: 1,
            ..Default::default()
        }
    }

    fn packet(frames: usize) -> Vec<u8> {
        (0..frames * FRAME_SIZE).map(|n| n as u8).collect()
    }

    #[test]
    fn idle_until_alternate_setting_one() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);
        let mut amplifier = Amplifier::default();
        let mut engine = engine(&pool, &mut amplifier);

        block_on(engine.on_packet(&packet(44)));
        assert_eq!(engine.stats().ignored, 1);
        assert_eq!(pool.queued_len(), 0);

        engine.handle_control(streaming(SampleRate::Hz44100));
        assert_eq!(engine.state(), EngineState::Streaming(SampleRate::Hz44100));

        block_on(engine.on_packet(&packet(44)));
        assert_eq!(pool.queued_len(), 1);

        engine.handle_control(ControlSettings::default());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn packets_are_copied_verbatim() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);
        let mut amplifier = Amplifier::default();
        let mut engine = engine(&pool, &mut amplifier);
        engine.handle_control(streaming(SampleRate::Hz44100));

        let payload = packet(45);
        block_on(engine.on_packet(&payload));

        let buffer = pool.try_acquire().unwrap();
        assert_eq!(buffer.sample_count(), 45);
        for (sample, bytes) in buffer.samples().iter().zip(payload.chunks_exact(2)) {
            assert_eq!(*sample, i16::from_le_bytes([bytes[0], bytes[1]]));
        }
        pool.release(buffer);

        assert_eq!(engine.stats().packets, 1);
    }

    #[test]
    fn rate_change_reconfigures() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);
        let mut amplifier = Amplifier::default();
        let mut engine = engine(&pool, &mut amplifier);

        engine.handle_control(streaming(SampleRate::Hz44100));
        block_on(engine.on_packet(&packet(44)));
        block_on(engine.on_packet(&packet(44)));
        assert_eq!(pool.queued_len(), 2);

        let config = engine.handle_control(streaming(SampleRate::Hz48000));
        assert_eq!(config, Some(PllConfig::SYS_192MHZ));
        assert_eq!(engine.state(), EngineState::Streaming(SampleRate::Hz48000));
        assert_eq!(pool.queued_len(), 0);
        assert_eq!(engine.eq().bank().sample_rate(), SampleRate::Hz48000);
        assert_eq!(engine.feedback_packet(), [0x00, 0x00, 0x0C]);
        assert_eq!(engine.clock().clock().writes, [PllConfig::SYS_192MHZ]);

        // Unchanged settings do not reconfigure.
        assert_eq!(engine.handle_control(streaming(SampleRate::Hz48000)), None);
        assert_eq!(engine.stream_state().rate, SampleRate::Hz48000);

        // The last negotiated rate is kept across alternate setting changes.
        engine.handle_control(ControlSettings {
            sample_rate: SampleRate::Hz48000,
            ..Default::default()
        });
        engine.handle_control(streaming(SampleRate::Hz48000));
        assert_eq!(engine.state(), EngineState::Streaming(SampleRate::Hz48000));
    }

    #[test]
    fn overruns_drop_packets() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);
        let mut amplifier = Amplifier::default();
        let mut engine = engine(&pool, &mut amplifier);
        engine.handle_control(streaming(SampleRate::Hz96000));

        for _ in 0..BUFFER_COUNT + 2 {
            block_on(engine.on_packet(&packet(96)));
        }

        let stats = engine.stats();
        assert_eq!(stats.packets, BUFFER_COUNT as u32);
        assert_eq!(stats.overruns, 2);
        assert_eq!(pool.census().total(), BUFFER_COUNT);
        assert_eq!(pool.queued_len(), BUFFER_COUNT);
    }

    #[test]
    fn malformed_packets_are_dropped() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);
        let mut amplifier = Amplifier::default();
        let mut engine = engine(&pool, &mut amplifier);
        engine.handle_control(streaming(SampleRate::Hz48000));

        block_on(engine.on_packet(&[0; 6]));
        block_on(engine.on_packet(&[0; (BUFFER_FRAMES + 1) * FRAME_SIZE]));
        block_on(engine.on_packet(&[]));
        block_on(engine.on_packet(&packet(MAX_PACKET_SIZE / FRAME_SIZE)));

        let stats = engine.stats();
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.packets, 1);
        assert_eq!(pool.census().free, BUFFER_COUNT - 1);
    }

    #[test]
    fn volume_is_forwarded() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);
        let mut amplifier = Amplifier::default();

        {
            let mut engine = engine(&pool, &mut amplifier);
            let volume = VolumeSetting {
                muted: true,
                volume_8q8_db: -30 * 256,
            };

            engine.handle_control(ControlSettings {
                volume,
                ..Default::default()
            });
            engine.handle_control(ControlSettings {
                volume,
                ..Default::default()
            });

            assert_eq!(engine.stream_state().volume_index(), 61);
        }

        assert_eq!(amplifier.settings.len(), 1);
        assert!(amplifier.settings[0].muted);
    }

    #[test]
    fn feedback_follows_output() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);
        let mut amplifier = Amplifier::default();
        let mut engine = engine(&pool, &mut amplifier);
        engine.handle_control(streaming(SampleRate::Hz48000));

        let mut output_frames = 0u32;
        for frame_number in 0..=crate::FEEDBACK_WINDOW as u16 {
            engine.on_sof(frame_number, output_frames);
            output_frames += 47;
        }

        assert_eq!(engine.stream_state().measured_rate_hz, Some(47_000));
        let value = (47u32 << 14).to_le_bytes();
        assert_eq!(engine.feedback_packet(), [value[0], value[1], value[2]]);
    }
}
