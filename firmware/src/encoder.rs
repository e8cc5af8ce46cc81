//! Quadrature rotary encoder, sampled from a periodic task.
use audio::eq::EncoderInput;
use embassy_rp::gpio::Input;

// Quadrature steps per mechanical detent.
const STEPS_PER_DETENT: i32 = 4;

// Step for (previous << 2 | current) state; invalid double transitions count as nothing.
const TRANSITIONS: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

pub struct QuadratureEncoder<'d> {
    a: Input<'d>,
    b: Input<'d>,
    state: u8,
    steps: i32,
}

impl<'d> QuadratureEncoder<'d> {
    pub fn new(a: Input<'d>, b: Input<'d>) -> Self {
        let mut encoder = Self { a, b, state: 0, steps: 0 };
        encoder.state = encoder.read();
        encoder
    }

    fn read(&self) -> u8 {
        ((self.a.is_high() as u8) << 1) | self.b.is_high() as u8
    }

    /// Sample both inputs. Must run often enough to see every transition.
    pub fn sample(&mut self) {
        let state = self.read();
        self.steps += TRANSITIONS[((self.state << 2) | state) as usize] as i32;
        self.state = state;
    }
}

impl EncoderInput for QuadratureEncoder<'_> {
    fn take_delta(&mut self) -> i32 {
        let detents = self.steps / STEPS_PER_DETENT;
        self.steps -= detents * STEPS_PER_DETENT;
        detents
    }
}
