//! Fixed pool of interleaved stereo sample blocks, exchanged between the USB producer and the S/PDIF consumer.
//!
//! Every block is owned by exactly one of: the free list, the producer, the output queue, or the consumer. Ownership
//! moves with the [`AudioBuffer`] handle, which cannot be copied or cloned.
//!
//! Producer: [`BufferPool::take`] -> fill -> [`BufferPool::give`]
//! Consumer: [`BufferPool::acquire`] -> drain -> [`BufferPool::release`]
use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;

use crate::{Error, BUFFER_COUNT, BUFFER_FRAMES, CHANNEL_COUNT, FRAME_SIZE};

/// The pool shared between cores, with the default geometry.
pub type AudioBufferPool<'a> = BufferPool<'a, CriticalSectionRawMutex, BUFFER_COUNT>;

/// Backing storage for one audio buffer.
pub struct AudioBlock {
    samples: [i16; BUFFER_FRAMES * CHANNEL_COUNT],
    sample_count: usize,
}

impl AudioBlock {
    pub const fn new() -> Self {
        Self {
            samples: [0; BUFFER_FRAMES * CHANNEL_COUNT],
            sample_count: 0,
        }
    }
}

impl Default for AudioBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle to one block of the pool.
pub struct AudioBuffer<'a> {
    block: &'a mut AudioBlock,
}

impl<'a> AudioBuffer<'a> {
    /// Maximum number of stereo samples.
    pub const fn capacity(&self) -> usize {
        BUFFER_FRAMES
    }

    /// Number of valid stereo samples.
    pub fn sample_count(&self) -> usize {
        self.block.sample_count
    }

    /// The valid, interleaved samples.
    pub fn samples(&self) -> &[i16] {
        &self.block.samples[..self.block.sample_count * CHANNEL_COUNT]
    }

    /// The valid, interleaved samples, for in-place processing.
    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.block.samples[..self.block.sample_count * CHANNEL_COUNT]
    }

    pub fn clear(&mut self) {
        self.block.sample_count = 0;
    }

    /// Replace the content with interleaved samples.
    pub fn fill(&mut self, samples: &[i16]) -> Result<(), Error> {
        if samples.len() % CHANNEL_COUNT != 0 || samples.len() > self.block.samples.len() {
            return Err(Error::InvalidParameter);
        }

        self.block.samples[..samples.len()].copy_from_slice(samples);
        self.block.sample_count = samples.len() / CHANNEL_COUNT;
        Ok(())
    }

    /// Replace the content with little-endian interleaved 16 bit PCM, verbatim.
    ///
    /// Returns the number of stereo samples. Payloads that are not a whole number of frames, or that exceed the
    /// capacity, are rejected and leave the buffer untouched.
    pub fn fill_from_le_bytes(&mut self, payload: &[u8]) -> Result<usize, Error> {
        if payload.len() % FRAME_SIZE != 0 || payload.len() / FRAME_SIZE > BUFFER_FRAMES {
            return Err(Error::InvalidParameter);
        }

        for (sample, bytes) in self.block.samples.iter_mut().zip(payload.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }

        self.block.sample_count = payload.len() / FRAME_SIZE;
        Ok(self.block.sample_count)
    }
}

/// Number of buffers held by each owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Census {
    pub free: usize,
    pub producer: usize,
    pub queued: usize,
    pub consumer: usize,
}

impl Census {
    pub fn total(&self) -> usize {
        self.free + self.producer + self.queued + self.consumer
    }
}

/// Backpressure counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStats {
    /// Failed non-blocking `take`s.
    pub overruns: u32,
    /// Polls of the output queue that found it empty.
    pub underruns: u32,
}

#[derive(Clone, Copy, Default)]
struct Ledger {
    producer: usize,
    consumer: usize,
    stats: PoolStats,
}

pub struct BufferPool<'a, M: RawMutex, const N: usize> {
    free: Channel<M, AudioBuffer<'a>, N>,
    queued: Channel<M, AudioBuffer<'a>, N>,
    ledger: Mutex<M, Cell<Ledger>>,
}

impl<'a, M: RawMutex, const N: usize> BufferPool<'a, M, N> {
    /// Create a pool, with all blocks on the free list.
    pub fn new(blocks: &'a mut [AudioBlock; N]) -> Self {
        let pool = Self {
            free: Channel::new(),
            queued: Channel::new(),
            ledger: Mutex::new(Cell::new(Ledger::default())),
        };

        for block in blocks {
            block.sample_count = 0;
            Self::push(&pool.free, AudioBuffer { block });
        }

        pool
    }

    // Each channel can hold all N buffers, so this never fails.
    fn push(channel: &Channel<M, AudioBuffer<'a>, N>, buffer: AudioBuffer<'a>) {
        if channel.try_send(buffer).is_err() {
            error!("Audio buffer lost.");
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        self.ledger.lock(|ledger| {
            let mut l = ledger.get();
            let result = f(&mut l);
            ledger.set(l);
            result
        })
    }

    /// Take a free buffer for filling, without waiting.
    ///
    /// Fails with [`Error::ResourceExhausted`] and counts an overrun, if no buffer is free.
    pub fn try_take(&self) -> Result<AudioBuffer<'a>, Error> {
        self.update(|ledger| match self.free.try_receive() {
            Ok(mut buffer) => {
                buffer.clear();
                ledger.producer += 1;
                Ok(buffer)
            }
            Err(_) => {
                ledger.stats.overruns = ledger.stats.overruns.wrapping_add(1);
                Err(Error::ResourceExhausted)
            }
        })
    }

    /// Take a free buffer for filling.
    ///
    /// If `blocking` is set, waits until the consumer releases a buffer. Otherwise, behaves like
    /// [`BufferPool::try_take`].
    pub async fn take(&self, blocking: bool) -> Result<AudioBuffer<'a>, Error> {
        if !blocking {
            return self.try_take();
        }

        let mut buffer = self.free.receive().await;
        buffer.clear();
        self.update(|ledger| ledger.producer += 1);

        Ok(buffer)
    }

    /// Queue a filled buffer for output. Never blocks.
    pub fn give(&self, buffer: AudioBuffer<'a>) {
        self.update(|ledger| {
            ledger.producer = ledger.producer.saturating_sub(1);
            Self::push(&self.queued, buffer);
        });
    }

    /// Return a taken buffer to the free list, without queueing it.
    pub fn discard(&self, buffer: AudioBuffer<'a>) {
        self.update(|ledger| {
            ledger.producer = ledger.producer.saturating_sub(1);
            Self::push(&self.free, buffer);
        });
    }

    /// Wait for the next queued buffer.
    pub async fn acquire(&self) -> AudioBuffer<'a> {
        let buffer = self.queued.receive().await;
        self.update(|ledger| ledger.consumer += 1);

        buffer
    }

    /// Get the next queued buffer, if any. Counts an underrun otherwise.
    pub fn try_acquire(&self) -> Option<AudioBuffer<'a>> {
        self.update(|ledger| match self.queued.try_receive() {
            Ok(buffer) => {
                ledger.consumer += 1;
                Some(buffer)
            }
            Err(_) => {
                ledger.stats.underruns = ledger.stats.underruns.wrapping_add(1);
                None
            }
        })
    }

    /// Return a drained buffer to the free list.
    pub fn release(&self, buffer: AudioBuffer<'a>) {
        self.update(|ledger| {
            ledger.consumer = ledger.consumer.saturating_sub(1);
            Self::push(&self.free, buffer);
        });
    }

    /// Move all queued buffers back to the free list, dropping their audio.
    ///
    /// Returns the number of flushed buffers.
    pub fn flush(&self) -> usize {
        self.update(|_| {
            let mut count = 0;
            while let Ok(buffer) = self.queued.try_receive() {
                Self::push(&self.free, buffer);
                count += 1;
            }
            count
        })
    }

    /// Number of buffers waiting for the consumer.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn census(&self) -> Census {
        self.update(|ledger| Census {
            free: self.free.len(),
            producer: ledger.producer,
            queued: self.queued.len(),
            consumer: ledger.consumer,
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.update(|ledger| ledger.stats)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use std::vec::Vec;

    use super::*;

    fn blocks() -> [AudioBlock; BUFFER_COUNT] {
        core::array::from_fn(|_| AudioBlock::new())
    }

    #[test]
    fn conservation() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);

        let mut producer = Vec::new();
        let mut consumer = Vec::new();
        let mut seed: u32 = 0x1234_5678;

        assert_eq!(pool.census().free, BUFFER_COUNT);

        for _ in 0..2000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);

            match (seed >> 16) % 4 {
                0 => {
                    if let Ok(buffer) = pool.try_take() {
                        producer.push(buffer);
                    }
                }
                1 => {
                    if let Some(buffer) = producer.pop() {
                        pool.give(buffer);
                    }
                }
                2 => {
                    if let Some(buffer) = pool.try_acquire() {
                        consumer.push(buffer);
                    }
                }
                _ => {
                    if let Some(buffer) = consumer.pop() {
                        pool.release(buffer);
                    }
                }
            }

            let census = pool.census();
            assert_eq!(census.total(), BUFFER_COUNT);
            assert_eq!(census.producer, producer.len());
            assert_eq!(census.consumer, consumer.len());
        }
    }

    #[test]
    fn fifo_order() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);

        for marker in 1..=3 {
            let mut buffer = pool.try_take().unwrap();
            buffer.fill(&[marker, -marker]).unwrap();
            pool.give(buffer);
        }

        for marker in 1..=3 {
            let buffer = pool.try_acquire().unwrap();
            assert_eq!(buffer.samples(), &[marker, -marker]);
            pool.release(buffer);
        }

        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.stats().underruns, 1);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);

        let taken: Vec<_> = (0..BUFFER_COUNT).map(|_| pool.try_take().unwrap()).collect();
        assert_eq!(pool.try_take().err(), Some(Error::ResourceExhausted));
        assert_eq!(block_on(pool.take(false)).err(), Some(Error::ResourceExhausted));
        assert_eq!(pool.stats().overruns, 2);

        for buffer in taken {
            pool.discard(buffer);
        }
        assert!(pool.try_take().is_ok());
    }

    #[test]
    fn blocking_take_waits_for_release() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);

        for _ in 0..BUFFER_COUNT {
            let buffer = pool.try_take().unwrap();
            pool.give(buffer);
        }
        let drained = pool.try_acquire().unwrap();

        let (taken, _) = block_on(join(pool.take(true), async { pool.release(drained) }));
        assert!(taken.is_ok());

        let census = pool.census();
        assert_eq!(census.producer, 1);
        assert_eq!(census.queued, BUFFER_COUNT - 1);
        assert_eq!(census.free, 0);
    }

    #[test]
    fn flush_returns_queued_buffers() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);

        for _ in 0..3 {
            let buffer = pool.try_take().unwrap();
            pool.give(buffer);
        }

        assert_eq!(pool.flush(), 3);
        assert_eq!(pool.census().free, BUFFER_COUNT);
        assert_eq!(pool.queued_len(), 0);
    }

    #[test]
    fn payload_copy() {
        let mut blocks = blocks();
        let pool = AudioBufferPool::new(&mut blocks);
        let mut buffer = pool.try_take().unwrap();

        let frames = buffer.fill_from_le_bytes(&[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80, 0xFF, 0x7F]);
        assert_eq!(frames, Ok(2));
        assert_eq!(buffer.samples(), &[1, -1, i16::MIN, i16::MAX]);

        // Not a whole frame
        assert_eq!(buffer.fill_from_le_bytes(&[0; 6]), Err(Error::InvalidParameter));
        // Too large
        assert_eq!(
            buffer.fill_from_le_bytes(&[0; (BUFFER_FRAMES + 1) * FRAME_SIZE]),
            Err(Error::InvalidParameter)
        );
        assert_eq!(buffer.sample_count(), 2);
    }
}
