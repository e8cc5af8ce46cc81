//! Fork-join equalization of stereo blocks across two cores.
//!
//! The left channel is filtered by the calling core, the right channel by a worker on the other core. The job sent
//! to the worker owns both the de-interleaved samples and the filter cascade of the right channel, so that nothing is
//! shared mutably between the cores. One job is in flight at most.
use core::sync::atomic::{fence, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::eq::{Cascade, ChannelSelect, EqualizerBank};
use crate::{BUFFER_FRAMES, CHANNEL_COUNT};

/// Filter stage of the stream engine.
#[allow(async_fn_in_trait)]
pub trait EqStage {
    /// The equalizer settings.
    fn bank(&mut self) -> &mut EqualizerBank;

    /// Filter an interleaved stereo block in place.
    async fn process(&mut self, samples: &mut [i16]);
}

impl EqStage for EqualizerBank {
    fn bank(&mut self) -> &mut EqualizerBank {
        self
    }

    async fn process(&mut self, samples: &mut [i16]) {
        EqualizerBank::process(self, samples)
    }
}

/// One channel of one block, with the filter that processes it.
pub struct ChannelJob {
    samples: [i16; BUFFER_FRAMES],
    len: usize,
    cascade: Cascade,
}

impl ChannelJob {
    fn new(cascade: Cascade) -> Self {
        Self {
            samples: [0; BUFFER_FRAMES],
            len: 0,
            cascade,
        }
    }

    /// Copy one channel out of an interleaved block.
    fn load(&mut self, block: &[i16], channel: ChannelSelect) {
        let (offset, stride) = channel.layout();

        self.len = 0;
        for (sample, source) in self.samples.iter_mut().zip(block.iter().skip(offset).step_by(stride)) {
            *sample = *source;
            self.len += 1;
        }
    }

    /// Copy the filtered channel back into the interleaved block.
    fn store(&self, block: &mut [i16], channel: ChannelSelect) {
        let (offset, stride) = channel.layout();

        for (target, sample) in block.iter_mut().skip(offset).step_by(stride).zip(self.samples[..self.len].iter()) {
            *target = *sample;
        }
    }

    /// Run the full cascade over the samples.
    pub fn run(&mut self) {
        self.cascade.process(&mut self.samples[..self.len], ChannelSelect::Contiguous);
    }
}

/// The pair of single-slot channels between the cores.
pub struct CoreLink {
    request: Channel<CriticalSectionRawMutex, ChannelJob, 1>,
    response: Channel<CriticalSectionRawMutex, ChannelJob, 1>,
}

impl Default for CoreLink {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreLink {
    pub const fn new() -> Self {
        Self {
            request: Channel::new(),
            response: Channel::new(),
        }
    }
}

/// Filters the jobs it receives. Runs on the second core.
pub struct EqWorker<'a> {
    link: &'a CoreLink,
}

impl<'a> EqWorker<'a> {
    pub fn new(link: &'a CoreLink) -> Self {
        Self { link }
    }

    /// Wait for one job, filter it, and hand it back.
    pub async fn serve(&self) {
        let mut job = self.link.request.receive().await;
        fence(Ordering::Acquire);

        job.run();

        fence(Ordering::Release);
        self.link.response.send(job).await;
    }

    pub async fn run(&self) -> ! {
        loop {
            self.serve().await;
        }
    }
}

pub struct DualCoreEqSplitter<'a> {
    link: &'a CoreLink,
    bank: EqualizerBank,
    in_flight: bool,
    // Bank generation when the in-flight job was sent.
    dispatched: u32,
}

impl<'a> DualCoreEqSplitter<'a> {
    pub fn new(link: &'a CoreLink, bank: EqualizerBank) -> Self {
        Self {
            link,
            bank,
            in_flight: false,
            dispatched: 0,
        }
    }

    /// Collect the outstanding job, and put its cascade back.
    ///
    /// If the settings changed while the job was out, its cascade is stale. Channel 1 then takes the coefficients of
    /// channel 0 with cleared memory, like every channel does on a change.
    async fn join(&mut self) -> Option<ChannelJob> {
        if !self.in_flight {
            return None;
        }

        let job = self.link.response.receive().await;
        fence(Ordering::Acquire);
        self.in_flight = false;

        if self.bank.generation() == self.dispatched {
            self.bank.replace_channel(1, job.cascade);
        } else {
            debug!("Dropped a stale right channel cascade.");
            let stages = *self.bank.channel(0).stages();
            self.bank.channel_mut(1).configure(&stages);
        }

        Some(job)
    }

    /// Filter one block of at most [`BUFFER_FRAMES`] frames.
    async fn process_block(&mut self, samples: &mut [i16]) {
        let mut job = ChannelJob::new(self.bank.replace_channel(1, Cascade::new()));
        job.load(samples, ChannelSelect::Right);

        fence(Ordering::Release);
        self.link.request.send(job).await;
        self.in_flight = true;
        self.dispatched = self.bank.generation();

        self.bank.channel_mut(0).process(samples, ChannelSelect::Left);

        if let Some(job) = self.join().await {
            job.store(samples, ChannelSelect::Right);
        }
    }
}

impl EqStage for DualCoreEqSplitter<'_> {
    fn bank(&mut self) -> &mut EqualizerBank {
        &mut self.bank
    }

    async fn process(&mut self, samples: &mut [i16]) {
        if self.join().await.is_some() {
            debug!("Collected a stale equalizer job.");
        }

        if !self.bank.is_enabled() {
            return;
        }

        for block in samples.chunks_mut(BUFFER_FRAMES * CHANNEL_COUNT) {
            self.process_block(block).await;
        }
    }
}
