// Consumer-side entry points, executed on the audio server's realtime
// thread. Everything here must stay allocation- and lock-free: the pull
// path copies memory, updates its own clock tracker, and pushes one timing
// tick. All producer-visible effects travel through the rings and a few
// one-shot atomics.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;

use super::clock::{ClockTracker, Step};
use super::sample_ring::SampleReader;
use super::timing_ring::{Tick, TickSender};

/// Seconds of consumed silence after which a kept-alive stream shuts down.
pub const KEEP_ALIVE_EXPIRY_SEC: i64 = 30;

/// Stream lifecycle. Stored as an atomic u8 in [`StreamShared`]; the
/// producer owns most transitions, the consumer marks SETUP_CONSUMER→RUN
/// and the KEEP_ALIVE expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Stop = 0,
    SetupProducer = 1,
    SetupConsumer = 2,
    Run = 3,
    KeepAlive = 4,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::SetupProducer,
            2 => StreamState::SetupConsumer,
            3 => StreamState::Run,
            4 => StreamState::KeepAlive,
            _ => StreamState::Stop,
        }
    }
}

/// The atomics both threads touch, grouped per writing side so neither
/// invalidates the other's cache line on every access.
pub(crate) struct StreamShared {
    state: CachePadded<AtomicU8>,
    /// Producer-written: frames wanted in the ring before playback starts.
    target_start: CachePadded<AtomicI64>,
    /// Consumer-written one-shot: startup deficit observed at the first
    /// pull, folded into the producer position on its next push.
    prefill_deficit: CachePadded<AtomicI64>,
}

impl StreamShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: CachePadded::new(AtomicU8::new(StreamState::Stop as u8)),
            target_start: CachePadded::new(AtomicI64::new(0)),
            prefill_deficit: CachePadded::new(AtomicI64::new(0)),
        })
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_target_start(&self, frames: i64) {
        self.target_start.store(frames, Ordering::Release);
    }

    pub fn take_prefill_deficit(&self) -> i64 {
        self.prefill_deficit.swap(0, Ordering::AcqRel)
    }
}

/// Handed to the audio backend at stream open; the device invokes [`pull`]
/// from its realtime callback for every period.
///
/// [`pull`]: ConsumerHandle::pull
pub struct ConsumerHandle {
    shared: Arc<StreamShared>,
    reader: SampleReader,
    ticks: TickSender,
    tracker: ClockTracker,
    channels: usize,
    sample_rate: u32,
    epoch: Instant,
}

impl ConsumerHandle {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        reader: SampleReader,
        ticks: TickSender,
        channels: usize,
        sample_rate: u32,
        epoch: Instant,
    ) -> Self {
        Self {
            shared,
            reader,
            ticks,
            tracker: ClockTracker::new(sample_rate),
            channels,
            sample_rate,
            epoch,
        }
    }

    /// Fill `dst` with the next period of interleaved F32 audio. Every
    /// sample of `dst` is always written; the return value is the frame
    /// count delivered (0 when the stream is not playing).
    pub fn pull(&mut self, dst: &mut [f32]) -> usize {
        let now_ns = self.epoch.elapsed().as_nanos() as i64;
        self.pull_at(dst, now_ns)
    }

    pub(crate) fn pull_at(&mut self, dst: &mut [f32], now_ns: i64) -> usize {
        let frames = dst.len() / self.channels;
        if frames == 0 {
            dst.fill(0.0);
            return 0;
        }

        let state = self.shared.state();
        match state {
            StreamState::Stop | StreamState::SetupProducer => {
                dst.fill(0.0);
                0
            }
            StreamState::SetupConsumer | StreamState::Run | StreamState::KeepAlive => {
                if state == StreamState::SetupConsumer {
                    // Playback begins at the first pull. If the device came
                    // up before the pre-fill completed, publish the deficit
                    // so the producer slews its position; the signed ring
                    // count renders the missing frames as silence.
                    let deficit =
                        self.reader.count() - self.shared.target_start.load(Ordering::Acquire);
                    if deficit < 0 {
                        self.shared
                            .prefill_deficit
                            .store(deficit, Ordering::Release);
                    }
                    self.shared.set_state(StreamState::Run);
                }

                self.reader.consume(Some(&mut dst[..frames * self.channels]), frames);
                dst[frames * self.channels..].fill(0.0);

                if let Step::Desync { slew_frames } = self.tracker.advance(frames as i32, now_ns) {
                    // Running behind the wall clock: discard to catch up.
                    // The position jump lands in the next tick, where the
                    // producer spots it and resets the controller.
                    if slew_frames > 0 {
                        self.reader.consume(None, slew_frames as usize);
                    }
                }
                self.tracker.add_position(frames as i64);

                self.ticks.push(Tick {
                    period_frames: self.tracker.period_frames(),
                    next_time: self.tracker.next_time(),
                    next_position: self.tracker.next_position(),
                });

                if state == StreamState::KeepAlive {
                    let expiry = -(KEEP_ALIVE_EXPIRY_SEC * self.sample_rate as i64);
                    if self.reader.count() <= expiry {
                        // Only the flag flips here; the producer tears the
                        // stream down on its next entry.
                        self.shared.set_state(StreamState::Stop);
                    }
                }
                frames
            }
        }
    }

    /// Signed ring count, frames (diagnostic).
    pub fn buffered_frames(&self) -> i64 {
        self.reader.count()
    }
}
