// Adaptive playback engine. Bridges the guest's audio stream to the host
// audio device while two independent PLLs estimate each side's clock and a
// PI controller turns the measured offset into a resampling ratio.
//
// Producer thread (protocol client): start/stop/volume/mute/data.
// Consumer thread (audio server): ConsumerHandle::pull, driven by the
// device; created here, handed to the backend at stream open.
//
// Data flow per push: S16 packet → F32 with gain → resample at the
// controller's ratio → sample ring. The consumer pulls from the ring and
// publishes one timing tick per period; the producer drains those ticks to
// interpolate the device position it measures its offset against.

pub mod clock;
pub mod consumer;
pub mod latency;
pub mod resampler;
pub mod sample_ring;
pub mod timing_ring;
pub mod volume;


use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::device::{AudioDevice, StreamParams};
use clock::{ClockTracker, Step};
use consumer::{ConsumerHandle, StreamShared, StreamState, KEEP_ALIVE_EXPIRY_SEC};
use latency::{target_latency_frames, LatencyController};
use resampler::{Resampler, SincResampler, MAX_RATIO_RELATIVE};
use sample_ring::{sample_ring, SampleReader, SampleWriter};
use timing_ring::{timing_ring, TickReceiver, TickSender};
use volume::{convert_s16, volume_gain, MAX_CHANNELS};

/// Sample formats the protocol can negotiate. Guests produce S16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
}

/// Invoked about every eighth data push with (total, offset, device)
/// latency in milliseconds; total = offset + device.
pub type LatencyCallback = Box<dyn FnMut(u64, u64, u64) + Send>;

const LATENCY_CB_INTERVAL: u64 = 8;

/// Everything allocated for one open stream. Dropped on teardown, retained
/// across RUN→KEEP_ALIVE→RUN cycles.
struct Stream {
    shared: Arc<StreamShared>,
    writer: SampleWriter,
    ticks: TickReceiver,
    /// Consumer half, parked until the device is opened at the first push.
    pending_consumer: Option<(SampleReader, TickSender)>,
    tracker: ClockTracker,
    controller: LatencyController,
    resampler: Box<dyn Resampler>,
    channels: usize,
    sample_rate: u32,

    // Device timeline snapshot, updated only while draining the timing
    // ring so the interpolation below always sees a coherent pair.
    dev_last_time: i64,
    dev_last_pos: i64,
    dev_next_time: i64,
    dev_next_pos: i64,
    dev_period: i32,
    dev_ticks: u64,
    dropped_ticks: u64,
    device_max_period: i32,

    convert_buf: Vec<f32>,
    resample_buf: Vec<f32>,
    push_count: u64,
    last_offset: f64,
    last_target: f64,
    last_ratio: f64,
}

/// Producer-side engine. All methods are called from the protocol client's
/// thread; none of them return errors — failures log, drive the state
/// machine, and recover on the next start.
pub struct PlaybackEngine {
    config: Config,
    device: Box<dyn AudioDevice>,
    epoch: Instant,
    latency_cb: Option<LatencyCallback>,
    gains: [f32; MAX_CHANNELS],
    muted: bool,
    record_format: Option<(u8, u32)>,
    stream: Option<Stream>,
    resampler_resets: u64,
}

impl PlaybackEngine {
    pub fn new(config: Config, device: Box<dyn AudioDevice>) -> Self {
        Self {
            config,
            device,
            epoch: Instant::now(),
            latency_cb: None,
            gains: [1.0; MAX_CHANNELS],
            muted: false,
            record_format: None,
            stream: None,
            resampler_resets: 0,
        }
    }

    /// Register the periodic latency feedback callback.
    pub fn set_latency_cb(&mut self, cb: LatencyCallback) {
        self.latency_cb = Some(cb);
    }

    fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    /// (Re)start the stream for a new guest format. `timestamp` is the
    /// guest's stream start time; playback alignment is adaptive, so it is
    /// only logged.
    pub fn start(&mut self, channels: u8, sample_rate: u32, format: SampleFormat, timestamp: u32) {
        self.reconcile_consumer_stop();
        match format {
            SampleFormat::S16 => {}
        }
        if channels == 0 || channels as usize > MAX_CHANNELS || sample_rate == 0 {
            log::warn!("Rejecting playback start: {channels}ch {sample_rate}Hz");
            return;
        }
        log::info!("Playback start: {channels}ch {sample_rate}Hz S16 (guest time {timestamp})");

        // A running stream degrades to KEEP_ALIVE first, exactly as if the
        // client had called stop() before this start.
        if let Some(stream) = &self.stream {
            if stream.shared.state() == StreamState::Run {
                self.stop();
            }
        }

        // Fast path: an identical kept-alive stream resumes on the next
        // data push with no reallocation.
        if let Some(stream) = &self.stream {
            if stream.shared.state() == StreamState::KeepAlive
                && stream.channels == channels as usize
                && stream.sample_rate == sample_rate
            {
                log::debug!("Reusing kept-alive stream");
                return;
            }
        }

        self.teardown();

        let resampler: Box<dyn Resampler> = match SincResampler::new(channels as usize) {
            Ok(r) => Box::new(r),
            Err(e) => {
                // Fatal for this stream: stay in STOP, pull returns zeros.
                log::error!("Cannot start playback: {e}");
                return;
            }
        };

        let shared = StreamShared::new();
        let (writer, reader) = sample_ring(channels as usize, sample_rate as usize);
        let (tick_tx, tick_rx) = timing_ring();
        shared.set_state(StreamState::SetupProducer);

        self.stream = Some(Stream {
            shared,
            writer,
            ticks: tick_rx,
            pending_consumer: Some((reader, tick_tx)),
            tracker: ClockTracker::new(sample_rate),
            controller: LatencyController::new(),
            resampler,
            channels: channels as usize,
            sample_rate,
            dev_last_time: 0,
            dev_last_pos: 0,
            dev_next_time: 0,
            dev_next_pos: 0,
            dev_period: 0,
            dev_ticks: 0,
            dropped_ticks: 0,
            device_max_period: self.config.period_size as i32,
            convert_buf: Vec::new(),
            resample_buf: Vec::new(),
            push_count: 0,
            last_offset: 0.0,
            last_target: 0.0,
            last_ratio: 1.0,
        });
    }

    /// Stop the stream. A running stream is kept alive so an identical
    /// restart is free; a stream still in setup is torn down immediately.
    pub fn stop(&mut self) {
        self.reconcile_consumer_stop();
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match stream.shared.state() {
            StreamState::SetupProducer | StreamState::SetupConsumer => {
                self.teardown();
            }
            StreamState::Run => {
                stream.resampler.reset();
                self.resampler_resets += 1;
                stream.shared.set_state(StreamState::KeepAlive);
                log::debug!("Playback stopped, stream kept alive");
            }
            StreamState::KeepAlive | StreamState::Stop => {}
        }
    }

    /// Cache per-channel volume. Applied from the next data push onward;
    /// cached across restarts.
    pub fn volume(&mut self, channels: u8, volume: &[u16]) {
        for (ch, &v) in volume
            .iter()
            .take((channels as usize).min(MAX_CHANNELS))
            .enumerate()
        {
            self.gains[ch] = volume_gain(v) as f32;
        }
        log::debug!("Volume update for {channels} channels");
    }

    /// Cache the mute flag. Muted pushes still advance the timeline; they
    /// convert to silent frames.
    pub fn mute(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Push one S16 packet from the guest.
    pub fn data(&mut self, data: &[u8]) {
        let now_ns = self.now_ns();
        self.data_at(data, now_ns);
    }

    /// Device-reported playback latency pass-through.
    pub fn latency_ms(&self) -> u64 {
        self.device.latency_ms()
    }

    /// Capture start hook: the format is cached for a future capture path,
    /// nothing is recorded.
    pub fn record_start(&mut self, channels: u8, sample_rate: u32, format: SampleFormat) {
        match format {
            SampleFormat::S16 => {}
        }
        self.record_format = Some((channels, sample_rate));
        log::info!("Capture start: {channels}ch {sample_rate}Hz");
    }

    /// Capture stop hook.
    pub fn record_stop(&mut self) {
        if let Some((channels, sample_rate)) = self.record_format.take() {
            log::info!("Capture stop: {channels}ch {sample_rate}Hz");
        }
    }

    pub(crate) fn data_at(&mut self, data: &[u8], now_ns: i64) {
        self.reconcile_consumer_stop();
        let Some(state) = self.stream.as_ref().map(|s| s.shared.state()) else {
            return;
        };

        match state {
            StreamState::Stop => return,
            StreamState::SetupProducer => {
                if !self.open_device(data) {
                    return;
                }
            }
            StreamState::KeepAlive => {
                if let Some(stream) = self.stream.as_mut() {
                    // Resuming; the stale PLL phase below slews the position
                    // and the owed ring frames cancel against the silence.
                    stream.controller.reset();
                    stream.shared.set_state(StreamState::Run);
                    log::debug!("Resuming kept-alive stream");
                }
            }
            StreamState::SetupConsumer | StreamState::Run => {}
        }

        self.process_push(data, now_ns);
    }

    /// First push: size the startup fill from the packet, open the device,
    /// hand it the consumer half.
    fn open_device(&mut self, data: &[u8]) -> bool {
        let (params, handle, frames) = {
            let Some(stream) = self.stream.as_mut() else {
                return false;
            };
            let frames = data.len() / (stream.channels * 2);
            if frames == 0 {
                return false;
            }
            let Some((reader, tick_tx)) = stream.pending_consumer.take() else {
                log::error!("Consumer half missing at first push");
                return false;
            };
            let handle = ConsumerHandle::new(
                stream.shared.clone(),
                reader,
                tick_tx,
                stream.channels,
                stream.sample_rate,
                self.epoch,
            );
            let params = StreamParams {
                channels: stream.channels as u16,
                sample_rate: stream.sample_rate,
                period_frames: self.config.period_size,
                sink: self.config.sink.clone(),
            };
            (params, handle, frames)
        };

        let info = match self.device.open(&params, handle) {
            Ok(info) => info,
            Err(e) => {
                log::error!("Cannot open audio device: {e}");
                self.teardown();
                return false;
            }
        };

        if let Some(stream) = self.stream.as_mut() {
            stream.device_max_period = info.max_period_frames as i32;
            let target = 2 * frames as i64 + info.start_frames as i64;
            stream.shared.set_target_start(target);
            stream.shared.set_state(StreamState::SetupConsumer);
            log::info!(
                "Stream setup: start fill {target} frames, device period {} max",
                info.max_period_frames
            );
        }
        true
    }

    fn process_push(&mut self, data: &[u8], now_ns: i64) {
        let gains = self.gains;
        let muted = self.muted;
        let buffer_latency_ms = self.config.buffer_latency_ms;

        let mut failed = false;
        let mut cb_offset_ms = None;

        if let Some(stream) = self.stream.as_mut() {
            // Pull the device timeline forward. A position step that does
            // not match the period means the device slewed (or ticks were
            // dropped); accumulated controller state is garbage then.
            while let Some(tick) = stream.ticks.pop() {
                if stream.dev_ticks > 0
                    && tick.next_position - stream.dev_next_pos != tick.period_frames as i64
                {
                    stream.controller.reset();
                }
                stream.dev_last_time = stream.dev_next_time;
                stream.dev_last_pos = stream.dev_next_pos;
                stream.dev_next_time = tick.next_time;
                stream.dev_next_pos = tick.next_position;
                stream.dev_period = tick.period_frames;
                stream.dev_ticks += 1;
            }
            let dropped = stream.ticks.dropped();
            if dropped > stream.dropped_ticks {
                log::warn!(
                    "Timing ring overrun, {} ticks dropped",
                    dropped - stream.dropped_ticks
                );
                stream.dropped_ticks = dropped;
            }

            // Deficit from a device that started pulling before the fill
            // completed; the played silence becomes a position slew.
            let deficit = stream.shared.take_prefill_deficit();
            if deficit != 0 {
                stream.tracker.slew_position(deficit);
                stream.controller.reset();
                log::debug!("Device started {} frames early", -deficit);
            }

            let frames = convert_s16(data, stream.channels, &gains, muted, &mut stream.convert_buf);
            if frames == 0 {
                return;
            }

            // Guest-clock PLL, fed with the packet cadence.
            if let Step::Desync { slew_frames } =
                stream.tracker.advance(frames as i32, now_ns)
            {
                // Producer stalled or its clock jumped. Silence covers the
                // gap; the frames the consumer already took as owed cancel
                // against it, so little of it is audible.
                if slew_frames > 0 {
                    stream.writer.append(None, slew_frames as usize);
                }
                stream.controller.reset();
                log::debug!("Producer desync, slewed {slew_frames} frames");
            }

            // Offset → ratio once the device has published a usable
            // timeline segment.
            let ratio = if stream.dev_ticks >= 2 && stream.dev_next_time > stream.dev_last_time {
                let span = (stream.dev_next_time - stream.dev_last_time) as f64;
                let frac = (now_ns - stream.dev_last_time) as f64 / span;
                let dev_pos = stream.dev_last_pos as f64
                    + (stream.dev_next_pos - stream.dev_last_pos) as f64 * frac;
                let offset = stream.tracker.next_position() as f64 - dev_pos;
                let target = target_latency_frames(
                    stream.device_max_period,
                    stream.dev_period,
                    buffer_latency_ms,
                    stream.sample_rate,
                );
                let (b, c) = stream.tracker.coeffs();
                stream.last_offset = offset;
                stream.last_target = target;
                stream
                    .controller
                    .update(offset, target, b, c, stream.tracker.period_sec())
            } else {
                1.0
            };
            let ratio = ratio.clamp(1.0 / MAX_RATIO_RELATIVE, MAX_RATIO_RELATIVE);
            stream.last_ratio = ratio;

            stream.resample_buf.clear();
            match stream
                .resampler
                .process(&stream.convert_buf, ratio, &mut stream.resample_buf)
            {
                Ok(out_frames) => {
                    stream
                        .writer
                        .append(Some(&stream.resample_buf[..out_frames * stream.channels]), out_frames);
                    stream.tracker.add_position(out_frames as i64);
                }
                Err(e) => {
                    log::error!("Resampler failed, stopping stream: {e}");
                    failed = true;
                }
            }

            if !failed {
                stream.push_count += 1;
                if stream.push_count % LATENCY_CB_INTERVAL == 0 {
                    let offset_ms =
                        (stream.last_offset.max(0.0) * 1000.0 / stream.sample_rate as f64) as u64;
                    cb_offset_ms = Some(offset_ms);
                }
            }
        }

        if failed {
            // Transient failure policy: free everything; the next start
            // rebuilds the stream from scratch.
            self.teardown();
            return;
        }

        if let Some(offset_ms) = cb_offset_ms {
            if let Some(cb) = self.latency_cb.as_mut() {
                let device_ms = self.device.latency_ms();
                cb(offset_ms + device_ms, offset_ms, device_ms);
            }
        }
    }

    /// The consumer marks KEEP_ALIVE expiry by flipping the state to STOP;
    /// the actual teardown happens here, on the producer's next entry.
    fn reconcile_consumer_stop(&mut self) {
        let expired = self
            .stream
            .as_ref()
            .is_some_and(|s| s.shared.state() == StreamState::Stop);
        if expired {
            log::info!("Stream expired after {KEEP_ALIVE_EXPIRY_SEC}s of silence");
            self.teardown();
        }
    }

    /// Free the stream. The device is closed first so the consumer thread
    /// is gone before any buffer it might touch is dropped.
    fn teardown(&mut self) {
        if self.stream.is_none() {
            return;
        }
        self.device.close();
        if let Some(stream) = self.stream.take() {
            stream.shared.set_state(StreamState::Stop);
        }
        log::debug!("Playback stream freed");
    }

    #[cfg(test)]
    pub(crate) fn stream_state(&self) -> StreamState {
        self.stream
            .as_ref()
            .map(|s| s.shared.state())
            .unwrap_or(StreamState::Stop)
    }

    #[cfg(test)]
    pub(crate) fn debug_stats(&self) -> Option<(f64, f64, f64)> {
        self.stream
            .as_ref()
            .map(|s| (s.last_offset, s.last_target, s.last_ratio))
    }

    #[cfg(test)]
    pub(crate) fn shared_handle(&self) -> Option<Arc<StreamShared>> {
        self.stream.as_ref().map(|s| s.shared.clone())
    }

    #[cfg(test)]
    pub(crate) fn ring_generations(&self) -> Option<usize> {
        self.stream.as_ref().map(|s| s.writer.generations())
    }

    #[cfg(test)]
    pub(crate) fn resampler_resets(&self) -> u64 {
        self.resampler_resets
    }

    #[cfg(test)]
    pub(crate) fn ring_count(&self) -> Option<i64> {
        self.stream.as_ref().map(|s| s.writer.count())
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
