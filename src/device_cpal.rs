// cpal-backed audio output. The cpal Stream is !Send, so a dedicated thread
// owns it: the thread builds the stream, reports the outcome through a
// bounded channel, then parks until shutdown. The stream's data callback is
// the consumer thread of the playback pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;

use crate::device::{AudioDevice, DeviceInfo, StreamParams};
use crate::playback::consumer::ConsumerHandle;

pub struct CpalDevice {
    shutdown: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for CpalDevice {
    fn open(
        &mut self,
        params: &StreamParams,
        mut consumer: ConsumerHandle,
    ) -> Result<DeviceInfo, String> {
        self.close();
        self.shutdown.store(false, Ordering::Relaxed);

        let (result_tx, result_rx) = bounded::<Result<(), String>>(1);
        let shutdown = self.shutdown.clone();
        let latency = self.latency_ms.clone();
        let channels = params.channels;
        let sample_rate = params.sample_rate;
        let period_frames = params.period_frames;
        let sink = params.sink.clone();

        let handle = thread::Builder::new()
            .name("kvm-audio".into())
            .spawn(move || {
                let result = (|| -> Result<cpal::Stream, String> {
                    let host = cpal::default_host();
                    let device = match &sink {
                        Some(name) => host
                            .output_devices()
                            .map_err(|e| format!("Cannot enumerate output devices: {e}"))?
                            .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                            .ok_or_else(|| format!("Output device '{name}' not found"))?,
                        None => host
                            .default_output_device()
                            .ok_or_else(|| "No audio output device found".to_string())?,
                    };

                    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
                    log::info!(
                        "Audio device: '{dev_name}', {channels}ch {sample_rate}Hz, period {period_frames}"
                    );

                    let config = cpal::StreamConfig {
                        channels,
                        sample_rate: cpal::SampleRate(sample_rate),
                        buffer_size: cpal::BufferSize::Fixed(period_frames),
                    };

                    let stream = device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                                consumer.pull(data);
                                let ts = info.timestamp();
                                if let Some(delay) = ts.playback.duration_since(&ts.callback) {
                                    latency.store(delay.as_millis() as u64, Ordering::Relaxed);
                                }
                            },
                            move |err| {
                                log::error!("Audio stream error: {err}");
                            },
                            None,
                        )
                        .map_err(|e| format!("build_output_stream failed: {e}"))?;

                    stream
                        .play()
                        .map_err(|e| format!("stream.play() failed: {e}"))?;

                    Ok(stream)
                })();

                match result {
                    Ok(stream) => {
                        let _ = result_tx.send(Ok(()));
                        // Park here: this thread owns the stream.
                        while !shutdown.load(Ordering::Relaxed) {
                            thread::park_timeout(Duration::from_millis(100));
                        }
                        drop(stream);
                        log::debug!("Audio thread exiting");
                    }
                    Err(e) => {
                        let _ = result_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| format!("spawn audio thread: {e}"))?;

        result_rx
            .recv()
            .map_err(|_| "Audio thread died before reporting status".to_string())??;
        self.thread = Some(handle);

        // cpal does not report the granted buffer size back; the requested
        // period doubles as the worst-case expectation and the startup fill.
        Ok(DeviceInfo {
            max_period_frames: period_frames,
            start_frames: period_frames,
        })
    }

    fn close(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.shutdown.store(true, Ordering::Relaxed);
            handle.thread().unpark();
            let _ = handle.join();
        }
    }

    fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}
