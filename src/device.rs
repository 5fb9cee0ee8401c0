// Audio-server seam. The engine opens a stream against whatever backend the
// host exposes; the backend drives ConsumerHandle::pull from its realtime
// context. Tests substitute a mock that pulls on a scripted clock.

use crate::playback::consumer::ConsumerHandle;

/// Stream parameters requested from the backend.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub channels: u16,
    pub sample_rate: u32,
    /// Requested period size in frames; the device may override it.
    pub period_frames: u32,
    /// Sink name, None for the server default.
    pub sink: Option<String>,
}

/// What the backend actually granted.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    /// Largest period the device may request per pull.
    pub max_period_frames: u32,
    /// Frames the device buffers before playback audibly starts.
    pub start_frames: u32,
}

/// Common interface for audio output backends.
pub trait AudioDevice: Send {
    /// Open the stream and start pulling through `consumer`.
    fn open(&mut self, params: &StreamParams, consumer: ConsumerHandle)
        -> Result<DeviceInfo, String>;

    /// Stop pulling and release the stream. Idempotent.
    fn close(&mut self);

    /// Most recent device-reported playback latency in milliseconds.
    fn latency_ms(&self) -> u64;
}

/// Create the platform audio backend.
pub fn create_device() -> Result<Box<dyn AudioDevice>, String> {
    Ok(Box::new(crate::device_cpal::CpalDevice::new()))
}
