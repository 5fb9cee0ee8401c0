// softkvm — host-side companion for a GPU-passthrough VM.
//
// A hotkey grabs the local keyboard/mouse/audio and bridges them to the
// guest over a remote-desktop-style protocol while the shared display is
// switched between host and guest. This crate implements the hard part of
// that bridge: the adaptive audio playback pipeline. Input grabbing, the
// monitor-control bus and the protocol client are external collaborators
// and are reached only through the seams exposed here:
//
//   protocol client ──► PlaybackEngine::{start,stop,volume,mute,data}
//   audio server    ──► ConsumerHandle::pull / PlaybackEngine::latency_ms
//
// The producer (protocol) thread and the consumer (audio server) thread
// never share locks; they meet through two SPSC rings and a handful of
// atomics. See `playback` for the pipeline itself.

pub mod config;
pub mod device;
pub mod device_cpal;
pub mod playback;

pub use config::Config;
pub use device::{create_device, AudioDevice, DeviceInfo, StreamParams};
pub use playback::consumer::ConsumerHandle;
pub use playback::volume::volume_gain;
pub use playback::{PlaybackEngine, SampleFormat};
