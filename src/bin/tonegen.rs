// Synthetic producer harness. Drives the playback engine with generated
// S16 packets against the real audio backend — the whole pipeline runs
// (conversion, PLLs, controller, resampler) without a guest attached.
//
// Usage: tonegen [seconds] [frequency_hz]
//   RUST_LOG=debug tonegen 10 440

use std::time::{Duration, Instant};

use crossbeam_channel::tick;

use softkvm::{create_device, Config, PlaybackEngine, SampleFormat};

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u8 = 2;
const PACKET_FRAMES: usize = 480;
const AMPLITUDE: f64 = 0.2;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let secs: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(5);
    let freq: f64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(440.0);

    let config = Config::load();
    let device = match create_device() {
        Ok(d) => d,
        Err(e) => {
            log::error!("No audio backend: {e}");
            std::process::exit(1);
        }
    };

    let mut engine = PlaybackEngine::new(config, device);
    engine.set_latency_cb(Box::new(|total, offset, device| {
        log::info!("latency {total}ms total = {offset}ms buffer + {device}ms device");
    }));

    log::info!("Playing {freq}Hz for {secs}s");
    engine.start(CHANNELS, SAMPLE_RATE, SampleFormat::S16, 0);

    // One 10 ms packet per tick, the cadence a guest would produce at.
    let ticker = tick(Duration::from_millis(10));
    let started = Instant::now();
    let step = std::f64::consts::TAU * freq / SAMPLE_RATE as f64;
    let mut phase = 0f64;
    let mut packet = vec![0u8; PACKET_FRAMES * CHANNELS as usize * 2];

    while started.elapsed() < Duration::from_secs(secs) {
        if ticker.recv().is_err() {
            break;
        }
        for f in 0..PACKET_FRAMES {
            let sample = (phase.sin() * AMPLITUDE * 32767.0) as i16;
            phase += step;
            if phase > std::f64::consts::TAU {
                phase -= std::f64::consts::TAU;
            }
            let bytes = sample.to_le_bytes();
            for ch in 0..CHANNELS as usize {
                let i = (f * CHANNELS as usize + ch) * 2;
                packet[i] = bytes[0];
                packet[i + 1] = bytes[1];
            }
        }
        engine.data(&packet);
    }

    engine.stop();
}
