// Volume handling. The protocol delivers per-channel u16 volume values; the
// curve mapping them to a linear gain is a compatibility constant measured
// against guest audio hardware — treat the three magic numbers as opaque.
// Gain is applied during S16→F32 conversion on the producer thread, so the
// realtime consumer never touches it.

/// Maximum channels the protocol can address.
pub const MAX_CHANNELS: usize = 8;

/// Map a protocol volume value to a linear gain.
pub fn volume_gain(volume: u16) -> f64 {
    let gain = 9.3234e-7 * 1.000211902f64.powf(volume as f64) - 0.000172787;
    gain.max(0.0)
}

/// Convert S16LE interleaved bytes to F32 frames, applying per-channel gain.
/// Trailing partial frames are ignored. Returns the frame count.
pub fn convert_s16(
    data: &[u8],
    channels: usize,
    gains: &[f32; MAX_CHANNELS],
    muted: bool,
    out: &mut Vec<f32>,
) -> usize {
    let frames = data.len() / (channels * 2);
    out.clear();
    out.reserve(frames * channels);

    if muted {
        out.resize(frames * channels, 0.0);
        return frames;
    }

    for f in 0..frames {
        for ch in 0..channels {
            let i = (f * channels + ch) * 2;
            let s = i16::from_le_bytes([data[i], data[i + 1]]);
            out.push(s as f32 / 32768.0 * gains[ch.min(MAX_CHANNELS - 1)]);
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_endpoints() {
        // Values follow from the curve constants: zero volume lands just
        // below zero and clamps, full volume is within a tenth of a percent
        // of unity.
        assert_eq!(volume_gain(0), 0.0);
        let full = volume_gain(65535);
        assert!((full - 0.99987).abs() < 1e-3, "gain(65535) = {full}");
    }

    #[test]
    fn curve_midpoint() {
        let mid = volume_gain(32768);
        assert!((mid - 7.9287e-4).abs() < 1e-7, "gain(32768) = {mid}");
    }

    #[test]
    fn curve_is_monotonic() {
        let mut prev = volume_gain(0);
        for v in (0..=65535u32).step_by(257) {
            let g = volume_gain(v as u16);
            assert!(g >= prev, "non-monotonic at {v}");
            prev = g;
        }
    }

    #[test]
    fn s16_conversion_scales_and_applies_gain() {
        let mut gains = [1.0f32; MAX_CHANNELS];
        gains[1] = 0.5;
        // Two stereo frames: (16384, -32768), (0, 16384).
        let data: Vec<u8> = [16384i16, -32768, 0, 16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();

        let mut out = Vec::new();
        let frames = convert_s16(&data, 2, &gains, false, &mut out);
        assert_eq!(frames, 2);
        assert_eq!(out, vec![0.5, -0.5, 0.0, 0.25]);
    }

    #[test]
    fn mute_produces_silent_frames() {
        let gains = [1.0f32; MAX_CHANNELS];
        let data = vec![0x55u8; 16];
        let mut out = Vec::new();
        let frames = convert_s16(&data, 2, &gains, true, &mut out);
        assert_eq!(frames, 4);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn partial_trailing_frame_is_dropped() {
        let gains = [1.0f32; MAX_CHANNELS];
        let data = vec![0u8; 10];
        let mut out = Vec::new();
        assert_eq!(convert_s16(&data, 2, &gains, false, &mut out), 2);
    }
}
