// Sinc sample-rate conversion with a per-push ratio. The ratio stays within
// a fraction of a percent of 1.0 once the controller has locked, but can
// swing a few percent during startup transients, so the converter is built
// with ±10% of headroom.
//
// rubato processes fixed-size deinterleaved chunks; incoming packets are an
// arbitrary number of interleaved frames, so a small per-channel FIFO sits
// in front and at most one chunk is held back between pushes.

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};

/// Largest ratio deviation the converter accepts, as output/input.
pub const MAX_RATIO_RELATIVE: f64 = 1.1;

/// Input chunk size in frames. Kept small so the holdback (and therefore the
/// latency contributed by this stage) stays under two milliseconds at 48 kHz.
const CHUNK_FRAMES: usize = 64;

const SINC_LEN: usize = 64;

pub trait Resampler: Send {
    /// Convert `input` (interleaved, whole frames) at `ratio` (output/input)
    /// and append the result to `out`. All input is accepted; up to one
    /// chunk may be held back internally. Returns frames appended.
    fn process(&mut self, input: &[f32], ratio: f64, out: &mut Vec<f32>) -> Result<usize, String>;

    /// Clear internal state without recreating the instance.
    fn reset(&mut self);
}

pub struct SincResampler {
    inner: SincFixedIn<f32>,
    channels: usize,
    /// Per-channel input FIFO, deinterleaved.
    pending: Vec<Vec<f32>>,
    out_bufs: Vec<Vec<f32>>,
}

impl SincResampler {
    pub fn new(channels: usize) -> Result<Self, String> {
        let params = SincInterpolationParameters {
            sinc_len: SINC_LEN,
            f_cutoff: 0.95,
            oversampling_factor: 128,
            interpolation: SincInterpolationType::Cubic,
            window: WindowFunction::Blackman,
        };
        let inner = SincFixedIn::<f32>::new(1.0, MAX_RATIO_RELATIVE, params, CHUNK_FRAMES, channels)
            .map_err(|e| format!("Cannot create resampler: {e}"))?;
        let out_bufs = inner.output_buffer_allocate(true);
        Ok(Self {
            inner,
            channels,
            pending: vec![Vec::new(); channels],
            out_bufs,
        })
    }
}

impl Resampler for SincResampler {
    fn process(&mut self, input: &[f32], ratio: f64, out: &mut Vec<f32>) -> Result<usize, String> {
        let ratio = ratio.clamp(1.0 / MAX_RATIO_RELATIVE, MAX_RATIO_RELATIVE);
        self.inner
            .set_resample_ratio(ratio, true)
            .map_err(|e| format!("Cannot set ratio {ratio}: {e}"))?;

        let frames = input.len() / self.channels;
        for ch in 0..self.channels {
            let fifo = &mut self.pending[ch];
            fifo.reserve(frames);
            for f in 0..frames {
                fifo.push(input[f * self.channels + ch]);
            }
        }

        let mut produced = 0usize;
        while self.pending[0].len() >= CHUNK_FRAMES {
            let chunk: Vec<&[f32]> = self.pending.iter().map(|b| &b[..CHUNK_FRAMES]).collect();
            let (used, generated) = self
                .inner
                .process_into_buffer(&chunk, &mut self.out_bufs, None)
                .map_err(|e| format!("Resampler process failed: {e}"))?;
            debug_assert_eq!(used, CHUNK_FRAMES);

            out.reserve(generated * self.channels);
            for f in 0..generated {
                for ch in 0..self.channels {
                    out.push(self.out_bufs[ch][f]);
                }
            }
            produced += generated;

            for fifo in &mut self.pending {
                fifo.drain(..used);
            }
        }
        Ok(produced)
    }

    fn reset(&mut self) {
        self.inner.reset();
        for fifo in &mut self.pending {
            fifo.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frames: usize, channels: usize) -> Vec<f32> {
        (0..frames * channels)
            .map(|i| {
                let f = (i / channels) as f32;
                (2.0 * std::f32::consts::PI * 440.0 * f / 48_000.0).sin()
            })
            .collect()
    }

    #[test]
    fn unity_ratio_preserves_frame_count() {
        let mut rs = SincResampler::new(2).unwrap();
        let mut out = Vec::new();
        let mut total_in = 0usize;
        let mut total_out = 0usize;
        for _ in 0..50 {
            let input = sine(512, 2);
            total_in += 512;
            total_out += rs.process(&input, 1.0, &mut out).unwrap();
        }
        assert_eq!(out.len(), total_out * 2);
        let diff = total_in as i64 - total_out as i64;
        assert!(diff.abs() < 64, "in {total_in} out {total_out}");
    }

    #[test]
    fn ratio_above_one_produces_more_frames() {
        let mut rs = SincResampler::new(1).unwrap();
        let mut out = Vec::new();
        let mut total_out = 0usize;
        let total_in = 64 * 400;
        for _ in 0..400 {
            total_out += rs.process(&sine(64, 1), 1.01, &mut out).unwrap();
        }
        let measured = total_out as f64 / total_in as f64;
        assert!((measured - 1.01).abs() < 0.005, "measured ratio {measured}");
    }

    #[test]
    fn short_input_is_held_back() {
        let mut rs = SincResampler::new(2).unwrap();
        let mut out = Vec::new();
        // Below one chunk: nothing comes out yet.
        let n = rs.process(&sine(32, 2), 1.0, &mut out).unwrap();
        assert_eq!(n, 0);
        // Completing the chunk releases it.
        let n = rs.process(&sine(32, 2), 1.0, &mut out).unwrap();
        assert!(n > 0);
    }

    #[test]
    fn reset_discards_pending_input() {
        let mut rs = SincResampler::new(1).unwrap();
        let mut out = Vec::new();
        rs.process(&sine(32, 1), 1.0, &mut out).unwrap();
        rs.reset();
        let n = rs.process(&sine(64, 1), 1.0, &mut out).unwrap();
        // Only the post-reset chunk is converted.
        assert!(n <= 70, "produced {n}");
    }

    #[test]
    fn out_of_range_ratio_is_clamped() {
        let mut rs = SincResampler::new(1).unwrap();
        let mut out = Vec::new();
        // Would be rejected by the converter unclamped.
        assert!(rs.process(&sine(128, 1), 2.0, &mut out).is_ok());
        assert!(rs.process(&sine(128, 1), 0.2, &mut out).is_ok());
    }
}
