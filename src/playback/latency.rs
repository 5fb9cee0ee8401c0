// PI controller converting the measured producer/device offset error into a
// resampling ratio. Runs on the producer thread only; its inputs are the
// producer PLL (filter coefficients, period) and the device position
// interpolated from drained timing ticks.

/// Proportional gain, ratio units per frame of filtered offset error.
const KP: f64 = 0.5e-6;

/// Integral gain.
const KI: f64 = 1.0e-16;

/// Headroom factor applied to the largest period the device may request.
const PERIOD_HEADROOM: f64 = 1.1;

pub struct LatencyController {
    /// Filtered offset error in frames; positive = producer behind target.
    offset_error: f64,
    offset_error_integral: f64,
    ratio_integral: f64,
}

impl LatencyController {
    pub fn new() -> Self {
        Self {
            offset_error: 0.0,
            offset_error_integral: 0.0,
            ratio_integral: 0.0,
        }
    }

    /// Forget all accumulated state. Called after any slew on either side.
    pub fn reset(&mut self) {
        self.offset_error = 0.0;
        self.offset_error_integral = 0.0;
        self.ratio_integral = 0.0;
    }

    /// One PI step. `b`/`c` are the producer PLL's loop coefficients, reused
    /// here to filter the raw offset; `period_sec` is its period estimate.
    /// Returns the resampling ratio (output/input) for this push.
    pub fn update(
        &mut self,
        actual_offset: f64,
        target_offset: f64,
        b: f64,
        c: f64,
        period_sec: f64,
    ) -> f64 {
        let actual_error = -(actual_offset - target_offset);
        let err = actual_error - self.offset_error;
        self.offset_error += b * err + self.offset_error_integral;
        self.offset_error_integral += c * err;
        self.ratio_integral += self.offset_error * period_sec;
        1.0 + KP * self.offset_error + KI * self.ratio_integral
    }

    pub fn offset_error(&self) -> f64 {
        self.offset_error
    }
}

/// Desired steady-state producer lead over the device, in frames.
///
/// When the device is running a smaller period than its maximum, the
/// difference is added on top: during a downshift extra data piles up in the
/// ring, and without the raised target the controller would speed playback
/// up, then underrun hard when the period grows back.
pub fn target_latency_frames(
    device_max_period: i32,
    observed_period: i32,
    buffer_latency_ms: u32,
    sample_rate: u32,
) -> f64 {
    let max_period = device_max_period.max(observed_period) as f64;
    let config = buffer_latency_ms as f64 * sample_rate as f64 / 1000.0;
    let rebound = (device_max_period - observed_period).max(0) as f64;
    PERIOD_HEADROOM * max_period + config + rebound
}

#[cfg(test)]
mod tests {
    use super::*;

    // Coefficients matching a 480-frame period at 48 kHz.
    const B: f64 = 0.004442882938158366;
    const C: f64 = 9.869604401089358e-6;
    const PERIOD_SEC: f64 = 0.01;

    #[test]
    fn behind_target_speeds_up() {
        let mut ctl = LatencyController::new();
        // Producer 500 frames short of target: ratio must exceed 1 so more
        // output frames land in the ring.
        let mut ratio = 1.0;
        for _ in 0..200 {
            ratio = ctl.update(1000.0, 1500.0, B, C, PERIOD_SEC);
        }
        assert!(ratio > 1.0, "ratio {ratio}");
        assert!(ctl.offset_error() > 0.0);
    }

    #[test]
    fn ahead_of_target_slows_down() {
        let mut ctl = LatencyController::new();
        let mut ratio = 1.0;
        for _ in 0..200 {
            ratio = ctl.update(2000.0, 1500.0, B, C, PERIOD_SEC);
        }
        assert!(ratio < 1.0, "ratio {ratio}");
    }

    #[test]
    fn on_target_stays_near_unity() {
        let mut ctl = LatencyController::new();
        let mut ratio = 1.0;
        for _ in 0..1000 {
            ratio = ctl.update(1500.0, 1500.0, B, C, PERIOD_SEC);
        }
        assert!((ratio - 1.0).abs() < 1e-9, "ratio {ratio}");
    }

    #[test]
    fn reset_clears_all_state() {
        let mut ctl = LatencyController::new();
        for _ in 0..50 {
            ctl.update(0.0, 1500.0, B, C, PERIOD_SEC);
        }
        assert!(ctl.offset_error() != 0.0);
        ctl.reset();
        assert_eq!(ctl.offset_error(), 0.0);
        let ratio = ctl.update(1500.0, 1500.0, B, C, PERIOD_SEC);
        assert!((ratio - 1.0).abs() < 1e-12);
    }

    #[test]
    fn target_includes_rebound_margin() {
        // Device max 1024 but currently running 256-frame periods: target
        // carries the full difference so the regrowth cannot underrun.
        let target = target_latency_frames(1024, 256, 12, 48_000);
        let expected = 1.1 * 1024.0 + 12.0 * 48.0 + (1024.0 - 256.0);
        assert!((target - expected).abs() < 1e-9);
    }

    #[test]
    fn target_tracks_oversized_observed_period() {
        let target = target_latency_frames(1024, 2048, 0, 48_000);
        assert!((target - 1.1 * 2048.0).abs() < 1e-9);
    }
}
