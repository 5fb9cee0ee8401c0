// Second-order PLL tracking one side's clock: the device's pull cadence on
// the audio thread, the guest's push cadence on the producer thread. Each
// side owns its own instance; the only bridge between them is the timing
// ring.

/// PLL loop bandwidth in Hz.
const BANDWIDTH_HZ: f64 = 0.05;

/// Phase error beyond which the clock is declared desynchronized and the
/// position is slewed instead of filtered.
pub const DESYNC_THRESHOLD_SEC: f64 = 0.2;

/// Result of feeding one period into the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// First call after (re)start; estimates seeded from this period.
    First,
    /// The period size changed; phase advanced by the old period length.
    PeriodChange,
    /// Phase-locked update with the filtered error in seconds.
    Locked { error_sec: f64 },
    /// Error exceeded the desync threshold. `slew_frames` has already been
    /// added to the position; the caller must apply the matching ring
    /// adjustment and reset the latency controller.
    Desync { slew_frames: i64 },
}

pub struct ClockTracker {
    sample_rate: f64,
    period_frames: i32,
    period_sec: f64,
    /// Predicted wall time of the next invocation, nanoseconds.
    next_time: i64,
    /// Cumulative frame position at `next_time`. Advanced by the caller via
    /// `add_position`; `advance` only touches it when slewing.
    next_position: i64,
    b: f64,
    c: f64,
    started: bool,
}

impl ClockTracker {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate as f64,
            period_frames: 0,
            period_sec: 0.0,
            next_time: 0,
            next_position: 0,
            b: 0.0,
            c: 0.0,
            started: false,
        }
    }

    /// Feed one observed period: `frames` moved, arriving at `now_ns`.
    pub fn advance(&mut self, frames: i32, now_ns: i64) -> Step {
        if !self.started {
            self.started = true;
            self.period_frames = frames;
            self.period_sec = frames as f64 / self.sample_rate;
            self.next_time = now_ns + (self.period_sec * 1e9) as i64;
            self.refilter();
            return Step::First;
        }

        if frames != self.period_frames {
            // Double-buffered devices request the new size before finishing
            // the old buffer, so this interval still spans the old period.
            self.next_time += (self.period_sec * 1e9) as i64;
            self.period_frames = frames;
            self.period_sec = frames as f64 / self.sample_rate;
            self.refilter();
            return Step::PeriodChange;
        }

        let error = (now_ns - self.next_time) as f64 * 1e-9;
        if error.abs() >= DESYNC_THRESHOLD_SEC {
            let slew_frames = (error * self.sample_rate).round() as i64;
            self.period_sec = self.period_frames as f64 / self.sample_rate;
            self.next_time = now_ns + (self.period_sec * 1e9) as i64;
            self.next_position += slew_frames;
            self.refilter();
            return Step::Desync { slew_frames };
        }

        self.next_time += ((self.b * error + self.period_sec) * 1e9) as i64;
        self.period_sec += self.c * error;
        Step::Locked { error_sec: error }
    }

    /// Advance the cumulative position; the caller passes the frames it
    /// actually moved through the ring this period.
    pub fn add_position(&mut self, frames: i64) {
        self.next_position += frames;
    }

    /// Apply an externally computed slew (startup deficit catch-up).
    pub fn slew_position(&mut self, frames: i64) {
        self.next_position += frames;
    }

    fn refilter(&mut self) {
        let omega = 2.0 * std::f64::consts::PI * BANDWIDTH_HZ * self.period_sec;
        self.b = std::f64::consts::SQRT_2 * omega;
        self.c = omega * omega;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn period_frames(&self) -> i32 {
        self.period_frames
    }

    pub fn period_sec(&self) -> f64 {
        self.period_sec
    }

    pub fn next_time(&self) -> i64 {
        self.next_time
    }

    pub fn next_position(&self) -> i64 {
        self.next_position
    }

    /// Loop filter coefficients, shared with the latency controller's offset
    /// filter.
    pub fn coeffs(&self) -> (f64, f64) {
        (self.b, self.c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48_000;
    const PERIOD: i32 = 480;
    const PERIOD_NS: i64 = 10_000_000;

    fn run_steady(tracker: &mut ClockTracker, start_ns: i64, periods: i64) -> i64 {
        let mut now = start_ns;
        for _ in 0..periods {
            tracker.advance(PERIOD, now);
            tracker.add_position(PERIOD as i64);
            now += PERIOD_NS;
        }
        now
    }

    #[test]
    fn first_call_seeds_estimates() {
        let mut t = ClockTracker::new(SR);
        assert_eq!(t.advance(PERIOD, 1_000_000), Step::First);
        t.add_position(PERIOD as i64);
        assert_eq!(t.period_frames(), PERIOD);
        assert!((t.period_sec() - 0.01).abs() < 1e-12);
        assert_eq!(t.next_time(), 1_000_000 + PERIOD_NS);
        assert_eq!(t.next_position(), PERIOD as i64);
    }

    #[test]
    fn locks_to_a_skewed_clock() {
        let mut t = ClockTracker::new(SR);
        // Real device runs 200 ppm fast: periods arrive slightly early.
        let real_period_ns = (PERIOD_NS as f64 / 1.0002) as i64;
        let mut now = 0i64;
        for _ in 0..8000 {
            t.advance(PERIOD, now);
            t.add_position(PERIOD as i64);
            now += real_period_ns;
        }
        // Estimated period converges to the real one within a few ppm.
        let est = t.period_sec();
        let real = real_period_ns as f64 * 1e-9;
        assert!(
            (est - real).abs() / real < 20e-6,
            "period estimate {est} vs real {real}"
        );
    }

    #[test]
    fn period_change_advances_by_old_period() {
        let mut t = ClockTracker::new(SR);
        let now = run_steady(&mut t, 0, 10);
        let next_before = t.next_time();

        // New period requested; wall-clock interval still spans the old one.
        let step = t.advance(1024, now);
        t.add_position(1024);
        assert_eq!(step, Step::PeriodChange);
        assert_eq!(t.next_time(), next_before + PERIOD_NS);
        assert_eq!(t.period_frames(), 1024);
    }

    #[test]
    fn desync_slews_position() {
        let mut t = ClockTracker::new(SR);
        let now = run_steady(&mut t, 0, 10);
        let pos_before = t.next_position();

        // 0.25 s gap: past the 0.2 s threshold.
        let gap_ns = 250_000_000;
        let step = t.advance(PERIOD, now + gap_ns);
        match step {
            Step::Desync { slew_frames } => {
                // round(0.25 * 48000) within one period of slop from the
                // residual phase error before the jump.
                assert!(
                    (slew_frames - 12_000).abs() <= PERIOD as i64,
                    "slew {slew_frames}"
                );
                assert_eq!(t.next_position(), pos_before + slew_frames);
            }
            other => panic!("expected desync, got {other:?}"),
        }
        // Re-seeded prediction.
        assert_eq!(t.next_time(), now + gap_ns + PERIOD_NS);
    }

    #[test]
    fn small_jitter_stays_locked() {
        let mut t = ClockTracker::new(SR);
        let mut now = 0i64;
        let jitter = [300_000i64, -250_000, 120_000, -90_000];
        for i in 0..2000 {
            let step = t.advance(PERIOD, now + jitter[i % jitter.len()]);
            t.add_position(PERIOD as i64);
            if i > 0 {
                assert!(matches!(step, Step::Locked { .. }), "step {i}: {step:?}");
            }
            now += PERIOD_NS;
        }
    }
}
