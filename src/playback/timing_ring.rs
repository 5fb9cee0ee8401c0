// Fixed 16-slot SPSC queue of device timing ticks.
//
// The audio thread pushes one tick per period; the producer thread drains
// everything on each push. Overruns (producer not draining for >16 periods)
// drop the newest tick and are counted — the only consequence is a delayed
// producer-side correction, which the controller heals on the next drain.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

pub const TIMING_SLOTS: usize = 16;

/// One device period as observed by the consumer: how many frames it moved,
/// and the PLL's prediction of the next wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tick {
    pub period_frames: i32,
    /// Predicted wall time of the next pull, nanoseconds.
    pub next_time: i64,
    /// Cumulative frame position at `next_time`.
    pub next_position: i64,
}

struct TimingShared {
    slots: [UnsafeCell<Tick>; TIMING_SLOTS],
    /// Next slot to read; owned by the drain side.
    head: CachePadded<AtomicUsize>,
    /// Next slot to write; owned by the push side.
    tail: CachePadded<AtomicUsize>,
    dropped: AtomicU64,
}

unsafe impl Send for TimingShared {}
unsafe impl Sync for TimingShared {}

pub fn timing_ring() -> (TickSender, TickReceiver) {
    let shared = Arc::new(TimingShared {
        slots: Default::default(),
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        dropped: AtomicU64::new(0),
    });
    (
        TickSender {
            shared: shared.clone(),
        },
        TickReceiver { shared },
    )
}

/// Push half, owned by the audio thread. Never blocks or allocates.
pub struct TickSender {
    shared: Arc<TimingShared>,
}

unsafe impl Send for TickSender {}

impl TickSender {
    /// Push a tick; if the ring is full the tick is dropped and counted.
    pub fn push(&mut self, tick: Tick) -> bool {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= TIMING_SLOTS {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe {
            *self.shared.slots[tail % TIMING_SLOTS].get() = tick;
        }
        self.shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }
}

/// Drain half, owned by the producer thread.
pub struct TickReceiver {
    shared: Arc<TimingShared>,
}

unsafe impl Send for TickReceiver {}

impl TickReceiver {
    pub fn pop(&mut self) -> Option<Tick> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let tick = unsafe { *self.shared.slots[head % TIMING_SLOTS].get() };
        self.shared.head.store(head.wrapping_add(1), Ordering::Release);
        Some(tick)
    }

    /// Total ticks dropped to overruns since creation.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(n: i64) -> Tick {
        Tick {
            period_frames: 480,
            next_time: n * 10_000_000,
            next_position: n * 480,
        }
    }

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = timing_ring();
        for i in 0..5 {
            assert!(tx.push(tick(i)));
        }
        for i in 0..5 {
            assert_eq!(rx.pop(), Some(tick(i)));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn overrun_drops_newest() {
        let (mut tx, mut rx) = timing_ring();
        for i in 0..TIMING_SLOTS as i64 {
            assert!(tx.push(tick(i)));
        }
        assert!(!tx.push(tick(99)));
        assert_eq!(rx.dropped(), 1);

        // The oldest ticks survive; the overflowing one is gone.
        for i in 0..TIMING_SLOTS as i64 {
            assert_eq!(rx.pop(), Some(tick(i)));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn wraps_across_many_cycles() {
        let (mut tx, mut rx) = timing_ring();
        for round in 0..100i64 {
            for i in 0..8 {
                assert!(tx.push(tick(round * 8 + i)));
            }
            for i in 0..8 {
                assert_eq!(rx.pop(), Some(tick(round * 8 + i)));
            }
        }
    }

    #[test]
    fn cross_thread_handoff() {
        let (mut tx, mut rx) = timing_ring();
        let writer = std::thread::spawn(move || {
            for i in 0..1000i64 {
                while !tx.push(tick(i)) {
                    std::thread::yield_now();
                }
            }
        });
        let mut expect = 0i64;
        while expect < 1000 {
            if let Some(t) = rx.pop() {
                assert_eq!(t, tick(expect));
                expect += 1;
            }
        }
        writer.join().unwrap();
    }
}
