// Signed-count sample ring (SPSC, interleaved F32 frames).
//
// The count is the difference between everything ever appended and
// everything ever consumed, and it may go negative: a consumer that runs
// ahead of the producer receives silence and the missing frames are "owed".
// Appending while frames are owed pays the debt — late frames are dropped
// rather than stored, because their playback slots have already passed.
// This one rule covers startup pre-fill, producer stalls and the timed
// KEEP_ALIVE exit without any special cases at the call sites.
//
// The consumer side never allocates, locks or spins: `consume` is a pair of
// slice copies plus two atomic accesses. Growth is producer-only; every
// storage generation is kept alive until the ring is dropped so a reader
// holding a stale pointer never dangles.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

struct RingStorage {
    samples: Box<[UnsafeCell<f32>]>,
    /// Frame capacity, always a power of two.
    frame_cap: usize,
}

unsafe impl Send for RingStorage {}
unsafe impl Sync for RingStorage {}

impl RingStorage {
    fn with_frames(channels: usize, frame_cap: usize) -> Arc<Self> {
        debug_assert!(frame_cap.is_power_of_two());
        let samples: Vec<UnsafeCell<f32>> = (0..frame_cap * channels)
            .map(|_| UnsafeCell::new(0.0f32))
            .collect();
        Arc::new(Self {
            samples: samples.into_boxed_slice(),
            frame_cap,
        })
    }

    #[inline]
    fn mask(&self) -> u64 {
        (self.frame_cap - 1) as u64
    }

    /// Copy `src` (interleaved, whole frames) into the ring starting at
    /// logical frame `pos`. Producer only; the caller guarantees the target
    /// region is not readable by the consumer.
    unsafe fn copy_in(&self, channels: usize, pos: u64, src: &[f32]) {
        let frames = src.len() / channels;
        let mut done = 0usize;
        while done < frames {
            let phys = ((pos + done as u64) & self.mask()) as usize;
            let run = (frames - done).min(self.frame_cap - phys);
            std::ptr::copy_nonoverlapping(
                src.as_ptr().add(done * channels),
                self.samples[phys * channels].get(),
                run * channels,
            );
            done += run;
        }
    }

    /// Zero `frames` frames starting at logical frame `pos`. Producer only.
    unsafe fn zero_in(&self, channels: usize, pos: u64, frames: usize) {
        let mut done = 0usize;
        while done < frames {
            let phys = ((pos + done as u64) & self.mask()) as usize;
            let run = (frames - done).min(self.frame_cap - phys);
            std::ptr::write_bytes(self.samples[phys * channels].get(), 0, run * channels);
            done += run;
        }
    }

    /// Copy whole frames out of the ring starting at logical frame `pos`.
    /// Consumer only.
    unsafe fn copy_out(&self, channels: usize, pos: u64, dst: &mut [f32]) {
        let frames = dst.len() / channels;
        let mut done = 0usize;
        while done < frames {
            let phys = ((pos + done as u64) & self.mask()) as usize;
            let run = (frames - done).min(self.frame_cap - phys);
            std::ptr::copy_nonoverlapping(
                self.samples[phys * channels].get() as *const f32,
                dst.as_mut_ptr().add(done * channels),
                run * channels,
            );
            done += run;
        }
    }
}

/// Copy the live logical region `[from, to)` from one storage generation to
/// the next. Only reads the old generation, so a concurrent consumer on the
/// old pointer is unaffected.
fn migrate(old: &RingStorage, new: &RingStorage, channels: usize, mut from: u64, to: u64) {
    while from < to {
        let old_phys = (from & old.mask()) as usize;
        let new_phys = (from & new.mask()) as usize;
        let run = ((to - from) as usize)
            .min(old.frame_cap - old_phys)
            .min(new.frame_cap - new_phys);
        unsafe {
            std::ptr::copy_nonoverlapping(
                old.samples[old_phys * channels].get() as *const f32,
                new.samples[new_phys * channels].get(),
                run * channels,
            );
        }
        from += run as u64;
    }
}

pub struct SampleRing {
    channels: usize,
    /// Total frames ever appended, including late frames dropped while
    /// paying off owed silence.
    appended: CachePadded<AtomicU64>,
    /// Total frames ever consumed, including owed (zero-filled) frames.
    consumed: CachePadded<AtomicU64>,
    /// Current storage generation. The producer publishes a new pointer
    /// *before* the `appended` store that exposes frames living in it; the
    /// consumer loads `appended` before the pointer, so any count it acts on
    /// is backed by the storage it sees.
    storage: AtomicPtr<RingStorage>,
    /// Every generation ever allocated, kept alive until drop. Producer-only
    /// lock, taken on growth.
    generations: Mutex<Vec<Arc<RingStorage>>>,
}

unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    fn count_inner(&self) -> i64 {
        let a = self.appended.load(Ordering::Acquire);
        let c = self.consumed.load(Ordering::Acquire);
        a.wrapping_sub(c) as i64
    }
}

/// Create a ring for `channels`-channel interleaved audio with at least
/// `capacity_frames` frames of storage (rounded up to a power of two).
pub fn sample_ring(channels: usize, capacity_frames: usize) -> (SampleWriter, SampleReader) {
    assert!(channels > 0);
    let cap = capacity_frames.next_power_of_two().max(64);
    let storage = RingStorage::with_frames(channels, cap);
    let ring = Arc::new(SampleRing {
        channels,
        appended: CachePadded::new(AtomicU64::new(0)),
        consumed: CachePadded::new(AtomicU64::new(0)),
        storage: AtomicPtr::new(Arc::as_ptr(&storage) as *mut RingStorage),
        generations: Mutex::new(vec![storage.clone()]),
    });
    (
        SampleWriter {
            ring: ring.clone(),
            current: storage,
        },
        SampleReader { ring },
    )
}

/// Producer half of the ring.
pub struct SampleWriter {
    ring: Arc<SampleRing>,
    current: Arc<RingStorage>,
}

unsafe impl Send for SampleWriter {}

impl SampleWriter {
    /// Signed frame count (negative = silence owed to the consumer).
    pub fn count(&self) -> i64 {
        self.ring.count_inner()
    }

    /// Number of storage generations allocated so far (diagnostic).
    pub fn generations(&self) -> usize {
        self.ring.generations.lock().unwrap().len()
    }

    /// Append `n` frames; `None` appends silence. Never blocks. `frames`
    /// must hold exactly `n * channels` samples when present.
    pub fn append(&mut self, frames: Option<&[f32]>, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(buf) = frames {
            debug_assert_eq!(buf.len(), n * self.ring.channels);
        }

        let channels = self.ring.channels;
        let w = self.ring.appended.load(Ordering::Relaxed);
        let r = self.ring.consumed.load(Ordering::Acquire);

        // Frames whose playback slot has already passed (count < 0) pay the
        // debt instead of being stored.
        let debt = r.saturating_sub(w);
        let skip = debt.min(n as u64) as usize;
        let store = n - skip;

        if store > 0 {
            let start = w + skip as u64;
            let live_after = (w + n as u64).saturating_sub(r);
            let storage = self.ensure_capacity(live_after, r);
            unsafe {
                match frames {
                    Some(buf) => storage.copy_in(channels, start, &buf[skip * channels..]),
                    None => storage.zero_in(channels, start, store),
                }
            }
        }

        self.ring.appended.store(w + n as u64, Ordering::Release);
    }

    /// Grow the storage when the live region would overflow it. Returns the
    /// generation to write into.
    fn ensure_capacity(&mut self, live_frames: u64, read_from: u64) -> Arc<RingStorage> {
        if live_frames as usize <= self.current.frame_cap {
            return self.current.clone();
        }

        let channels = self.ring.channels;
        let new_cap = (live_frames as usize).next_power_of_two();
        let fresh = RingStorage::with_frames(channels, new_cap);

        let w = self.ring.appended.load(Ordering::Relaxed);
        if w > read_from {
            migrate(&self.current, &fresh, channels, read_from, w);
        }

        // Pointer first, counter second: a consumer that observes frames
        // stored in the new generation is guaranteed to also observe the new
        // pointer (it loads the counter before the pointer).
        self.ring
            .storage
            .store(Arc::as_ptr(&fresh) as *mut RingStorage, Ordering::Release);
        self.ring.generations.lock().unwrap().push(fresh.clone());

        log::debug!(
            "sample ring grown: {} -> {} frames",
            self.current.frame_cap,
            new_cap
        );
        self.current = fresh.clone();
        fresh
    }
}

/// Consumer half of the ring. Realtime-safe: no allocation, no locks.
pub struct SampleReader {
    ring: Arc<SampleRing>,
}

unsafe impl Send for SampleReader {}

impl SampleReader {
    /// Signed frame count (negative = silence owed).
    pub fn count(&self) -> i64 {
        self.ring.count_inner()
    }

    /// Consume `n` frames into `dst` (`None` discards). Frames beyond what
    /// the producer has written are delivered as silence and the count goes
    /// negative. `dst` must hold exactly `n * channels` samples.
    pub fn consume(&mut self, dst: Option<&mut [f32]>, n: usize) {
        if n == 0 {
            return;
        }

        let channels = self.ring.channels;
        let r = self.ring.consumed.load(Ordering::Relaxed);
        // Counter before pointer; see `SampleRing::storage`.
        let w = self.ring.appended.load(Ordering::Acquire);
        let storage = unsafe { &*self.ring.storage.load(Ordering::Acquire) };

        let avail = w.saturating_sub(r);
        let real = avail.min(n as u64) as usize;

        if let Some(dst) = dst {
            debug_assert_eq!(dst.len(), n * channels);
            if real > 0 {
                unsafe { storage.copy_out(channels, r, &mut dst[..real * channels]) };
            }
            dst[real * channels..].fill(0.0);
        }

        self.ring.consumed.store(r + n as u64, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(vals: &[f32]) -> Vec<f32> {
        // Mono helper: one sample per frame.
        vals.to_vec()
    }

    #[test]
    fn append_then_consume_preserves_data() {
        let (mut w, mut r) = sample_ring(2, 8);
        let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
        w.append(Some(&data), 6);
        assert_eq!(w.count(), 6);

        let mut out = vec![0.0f32; 12];
        r.consume(Some(&mut out), 6);
        assert_eq!(out, data);
        assert_eq!(r.count(), 0);
    }

    #[test]
    fn silence_append_writes_zeros() {
        let (mut w, mut r) = sample_ring(1, 8);
        w.append(Some(&frames(&[1.0, 2.0])), 2);
        w.append(None, 3);
        let mut out = vec![9.0f32; 5];
        r.consume(Some(&mut out), 5);
        assert_eq!(out, vec![1.0, 2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn underrun_goes_negative_and_zero_fills() {
        let (mut w, mut r) = sample_ring(1, 8);
        w.append(Some(&frames(&[1.0, 2.0])), 2);

        let mut out = vec![7.0f32; 5];
        r.consume(Some(&mut out), 5);
        assert_eq!(out, vec![1.0, 2.0, 0.0, 0.0, 0.0]);
        assert_eq!(r.count(), -3);
    }

    #[test]
    fn late_frames_pay_debt_and_are_dropped() {
        let (mut w, mut r) = sample_ring(1, 8);
        r.consume(None, 4);
        assert_eq!(w.count(), -4);

        // Two late frames: count rises, nothing stored.
        w.append(Some(&frames(&[1.0, 2.0])), 2);
        assert_eq!(w.count(), -2);

        // Pays the rest of the debt and stores the final two frames.
        w.append(Some(&frames(&[3.0, 4.0, 5.0, 6.0])), 4);
        assert_eq!(w.count(), 2);

        let mut out = vec![0.0f32; 2];
        r.consume(Some(&mut out), 2);
        assert_eq!(out, vec![5.0, 6.0]);
    }

    #[test]
    fn discard_advances_count_only() {
        let (mut w, mut r) = sample_ring(1, 8);
        w.append(Some(&frames(&[1.0, 2.0, 3.0])), 3);
        r.consume(None, 2);
        let mut out = vec![0.0f32; 1];
        r.consume(Some(&mut out), 1);
        assert_eq!(out, vec![3.0]);
    }

    #[test]
    fn growth_preserves_live_data() {
        let (mut w, mut r) = sample_ring(1, 64);
        let first: Vec<f32> = (0..60).map(|i| i as f32).collect();
        w.append(Some(&first), 60);

        // Forces at least one growth past the 64-frame initial capacity.
        let second: Vec<f32> = (0..500).map(|i| (1000 + i) as f32).collect();
        w.append(Some(&second), 500);
        assert!(w.generations() > 1);
        assert_eq!(w.count(), 560);

        let mut out = vec![0.0f32; 560];
        r.consume(Some(&mut out), 560);
        assert_eq!(&out[..60], &first[..]);
        assert_eq!(&out[60..], &second[..]);
    }

    #[test]
    fn count_equals_appended_minus_consumed() {
        // Invariant: count + consumed - appended == 0 under any interleaving.
        let (mut w, mut r) = sample_ring(2, 128);
        let mut appended = 0i64;
        let mut consumed = 0i64;
        let mut seed = 0x2545f491u32;
        let scratch = vec![0.5f32; 2 * 4096];
        let mut out = vec![0.0f32; 2 * 4096];

        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let n = (seed % 700) as usize;
            if seed & 1 == 0 {
                w.append(Some(&scratch[..n * 2]), n);
                appended += n as i64;
            } else {
                r.consume(Some(&mut out[..n * 2]), n);
                consumed += n as i64;
            }
            assert_eq!(w.count(), appended - consumed);
        }
    }
}
