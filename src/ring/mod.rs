//! Magic-wrap ring buffer for lock-free, zero-copy sample streaming.
//!
//! A single-producer single-consumer byte ring whose backing pages are
//! mapped twice back to back, so any window of up to `size` bytes is one
//! contiguous slice even when it crosses the wrap point. This removes all
//! branching from the hot path: the producer reserves space with
//! [`RingWriter::write_ptr`], fills it, and commits with
//! [`RingWriter::write_finished`]; the consumer mirrors that with
//! [`RingReader::read_ptr`] / [`RingReader::read_finished`].
//!
//! # Index discipline
//!
//! `head` and `tail` are monotone byte counters with `tail - head` the
//! number of unconsumed bytes, never more than `size`. The consumer
//! normalizes both indices down by `size` once `head` passes `size`, so
//! `head` always stays inside the lower view and `&buffer[head..]` is
//! readable for `tail - head` contiguous bytes. `total_read` and
//! `total_write` count traffic for the stats surface and are never
//! normalized.
//!
//! # Ordering
//!
//! The producer publishes `tail` with release ordering after filling the
//! reservation; the consumer acquires `tail` before dereferencing, which
//! makes the written bytes visible. The symmetric pair on `head` lets the
//! producer reuse consumed space safely.

mod map;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CxError, Result};

struct RingCore {
    base: NonNull<u8>,
    size: usize,
    head: AtomicU64,
    tail: AtomicU64,
    total_read: AtomicU64,
    total_write: AtomicU64,
}

// SAFETY: the mapping lives as long as the core; all index traffic is
// atomic and the raw pointer is only dereferenced inside the SPSC
// reservation discipline.
unsafe impl Send for RingCore {}
// SAFETY: see above; producer and consumer touch disjoint byte ranges.
unsafe impl Sync for RingCore {}

impl RingCore {
    #[inline]
    fn used(&self) -> u64 {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }
}

impl Drop for RingCore {
    fn drop(&mut self) {
        // SAFETY: base came from map::map_ring(size) and is dropped once.
        unsafe { map::unmap_ring(self.base, self.size) };
    }
}

/// The double-mapped SPSC ring buffer.
///
/// Split into a [`RingWriter`] and [`RingReader`] before use; producer and
/// consumer exclusivity is then enforced by ownership. A [`RingStats`]
/// handle stays readable from any thread.
pub struct MagicRingBuffer {
    core: Arc<RingCore>,
}

impl MagicRingBuffer {
    /// Creates a ring of `size` bytes. `size` must be a non-zero multiple
    /// of [`MagicRingBuffer::allocation_granularity`].
    pub fn with_size(size: usize) -> Result<Self> {
        let base = map::map_ring(size)?;
        Ok(Self {
            core: Arc::new(RingCore {
                base,
                size,
                head: AtomicU64::new(0),
                tail: AtomicU64::new(0),
                total_read: AtomicU64::new(0),
                total_write: AtomicU64::new(0),
            }),
        })
    }

    /// The OS allocation granularity ring sizes must be a multiple of.
    pub fn allocation_granularity() -> usize {
        map::allocation_granularity()
    }

    pub fn size(&self) -> usize {
        self.core.size
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            core: Arc::clone(&self.core),
        }
    }

    /// Splits the ring into its producer and consumer halves.
    pub fn split(self) -> (RingWriter, RingReader) {
        let reader = RingReader {
            core: Arc::clone(&self.core),
        };
        (RingWriter { core: self.core }, reader)
    }
}

/// Producer half of a [`MagicRingBuffer`].
pub struct RingWriter {
    core: Arc<RingCore>,
}

impl RingWriter {
    /// Reserves `n` contiguous writable bytes at the current tail, or
    /// `None` when fewer than `n` bytes are free.
    #[inline]
    pub fn write_ptr(&mut self, n: usize) -> Option<&mut [u8]> {
        let core = &*self.core;
        let used = core.used();
        // `used` can transiently exceed `size` while the consumer
        // normalizes indices; treat that window as full.
        if used > core.size as u64 || (core.size as u64 - used) < n as u64 {
            return None;
        }
        let off = (core.tail.load(Ordering::Relaxed) % core.size as u64) as usize;
        // SAFETY: off < size and n <= size, so [off, off + n) lies inside
        // the 2*size double mapping; by the reservation discipline it does
        // not overlap any range handed to the consumer.
        Some(unsafe { std::slice::from_raw_parts_mut(core.base.as_ptr().add(off), n) })
    }

    /// Commits `n` bytes previously reserved with [`Self::write_ptr`].
    #[inline]
    pub fn write_finished(&mut self, n: usize) -> Result<()> {
        let core = &*self.core;
        let used = core.used();
        if used > core.size as u64 || (core.size as u64 - used) < n as u64 {
            return Err(CxError::RingSpaceExhausted {
                requested: n,
                reserved: (core.size as u64).saturating_sub(used) as usize,
            });
        }
        core.total_write.fetch_add(n as u64, Ordering::Relaxed);
        core.tail.fetch_add(n as u64, Ordering::Release);
        Ok(())
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            core: Arc::clone(&self.core),
        }
    }
}

/// Consumer half of a [`MagicRingBuffer`].
pub struct RingReader {
    core: Arc<RingCore>,
}

impl RingReader {
    /// Unconsumed byte count (`tail - head`).
    #[inline]
    pub fn available(&self) -> usize {
        self.core.used() as usize
    }

    /// Returns `n` contiguous readable bytes at the current head, or
    /// `None` when fewer than `n` bytes are pending. `read_ptr(0)` always
    /// succeeds with an empty slice.
    #[inline]
    pub fn read_ptr(&mut self, n: usize) -> Option<&[u8]> {
        let core = &*self.core;
        if core.used() < n as u64 {
            return None;
        }
        let off = core.head.load(Ordering::Relaxed) as usize;
        // SAFETY: head < size (normalization invariant) and n <= size, so
        // [off, off + n) lies inside the double mapping; the producer never
        // writes inside [head, tail).
        Some(unsafe { std::slice::from_raw_parts(core.base.as_ptr().add(off), n) })
    }

    /// Consumes `n` bytes and normalizes the indices once `head` passes
    /// the ring size.
    #[inline]
    pub fn read_finished(&mut self, n: usize) -> Result<()> {
        let core = &*self.core;
        let used = core.used();
        if used < n as u64 {
            return Err(CxError::RingSpaceExhausted {
                requested: n,
                reserved: used as usize,
            });
        }
        core.total_read.fetch_add(n as u64, Ordering::Relaxed);
        let head = core.head.load(Ordering::Relaxed) + n as u64;
        if head >= core.size as u64 {
            // Subtract tail first: a concurrent producer space check can
            // then only see a transiently smaller window, never a larger
            // one.
            core.tail.fetch_sub(core.size as u64, Ordering::AcqRel);
            core.head.store(head - core.size as u64, Ordering::Release);
        } else {
            core.head.store(head, Ordering::Release);
        }
        Ok(())
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            core: Arc::clone(&self.core),
        }
    }
}

/// Shared, read-only view of a ring's counters for the stats surface.
/// Reads are individually atomic with no snapshot guarantee.
#[derive(Clone)]
pub struct RingStats {
    core: Arc<RingCore>,
}

impl RingStats {
    pub fn size(&self) -> usize {
        self.core.size
    }

    pub fn total_read(&self) -> u64 {
        self.core.total_read.load(Ordering::Relaxed)
    }

    pub fn total_write(&self) -> u64 {
        self.core.total_write.load(Ordering::Relaxed)
    }

    /// Bytes written but not yet consumed.
    pub fn difference(&self) -> u64 {
        self.total_write().wrapping_sub(self.total_read())
    }

    /// Fill level in percent of the ring size.
    pub fn difference_pct(&self) -> u64 {
        self.difference() * 100 / self.core.size as u64
    }

    /// Raw head index (tests and diagnostics).
    pub fn head(&self) -> u64 {
        self.core.head.load(Ordering::Relaxed)
    }

    /// Raw tail index (tests and diagnostics).
    pub fn tail(&self) -> u64 {
        self.core.tail.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ring(size: usize) -> (RingWriter, RingReader) {
        MagicRingBuffer::with_size(size).unwrap().split()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (mut w, mut r) = ring(4096);
        let buf = w.write_ptr(11).unwrap();
        buf.copy_from_slice(b"hello rings");
        w.write_finished(11).unwrap();

        assert_eq!(r.available(), 11);
        assert_eq!(r.read_ptr(11).unwrap(), b"hello rings");
        r.read_finished(11).unwrap();
        assert_eq!(r.available(), 0);
    }

    #[test]
    fn contiguous_across_the_wrap() {
        let size = 4096;
        let (mut w, mut r) = ring(size);

        // Park head/tail close to the end of the lower view.
        let n = size - 64;
        w.write_ptr(n).unwrap();
        w.write_finished(n).unwrap();
        r.read_ptr(n).unwrap();
        r.read_finished(n).unwrap();

        // This reservation crosses the wrap; it must still be one slice.
        let pattern: Vec<u8> = (0..128u32).map(|i| i as u8).collect();
        let buf = w.write_ptr(128).unwrap();
        buf.copy_from_slice(&pattern);
        w.write_finished(128).unwrap();

        assert_eq!(r.read_ptr(128).unwrap(), &pattern[..]);
        r.read_finished(128).unwrap();
    }

    #[test]
    fn capacity_boundary() {
        let size = 4096;
        let (mut w, mut r) = ring(size);

        // Exactly size bytes fit with no intervening read.
        assert!(w.write_ptr(size).is_some());
        w.write_finished(size).unwrap();
        // One more byte does not.
        assert!(w.write_ptr(1).is_none());
        assert!(w.write_finished(1).is_err());

        r.read_ptr(size).unwrap();
        r.read_finished(size).unwrap();
        // size + 1 can never fit.
        assert!(w.write_ptr(size + 1).is_none());
    }

    #[test]
    fn commit_without_reservation_fails() {
        let size = 4096;
        let (mut w, _r) = ring(size);
        w.write_ptr(size).unwrap();
        w.write_finished(size).unwrap();
        assert!(matches!(
            w.write_finished(1),
            Err(CxError::RingSpaceExhausted { .. })
        ));
    }

    #[test]
    fn zero_length_read_always_succeeds() {
        let (_w, mut r) = ring(4096);
        assert_eq!(r.read_ptr(0).unwrap().len(), 0);
    }

    #[test]
    fn wrap_patterns_and_index_bounds() {
        use rand::{Rng, SeedableRng};

        // Write/read two distinct 50000-byte patterns through a 65536
        // ring and confirm the indices stay normalized.
        let size = 65536;
        let (mut w, mut r) = ring(size);
        let stats = w.stats();

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x0C0FFEE);
        let mut p1 = vec![0u8; 50000];
        let mut p2 = vec![0u8; 50000];
        rng.fill(&mut p1[..]);
        rng.fill(&mut p2[..]);

        w.write_ptr(p1.len()).unwrap().copy_from_slice(&p1);
        w.write_finished(p1.len()).unwrap();
        assert_eq!(r.read_ptr(p1.len()).unwrap(), &p1[..]);
        r.read_finished(p1.len()).unwrap();

        w.write_ptr(p2.len()).unwrap().copy_from_slice(&p2);
        w.write_finished(p2.len()).unwrap();
        assert_eq!(r.read_ptr(p2.len()).unwrap(), &p2[..]);
        r.read_finished(p2.len()).unwrap();

        assert!(stats.head() <= 2 * size as u64);
        assert!(stats.tail() <= 2 * size as u64);
        assert_eq!(stats.total_write(), 100_000);
        assert_eq!(stats.total_read(), 100_000);
    }

    #[test]
    fn spsc_stream_preserves_order_and_content() {
        const TOTAL: usize = 1 << 22;
        const CHUNK: usize = 4096;
        let (mut w, mut r) = ring(65536);

        let producer = thread::spawn(move || {
            let mut value = 0u8;
            let mut sent = 0usize;
            while sent < TOTAL {
                match w.write_ptr(CHUNK) {
                    Some(buf) => {
                        for b in buf.iter_mut() {
                            *b = value;
                            value = value.wrapping_add(1);
                        }
                        w.write_finished(CHUNK).unwrap();
                        sent += CHUNK;
                    }
                    None => thread::yield_now(),
                }
            }
        });

        let mut expected = 0u8;
        let mut received = 0usize;
        while received < TOTAL {
            let n = r.available().min(TOTAL - received);
            if n == 0 {
                thread::yield_now();
                continue;
            }
            let data = r.read_ptr(n).unwrap();
            for &b in data {
                assert_eq!(b, expected, "byte {} out of order", received);
                expected = expected.wrapping_add(1);
            }
            r.read_finished(n).unwrap();
            received += n;
        }

        producer.join().unwrap();
    }
}
