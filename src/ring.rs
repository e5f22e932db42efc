// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Virtual ring buffer.
//!
//! The backing storage is mapped twice at adjacent virtual addresses, so any
//! run of up to `capacity` contiguous bytes can be produced or consumed
//! without wrap handling: a write starting near the end of the first mapping
//! simply continues into the second, which aliases the start of the storage.
//!
//! Access protocol (single producer, single consumer, shared behind a
//! mutex): reserve a view under the lock, copy the payload outside the lock,
//! commit under the lock. The producer only ever touches
//! `[rear, rear + free)`, the consumer only `[front, front + fill)`, so the
//! unlocked copies cannot overlap.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("failed to allocate ring storage: {0}")]
    Alloc(#[source] io::Error),
}

/// Snapshot of the fill-level accounting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillStats {
    /// Highest fill ever observed (bytes).
    pub max_fill: usize,
    /// Buffer capacity (bytes).
    pub capacity: usize,
    /// Mean fill fraction over all enqueue attempts.
    pub mean_fraction: f64,
}

pub struct VirtualRing {
    base: *mut u8,
    capacity: usize,
    front: usize,
    rear: usize,
    fill: usize,
    max_fill: usize,
    fill_sum: f64,
    fill_samples: u64,
}

// SAFETY: the raw base pointer is just an address into a mapping owned by
// the ring; the ring itself is only ever accessed under an external mutex.
unsafe impl Send for VirtualRing {}

fn errno() -> io::Error {
    io::Error::last_os_error()
}

impl VirtualRing {
    /// Allocate a ring of at least `min_size` bytes, rounded up to a whole
    /// number of pages, and map it twice back to back.
    ///
    /// The storage is an anonymous memfd: it never has a filesystem name and
    /// the descriptor is closed as soon as the mappings exist.
    pub fn with_min_size(min_size: usize) -> Result<Self, RingError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let capacity = (min_size + page - 1) / page * page;

        let fd = unsafe {
            libc::memfd_create(
                b"udprec-ring\0".as_ptr().cast(),
                libc::MFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(RingError::Alloc(errno()));
        }
        // SAFETY: freshly created descriptor, not owned elsewhere.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), capacity as libc::off_t) } != 0 {
            return Err(RingError::Alloc(errno()));
        }

        // Reserve a 2*capacity window first, then overlay both halves with
        // shared mappings of the same storage.
        let window = unsafe {
            libc::mmap(
                ptr::null_mut(),
                2 * capacity,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if window == libc::MAP_FAILED {
            return Err(RingError::Alloc(errno()));
        }

        for half in 0..2 {
            // SAFETY: `window` covers 2*capacity bytes that belong to this
            // reservation; MAP_FIXED replaces exactly one half of it.
            let want = unsafe { window.cast::<u8>().add(half * capacity) };
            let got = unsafe {
                libc::mmap(
                    want.cast(),
                    capacity,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_FIXED | libc::MAP_SHARED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if got == libc::MAP_FAILED || got != want.cast() {
                let err = errno();
                unsafe { libc::munmap(window, 2 * capacity) };
                return Err(RingError::Alloc(err));
            }
        }

        // The mappings keep the storage alive; the descriptor can go.
        drop(fd);

        Ok(Self {
            base: window.cast(),
            capacity,
            front: 0,
            rear: 0,
            fill: 0,
            max_fill: 0,
            fill_sum: 0.0,
            fill_samples: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Address where `len` bytes can be deposited contiguously, or `None`
    /// when the buffer cannot take them. Pure: no state change.
    pub fn write_view(&self, len: usize) -> Option<*mut u8> {
        if self.fill + len > self.capacity {
            None
        } else {
            // SAFETY: rear < capacity and the double mapping makes
            // [rear, rear + capacity) addressable.
            Some(unsafe { self.base.add(self.rear) })
        }
    }

    /// Account for `len` bytes deposited at the last `write_view` address.
    pub fn commit_write(&mut self, len: usize) {
        debug_assert!(self.fill + len <= self.capacity);
        self.rear = (self.rear + len) % self.capacity;
        self.fill += len;
        if self.fill > self.max_fill {
            self.max_fill = self.fill;
        }
    }

    /// Address of the oldest byte, or `None` when the ring is empty. Up to
    /// `fill()` bytes are readable contiguously from it.
    pub fn read_view(&self) -> Option<*const u8> {
        if self.fill == 0 {
            None
        } else {
            // SAFETY: front < capacity; see write_view.
            Some(unsafe { self.base.add(self.front).cast_const() })
        }
    }

    /// Release `len` bytes from the front of the ring.
    pub fn commit_read(&mut self, len: usize) {
        debug_assert!(len <= self.fill);
        self.front = (self.front + len) % self.capacity;
        self.fill -= len;
    }

    /// Record one fill-level sample. Called once per enqueue attempt, before
    /// the attempt, so the mean covers drops as well.
    pub fn note_fill_sample(&mut self) {
        self.fill_sum += self.fill as f64 / self.capacity as f64;
        self.fill_samples += 1;
    }

    pub fn fill_stats(&self) -> FillStats {
        FillStats {
            max_fill: self.max_fill,
            capacity: self.capacity,
            mean_fraction: if self.fill_samples == 0 {
                0.0
            } else {
                self.fill_sum / self.fill_samples as f64
            },
        }
    }

    /// Restart the fill-level accounting (new output file).
    pub fn reset_fill_stats(&mut self) {
        self.max_fill = 0;
        self.fill_sum = 0.0;
        self.fill_samples = 0;
    }
}

impl Drop for VirtualRing {
    fn drop(&mut self) {
        // SAFETY: base covers the whole 2*capacity window mapped above.
        unsafe {
            libc::munmap(self.base.cast(), 2 * self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bytes(ring: &mut VirtualRing, data: &[u8]) -> bool {
        match ring.write_view(data.len()) {
            None => false,
            Some(ptr) => {
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
                ring.commit_write(data.len());
                true
            }
        }
    }

    fn read_bytes(ring: &mut VirtualRing, len: usize) -> Vec<u8> {
        let ptr = ring.read_view().expect("data available");
        let out = unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec();
        ring.commit_read(len);
        out
    }

    #[test]
    fn test_capacity_rounded_to_page() {
        let ring = VirtualRing::with_min_size(1).unwrap();
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        assert_eq!(ring.capacity(), page);

        let ring = VirtualRing::with_min_size(page + 1).unwrap();
        assert_eq!(ring.capacity(), 2 * page);
    }

    #[test]
    fn test_double_mapping_aliases() {
        let ring = VirtualRing::with_min_size(1).unwrap();
        let cap = ring.capacity();
        let base = ring.write_view(1).unwrap();
        for k in [0usize, 1, cap / 2, cap - 1] {
            unsafe {
                base.add(k).write((k % 251) as u8);
                assert_eq!(base.add(k).read(), base.add(k + cap).read());
            }
        }
    }

    #[test]
    fn test_write_read_across_wrap() {
        let mut ring = VirtualRing::with_min_size(1).unwrap();
        let cap = ring.capacity();

        // Park front/rear near the end so the next record straddles the
        // physical wrap point.
        let pad = vec![0u8; cap - 3];
        assert!(write_bytes(&mut ring, &pad));
        assert_eq!(read_bytes(&mut ring, cap - 3), pad);

        let record: Vec<u8> = (0u8..=9).collect();
        assert!(write_bytes(&mut ring, &record));
        assert_eq!(ring.fill(), 10);
        assert_eq!(read_bytes(&mut ring, 10), record);
        assert_eq!(ring.fill(), 0);
    }

    #[test]
    fn test_rejects_when_full() {
        let mut ring = VirtualRing::with_min_size(1).unwrap();
        let cap = ring.capacity();
        assert!(write_bytes(&mut ring, &vec![7u8; cap]));
        assert!(ring.write_view(1).is_none());
        ring.commit_read(1);
        assert!(ring.write_view(1).is_some());
        assert!(ring.write_view(2).is_none());
    }

    #[test]
    fn test_fill_accounting() {
        let mut ring = VirtualRing::with_min_size(1).unwrap();
        ring.note_fill_sample();
        assert!(write_bytes(&mut ring, &[1, 2, 3, 4]));
        ring.note_fill_sample();
        let stats = ring.fill_stats();
        assert_eq!(stats.max_fill, 4);
        let expected = (4.0 / ring.capacity() as f64) / 2.0;
        assert!((stats.mean_fraction - expected).abs() < 1e-12);

        ring.reset_fill_stats();
        let stats = ring.fill_stats();
        assert_eq!(stats.max_fill, 0);
        assert_eq!(stats.mean_fraction, 0.0);
    }
}
