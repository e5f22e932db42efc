//! Ring buffer laws: fill accounting under arbitrary interleavings,
//! double-mapped aliasing, and ordered hand-off between two real threads.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use proptest::prelude::*;

use udprec::ring::VirtualRing;

fn push(ring: &mut VirtualRing, data: &[u8]) -> bool {
    match ring.write_view(data.len()) {
        None => false,
        Some(ptr) => {
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
            ring.commit_write(data.len());
            true
        }
    }
}

fn pop(ring: &mut VirtualRing, len: usize) -> Vec<u8> {
    let ptr = ring.read_view().expect("data available");
    let out = unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec();
    ring.commit_read(len);
    out
}

#[test]
fn double_mapping_aliases_every_offset() {
    let ring = VirtualRing::with_min_size(1).unwrap();
    let cap = ring.capacity();
    let base = ring.write_view(0).expect("empty ring always has a view");
    for offset in 0..cap {
        unsafe {
            base.add(offset).write((offset % 251) as u8);
        }
    }
    for offset in 0..cap {
        unsafe {
            assert_eq!(
                base.add(offset).read(),
                base.add(offset + cap).read(),
                "offset {}",
                offset
            );
        }
    }
}

proptest! {
    /// Random interleavings of record writes and reads: the bytes coming
    /// out are exactly the bytes that went in, in order, and the fill level
    /// always equals bytes-in minus bytes-out.
    #[test]
    fn interleaved_writes_and_reads_preserve_bytes(
        ops in proptest::collection::vec((any::<bool>(), 1usize..2000), 1..200)
    ) {
        let mut ring = VirtualRing::with_min_size(8192).unwrap();
        let mut model: VecDeque<u8> = VecDeque::new();
        let mut next_byte = 0u8;

        for (is_write, size) in ops {
            if is_write {
                let record: Vec<u8> = (0..size)
                    .map(|_| {
                        next_byte = next_byte.wrapping_add(1);
                        next_byte
                    })
                    .collect();
                if push(&mut ring, &record) {
                    model.extend(&record);
                } else {
                    // Full: the model must agree that it does not fit.
                    prop_assert!(model.len() + size > ring.capacity());
                }
            } else {
                let take = size.min(ring.fill());
                if take > 0 {
                    let got = pop(&mut ring, take);
                    let want: Vec<u8> = model.drain(..take).collect();
                    prop_assert_eq!(got, want);
                }
            }
            prop_assert_eq!(ring.fill(), model.len());
        }
    }
}

/// Two threads around a mutex-guarded ring, length-prefixed records, the
/// reserve/copy-outside-the-lock/commit protocol on both sides. Every
/// record must come out intact and in order.
#[test]
fn spsc_threads_preserve_record_order() {
    struct Shared {
        ring: Mutex<VirtualRing>,
        space: Condvar,
        data: Condvar,
    }

    let shared = Arc::new(Shared {
        ring: Mutex::new(VirtualRing::with_min_size(16 * 1024).unwrap()),
        space: Condvar::new(),
        data: Condvar::new(),
    });
    const RECORDS: usize = 2_000;

    let producer = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            for seq in 0..RECORDS {
                let len = 3 + (seq * 37) % 900;
                let mut record = Vec::with_capacity(len + 2);
                record.extend_from_slice(&(len as u16).to_le_bytes());
                record.extend((0..len).map(|i| ((seq + i) % 256) as u8));

                let dst = {
                    let mut ring = shared.ring.lock().unwrap();
                    loop {
                        match ring.write_view(record.len()) {
                            Some(dst) => break dst,
                            None => ring = shared.space.wait(ring).unwrap(),
                        }
                    }
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(record.as_ptr(), dst, record.len())
                };
                shared.ring.lock().unwrap().commit_write(record.len());
                shared.data.notify_all();
            }
        })
    };

    let consumer = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            for seq in 0..RECORDS {
                // Wait for the 2-byte header.
                let mut header = [0u8; 2];
                {
                    let mut ring = shared.ring.lock().unwrap();
                    while ring.fill() < 2 {
                        ring = shared.data.wait(ring).unwrap();
                    }
                    let src = ring.read_view().unwrap();
                    unsafe { std::ptr::copy_nonoverlapping(src, header.as_mut_ptr(), 2) };
                }
                let len = u16::from_le_bytes(header) as usize;

                let record = {
                    let mut ring = shared.ring.lock().unwrap();
                    while ring.fill() < 2 + len {
                        ring = shared.data.wait(ring).unwrap();
                    }
                    let src = ring.read_view().unwrap();
                    let bytes =
                        unsafe { std::slice::from_raw_parts(src, 2 + len) }.to_vec();
                    ring.commit_read(2 + len);
                    bytes
                };
                shared.space.notify_all();

                let want_len = 3 + (seq * 37) % 900;
                assert_eq!(len, want_len, "record {} length", seq);
                for (i, byte) in record[2..].iter().enumerate() {
                    assert_eq!(*byte, ((seq + i) % 256) as u8, "record {} byte {}", seq, i);
                }
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
}
