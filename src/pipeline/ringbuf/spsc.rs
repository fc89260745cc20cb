use std::sync::Arc;

use super::common::{RingBuffer, RingBufferReader, RingBufferWriter};

/// Creates a ring of `capacity` slots (a power of two) split into its two
/// ends plus an occupancy handle usable from any thread.
pub(crate) fn ringbuffer_spsc<T>(capacity: usize) -> (RingBufferWriterSPSC<T>, RingBufferReaderSPSC<T>, Occupancy<T>) {
    let rb = Arc::new(RingBuffer::new(capacity));
    (
        RingBufferWriterSPSC(RingBufferWriter::new(rb.clone())),
        RingBufferReaderSPSC(RingBufferReader::new(rb.clone())),
        Occupancy(rb),
    )
}

#[repr(transparent)]
pub(crate) struct RingBufferWriterSPSC<T>(RingBufferWriter<T>);

impl<T> RingBufferWriterSPSC<T> {
    pub(crate) fn push(&mut self, t: T) -> Result<(), T> {
        self.0.push(t)
    }
}

#[repr(transparent)]
pub(crate) struct RingBufferReaderSPSC<T>(RingBufferReader<T>);

impl<T> RingBufferReaderSPSC<T> {
    pub(crate) fn pull(&mut self) -> Option<T> {
        self.0.pull()
    }

    pub(crate) fn is_empty(&mut self) -> bool {
        self.0.is_drained()
    }

    /// Drops every element currently visible to the reader. Returns how many.
    pub(crate) fn clear(&mut self) -> usize {
        let mut n = 0;
        while self.pull().is_some() {
            n += 1;
        }
        n
    }
}

#[repr(transparent)]
pub(crate) struct Occupancy<T>(Arc<RingBuffer<T>>);

impl<T> Occupancy<T> {
    pub(crate) fn get(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    // Elements arrive in order across threads
    #[test]
    fn preserves_order() {
        const N: usize = 1_000_000;

        let (mut tx, mut rx, _) = ringbuffer_spsc::<usize>(32);

        let p = std::thread::spawn(move || {
            let mut current = 0;
            while current < N {
                match tx.push(current) {
                    Ok(()) => current += 1,
                    Err(_) => std::thread::yield_now(),
                }
            }
        });

        let c = std::thread::spawn(move || {
            let mut expected = 0;
            while expected < N {
                match rx.pull() {
                    Some(v) => {
                        assert_eq!(v, expected);
                        expected += 1;
                    }
                    None => std::thread::yield_now(),
                }
            }
        });

        p.join().unwrap();
        c.join().unwrap();
    }

    #[test]
    fn full_gives_item_back_and_frees_on_pull() {
        let (mut tx, mut rx, occupancy) = ringbuffer_spsc::<u32>(32);
        for i in 0..32 {
            assert!(tx.push(i).is_ok());
        }
        assert_eq!(occupancy.get(), 32);
        assert_eq!(tx.push(99), Err(99));

        assert_eq!(rx.pull(), Some(0));
        assert_eq!(occupancy.get(), 31);
        assert!(tx.push(32).is_ok());

        assert_eq!(rx.clear(), 32);
        assert!(rx.is_empty());
        assert_eq!(occupancy.get(), 0);
    }

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    struct DropCounter;

    impl DropCounter {
        fn new() -> Self {
            COUNTER.fetch_add(1, Ordering::SeqCst);
            Self
        }
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            COUNTER.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn memcheck() {
        const N: usize = 64;

        let (mut tx, mut rx, occupancy) = ringbuffer_spsc::<DropCounter>(N);
        for _ in 0..N {
            assert!(tx.push(DropCounter::new()).is_ok());
        }
        assert!(tx.push(DropCounter::new()).is_err());
        assert_eq!(COUNTER.load(Ordering::SeqCst), N, "Rejected element must be dropped by the caller");

        // A pulled element is owned by the caller, not the ring
        let pulled = rx.pull().unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), N);
        drop(pulled);
        assert_eq!(COUNTER.load(Ordering::SeqCst), N - 1);

        drop(tx);
        drop(rx);
        assert_eq!(COUNTER.load(Ordering::SeqCst), N - 1, "The occupancy handle keeps the storage alive");
        drop(occupancy);
        assert_eq!(COUNTER.load(Ordering::SeqCst), 0, "Remaining elements dropped with the storage");
    }
}
