//! Bounded reply ring
//!
//! A small blocking ring buffer connecting a socket reader thread to the
//! threads waiting on command replies. The reader never blocks on a full
//! ring; the dispatchers drop a batch of stale replies instead (see the mgmt
//! dispatcher). Waiters block with a deadline and are failed over to
//! [`Error::Closed`] when the owning component shuts down.

use alloc::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Error {
    /// The ring was closed while waiting, or before the call
    Closed,
    /// No element arrived within the deadline
    Timeout,
    /// The ring is at capacity
    Full,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match *self {
            Error::Closed => write!(f, "ring closed"),
            Error::Timeout => write!(f, "ring get timeout"),
            Error::Full => write!(f, "ring full"),
        }
    }
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            inner: Mutex::new(Inner { queue: VecDeque::with_capacity(capacity), closed: false }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Enqueue without blocking
    ///
    /// Fails with [`Error::Full`] at capacity (the element is discarded;
    /// reader threads use [`put_dropping_oldest`](RingBuffer::put_dropping_oldest)
    /// instead), and with [`Error::Closed`] after `close`.
    pub fn put(&self, item: T) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.queue.len() >= self.capacity {
            return Err(Error::Full);
        }

        inner.queue.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Drop the `count` oldest entries, returning how many were removed
    pub fn drop_oldest(&self, count: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = count.min(inner.queue.len());

        inner.queue.drain(..n).for_each(drop);
        n
    }

    /// Enqueue, dropping a batch of the oldest entries first when full
    ///
    /// This is the reader-thread entry point: the reader never stalls on a
    /// full ring, it sheds the stale head instead. Returns how many entries
    /// were shed.
    pub fn put_dropping_oldest(&self, item: T, batch: usize) -> Result<usize, Error> {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return Err(Error::Closed);
        }

        let mut dropped = 0;
        if inner.queue.len() >= self.capacity {
            dropped = batch.max(1).min(inner.queue.len());
            inner.queue.drain(..dropped).for_each(drop);
        }

        inner.queue.push_back(item);
        self.not_empty.notify_one();
        Ok(dropped)
    }

    /// Dequeue with a deadline
    ///
    /// Blocks until an element arrives, the ring is closed, or `timeout`
    /// elapsed.
    pub fn get(&self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(item) = inner.queue.pop_front() {
                return Ok(item);
            }
            if inner.closed {
                return Err(Error::Closed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }

            let (guard, wait) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;

            if wait.timed_out() && inner.queue.is_empty() {
                return if inner.closed { Err(Error::Closed) } else { Err(Error::Timeout) };
            }
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().queue.clear();
    }

    /// Close the ring
    ///
    /// Idempotent. Pending and future `get` calls fail with
    /// [`Error::Closed`]; queued elements are discarded.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();

        inner.closed = true;
        inner.queue.clear();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn put_get_in_order() {
        let ring = RingBuffer::new(4);

        ring.put(1u32).unwrap();
        ring.put(2).unwrap();

        assert_eq!(Ok(1), ring.get(Duration::from_millis(10)));
        assert_eq!(Ok(2), ring.get(Duration::from_millis(10)));
        assert_eq!(Err(Error::Timeout), ring.get(Duration::from_millis(10)));
    }

    #[test]
    fn full_then_drop_oldest() {
        let ring = RingBuffer::new(2);

        ring.put(1u32).unwrap();
        ring.put(2).unwrap();
        assert_eq!(Err(Error::Full), ring.put(3));

        assert_eq!(1, ring.drop_oldest(1));
        ring.put(3).unwrap();

        assert_eq!(Ok(2), ring.get(Duration::from_millis(10)));
        assert_eq!(Ok(3), ring.get(Duration::from_millis(10)));
    }

    #[test]
    fn put_dropping_oldest_sheds_batch() {
        let ring = RingBuffer::new(4);

        for i in 0..4u32 {
            ring.put(i).unwrap();
        }

        // Capacity 4, batch of one quarter would be 1
        assert_eq!(Ok(1), ring.put_dropping_oldest(4, 1));
        assert_eq!(Ok(1), ring.get(Duration::from_millis(10)));
        assert_eq!(Ok(2), ring.get(Duration::from_millis(10)));
        assert_eq!(Ok(3), ring.get(Duration::from_millis(10)));
        assert_eq!(Ok(4), ring.get(Duration::from_millis(10)));
    }

    #[test]
    fn close_unblocks_waiter() {
        let ring = Arc::new(RingBuffer::<u32>::new(2));
        let waiter = ring.clone();

        let handle = thread::spawn(move || waiter.get(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(50));
        ring.close();

        assert_eq!(Err(Error::Closed), handle.join().unwrap());
        assert_eq!(Err(Error::Closed), ring.put(1));
    }

    #[test]
    fn blocked_get_wakes_on_put() {
        let ring = Arc::new(RingBuffer::<u32>::new(2));
        let waiter = ring.clone();

        let handle = thread::spawn(move || waiter.get(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(50));
        ring.put(7).unwrap();

        assert_eq!(Ok(7), handle.join().unwrap());
    }
}
