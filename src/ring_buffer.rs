//! Bounded ingest buffer between the network receiver and the worker thread

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use bytes::Bytes;
use thiserror::Error;

/// One raw network frame with its receive timestamp (monotonic nanoseconds)
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub timestamp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("ingest buffer full, frame dropped")]
pub struct BufferFull;

struct Inner {
    queue: VecDeque<Frame>,
    closed: bool,
}

/// Fixed-capacity frame queue. Enqueue never blocks (a full buffer drops the
/// frame, which the caller counts); dequeue blocks until a frame arrives or
/// the buffer is closed. After close, remaining frames are still drained so
/// shutdown never discards buffered input.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Occupancy as a percentage of capacity
    pub fn fullness_percent(&self) -> f32 {
        self.len() as f32 / self.capacity as f32 * 100.0
    }

    pub fn enqueue(&self, data: Bytes, timestamp: i64) -> Result<(), BufferFull> {
        let mut guard = self.inner.lock().expect("ring buffer lock poisoned");
        if guard.closed || guard.queue.len() >= self.capacity {
            return Err(BufferFull);
        }
        guard.queue.push_back(Frame { data, timestamp });
        drop(guard);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until a frame is available or the buffer is closed and empty.
    pub fn dequeue(&self) -> Option<Frame> {
        let mut guard = self.inner.lock().expect("ring buffer lock poisoned");
        loop {
            if let Some(frame) = guard.queue.pop_front() {
                return Some(frame);
            }
            if guard.closed {
                return None;
            }
            guard = self
                .not_empty
                .wait(guard)
                .expect("ring buffer lock poisoned");
        }
    }

    /// Wakes any blocked consumer; pending frames remain drainable.
    pub fn close(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.closed = true;
        }
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame_data(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 16])
    }

    #[test]
    fn frames_come_out_in_arrival_order() {
        let ring = RingBuffer::new(8);
        ring.enqueue(frame_data(1), 10).unwrap();
        ring.enqueue(frame_data(2), 20).unwrap();

        assert_eq!(ring.dequeue().unwrap().timestamp, 10);
        assert_eq!(ring.dequeue().unwrap().timestamp, 20);
    }

    #[test]
    fn full_buffer_rejects_frames() {
        let ring = RingBuffer::new(2);
        ring.enqueue(frame_data(1), 0).unwrap();
        ring.enqueue(frame_data(2), 0).unwrap();
        assert_eq!(ring.enqueue(frame_data(3), 0), Err(BufferFull));
        assert_eq!(ring.fullness_percent(), 100.0);
    }

    #[test]
    fn close_drains_then_terminates() {
        let ring = RingBuffer::new(8);
        ring.enqueue(frame_data(1), 0).unwrap();
        ring.close();

        assert!(ring.dequeue().is_some());
        assert!(ring.dequeue().is_none());
        assert_eq!(ring.enqueue(frame_data(2), 0), Err(BufferFull));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let ring = Arc::new(RingBuffer::new(8));
        let consumer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.dequeue())
        };

        std::thread::sleep(Duration::from_millis(50));
        ring.close();
        assert!(consumer.join().unwrap().is_none());
    }
}
