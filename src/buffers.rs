//! Audio buffering primitives.
//!
//! [`ByteRing`] carries continuous PCM between the platform audio
//! callbacks and the streaming tasks: the callback side uses the
//! non-blocking `try_*` methods, the task side the async deadline
//! variants. [`MessageQueue`] is the byte-bounded speaker queue; unlike a
//! plain byte stream it preserves message boundaries, so one received
//! message is decoded as one unit.
//!
//! Both are single-producer/single-consumer in practice, but nothing
//! breaks if a second caller shows up; everything is behind one mutex.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

// ═══════════════════════════════════════════════════════════════════════
//  ByteRing
// ═══════════════════════════════════════════════════════════════════════

/// Fixed-capacity byte ring.
pub struct ByteRing {
    inner: Mutex<VecDeque<u8>>,
    capacity: usize,
    /// Signaled when bytes are written.
    data: Notify,
    /// Signaled when space is freed.
    space: Notify,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        ByteRing {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            data: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all buffered bytes.
    pub fn reset(&self) {
        self.inner.lock().unwrap().clear();
        self.space.notify_waiters();
    }

    /// Write what fits, return the number of bytes accepted. Safe to call
    /// from an audio capture callback.
    pub fn try_write(&self, bytes: &[u8]) -> usize {
        let accepted = {
            let mut ring = self.inner.lock().unwrap();
            let n = bytes.len().min(self.capacity - ring.len());
            ring.extend(&bytes[..n]);
            n
        };
        if accepted > 0 {
            self.data.notify_waiters();
        }
        accepted
    }

    /// Read what is available, return the number of bytes copied. Safe to
    /// call from an audio output callback.
    pub fn try_read(&self, buf: &mut [u8]) -> usize {
        let copied = {
            let mut ring = self.inner.lock().unwrap();
            let n = buf.len().min(ring.len());
            for slot in buf[..n].iter_mut() {
                *slot = ring.pop_front().unwrap();
            }
            n
        };
        if copied > 0 {
            self.space.notify_waiters();
        }
        copied
    }

    /// Read at least one byte into `buf`, waiting up to `timeout` for data
    /// to appear. Returns 0 on timeout.
    pub async fn read_some(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.data.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let n = self.try_read(buf);
            if n > 0 {
                return n;
            }
            let now = Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, notified).await.is_err()
            {
                return 0;
            }
        }
    }

    /// Write all of `bytes`, retrying every `retry` until the consumer
    /// frees enough space.
    pub async fn write_all(&self, bytes: &[u8], retry: Duration) {
        let mut written = 0;
        while written < bytes.len() {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            written += self.try_write(&bytes[written..]);
            if written < bytes.len() {
                // Consumer is behind; wait for a drain or the retry tick.
                let _ = tokio::time::timeout(retry, notified).await;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  MessageQueue
// ═══════════════════════════════════════════════════════════════════════

/// Cost of one queued message against the byte budget.
pub trait ByteLen {
    fn byte_len(&self) -> usize;
}

impl ByteLen for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

struct QueueInner<T> {
    queue: VecDeque<T>,
    bytes: usize,
}

/// Bounded FIFO of whole messages, budgeted in payload bytes.
pub struct MessageQueue<T> {
    inner: Mutex<QueueInner<T>>,
    capacity: usize,
    data: Notify,
    space: Notify,
}

impl<T: ByteLen> MessageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        MessageQueue {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                bytes: 0,
            }),
            capacity,
            data: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Buffered payload bytes.
    pub fn bytes(&self) -> usize {
        self.inner.lock().unwrap().bytes
    }

    /// Push a message, waiting up to `timeout` for room. On timeout the
    /// message is handed back so the caller can decide what to do with it.
    pub async fn send(&self, msg: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.bytes + msg.byte_len() <= self.capacity {
                    inner.bytes += msg.byte_len();
                    inner.queue.push_back(msg);
                    drop(inner);
                    self.data.notify_waiters();
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, notified).await.is_err()
            {
                return Err(msg);
            }
        }
    }

    /// Push a message unconditionally, dropping the oldest queued messages
    /// until it fits. Returns how many were dropped.
    pub fn force_send(&self, msg: T) -> usize {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            let mut dropped = 0;
            while inner.bytes + msg.byte_len() > self.capacity {
                match inner.queue.pop_front() {
                    Some(old) => {
                        inner.bytes -= old.byte_len();
                        dropped += 1;
                    }
                    // Oversized message; let it through rather than spin.
                    None => break,
                }
            }
            inner.bytes += msg.byte_len();
            inner.queue.push_back(msg);
            dropped
        };
        self.data.notify_waiters();
        dropped
    }

    /// Pop the oldest message, waiting up to `timeout`. `None` on timeout.
    pub async fn recv(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.data.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(msg) = inner.queue.pop_front() {
                    inner.bytes -= msg.byte_len();
                    drop(inner);
                    self.space.notify_waiters();
                    return Some(msg);
                }
            }
            let now = Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, notified).await.is_err()
            {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ring_try_write_respects_capacity() {
        let ring = ByteRing::new(8);
        assert_eq!(ring.try_write(&[1; 6]), 6);
        assert_eq!(ring.try_write(&[2; 6]), 2);
        assert_eq!(ring.len(), 8);

        let mut buf = [0u8; 8];
        assert_eq!(ring.try_read(&mut buf), 8);
        assert_eq!(&buf[..6], &[1; 6]);
        assert_eq!(&buf[6..], &[2; 2]);
        assert!(ring.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ring_read_some_times_out_empty() {
        let ring = ByteRing::new(8);
        let mut buf = [0u8; 4];
        assert_eq!(ring.read_some(&mut buf, Duration::from_millis(100)).await, 0);
    }

    #[tokio::test]
    async fn ring_read_some_wakes_on_write() {
        let ring = Arc::new(ByteRing::new(64));
        let reader = {
            let ring = ring.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                ring.read_some(&mut buf, Duration::from_secs(5)).await
            })
        };
        tokio::task::yield_now().await;
        ring.try_write(&[7u8; 10]);
        assert_eq!(reader.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn ring_write_all_blocks_until_drained() {
        let ring = Arc::new(ByteRing::new(4));
        let writer = {
            let ring = ring.clone();
            tokio::spawn(async move {
                ring.write_all(&[9u8; 10], Duration::from_millis(5)).await;
            })
        };
        let mut total = 0;
        let mut buf = [0u8; 4];
        while total < 10 {
            let n = ring.read_some(&mut buf, Duration::from_secs(5)).await;
            assert!(buf[..n].iter().all(|&b| b == 9));
            total += n;
        }
        writer.await.unwrap();
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn queue_preserves_message_boundaries() {
        let q: MessageQueue<Vec<u8>> = MessageQueue::new(1000);
        q.send(vec![1; 10], Duration::from_millis(10)).await.unwrap();
        q.send(vec![2; 20], Duration::from_millis(10)).await.unwrap();
        assert_eq!(q.bytes(), 30);

        assert_eq!(q.recv(Duration::from_millis(10)).await.unwrap(), vec![1; 10]);
        assert_eq!(q.recv(Duration::from_millis(10)).await.unwrap(), vec![2; 20]);
        assert_eq!(q.bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_send_times_out_when_full() {
        let q: MessageQueue<Vec<u8>> = MessageQueue::new(16);
        q.send(vec![0; 16], Duration::from_millis(10)).await.unwrap();

        let rejected = q.send(vec![1; 8], Duration::from_millis(100)).await;
        assert_eq!(rejected.unwrap_err(), vec![1; 8]);
        assert_eq!(q.bytes(), 16);
    }

    #[tokio::test]
    async fn queue_force_send_drops_oldest() {
        let q: MessageQueue<Vec<u8>> = MessageQueue::new(30);
        q.send(vec![1; 10], Duration::from_millis(10)).await.unwrap();
        q.send(vec![2; 10], Duration::from_millis(10)).await.unwrap();
        q.send(vec![3; 10], Duration::from_millis(10)).await.unwrap();

        assert_eq!(q.force_send(vec![4; 15]), 2);
        assert_eq!(q.recv(Duration::from_millis(10)).await.unwrap(), vec![3; 10]);
        assert_eq!(q.recv(Duration::from_millis(10)).await.unwrap(), vec![4; 15]);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_recv_times_out_empty() {
        let q: MessageQueue<Vec<u8>> = MessageQueue::new(16);
        assert!(q.recv(Duration::from_millis(100)).await.is_none());
    }
}
