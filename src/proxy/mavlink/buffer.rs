//! Bounded FIFO frame buffer shared between the I/O task (producer) and the
//! worker pool (consumers). On overflow, drops the newest frame and
//! increments a counter exposed in health (spec §3, §9 — resolved open
//! question: "drop newest" is the majority-documented behavior).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tokio::sync::Mutex;
use tracing::warn;

use super::message::DecodedFrame;

pub struct FrameBuffer {
    queue: Mutex<VecDeque<DecodedFrame>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueues a frame; if the buffer is at capacity the new frame is
    /// dropped (not the oldest) and the drop counter is incremented.
    pub async fn push(&self, frame: DecodedFrame) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "MAVLink frame buffer full (capacity {}); dropping newest frame msg_id={}",
                self.capacity,
                frame.message.msg_id()
            );
            return;
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
    }

    /// Waits for and removes the oldest frame.
    pub async fn pop(&self) -> DecodedFrame {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(frame) = queue.pop_front() {
                    return frame;
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mavlink::message::MavMessage;

    fn frame(id: u32) -> DecodedFrame {
        DecodedFrame {
            source_system: 1,
            source_component: 1,
            message: MavMessage::Other { msg_id: id },
        }
    }

    #[tokio::test]
    async fn drops_newest_when_full() {
        let buf = FrameBuffer::new(2);
        buf.push(frame(1)).await;
        buf.push(frame(2)).await;
        buf.push(frame(3)).await; // dropped

        assert_eq!(buf.dropped_count(), 1);
        assert_eq!(buf.depth().await, 2);

        let first = buf.pop().await;
        assert_eq!(first.message.msg_id(), 1);
        let second = buf.pop().await;
        assert_eq!(second.message.msg_id(), 2);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let buf = std::sync::Arc::new(FrameBuffer::new(4));
        let buf2 = buf.clone();
        let handle = tokio::spawn(async move { buf2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        buf.push(frame(42)).await;
        let got = handle.await.unwrap();
        assert_eq!(got.message.msg_id(), 42);
    }
}
