//! Frame buffering between decoders and presentation
//!
//! A fixed ring of preallocated [`Frame`] slots. Decoders block in
//! [`FrameQueue::peek_writable`] while the ring is full and presentation
//! blocks in [`FrameQueue::peek_readable`] while it is empty; both wake up
//! with `None` once the packet queue feeding the decoder is aborted.
//!
//! With `keep_last` set the most recently consumed frame stays peekable
//! through [`FrameQueue::peek_last`] so a paused picture can be redrawn.

use crate::decoder::frame::{Frame, FrameTiming};
use crate::decoder::packet_queue::PacketQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

/// Ring capacity for decoded pictures
pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
/// Ring capacity for decoded subtitles
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;
/// Ring capacity for decoded audio frames
pub const SAMPLE_QUEUE_SIZE: usize = 9;

struct RingState {
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
    stats: QueueStats,
}

/// Queue statistics for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Total frames pushed
    pub frames_added: u64,

    /// Total frames released by `next`
    pub frames_consumed: u64,

    /// Maximum queue depth reached
    pub max_depth: usize,
}

/// Fixed-capacity frame ring with blocking producer/consumer ends
pub struct FrameQueue {
    slots: Vec<Mutex<Frame>>,
    ring: Mutex<RingState>,
    cond: Condvar,
    packets: Arc<PacketQueue>,
    max_size: usize,
    keep_last: bool,
}

impl FrameQueue {
    /// Create a queue of `max_size` slots tied to `packets` for abort
    pub fn new(packets: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let max_size = max_size.max(1);
        Self {
            slots: (0..max_size).map(|_| Mutex::new(Frame::default())).collect(),
            ring: Mutex::new(RingState {
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
                stats: QueueStats::default(),
            }),
            cond: Condvar::new(),
            packets,
            max_size,
            keep_last,
        }
    }

    /// Wake every waiter so it can observe an abort
    pub fn signal(&self) {
        let _ring = self.ring.lock();
        self.cond.notify_all();
    }

    /// Unread frame at the read cursor
    pub fn peek(&self) -> MutexGuard<'_, Frame> {
        let index = {
            let ring = self.ring.lock();
            (ring.rindex + ring.rindex_shown) % self.max_size
        };
        self.slots[index].lock()
    }

    /// Frame after [`peek`](Self::peek)
    pub fn peek_next(&self) -> MutexGuard<'_, Frame> {
        let index = {
            let ring = self.ring.lock();
            (ring.rindex + ring.rindex_shown + 1) % self.max_size
        };
        self.slots[index].lock()
    }

    /// Last shown frame, or the first unread one before anything was shown
    pub fn peek_last(&self) -> MutexGuard<'_, Frame> {
        let index = self.ring.lock().rindex;
        self.slots[index].lock()
    }

    pub fn peek_timing(&self) -> FrameTiming {
        self.peek().timing()
    }

    pub fn peek_next_timing(&self) -> FrameTiming {
        self.peek_next().timing()
    }

    pub fn peek_last_timing(&self) -> FrameTiming {
        self.peek_last().timing()
    }

    /// Wait for a free slot; `None` once the packet queue is aborted
    pub fn peek_writable(&self) -> Option<MutexGuard<'_, Frame>> {
        let index = {
            let mut ring = self.ring.lock();
            while ring.size >= self.max_size && !self.packets.is_aborted() {
                self.cond.wait(&mut ring);
            }
            if self.packets.is_aborted() {
                return None;
            }
            ring.windex
        };
        Some(self.slots[index].lock())
    }

    /// Wait for an unread frame; `None` once the packet queue is aborted
    pub fn peek_readable(&self) -> Option<MutexGuard<'_, Frame>> {
        let index = {
            let mut ring = self.ring.lock();
            while ring.size <= ring.rindex_shown && !self.packets.is_aborted() {
                self.cond.wait(&mut ring);
            }
            if self.packets.is_aborted() {
                return None;
            }
            (ring.rindex + ring.rindex_shown) % self.max_size
        };
        Some(self.slots[index].lock())
    }

    /// Publish the slot returned by `peek_writable`
    pub fn push(&self) {
        let mut ring = self.ring.lock();
        ring.windex = (ring.windex + 1) % self.max_size;
        ring.size += 1;
        ring.stats.frames_added += 1;
        ring.stats.max_depth = ring.stats.max_depth.max(ring.size);
        self.cond.notify_one();
    }

    /// Advance the read cursor, releasing the previously shown slot
    pub fn next(&self) {
        let mut ring = self.ring.lock();
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }

        self.slots[ring.rindex].lock().reset();
        ring.rindex = (ring.rindex + 1) % self.max_size;
        ring.size -= 1;
        ring.stats.frames_consumed += 1;
        self.cond.notify_one();
    }

    /// Frames not yet shown
    pub fn remaining(&self) -> usize {
        let ring = self.ring.lock();
        ring.size - ring.rindex_shown
    }

    /// Whether a frame has been shown since the queue was created
    pub fn rindex_shown(&self) -> bool {
        self.ring.lock().rindex_shown != 0
    }

    /// Source position of the last shown frame if it is still current
    pub fn last_pos(&self) -> Option<i64> {
        let ring = self.ring.lock();
        if ring.rindex_shown == 0 {
            return None;
        }
        let frame = self.slots[ring.rindex].lock();
        if frame.serial == self.packets.serial() && frame.pos >= 0 {
            Some(frame.pos)
        } else {
            None
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> QueueStats {
        self.ring.lock().stats
    }

    /// Reset every slot and rewind the ring
    pub fn destroy(&self) {
        let mut ring = self.ring.lock();
        for slot in &self.slots {
            slot.lock().reset();
        }
        ring.rindex = 0;
        ring.windex = 0;
        ring.size = 0;
        ring.rindex_shown = 0;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::frame::{FramePayload, VideoPicture};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn started_packets() -> Arc<PacketQueue> {
        let packets = Arc::new(PacketQueue::new());
        packets.start();
        packets
    }

    fn write_frame(queue: &FrameQueue, pts: f64, serial: i32) {
        let mut slot = queue.peek_writable().expect("queue aborted");
        slot.pts = pts;
        slot.serial = serial;
        slot.duration = 0.04;
        slot.payload = FramePayload::Video(VideoPicture {
            width: 4,
            height: 4,
            planes: vec![vec![0; 16]],
            strides: vec![4],
            ..Default::default()
        });
        drop(slot);
        queue.push();
    }

    #[test]
    fn test_frame_queue_basic() {
        let queue = FrameQueue::new(started_packets(), 3, false);
        assert_eq!(queue.remaining(), 0);

        write_frame(&queue, 0.0, 1);
        write_frame(&queue, 0.04, 1);
        assert_eq!(queue.remaining(), 2);

        assert_eq!(queue.peek().pts, 0.0);
        assert_eq!(queue.peek_next().pts, 0.04);

        queue.next();
        assert_eq!(queue.remaining(), 1);
        assert_eq!(queue.peek().pts, 0.04);
        assert_eq!(queue.stats().frames_consumed, 1);
    }

    #[test]
    fn test_full_queue_blocks_writer_until_next() {
        let queue = Arc::new(FrameQueue::new(started_packets(), 3, false));
        for i in 0..3 {
            write_frame(&queue, i as f64, 1);
        }

        let wrote = Arc::new(AtomicBool::new(false));
        let writer = {
            let queue = Arc::clone(&queue);
            let wrote = Arc::clone(&wrote);
            thread::spawn(move || {
                write_frame(&queue, 3.0, 1);
                wrote.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!wrote.load(Ordering::SeqCst), "fourth write must block");

        queue.next();
        writer.join().unwrap();
        assert!(wrote.load(Ordering::SeqCst));
        assert_eq!(queue.remaining(), 3);
    }

    #[test]
    fn test_keep_last_semantics() {
        let queue = FrameQueue::new(started_packets(), 3, true);
        write_frame(&queue, 1.0, 1);
        write_frame(&queue, 2.0, 1);
        assert_eq!(queue.remaining(), 2);

        queue.next();

        assert_eq!(queue.peek_last().pts, 1.0);
        assert_eq!(queue.remaining(), 1);
        assert_eq!(queue.peek().pts, 2.0);
        assert!(queue.rindex_shown());

        queue.next();
        assert_eq!(queue.peek_last().pts, 2.0);
        assert_eq!(queue.remaining(), 0);
    }

    #[test]
    fn test_abort_unblocks_reader_and_writer() {
        let packets = started_packets();
        let queue = Arc::new(FrameQueue::new(Arc::clone(&packets), 1, false));

        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.peek_readable().is_none())
        };

        thread::sleep(Duration::from_millis(20));
        packets.abort();
        queue.signal();

        assert!(reader.join().unwrap());
        assert!(queue.peek_writable().is_none());
    }

    #[test]
    fn test_next_resets_released_slot() {
        let queue = FrameQueue::new(started_packets(), 2, false);
        write_frame(&queue, 5.0, 1);
        queue.next();

        // the released slot is the next one written
        write_frame(&queue, 6.0, 1);
        write_frame(&queue, 7.0, 1);
        assert_eq!(queue.peek().pts, 6.0);
    }

    #[test]
    fn test_last_pos_requires_current_serial() {
        let packets = started_packets();
        let queue = FrameQueue::new(Arc::clone(&packets), 3, true);
        {
            let mut slot = queue.peek_writable().unwrap();
            slot.serial = packets.serial();
            slot.pos = 4096;
        }
        queue.push();
        queue.next();
        assert_eq!(queue.last_pos(), Some(4096));

        packets.flush();
        assert_eq!(queue.last_pos(), None);
    }
}
