//! Serial-tagged packet FIFO
//!
//! One queue per elementary stream sits between the demuxer and the
//! decoder. Every flush or start bumps the queue serial; packets carry the
//! serial in effect when they were enqueued so consumers can tell stale
//! data from current data after a seek.

use crate::media::Packet;
use crate::utils::error::{PlayerError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-entry bookkeeping overhead counted against the byte watermark
const ENTRY_OVERHEAD: usize = std::mem::size_of::<Packet>();

struct QueuedPacket {
    packet: Packet,
    serial: i32,
}

struct QueueState {
    packets: VecDeque<QueuedPacket>,
    nb_packets: usize,
    size: usize,
    duration: i64,
    serial: i32,
    abort_request: bool,
}

/// Outcome of [`PacketQueue::get`]
#[derive(Debug)]
pub enum PacketGet {
    /// A packet and the serial it was enqueued under
    Packet(Packet, i32),
    /// Nothing queued (non-blocking get or timeout)
    Empty,
    /// The queue was aborted
    Aborted,
}

/// Thread-safe packet FIFO with serial tagging and size accounting
pub struct PacketQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    /// Mirror of the live serial for lock-free readers such as clocks
    serial: Arc<AtomicI32>,
    /// Mirror of the abort flag for frame queues tied to this queue
    aborted: AtomicBool,
}

impl PacketQueue {
    /// Create a queue in the aborted state; call [`start`](Self::start) to use it
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                packets: VecDeque::new(),
                nb_packets: 0,
                size: 0,
                duration: 0,
                serial: 0,
                abort_request: true,
            }),
            cond: Condvar::new(),
            serial: Arc::new(AtomicI32::new(0)),
            aborted: AtomicBool::new(true),
        }
    }

    /// Clear the abort flag and open a new serial epoch
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.abort_request = false;
        self.aborted.store(false, Ordering::Release);
        state.serial += 1;
        self.serial.store(state.serial, Ordering::Release);
    }

    /// Enqueue a packet under the current serial
    pub fn put(&self, packet: Packet) -> Result<()> {
        let mut state = self.state.lock();
        if state.abort_request {
            return Err(PlayerError::Aborted("packet queue".to_string()));
        }

        let serial = state.serial;
        state.nb_packets += 1;
        state.size += packet.size() + ENTRY_OVERHEAD;
        state.duration += packet.duration;
        state.packets.push_back(QueuedPacket { packet, serial });
        self.cond.notify_one();
        Ok(())
    }

    /// Enqueue an end-of-stream marker for `stream_index`
    pub fn put_flush_marker(&self, stream_index: usize) -> Result<()> {
        self.put(Packet::null(stream_index))
    }

    /// Dequeue a packet, sleeping until one arrives when `block` is set
    pub fn get(&self, block: bool) -> PacketGet {
        let mut state = self.state.lock();
        loop {
            if state.abort_request {
                return PacketGet::Aborted;
            }
            if let Some(entry) = Self::pop(&mut state) {
                return PacketGet::Packet(entry.packet, entry.serial);
            }
            if !block {
                return PacketGet::Empty;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Dequeue a packet, waiting at most `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> PacketGet {
        let mut state = self.state.lock();
        if state.abort_request {
            return PacketGet::Aborted;
        }
        if let Some(entry) = Self::pop(&mut state) {
            return PacketGet::Packet(entry.packet, entry.serial);
        }

        self.cond.wait_for(&mut state, timeout);

        if state.abort_request {
            return PacketGet::Aborted;
        }
        match Self::pop(&mut state) {
            Some(entry) => PacketGet::Packet(entry.packet, entry.serial),
            None => PacketGet::Empty,
        }
    }

    fn pop(state: &mut QueueState) -> Option<QueuedPacket> {
        let entry = state.packets.pop_front()?;
        state.nb_packets -= 1;
        state.size -= entry.packet.size() + ENTRY_OVERHEAD;
        state.duration -= entry.packet.duration;
        Some(entry)
    }

    /// Drop every queued packet and open a new serial epoch
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.packets.clear();
        state.nb_packets = 0;
        state.size = 0;
        state.duration = 0;
        state.serial += 1;
        self.serial.store(state.serial, Ordering::Release);
    }

    /// Set the abort flag and wake every waiter
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.abort_request = true;
        self.aborted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Release all packets; the queue stays aborted
    pub fn destroy(&self) {
        self.abort();
        let mut state = self.state.lock();
        state.packets = VecDeque::new();
        state.nb_packets = 0;
        state.size = 0;
        state.duration = 0;
    }

    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    /// Shared handle on the live serial, read by clocks for staleness checks
    pub fn serial_handle(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.serial)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn nb_packets(&self) -> usize {
        self.state.lock().nb_packets
    }

    /// Bytes queued, including per-entry overhead
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Summed packet duration in stream time base units
    pub fn duration(&self) -> i64 {
        self.state.lock().duration
    }

    /// Consistent snapshot of the counters
    pub fn stats(&self) -> PacketQueueStats {
        let state = self.state.lock();
        PacketQueueStats {
            nb_packets: state.nb_packets,
            size: state.size,
            duration: state.duration,
            serial: state.serial,
            aborted: state.abort_request,
        }
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketQueueStats {
    pub nb_packets: usize,
    pub size: usize,
    pub duration: i64,
    pub serial: i32,
    pub aborted: bool,
}
