//! Receive buffer: a fixed ring of payload slots addressed by offset from
//! the acknowledgment cursor.
//!
//! Three positions matter: the read cursor (application side), the ack
//! cursor (everything before it is contiguous and deliverable), and the
//! insert window extending `capacity - readable` slots past the ack cursor.

use crate::protocol::{Boundary, FrameMeta};
use bytes::{Bytes, BytesMut};
use tracing::warn;

#[derive(Debug, Clone)]
struct Slot {
    payload: Bytes,
    msg_no: u32,
    boundary: Boundary,
    frame: Option<FrameMeta>,
    /// The message was abandoned by the sender; the slot only exists to keep
    /// the sequence space contiguous.
    dropped: bool,
}

/// Outcome of inserting a payload at a sequence offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    Duplicate,
    OutOfWindow,
}

/// One reassembled application message.
#[derive(Debug, Clone)]
pub struct Message {
    pub data: Bytes,
    pub frame: Option<FrameMeta>,
}

#[derive(Debug)]
pub struct RecvBuffer {
    slots: Vec<Option<Slot>>,
    cap: usize,
    /// Ring index of the read cursor.
    start: usize,
    /// Bytes already consumed from the slot at `start`.
    start_off: usize,
    /// Ring index matching the next-expected sequence (insert offset 0).
    ack_pos: usize,
    /// Slots between `start` and `ack_pos`: contiguous, deliverable.
    readable: usize,
}

impl RecvBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            slots: vec![None; cap],
            cap,
            start: 0,
            start_off: 0,
            ack_pos: 0,
            readable: 0,
        }
    }

    /// Free slots past the ack cursor; advertised to the peer as the flow
    /// window in acknowledgments.
    pub fn available(&self) -> usize {
        self.cap - self.readable
    }

    /// Places one packet's payload at `offset` slots past the ack cursor.
    /// Duplicates are ignored; offsets at or past the window edge are
    /// rejected.
    pub fn insert(
        &mut self,
        offset: usize,
        payload: Bytes,
        msg_no: u32,
        boundary: Boundary,
        frame: Option<FrameMeta>,
    ) -> InsertOutcome {
        if offset >= self.available() {
            return InsertOutcome::OutOfWindow;
        }
        let idx = (self.ack_pos + offset) % self.cap;
        if self.slots[idx].is_some() {
            return InsertOutcome::Duplicate;
        }
        self.slots[idx] = Some(Slot {
            payload,
            msg_no,
            boundary,
            frame,
            dropped: false,
        });
        InsertOutcome::Stored
    }

    /// Number of contiguously present slots starting at the ack cursor.
    pub fn contiguous_from_ack(&self) -> usize {
        let window = self.available();
        let mut n = 0;
        while n < window && self.slots[(self.ack_pos + n) % self.cap].is_some() {
            n += 1;
        }
        n
    }

    /// Moves the ack cursor forward over `count` present slots, making them
    /// readable.
    pub fn advance_ack(&mut self, count: usize) {
        debug_assert!(count <= self.contiguous_from_ack());
        self.ack_pos = (self.ack_pos + count) % self.cap;
        self.readable += count;
    }

    /// True once every delivered byte has been consumed.
    pub fn is_drained(&self) -> bool {
        self.readable == 0
    }

    /// Copies contiguous acknowledged bytes into `out`, advancing the read
    /// cursor. Returns the number of bytes written.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut written = 0;
        while self.readable > 0 && written < out.len() {
            let slot = match &self.slots[self.start] {
                Some(s) => s,
                None => {
                    // Readable slots are present by construction.
                    warn!("readable slot missing at {}", self.start);
                    break;
                }
            };
            if slot.dropped {
                self.pop_front_slot();
                continue;
            }
            let chunk = &slot.payload[self.start_off..];
            let n = chunk.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&chunk[..n]);
            written += n;
            self.start_off += n;
            if self.start_off == slot.payload.len() {
                self.pop_front_slot();
            }
        }
        written
    }

    /// Reassembles and consumes the message at the head of the readable
    /// region, if all of its blocks are readable. Dropped messages are
    /// skipped silently.
    pub fn read_msg(&mut self) -> Option<Message> {
        loop {
            if self.readable == 0 {
                return None;
            }
            debug_assert_eq!(self.start_off, 0, "byte and message reads were mixed");
            let first = self.slots[self.start].as_ref()?;
            if first.dropped {
                self.pop_front_slot();
                continue;
            }
            if !first.boundary.is_first() {
                warn!("message head misaligned at msg {}", first.msg_no);
                self.pop_front_slot();
                continue;
            }
            // Count the blocks of this message within the readable region.
            let mut blocks = 0;
            let mut complete = false;
            while blocks < self.readable {
                let slot = self.slots[(self.start + blocks) % self.cap].as_ref()?;
                blocks += 1;
                if slot.boundary.is_last() {
                    complete = true;
                    break;
                }
            }
            if !complete {
                return None;
            }
            let frame = first.frame;
            let mut data = BytesMut::new();
            for _ in 0..blocks {
                let slot = self.slots[self.start].as_ref()?;
                data.extend_from_slice(&slot.payload);
                self.pop_front_slot();
            }
            return Some(Message {
                data: data.freeze(),
                frame,
            });
        }
    }

    /// Scrubs a dropped message: pending slots in `[first_off, last_off]`
    /// become placeholder slots (so the ack cursor can cross the gap), and
    /// any unread blocks of `msg_no` are emptied.
    pub fn drop_message(&mut self, msg_no: u32, first_off: isize, last_off: isize) {
        let window = self.available() as isize;
        let lo = first_off.max(0);
        let hi = last_off.min(window - 1);
        for off in lo..=hi {
            let idx = (self.ack_pos + off as usize) % self.cap;
            match &mut self.slots[idx] {
                Some(slot) if slot.msg_no == msg_no => {
                    slot.dropped = true;
                    slot.payload = Bytes::new();
                }
                Some(_) => {}
                empty @ None => {
                    *empty = Some(Slot {
                        payload: Bytes::new(),
                        msg_no,
                        boundary: Boundary::Middle,
                        frame: None,
                        dropped: true,
                    });
                }
            }
        }
        // Unread but already acknowledged blocks of the message.
        for i in 0..self.readable {
            let idx = (self.start + i) % self.cap;
            if let Some(slot) = &mut self.slots[idx] {
                if slot.msg_no == msg_no {
                    slot.dropped = true;
                    slot.payload = Bytes::new();
                }
            }
        }
    }

    fn pop_front_slot(&mut self) {
        self.slots[self.start] = None;
        self.start = (self.start + 1) % self.cap;
        self.start_off = 0;
        self.readable -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(buf: &mut RecvBuffer, offset: usize, payload: &'static [u8]) -> InsertOutcome {
        buf.insert(offset, Bytes::from_static(payload), 0, Boundary::Solo, None)
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buf = RecvBuffer::new(8);
        assert_eq!(put(&mut buf, 0, b"ab"), InsertOutcome::Stored);
        assert_eq!(put(&mut buf, 1, b"cd"), InsertOutcome::Stored);
        assert_eq!(buf.contiguous_from_ack(), 2);
        buf.advance_ack(2);

        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out[..4], b"abcd");
        assert!(buf.is_drained());
    }

    #[test]
    fn test_gap_blocks_ack_advance() {
        let mut buf = RecvBuffer::new(8);
        put(&mut buf, 0, b"a");
        put(&mut buf, 2, b"c");
        assert_eq!(buf.contiguous_from_ack(), 1);
        put(&mut buf, 1, b"b");
        assert_eq!(buf.contiguous_from_ack(), 3);
    }

    #[test]
    fn test_duplicate_and_out_of_window() {
        let mut buf = RecvBuffer::new(4);
        assert_eq!(put(&mut buf, 1, b"x"), InsertOutcome::Stored);
        assert_eq!(put(&mut buf, 1, b"y"), InsertOutcome::Duplicate);
        assert_eq!(put(&mut buf, 4, b"z"), InsertOutcome::OutOfWindow);
    }

    #[test]
    fn test_partial_reads_keep_position() {
        let mut buf = RecvBuffer::new(4);
        put(&mut buf, 0, b"hello world");
        buf.advance_ack(1);

        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b" worl");
        assert_eq!(buf.read(&mut out), 1);
        assert_eq!(out[0], b'd');
    }

    #[test]
    fn test_read_msg_assembles_blocks() {
        let mut buf = RecvBuffer::new(8);
        let frame = FrameMeta {
            frame_id: 3,
            chunk_id: 0,
            total_chunks: 1,
            deadline_us: 500,
        };
        buf.insert(0, Bytes::from_static(b"part1-"), 9, Boundary::First, Some(frame));
        buf.insert(1, Bytes::from_static(b"part2"), 9, Boundary::Last, Some(frame));
        buf.advance_ack(1);
        // Incomplete: only the first block is readable.
        assert!(buf.read_msg().is_none());
        buf.advance_ack(1);
        let msg = buf.read_msg().unwrap();
        assert_eq!(&msg.data[..], b"part1-part2");
        assert_eq!(msg.frame.unwrap().frame_id, 3);
        assert!(buf.read_msg().is_none());
    }

    #[test]
    fn test_drop_message_fills_gap() {
        let mut buf = RecvBuffer::new(8);
        // Message 5 occupies offsets 0-2; only offset 1 arrived.
        buf.insert(1, Bytes::from_static(b"mid"), 5, Boundary::Middle, None);
        buf.insert(3, Bytes::from_static(b"next"), 6, Boundary::Solo, None);
        buf.drop_message(5, 0, 2);
        // The placeholder slots let the cursor advance across the hole.
        assert_eq!(buf.contiguous_from_ack(), 4);
        buf.advance_ack(4);
        let mut out = [0u8; 16];
        let n = buf.read(&mut out);
        assert_eq!(&out[..n], b"next");
    }

    #[test]
    fn test_wraparound_indexing() {
        let mut buf = RecvBuffer::new(4);
        for round in 0u8..6 {
            assert_eq!(
                buf.insert(0, Bytes::from(vec![round; 2]), 0, Boundary::Solo, None),
                InsertOutcome::Stored
            );
            buf.advance_ack(1);
            let mut out = [0u8; 2];
            assert_eq!(buf.read(&mut out), 2);
            assert_eq!(out, [round; 2]);
        }
    }
}
