//! Send buffer: application messages chunked into MSS-sized blocks, each
//! carrying its own metadata.
//!
//! Metadata lives on the block, never in a shared register: application
//! `send` calls and the pacing loop run decoupled in time, so anything not
//! stored with the queued data would be overwritten before packetization
//! reads it. Both the fresh-send and retransmit paths read the same stored
//! metadata.

use crate::protocol::{Boundary, FrameMeta};
use crate::seq;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-block fields the packetizer copies into the outgoing packet.
#[derive(Debug, Clone, Copy)]
pub struct BlockMeta {
    pub msg_no: u32,
    pub boundary: Boundary,
    pub in_order: bool,
    pub frame: Option<FrameMeta>,
}

#[derive(Debug)]
struct Block {
    data: Bytes,
    msg_no: u32,
    boundary: Boundary,
    in_order: bool,
    frame: Option<FrameMeta>,
    origin: Instant,
    ttl: Option<Duration>,
    /// Sequence assigned on first transmission.
    seq: Option<u32>,
    /// Set when the message was abandoned after partial transmission.
    dropped: bool,
}

impl Block {
    fn expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.origin) > ttl,
            None => false,
        }
    }
}

/// Result of a retransmission read at a sequence offset.
#[derive(Debug)]
pub enum RetransRead {
    /// The block is still live; retransmit it.
    Data { payload: Bytes, meta: BlockMeta },
    /// The block's message outlived its TTL; the caller should advertise the
    /// drop and stop retransmitting the range.
    Expired {
        msg_no: u32,
        first_seq: u32,
        last_seq: u32,
    },
    /// Nothing to send at this offset (already released or dropped).
    Gone,
}

/// Ordered queue of submitted blocks. The front block always corresponds to
/// the first unacknowledged sequence, so sequence offsets index it directly.
#[derive(Debug)]
pub struct SendBuffer {
    blocks: VecDeque<Block>,
    cap_blocks: usize,
    mss: usize,
    next_msg_no: u32,
    /// Queue index of the next block that has never been transmitted.
    snd_ptr: usize,
}

impl SendBuffer {
    pub fn new(cap_blocks: usize, mss: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(cap_blocks.min(1024)),
            cap_blocks,
            mss,
            next_msg_no: 0,
            snd_ptr: 0,
        }
    }

    /// Free block slots remaining.
    pub fn free_blocks(&self) -> usize {
        self.cap_blocks - self.blocks.len()
    }

    /// Total block capacity.
    pub fn capacity(&self) -> usize {
        self.cap_blocks
    }

    /// Blocks one payload of `len` bytes will occupy.
    pub fn blocks_for(&self, len: usize) -> usize {
        len.div_ceil(self.mss).max(1)
    }

    pub fn has_unsent(&self) -> bool {
        self.snd_ptr < self.blocks.len()
    }

    /// Queues one application message, chunked into MSS-sized blocks that
    /// share a message number and carry the supplied metadata. The caller
    /// must have checked `free_blocks()`.
    pub fn push(
        &mut self,
        data: Bytes,
        ttl: Option<Duration>,
        in_order: bool,
        frame: Option<FrameMeta>,
    ) -> usize {
        let msg_no = self.next_msg_no;
        self.next_msg_no = seq::inc_msg(self.next_msg_no);
        let origin = Instant::now();
        let count = self.blocks_for(data.len());
        for i in 0..count {
            let chunk = data.slice(i * self.mss..data.len().min((i + 1) * self.mss));
            let boundary = match (i == 0, i == count - 1) {
                (true, true) => Boundary::Solo,
                (true, false) => Boundary::First,
                (false, true) => Boundary::Last,
                (false, false) => Boundary::Middle,
            };
            self.blocks.push_back(Block {
                data: chunk,
                msg_no,
                boundary,
                in_order,
                frame,
                origin,
                ttl,
                seq: None,
                dropped: false,
            });
        }
        count
    }

    /// Yields the next never-sent block, recording the sequence the caller
    /// assigns to it. Wholly-unsent messages whose TTL already expired are
    /// discarded on the way; nothing was ever on the wire for them, so no
    /// drop advertisement is needed.
    pub fn read_next(&mut self, assign_seq: u32, now: Instant) -> Option<(Bytes, BlockMeta)> {
        loop {
            let block = self.blocks.get(self.snd_ptr)?;
            if block.boundary.is_first() && block.expired(now) {
                let msg_no = block.msg_no;
                while self
                    .blocks
                    .get(self.snd_ptr)
                    .is_some_and(|b| b.msg_no == msg_no)
                {
                    self.blocks.remove(self.snd_ptr);
                }
                debug!("discarded unsent expired message {}", msg_no);
                continue;
            }
            let block = &mut self.blocks[self.snd_ptr];
            block.seq = Some(assign_seq);
            self.snd_ptr += 1;
            return Some((
                block.data.clone(),
                BlockMeta {
                    msg_no: block.msg_no,
                    boundary: block.boundary,
                    in_order: block.in_order,
                    frame: block.frame,
                },
            ));
        }
    }

    /// Re-reads previously transmitted data by offset from the first
    /// unacknowledged sequence.
    pub fn read_retrans(&mut self, offset: usize, now: Instant) -> RetransRead {
        if offset >= self.snd_ptr || offset >= self.blocks.len() {
            return RetransRead::Gone;
        }
        if self.blocks[offset].dropped {
            return RetransRead::Gone;
        }
        if self.blocks[offset].expired(now) {
            let msg_no = self.blocks[offset].msg_no;
            // The block at `offset` was sent, so the range is never empty.
            let Some((first_seq, last_seq)) = self.abandon_message(msg_no) else {
                return RetransRead::Gone;
            };
            return RetransRead::Expired {
                msg_no,
                first_seq,
                last_seq,
            };
        }
        let block = &self.blocks[offset];
        RetransRead::Data {
            payload: block.data.clone(),
            meta: BlockMeta {
                msg_no: block.msg_no,
                boundary: block.boundary,
                in_order: block.in_order,
                frame: block.frame,
            },
        }
    }

    /// Abandons a partly transmitted message whose TTL lapsed before its
    /// tail ever left the buffer. The sent blocks stay (marked dropped)
    /// until the acknowledgment cursor releases them; the unsent tail is
    /// removed outright. Returns the message number and the sequence range
    /// of its sent blocks for the drop advertisement.
    pub fn drop_expired(&mut self, now: Instant) -> Option<(u32, u32, u32)> {
        let block = self.blocks.get(self.snd_ptr)?;
        if block.boundary.is_first() || !block.expired(now) {
            return None;
        }
        let msg_no = block.msg_no;
        let range = self.abandon_message(msg_no);
        debug!("dropped expired message {} after partial send", msg_no);
        range.map(|(first_seq, last_seq)| (msg_no, first_seq, last_seq))
    }

    /// Marks the sent blocks of `msg_no` dropped and removes its unsent
    /// tail. Sending is strictly in queue order, so the tail is exactly the
    /// run of matching blocks starting at `snd_ptr`.
    fn abandon_message(&mut self, msg_no: u32) -> Option<(u32, u32)> {
        let mut first_seq = None;
        let mut last_seq = None;
        for block in self.blocks.iter_mut().take(self.snd_ptr) {
            if block.msg_no == msg_no {
                block.dropped = true;
                if let Some(s) = block.seq {
                    if first_seq.is_none() {
                        first_seq = Some(s);
                    }
                    last_seq = Some(s);
                }
            }
        }
        while self
            .blocks
            .get(self.snd_ptr)
            .is_some_and(|b| b.msg_no == msg_no)
        {
            self.blocks.remove(self.snd_ptr);
        }
        first_seq.map(|first| (first, last_seq.unwrap_or(first)))
    }

    /// Releases `count` acknowledged blocks from the front of the queue.
    pub fn ack_through(&mut self, count: usize) {
        let count = count.min(self.blocks.len());
        self.blocks.drain(..count);
        self.snd_ptr = self.snd_ptr.saturating_sub(count);
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
