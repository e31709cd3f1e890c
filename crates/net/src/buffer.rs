//! Chained byte queue.
//!
//! A FIFO of bytes stored in fixed-size blocks. Bytes are appended at the
//! tail and removed from the head; blocks that drain are handed back to a
//! per-thread free-block pool so steady-state traffic does not hit the
//! allocator.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;

pub const BLOCK_SIZE: usize = 4000;

const MAX_POOLED_BLOCKS: usize = 256;

thread_local! {
    static FREE_BLOCKS: RefCell<Vec<Box<[u8]>>> = const { RefCell::new(Vec::new()) };
}

fn acquire_block() -> Box<[u8]> {
    FREE_BLOCKS
        .try_with(|pool| pool.borrow_mut().pop())
        .ok()
        .flatten()
        .unwrap_or_else(|| vec![0u8; BLOCK_SIZE].into_boxed_slice())
}

fn release_block(data: Box<[u8]>) {
    if data.len() != BLOCK_SIZE {
        return;
    }
    // The pool may already be torn down during thread exit.
    let _ = FREE_BLOCKS.try_with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < MAX_POOLED_BLOCKS {
            pool.push(data);
        }
    });
}

/// Number of blocks currently parked in this thread's free pool.
pub fn pooled_blocks() -> usize {
    FREE_BLOCKS.try_with(|pool| pool.borrow().len()).unwrap_or(0)
}

struct Block {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Block {
    fn new() -> Self {
        Self {
            data: acquire_block(),
            start: 0,
            end: 0,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn used(&self) -> usize {
        self.end - self.start
    }

    fn space(&self) -> usize {
        self.data.len() - self.end
    }

    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        release_block(std::mem::take(&mut self.data));
    }
}

/// FIFO byte buffer built from a chain of [`BLOCK_SIZE`] blocks.
///
/// Invariant: `len()` equals the sum of the used bytes of every block.
/// A drained queue keeps at most one empty block as its write target.
#[derive(Default)]
pub struct ByteQueue {
    blocks: VecDeque<Block>,
    len: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of blocks currently held by the chain.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Appends `data` at the tail, growing the chain as needed.
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.blocks.back().is_none_or(|block| block.space() == 0) {
                self.blocks.push_back(Block::new());
            }

            if let Some(block) = self.blocks.back_mut() {
                let n = block.space().min(data.len());
                block.data[block.end..block.end + n].copy_from_slice(&data[..n]);
                block.end += n;
                self.len += n;
                data = &data[n..];
            }
        }
    }

    /// Copies up to `out.len()` bytes from the head without removing them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.read_at(0, out)
    }

    /// Copies up to `out.len()` bytes starting at logical `offset`.
    ///
    /// Whole blocks before `offset` are skipped without copying.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.len || out.is_empty() {
            return 0;
        }

        let mut skip = offset;
        let mut copied = 0;

        for block in &self.blocks {
            let bytes = block.bytes();
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }

            let available = &bytes[skip..];
            skip = 0;

            let n = available.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;

            if copied == out.len() {
                break;
            }
        }

        copied
    }

    /// Removes up to `len` bytes from the head and returns how many were removed.
    pub fn consume(&mut self, len: usize) -> usize {
        let removed = len.min(self.len);
        let mut remaining = removed;

        while remaining > 0 {
            let emptied = match self.blocks.front_mut() {
                Some(front) => {
                    let n = remaining.min(front.used());
                    front.start += n;
                    remaining -= n;
                    front.used() == 0
                }
                None => break,
            };

            if emptied {
                if self.blocks.len() > 1 {
                    self.blocks.pop_front();
                } else if let Some(last) = self.blocks.front_mut() {
                    last.reset();
                }
            }
        }

        self.len -= removed;
        removed
    }

    /// Peek and consume of the same span.
    pub fn extract(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.consume(n)
    }

    /// Deep copy preserving order and length.
    pub fn dup(&self) -> ByteQueue {
        let mut copy = ByteQueue::new();
        for block in &self.blocks {
            copy.append(block.bytes());
        }
        copy
    }

    /// Logical offset of the first occurrence of `value`.
    pub fn find_byte(&self, value: u8) -> Option<usize> {
        let mut offset = 0;
        for block in &self.blocks {
            let bytes = block.bytes();
            if let Some(pos) = bytes.iter().position(|&b| b == value) {
                return Some(offset + pos);
            }
            offset += bytes.len();
        }
        None
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for block in &self.blocks {
            out.extend_from_slice(block.bytes());
        }
        out
    }

    pub fn clear(&mut self) {
        self.consume(self.len);
    }
}

impl Clone for ByteQueue {
    fn clone(&self) -> Self {
        self.dup()
    }
}

impl fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteQueue")
            .field("len", &self.len)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl io::Read for ByteQueue {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.extract(buf))
    }
}

impl io::Write for ByteQueue {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
