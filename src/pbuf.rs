//! Reference-counted, chainable packet buffers.
//!
//! Payload bytes are written once at ingress and read in place by every
//! later layer; only the final hand-off across a chain boundary copies.
//! A buffer may be referenced by a reassembly queue and a retransmission
//! queue at the same time, so segments carry an explicit reference count
//! and return to the pool exactly when it reaches zero.

use crate::arena::{Arena, ArenaBuilder, PoolId};
use crate::error::Error;

const NO_NEXT: u32 = u32::MAX;

/// Handle to the head segment of a buffer chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId(pub(crate) u32);

#[derive(Debug, Clone, Copy)]
struct BufSlot {
    len: u16,
    refs: u16,
    next: u32,
}

/// Pool of fixed-size payload segments over one preallocated byte region.
#[derive(Debug)]
pub struct BufPool {
    data: Vec<u8>,
    slots: Vec<BufSlot>,
    pool: PoolId,
    seg_size: usize,
}

impl BufPool {
    /// Reserves the buffer sub-pool against the arena budget and allocates
    /// the backing byte region once. Nothing here grows afterwards.
    pub fn new(builder: &mut ArenaBuilder, count: usize, seg_size: usize) -> Result<Self, Error> {
        let pool = builder.reserve("pbuf", count, seg_size)?;
        Ok(Self {
            data: vec![0; count * seg_size],
            slots: vec![
                BufSlot {
                    len: 0,
                    refs: 0,
                    next: NO_NEXT,
                };
                count
            ],
            pool,
            seg_size,
        })
    }

    pub fn seg_size(&self) -> usize {
        self.seg_size
    }

    /// Acquires a chain large enough for `len` payload bytes, with refcount
    /// one on every segment. If the pool runs out partway, everything
    /// acquired so far is released before the exhaustion is reported.
    pub fn acquire(&mut self, arena: &mut Arena, len: usize) -> Result<BufId, Error> {
        let segs = if len == 0 {
            1
        } else {
            (len + self.seg_size - 1) / self.seg_size
        };
        let mut head: Option<BufId> = None;
        let mut tail: Option<u32> = None;
        let mut remaining = len;

        for _ in 0..segs {
            let slot = match arena.alloc(self.pool) {
                Ok(s) => s,
                Err(e) => {
                    if let Some(h) = head {
                        self.release(arena, h);
                    }
                    return Err(e);
                }
            };
            let seg_len = remaining.min(self.seg_size);
            remaining -= seg_len;
            self.slots[slot as usize] = BufSlot {
                len: seg_len as u16,
                refs: 1,
                next: NO_NEXT,
            };
            match tail {
                Some(t) => self.slots[t as usize].next = slot,
                None => head = Some(BufId(slot)),
            }
            tail = Some(slot);
        }
        Ok(head.unwrap_or(BufId(tail.unwrap_or(0))))
    }

    /// Acquires a chain and copies `data` into it.
    pub fn acquire_from(&mut self, arena: &mut Arena, data: &[u8]) -> Result<BufId, Error> {
        let id = self.acquire(arena, data.len())?;
        self.copy_in(id, data);
        Ok(id)
    }

    /// Writes `data` across the chain. The chain must have been acquired
    /// with at least `data.len()` capacity.
    pub fn copy_in(&mut self, head: BufId, data: &[u8]) {
        let mut cur = head.0;
        let mut off = 0;
        while cur != NO_NEXT && off < data.len() {
            let slot = self.slots[cur as usize];
            let n = slot.len as usize;
            let base = cur as usize * self.seg_size;
            self.data[base..base + n].copy_from_slice(&data[off..off + n]);
            off += n;
            cur = slot.next;
        }
        debug_assert_eq!(off, data.len());
    }

    /// Increments the reference count of one segment.
    pub fn retain(&mut self, id: BufId) {
        self.slots[id.0 as usize].refs += 1;
    }

    /// Decrements reference counts along the chain, returning each segment
    /// to the pool at zero. Stops at the first segment that is still
    /// referenced elsewhere (its tail is then owned by that reference).
    pub fn release(&mut self, arena: &mut Arena, head: BufId) {
        let mut cur = head.0;
        while cur != NO_NEXT {
            let slot = &mut self.slots[cur as usize];
            debug_assert!(slot.refs > 0, "release of dead buffer");
            slot.refs -= 1;
            if slot.refs > 0 {
                break;
            }
            let next = slot.next;
            slot.next = NO_NEXT;
            slot.len = 0;
            arena.free(self.pool, cur);
            cur = next;
        }
    }

    /// Appends `tail` to the end of `head`'s chain. Reference counts are
    /// unchanged; the chain owns what it owned before.
    pub fn chain(&mut self, head: BufId, tail: BufId) {
        let mut cur = head.0;
        loop {
            let next = self.slots[cur as usize].next;
            if next == NO_NEXT {
                break;
            }
            cur = next;
        }
        debug_assert_ne!(cur, tail.0, "buffer chained to itself");
        self.slots[cur as usize].next = tail.0;
    }

    /// Total payload length across the chain.
    pub fn total_len(&self, head: BufId) -> usize {
        let mut cur = head.0;
        let mut total = 0;
        while cur != NO_NEXT {
            let slot = self.slots[cur as usize];
            total += slot.len as usize;
            cur = slot.next;
        }
        total
    }

    /// Payload of a single segment, read in place.
    pub fn seg_data(&self, id: BufId) -> &[u8] {
        let slot = self.slots[id.0 as usize];
        let base = id.0 as usize * self.seg_size;
        &self.data[base..base + slot.len as usize]
    }

    pub fn next(&self, id: BufId) -> Option<BufId> {
        let next = self.slots[id.0 as usize].next;
        (next != NO_NEXT).then_some(BufId(next))
    }

    /// Flattens a chain into `out`. This is the one permitted copy, at the
    /// hand-off to the transport-layer consumer.
    pub fn copy_out(&self, head: BufId, out: &mut Vec<u8>) {
        let mut cur = Some(head);
        while let Some(id) = cur {
            out.extend_from_slice(self.seg_data(id));
            cur = self.next(id);
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize, seg: usize) -> (Arena, BufPool) {
        let mut b = ArenaBuilder::new(count * seg);
        let p = BufPool::new(&mut b, count, seg).unwrap();
        (b.build(), p)
    }

    #[test]
    fn test_acquire_release_balances() {
        let (mut arena, mut pool) = pool(8, 64);
        let id = pool.acquire(&mut arena, 40).unwrap();
        assert_eq!(arena.in_use(pool.pool_id()), 1);
        pool.release(&mut arena, id);
        assert_eq!(arena.in_use(pool.pool_id()), 0);
    }

    #[test]
    fn test_chain_spans_segments() {
        let (mut arena, mut pool) = pool(8, 64);
        let data: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let id = pool.acquire_from(&mut arena, &data).unwrap();
        assert_eq!(pool.total_len(id), 150);
        assert_eq!(arena.in_use(pool.pool_id()), 3);

        let mut out = Vec::new();
        pool.copy_out(id, &mut out);
        assert_eq!(out, data);

        pool.release(&mut arena, id);
        assert_eq!(arena.in_use(pool.pool_id()), 0);
    }

    #[test]
    fn test_exhaustion_is_reported_not_fatal() {
        let (mut arena, mut pool) = pool(2, 64);
        let a = pool.acquire(&mut arena, 64).unwrap();
        let b = pool.acquire(&mut arena, 64).unwrap();
        assert!(matches!(
            pool.acquire(&mut arena, 1),
            Err(Error::Exhausted(_))
        ));
        pool.release(&mut arena, a);
        pool.release(&mut arena, b);
    }

    #[test]
    fn test_partial_chain_failure_releases_everything() {
        let (mut arena, mut pool) = pool(2, 64);
        // Needs 3 segments but only 2 exist.
        assert!(pool.acquire(&mut arena, 130).is_err());
        assert_eq!(arena.in_use(pool.pool_id()), 0);
    }

    #[test]
    fn test_retained_segment_survives_release() {
        let (mut arena, mut pool) = pool(4, 64);
        let id = pool.acquire_from(&mut arena, &[1, 2, 3]).unwrap();
        pool.retain(id);
        pool.release(&mut arena, id);
        // Still alive: one reference remains.
        assert_eq!(pool.seg_data(id), &[1, 2, 3]);
        assert_eq!(arena.in_use(pool.pool_id()), 1);
        pool.release(&mut arena, id);
        assert_eq!(arena.in_use(pool.pool_id()), 0);
    }

    #[test]
    fn test_chain_then_total_len() {
        let (mut arena, mut pool) = pool(4, 64);
        let head = pool.acquire_from(&mut arena, &[0u8; 10]).unwrap();
        let tail = pool.acquire_from(&mut arena, &[0u8; 20]).unwrap();
        pool.chain(head, tail);
        assert_eq!(pool.total_len(head), 30);
        pool.release(&mut arena, head);
        assert_eq!(arena.in_use(pool.pool_id()), 0);
    }
}
