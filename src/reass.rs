//! Bounded IPv4 fragment reassembly.
//!
//! Fragments are parked as pbuf chains keyed by (src, dst, ident, proto).
//! Entries are capped by the profile's reassembly pool; when the pool is
//! full the oldest entry is evicted, and entries past the timeout are
//! discarded on the timer tick. The peer's retransmission completes the
//! stream either way.

use crate::arena::{Arena, PoolId};
use crate::constants::REASSEMBLY_TIMEOUT_MS;
use crate::error::Error;
use crate::pbuf::{BufId, BufPool};
use crate::pcb::Millis;
use crate::wire::FragInfo;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReassKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub ident: u16,
    pub proto: u8,
}

#[derive(Debug)]
struct Fragment {
    offset: usize,
    len: usize,
    chain: BufId,
}

#[derive(Debug)]
struct Entry {
    key: ReassKey,
    frags: Vec<Fragment>,
    /// Known once the fragment without MF arrives.
    total_len: Option<usize>,
    created_ms: Millis,
    slot: u32,
}

#[derive(Debug)]
pub(crate) struct ReassTable {
    pool: PoolId,
    entries: Vec<Entry>,
}

impl ReassTable {
    pub fn new(pool: PoolId) -> Self {
        Self {
            pool,
            entries: Vec::new(),
        }
    }

    /// Adds one fragment. Returns the reassembled datagram payload once the
    /// coverage is complete. A fragment that cannot be stored is dropped
    /// silently; the peer retransmits.
    pub fn push(
        &mut self,
        arena: &mut Arena,
        bufs: &mut BufPool,
        key: ReassKey,
        frag: FragInfo,
        payload: &[u8],
        now: Millis,
    ) -> Result<Option<Vec<u8>>, Error> {
        let idx = match self.entries.iter().position(|e| e.key == key) {
            Some(i) => i,
            None => {
                let slot = match arena.alloc(self.pool) {
                    Ok(s) => s,
                    Err(_) => {
                        self.evict_oldest(arena, bufs);
                        match arena.alloc(self.pool) {
                            Ok(s) => s,
                            Err(e) => return Err(e),
                        }
                    }
                };
                self.entries.push(Entry {
                    key,
                    frags: Vec::new(),
                    total_len: None,
                    created_ms: now,
                    slot,
                });
                self.entries.len() - 1
            }
        };

        let chain = match bufs.acquire_from(arena, payload) {
            Ok(c) => c,
            Err(e) => return Err(e),
        };
        let entry = &mut self.entries[idx];
        entry.frags.push(Fragment {
            offset: frag.offset,
            len: payload.len(),
            chain,
        });
        if !frag.more_fragments {
            entry.total_len = Some(frag.offset + payload.len());
        }

        if let Some(total) = entry.total_len {
            if coverage_complete(&entry.frags, total) {
                let entry = self.entries.swap_remove(idx);
                let mut out = vec![0u8; total];
                for f in &entry.frags {
                    copy_chain_at(bufs, f.chain, &mut out[f.offset..f.offset + f.len]);
                }
                for f in entry.frags {
                    bufs.release(arena, f.chain);
                }
                arena.free(self.pool, entry.slot);
                return Ok(Some(out));
            }
        }
        Ok(None)
    }

    /// Discards entries older than the reassembly timeout.
    pub fn expire(&mut self, arena: &mut Arena, bufs: &mut BufPool, now: Millis) {
        let mut i = 0;
        while i < self.entries.len() {
            if now.saturating_sub(self.entries[i].created_ms) >= REASSEMBLY_TIMEOUT_MS {
                let entry = self.entries.swap_remove(i);
                Self::drop_entry(arena, bufs, self.pool, entry);
            } else {
                i += 1;
            }
        }
    }

    fn evict_oldest(&mut self, arena: &mut Arena, bufs: &mut BufPool) {
        if let Some((i, _)) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.created_ms)
        {
            let entry = self.entries.swap_remove(i);
            Self::drop_entry(arena, bufs, self.pool, entry);
        }
    }

    fn drop_entry(arena: &mut Arena, bufs: &mut BufPool, pool: PoolId, entry: Entry) {
        for f in entry.frags {
            bufs.release(arena, f.chain);
        }
        arena.free(pool, entry.slot);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// True when the fragments cover `0..total` without a hole.
fn coverage_complete(frags: &[Fragment], total: usize) -> bool {
    let mut intervals: Vec<(usize, usize)> =
        frags.iter().map(|f| (f.offset, f.offset + f.len)).collect();
    intervals.sort_unstable();
    let mut covered = 0;
    for (start, end) in intervals {
        if start > covered {
            return false;
        }
        covered = covered.max(end);
    }
    covered >= total
}

/// Copies a chain into an exact-size slice.
fn copy_chain_at(bufs: &BufPool, head: BufId, out: &mut [u8]) {
    let mut off = 0;
    let mut cur = Some(head);
    while let Some(id) = cur {
        let data = bufs.seg_data(id);
        out[off..off + data.len()].copy_from_slice(data);
        off += data.len();
        cur = bufs.next(id);
    }
    debug_assert_eq!(off, out.len());
}
