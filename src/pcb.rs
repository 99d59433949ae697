//! Protocol control blocks and the connection table.
//!
//! PCB storage comes from the arena's TCP sub-pool; the table maps the
//! 4-tuple to a slot and hands out generation-checked handles so a freed
//! slot cannot be touched through a stale handle.

use crate::arena::{Arena, ArenaBuilder, PoolId};
use crate::constants::{POLL_INTERVAL_MS, RTO_INITIAL_MS};
use crate::error::Error;
use crate::pbuf::BufId;
use crate::profile::MemoryProfile;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

/// Stack time, in milliseconds since an arbitrary epoch.
pub type Millis = u64;

/// The standard TCP connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States in which the application may still write.
    pub fn can_send(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }
}

/// Opaque handle to one TCP connection. Invalid after `on_error` or once
/// the state machine reaches CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    pub(crate) idx: u32,
    pub(crate) gen: u32,
}

/// One segment sitting on the retransmission queue.
#[derive(Debug)]
pub(crate) struct TxSegment {
    pub seq: u32,
    pub len: u32,
    pub syn: bool,
    pub fin: bool,
    /// Payload chain; `None` for bare SYN/FIN.
    pub chain: Option<BufId>,
    /// Arena slot in the segment sub-pool, freed when the segment is acked.
    pub slot: u32,
    pub rtx_count: u8,
}

/// Out-of-order segment parked until the gap before it fills.
#[derive(Debug)]
pub(crate) struct OooSegment {
    pub seq: u32,
    pub len: u32,
    pub fin: bool,
    pub chain: Option<BufId>,
    /// Arena slot in the reassembly sub-pool.
    pub slot: u32,
    pub arrived_ms: Millis,
}

/// One TCP endpoint's full state.
#[derive(Debug)]
pub struct TcpPcb {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: TcpState,

    // Send sequence space.
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    /// Peer's advertised window, already scaled.
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    /// Effective send MSS: min(profile MSS, peer's MSS option).
    pub mss: u16,
    pub dup_acks: u8,
    /// Segments queued but not yet transmitted (window/cwnd gated).
    pub(crate) unsent: VecDeque<TxSegment>,
    /// Segments transmitted and awaiting acknowledgment.
    pub(crate) unacked: VecDeque<TxSegment>,

    // Receive sequence space.
    pub irs: u32,
    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub(crate) ooo: Vec<OooSegment>,

    // Negotiated options.
    /// Shift applied to the peer's window field (their scale).
    pub snd_scale: u8,
    /// Shift the peer applies to ours (we advertise zero).
    pub rcv_scale: u8,
    pub ts_enabled: bool,
    pub ts_recent: u32,
    pub sack_enabled: bool,

    // Timers, absolute deadlines in stack time.
    pub rto_ms: u64,
    pub rtx_deadline: Option<Millis>,
    pub last_activity: Millis,
    pub keepalive_probes: u8,
    pub keepalive_deadline: Option<Millis>,
    pub timewait_deadline: Option<Millis>,
    pub poll_deadline: Millis,

    /// FIN has been queued locally (close() called).
    pub local_fin_queued: bool,
    /// `on_accept` has been delivered for this connection.
    pub accepted: bool,

    pub(crate) gen: u32,
}

impl TcpPcb {
    pub(crate) fn new(
        local: SocketAddr,
        remote: SocketAddr,
        iss: u32,
        profile: &MemoryProfile,
        now: Millis,
    ) -> Self {
        Self {
            local,
            remote,
            state: TcpState::Closed,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            cwnd: 2 * profile.mss as u32,
            ssthresh: profile.snd_buf,
            mss: profile.mss,
            dup_acks: 0,
            unsent: VecDeque::new(),
            unacked: VecDeque::new(),
            irs: 0,
            rcv_nxt: 0,
            rcv_wnd: profile.recv_wnd,
            ooo: Vec::new(),
            snd_scale: 0,
            rcv_scale: 0,
            ts_enabled: false,
            ts_recent: 0,
            sack_enabled: false,
            rto_ms: RTO_INITIAL_MS,
            rtx_deadline: None,
            last_activity: now,
            keepalive_probes: 0,
            keepalive_deadline: None,
            timewait_deadline: None,
            poll_deadline: now + POLL_INTERVAL_MS,
            local_fin_queued: false,
            accepted: false,
            gen: 0,
        }
    }

    /// Bytes currently in flight.
    pub fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Send budget: min(peer window, congestion window) minus in flight.
    pub fn send_budget(&self) -> u32 {
        let wnd = self.snd_wnd.min(self.cwnd);
        wnd.saturating_sub(self.in_flight())
    }
}

/// Fixed-capacity table of TCP PCBs keyed by 4-tuple.
#[derive(Debug)]
pub struct ConnTable {
    slots: Vec<Option<TcpPcb>>,
    generations: Vec<u32>,
    pool: PoolId,
    map: HashMap<(SocketAddr, SocketAddr), u32>,
}

impl ConnTable {
    pub fn new(builder: &mut ArenaBuilder, capacity: usize) -> Result<Self, Error> {
        let pool = builder.reserve("tcp-pcb", capacity, std::mem::size_of::<TcpPcb>())?;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots,
            generations: vec![0; capacity],
            pool,
            map: HashMap::with_capacity(capacity),
        })
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    /// Inserts a PCB, consuming one slot. Exhaustion is the caller's signal
    /// to silently drop the SYN.
    pub fn insert(&mut self, arena: &mut Arena, mut pcb: TcpPcb) -> Result<ConnHandle, Error> {
        let idx = arena.alloc(self.pool)?;
        let gen = self.generations[idx as usize];
        pcb.gen = gen;
        self.map.insert((pcb.local, pcb.remote), idx);
        self.slots[idx as usize] = Some(pcb);
        Ok(ConnHandle { idx, gen })
    }

    pub fn lookup(&self, local: SocketAddr, remote: SocketAddr) -> Option<ConnHandle> {
        let idx = *self.map.get(&(local, remote))?;
        let gen = self.slots[idx as usize].as_ref()?.gen;
        Some(ConnHandle { idx, gen })
    }

    pub fn get(&self, h: ConnHandle) -> Option<&TcpPcb> {
        self.slots
            .get(h.idx as usize)?
            .as_ref()
            .filter(|p| p.gen == h.gen)
    }

    pub fn get_mut(&mut self, h: ConnHandle) -> Option<&mut TcpPcb> {
        self.slots
            .get_mut(h.idx as usize)?
            .as_mut()
            .filter(|p| p.gen == h.gen)
    }

    /// Takes the PCB out of its slot so the protocol engine can borrow it
    /// alongside the pools. Pair with `restore` (or `remove` after
    /// restoring, if the connection died).
    pub(crate) fn take(&mut self, h: ConnHandle) -> Option<TcpPcb> {
        let slot = self.slots.get_mut(h.idx as usize)?;
        if slot.as_ref()?.gen != h.gen {
            return None;
        }
        slot.take()
    }

    pub(crate) fn restore(&mut self, h: ConnHandle, pcb: TcpPcb) {
        self.slots[h.idx as usize] = Some(pcb);
    }

    /// Frees the slot and bumps its generation so outstanding handles go
    /// stale. Returns the PCB so the caller can release its buffers.
    pub fn remove(&mut self, arena: &mut Arena, h: ConnHandle) -> Option<TcpPcb> {
        let pcb = self.slots.get_mut(h.idx as usize)?.take()?;
        if pcb.gen != h.gen {
            // Stale handle; put it back untouched.
            self.slots[h.idx as usize] = Some(pcb);
            return None;
        }
        self.map.remove(&(pcb.local, pcb.remote));
        self.generations[h.idx as usize] = self.generations[h.idx as usize].wrapping_add(1);
        arena.free(self.pool, h.idx);
        Some(pcb)
    }

    /// Iterates live connection handles. Collected up front because timer
    /// processing mutates the table while walking it.
    pub fn handles(&self) -> Vec<ConnHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.as_ref().map(|p| ConnHandle {
                    idx: i as u32,
                    gen: p.gen,
                })
            })
            .collect()
    }
}
