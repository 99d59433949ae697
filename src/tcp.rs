//! The TCP engine: segment input processing, output building and timers.
//!
//! Storage lives in the PCB; this module is stateless per call. All
//! sequence arithmetic wraps. Segments outside the receive window are
//! dropped (with a challenge ACK); duplicate ACKs feed fast retransmit;
//! retransmission timeouts double up to a cap and then abort the
//! connection through a single fatal event.

use crate::arena::{Arena, PoolId};
use crate::constants::{
    DUP_ACK_THRESHOLD, KEEPALIVE_IDLE_MS, KEEPALIVE_INTERVAL_MS, KEEPALIVE_PROBES, MAX_RETRANSMITS,
    MAX_SACK_RANGES, MAX_SYN_RETRANSMITS, POLL_INTERVAL_MS, REASSEMBLY_TIMEOUT_MS, RTO_INITIAL_MS,
    RTO_MAX_MS, TIME_WAIT_MS,
};
use crate::error::{CloseReason, Error};
use crate::pbuf::{BufId, BufPool};
use crate::pcb::{Millis, OooSegment, TcpPcb, TcpState, TxSegment};
use crate::profile::MemoryProfile;
use crate::wire::{self, TcpOptionsOut, TcpSegmentOut, TcpView, TCP_ACK, TCP_FIN, TCP_PSH, TCP_SYN};
use tracing::{debug, trace};

/// `a < b` in sequence space.
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    !seq_lt(b, a)
}

/// What one engine call observed; the stack turns these into callbacks.
#[derive(Debug)]
pub(crate) enum TcpEvent {
    /// Handshake completed (either direction).
    Established,
    /// In-order payload ready for the application; chain ownership moves
    /// to the dispatcher.
    DataReady { chain: BufId, len: usize },
    /// Peer half-closed; delivered as `on_receive(None)`.
    PeerFin,
    /// The peer acknowledged this many new payload bytes.
    AckedBytes(usize),
    /// Fatal; dispatch `on_error` once and free the PCB.
    Fatal(CloseReason),
    /// Orderly teardown finished; free the PCB without a callback.
    CloseDone,
    /// Periodic application tick.
    Poll,
}

/// Mutable context shared by one engine call.
pub(crate) struct TcpCtx<'a> {
    pub profile: &'a MemoryProfile,
    pub arena: &'a mut Arena,
    pub bufs: &'a mut BufPool,
    pub seg_pool: PoolId,
    pub reass_pool: PoolId,
    pub now: Millis,
    pub ident: &'a mut u16,
    pub events: &'a mut Vec<TcpEvent>,
    pub egress: &'a mut Vec<Vec<u8>>,
}

impl TcpCtx<'_> {
    fn next_ident(&mut self) -> u16 {
        let id = *self.ident;
        *self.ident = self.ident.wrapping_add(1);
        id
    }

    /// Timestamp clock for the TCP timestamps option.
    fn ts_now(&self) -> u32 {
        self.now as u32
    }
}

/// Queues the SYN for an active open and transmits it.
pub(crate) fn send_syn(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) -> Result<(), Error> {
    enqueue_ctrl(pcb, ctx, true, false)?;
    pcb.state = TcpState::SynSent;
    push_output(pcb, ctx);
    Ok(())
}

/// Queues the SYN-ACK for a passive open and transmits it.
pub(crate) fn send_syn_ack(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) -> Result<(), Error> {
    enqueue_ctrl(pcb, ctx, true, false)?;
    pcb.state = TcpState::SynRcvd;
    push_output(pcb, ctx);
    Ok(())
}

fn enqueue_ctrl(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>, syn: bool, fin: bool) -> Result<(), Error> {
    let slot = ctx.arena.alloc(ctx.seg_pool)?;
    pcb.unsent.push_back(TxSegment {
        seq: pcb.snd_nxt,
        len: 0,
        syn,
        fin,
        chain: None,
        slot,
        rtx_count: 0,
    });
    pcb.snd_nxt = pcb.snd_nxt.wrapping_add(1);
    Ok(())
}

/// Application write: segmentize into the unsent queue, bounded by the send
/// buffer and the profile's segment-queue length, then transmit whatever
/// the windows allow. Returns the bytes accepted.
pub(crate) fn send_data(pcb: &mut TcpPcb, data: &[u8], ctx: &mut TcpCtx<'_>) -> Result<usize, Error> {
    if !pcb.state.can_send() {
        return Err(Error::InvalidState("connection not writable"));
    }
    let queued: u32 = pcb
        .unsent
        .iter()
        .chain(pcb.unacked.iter())
        .map(|s| s.len)
        .sum();
    let room = ctx.profile.snd_buf.saturating_sub(queued) as usize;
    if room == 0 {
        return Err(Error::QueueFull);
    }
    let data = &data[..data.len().min(room)];

    let mut accepted = 0;
    for piece in data.chunks(pcb.mss as usize) {
        let in_queue = (pcb.unsent.len() + pcb.unacked.len()) as u32;
        if in_queue >= ctx.profile.snd_queue_len {
            break;
        }
        let slot = match ctx.arena.alloc(ctx.seg_pool) {
            Ok(s) => s,
            Err(_) => break,
        };
        let chain = match ctx.bufs.acquire_from(ctx.arena, piece) {
            Ok(c) => c,
            Err(_) => {
                ctx.arena.free(ctx.seg_pool, slot);
                break;
            }
        };
        pcb.unsent.push_back(TxSegment {
            seq: pcb.snd_nxt,
            len: piece.len() as u32,
            syn: false,
            fin: false,
            chain: Some(chain),
            slot,
            rtx_count: 0,
        });
        pcb.snd_nxt = pcb.snd_nxt.wrapping_add(piece.len() as u32);
        accepted += piece.len();
    }
    if accepted == 0 {
        return Err(Error::QueueFull);
    }
    push_output(pcb, ctx);
    Ok(accepted)
}

/// Orderly close: queue a FIN after any pending data.
pub(crate) fn close(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) -> Result<(), Error> {
    match pcb.state {
        TcpState::Established => {
            enqueue_ctrl(pcb, ctx, false, true)?;
            pcb.state = TcpState::FinWait1;
        }
        TcpState::CloseWait => {
            enqueue_ctrl(pcb, ctx, false, true)?;
            pcb.state = TcpState::LastAck;
        }
        TcpState::SynRcvd | TcpState::SynSent => {
            return Err(Error::InvalidState("close before establishment; use abort"));
        }
        _ => return Err(Error::InvalidState("already closing")),
    }
    pcb.local_fin_queued = true;
    push_output(pcb, ctx);
    Ok(())
}

/// Immediate teardown: drop every queue, optionally tell the peer.
pub(crate) fn abort(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>, send_rst: bool) {
    if send_rst && pcb.state != TcpState::Closed && pcb.state != TcpState::TimeWait {
        let seg = TcpSegmentOut {
            src_port: pcb.local.port(),
            dst_port: pcb.remote.port(),
            seq: pcb.snd_nxt,
            ack: pcb.rcv_nxt,
            flags: wire::TCP_RST | TCP_ACK,
            window: 0,
            options: TcpOptionsOut::default(),
            payload: &[],
        };
        let ident = ctx.next_ident();
        ctx.egress.push(wire::build_tcp_datagram(
            pcb.local.ip(),
            pcb.remote.ip(),
            ident,
            &seg,
        ));
    }
    release_queues(pcb, ctx);
    pcb.state = TcpState::Closed;
}

/// Releases every buffer and arena slot the PCB holds. Idempotent.
pub(crate) fn release_queues(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) {
    for seg in pcb.unsent.drain(..).chain(pcb.unacked.drain(..)) {
        if let Some(chain) = seg.chain {
            ctx.bufs.release(ctx.arena, chain);
        }
        ctx.arena.free(ctx.seg_pool, seg.slot);
    }
    for seg in pcb.ooo.drain(..) {
        if let Some(chain) = seg.chain {
            ctx.bufs.release(ctx.arena, chain);
        }
        ctx.arena.free(ctx.reass_pool, seg.slot);
    }
    pcb.rtx_deadline = None;
    pcb.keepalive_deadline = None;
}

/// Processes one inbound segment already matched to this PCB.
pub(crate) fn input(pcb: &mut TcpPcb, seg: &TcpView<'_>, ctx: &mut TcpCtx<'_>) {
    pcb.last_activity = ctx.now;
    pcb.keepalive_probes = 0;

    if seg.flags & wire::TCP_RST != 0 {
        let acceptable = match pcb.state {
            TcpState::SynSent => seg.flags & TCP_ACK != 0 && seg.ack == pcb.snd_nxt,
            _ => in_receive_window(pcb, seg.seq, 0),
        };
        if acceptable {
            debug!(remote = %pcb.remote, "connection reset by peer");
            let reason = if pcb.state == TcpState::SynSent {
                CloseReason::Refused
            } else {
                CloseReason::Reset
            };
            release_queues(pcb, ctx);
            pcb.state = TcpState::Closed;
            ctx.events.push(TcpEvent::Fatal(reason));
        }
        return;
    }

    match pcb.state {
        TcpState::SynSent => input_syn_sent(pcb, seg, ctx),
        TcpState::SynRcvd
        | TcpState::Established
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::CloseWait
        | TcpState::Closing
        | TcpState::LastAck
        | TcpState::TimeWait => input_synchronized(pcb, seg, ctx),
        TcpState::Closed | TcpState::Listen => {}
    }
}

fn input_syn_sent(pcb: &mut TcpPcb, seg: &TcpView<'_>, ctx: &mut TcpCtx<'_>) {
    if seg.flags & TCP_SYN == 0 || seg.flags & TCP_ACK == 0 {
        return;
    }
    if seg.ack != pcb.snd_nxt {
        // Unacceptable ACK of our SYN.
        emit_ack(pcb, ctx);
        return;
    }
    pcb.irs = seg.seq;
    pcb.rcv_nxt = seg.seq.wrapping_add(1);
    negotiate_options(pcb, seg, ctx.profile);
    ack_segments(pcb, seg.ack, ctx);
    update_send_window(pcb, seg, true);
    pcb.state = TcpState::Established;
    debug!(remote = %pcb.remote, "active open established");
    ctx.events.push(TcpEvent::Established);
    emit_ack(pcb, ctx);
    push_output(pcb, ctx);
}

fn input_synchronized(pcb: &mut TcpPcb, seg: &TcpView<'_>, ctx: &mut TcpCtx<'_>) {
    let payload_len = seg.payload.len() as u32;

    // Retransmitted SYN inside SYN_RCVD: repeat the SYN-ACK.
    if seg.flags & TCP_SYN != 0 && pcb.state == TcpState::SynRcvd && seg.seq == pcb.irs {
        retransmit_front(pcb, ctx);
        return;
    }

    if !in_receive_window(pcb, seg.seq, payload_len) {
        // Out of window: drop, answer with a bare ACK so the peer resyncs.
        trace!(seq = seg.seq, "segment outside receive window");
        emit_ack(pcb, ctx);
        return;
    }

    if seg.flags & TCP_ACK == 0 {
        return;
    }

    if pcb.ts_enabled {
        if let Some((val, _)) = seg.options.timestamps {
            if seq_le(seg.seq, pcb.rcv_nxt) {
                pcb.ts_recent = val;
            }
        }
    }

    process_ack(pcb, seg, ctx);

    if pcb.state == TcpState::Closed {
        return;
    }

    if payload_len > 0 {
        process_payload(pcb, seg, ctx);
    }

    if seg.flags & TCP_FIN != 0 {
        process_fin(pcb, seg, ctx);
    }

    push_output(pcb, ctx);
}

/// RFC 793 segment acceptability against rcv_nxt and the receive window.
fn in_receive_window(pcb: &TcpPcb, seq: u32, len: u32) -> bool {
    let wnd = pcb.rcv_wnd;
    let wnd_end = pcb.rcv_nxt.wrapping_add(wnd);
    if len == 0 {
        if wnd == 0 {
            return seq == pcb.rcv_nxt;
        }
        return seq_le(pcb.rcv_nxt, seq) && seq_lt(seq, wnd_end);
    }
    if wnd == 0 {
        return false;
    }
    let seg_end = seq.wrapping_add(len).wrapping_sub(1);
    (seq_le(pcb.rcv_nxt, seq) && seq_lt(seq, wnd_end))
        || (seq_le(pcb.rcv_nxt, seg_end) && seq_lt(seg_end, wnd_end))
}

fn process_ack(pcb: &mut TcpPcb, seg: &TcpView<'_>, ctx: &mut TcpCtx<'_>) {
    let ack = seg.ack;

    if seq_lt(pcb.snd_una, ack) && seq_le(ack, pcb.snd_nxt) {
        let acked = ack_segments(pcb, ack, ctx);
        pcb.dup_acks = 0;
        pcb.rto_ms = RTO_INITIAL_MS;
        pcb.rtx_deadline = if pcb.unacked.is_empty() && pcb.unsent.is_empty() {
            None
        } else {
            Some(ctx.now + pcb.rto_ms)
        };

        // Slow start below ssthresh, additive increase above it.
        let mss = pcb.mss as u32;
        if pcb.cwnd < pcb.ssthresh {
            pcb.cwnd = pcb.cwnd.saturating_add(mss);
        } else {
            pcb.cwnd = pcb.cwnd.saturating_add((mss * mss / pcb.cwnd).max(1));
        }

        if pcb.state == TcpState::SynRcvd {
            pcb.state = TcpState::Established;
            debug!(remote = %pcb.remote, "passive open established");
            ctx.events.push(TcpEvent::Established);
        }

        if acked > 0 {
            ctx.events.push(TcpEvent::AckedBytes(acked));
        }

        // Our FIN is acked once nothing remains outstanding.
        if pcb.local_fin_queued && pcb.unacked.is_empty() && pcb.unsent.is_empty() {
            match pcb.state {
                TcpState::FinWait1 => pcb.state = TcpState::FinWait2,
                TcpState::Closing => enter_time_wait(pcb, ctx),
                TcpState::LastAck => {
                    release_queues(pcb, ctx);
                    pcb.state = TcpState::Closed;
                    ctx.events.push(TcpEvent::CloseDone);
                }
                _ => {}
            }
        }
    } else if ack == pcb.snd_una
        && !pcb.unacked.is_empty()
        && seg.payload.is_empty()
        && seg.flags & (TCP_SYN | TCP_FIN) == 0
    {
        pcb.dup_acks = pcb.dup_acks.saturating_add(1);
        if pcb.dup_acks == DUP_ACK_THRESHOLD {
            // Fast retransmit: halve the pipe and resend the hole.
            let mss = pcb.mss as u32;
            pcb.ssthresh = (pcb.in_flight() / 2).max(2 * mss);
            pcb.cwnd = pcb.ssthresh + 3 * mss;
            debug!(remote = %pcb.remote, seq = pcb.snd_una, "fast retransmit");
            retransmit_front(pcb, ctx);
        }
    }

    update_send_window(pcb, seg, false);
}

/// Removes fully-acknowledged segments, returning acked payload bytes.
fn ack_segments(pcb: &mut TcpPcb, ack: u32, ctx: &mut TcpCtx<'_>) -> usize {
    let mut acked_payload = 0;
    loop {
        let fully_acked = match pcb.unacked.front() {
            Some(front) => {
                let seg_len = front.len + front.syn as u32 + front.fin as u32;
                seq_le(front.seq.wrapping_add(seg_len), ack)
            }
            None => false,
        };
        if !fully_acked {
            break;
        }
        if let Some(seg) = pcb.unacked.pop_front() {
            acked_payload += seg.len as usize;
            if let Some(chain) = seg.chain {
                ctx.bufs.release(ctx.arena, chain);
            }
            ctx.arena.free(ctx.seg_pool, seg.slot);
        }
    }
    if seq_lt(pcb.snd_una, ack) {
        pcb.snd_una = ack;
    }
    acked_payload
}

fn update_send_window(pcb: &mut TcpPcb, seg: &TcpView<'_>, force: bool) {
    if force
        || seq_lt(pcb.snd_wl1, seg.seq)
        || (pcb.snd_wl1 == seg.seq && seq_le(pcb.snd_wl2, seg.ack))
    {
        pcb.snd_wnd = (seg.window as u32) << pcb.snd_scale;
        pcb.snd_wl1 = seg.seq;
        pcb.snd_wl2 = seg.ack;
    }
}

fn process_payload(pcb: &mut TcpPcb, seg: &TcpView<'_>, ctx: &mut TcpCtx<'_>) {
    if !matches!(
        pcb.state,
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
    ) {
        return;
    }

    let mut seq = seg.seq;
    let mut payload = seg.payload;

    // Trim the part we already have.
    if seq_lt(seq, pcb.rcv_nxt) {
        let skip = pcb.rcv_nxt.wrapping_sub(seq) as usize;
        if skip >= payload.len() {
            // Complete duplicate; re-ACK for retransmit tolerance.
            emit_ack(pcb, ctx);
            return;
        }
        payload = &payload[skip..];
        seq = pcb.rcv_nxt;
    }

    if seq == pcb.rcv_nxt {
        // In order. Copy into pool buffers once; all later layers read in
        // place. On pool exhaustion the segment is dropped un-ACKed so the
        // peer retransmits.
        let chain = match ctx.bufs.acquire_from(ctx.arena, payload) {
            Ok(c) => c,
            Err(_) => {
                trace!("buffer pool exhausted; dropping in-order segment");
                return;
            }
        };
        pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(payload.len() as u32);
        ctx.events.push(TcpEvent::DataReady {
            chain,
            len: payload.len(),
        });
        drain_ooo(pcb, ctx);
        emit_ack(pcb, ctx);
    } else {
        // Future segment: park it, bounded by the reassembly pool, and tell
        // the peer what we do have via a duplicate ACK (+SACK).
        park_ooo(pcb, seq, payload, seg.flags & TCP_FIN != 0, ctx);
        emit_ack(pcb, ctx);
    }
}

fn park_ooo(pcb: &mut TcpPcb, seq: u32, payload: &[u8], fin: bool, ctx: &mut TcpCtx<'_>) {
    if pcb.ooo.iter().any(|o| o.seq == seq) {
        return;
    }
    let slot = match ctx.arena.alloc(ctx.reass_pool) {
        Ok(s) => s,
        Err(_) => {
            // Queue is at capacity; drop the oldest entry to make room so
            // progress near rcv_nxt is still possible.
            if let Some((i, _)) = pcb
                .ooo
                .iter()
                .enumerate()
                .min_by_key(|(_, o)| o.arrived_ms)
            {
                let old = pcb.ooo.swap_remove(i);
                if let Some(chain) = old.chain {
                    ctx.bufs.release(ctx.arena, chain);
                }
                old.slot
            } else {
                return;
            }
        }
    };
    let chain = match ctx.bufs.acquire_from(ctx.arena, payload) {
        Ok(c) => c,
        Err(_) => {
            ctx.arena.free(ctx.reass_pool, slot);
            return;
        }
    };
    pcb.ooo.push(OooSegment {
        seq,
        len: payload.len() as u32,
        fin,
        chain: Some(chain),
        slot,
        arrived_ms: ctx.now,
    });
}

/// Delivers parked segments that have become contiguous. Zero copy: the
/// parked chain moves straight to the application event.
fn drain_ooo(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) {
    loop {
        // Drop entries entirely below rcv_nxt (covered by retransmits).
        let mut i = 0;
        while i < pcb.ooo.len() {
            let end = pcb.ooo[i].seq.wrapping_add(pcb.ooo[i].len);
            if seq_le(end, pcb.rcv_nxt) && !pcb.ooo[i].fin {
                let old = pcb.ooo.swap_remove(i);
                if let Some(chain) = old.chain {
                    ctx.bufs.release(ctx.arena, chain);
                }
                ctx.arena.free(ctx.reass_pool, old.slot);
            } else {
                i += 1;
            }
        }

        let Some(pos) = pcb.ooo.iter().position(|o| o.seq == pcb.rcv_nxt) else {
            return;
        };
        let seg = pcb.ooo.swap_remove(pos);
        pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(seg.len);
        if let Some(chain) = seg.chain {
            ctx.events.push(TcpEvent::DataReady {
                chain,
                len: seg.len as usize,
            });
        }
        ctx.arena.free(ctx.reass_pool, seg.slot);
        if seg.fin {
            peer_fin_arrived(pcb, ctx);
            return;
        }
    }
}

fn process_fin(pcb: &mut TcpPcb, seg: &TcpView<'_>, ctx: &mut TcpCtx<'_>) {
    let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
    if seq_lt(fin_seq, pcb.rcv_nxt) {
        // Old retransmitted FIN, already consumed; re-ACK.
        emit_ack(pcb, ctx);
        return;
    }
    if fin_seq != pcb.rcv_nxt {
        // FIN beyond a hole; it is parked with its payload (or here, a bare
        // future FIN) and handled when reassembly reaches it.
        if seg.payload.is_empty() {
            park_ooo(pcb, seg.seq, &[], true, ctx);
        }
        return;
    }
    peer_fin_arrived(pcb, ctx);
}

fn peer_fin_arrived(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) {
    pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(1);
    ctx.events.push(TcpEvent::PeerFin);
    match pcb.state {
        TcpState::SynRcvd | TcpState::Established => pcb.state = TcpState::CloseWait,
        TcpState::FinWait1 => {
            if pcb.unacked.is_empty() && pcb.unsent.is_empty() {
                enter_time_wait(pcb, ctx);
            } else {
                pcb.state = TcpState::Closing;
            }
        }
        TcpState::FinWait2 => enter_time_wait(pcb, ctx),
        _ => {}
    }
    emit_ack(pcb, ctx);
}

fn enter_time_wait(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) {
    release_queues(pcb, ctx);
    pcb.state = TcpState::TimeWait;
    pcb.timewait_deadline = Some(ctx.now + TIME_WAIT_MS);
}

/// Transmits unsent segments while the send budget allows.
pub(crate) fn push_output(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) {
    loop {
        let sendable = match pcb.unsent.front() {
            // Control segments always go; data respects min(cwnd, peer window).
            Some(front) if front.len > 0 => {
                let wnd = pcb.snd_wnd.min(pcb.cwnd);
                let outstanding = front.seq.wrapping_sub(pcb.snd_una);
                outstanding + front.len <= wnd
            }
            Some(_) => true,
            None => false,
        };
        if !sendable {
            break;
        }
        if let Some(seg) = pcb.unsent.pop_front() {
            transmit_segment(pcb, &seg, ctx);
            pcb.unacked.push_back(seg);
        }
    }
    // In-flight data keeps the timer armed; data blocked by a closed
    // window is picked up by the zero-window path on the tick.
    if pcb.rtx_deadline.is_none() && !(pcb.unacked.is_empty() && pcb.unsent.is_empty()) {
        pcb.rtx_deadline = Some(ctx.now + pcb.rto_ms);
    }
}

fn transmit_segment(pcb: &TcpPcb, seg: &TxSegment, ctx: &mut TcpCtx<'_>) {
    let mut payload = Vec::new();
    if let Some(chain) = seg.chain {
        ctx.bufs.copy_out(chain, &mut payload);
    }

    let mut flags = TCP_ACK;
    let mut ack = pcb.rcv_nxt;
    let mut options = TcpOptionsOut::default();
    if seg.syn {
        flags = TCP_SYN;
        options.mss = Some(ctx.profile.mss);
        if pcb.state != TcpState::SynSent {
            // SYN-ACK: mirror only what the peer offered.
            flags |= TCP_ACK;
            if ctx.profile.window_scaling && pcb.snd_scale > 0 {
                options.window_scale = Some(pcb.rcv_scale);
            }
            options.sack_permitted = ctx.profile.sack && pcb.sack_enabled;
            if ctx.profile.timestamps && pcb.ts_enabled {
                options.timestamps = Some((ctx.ts_now(), pcb.ts_recent));
            }
        } else {
            // Active-open SYN: offer everything the profile enables.
            ack = 0;
            if ctx.profile.window_scaling {
                options.window_scale = Some(pcb.rcv_scale);
            }
            options.sack_permitted = ctx.profile.sack;
            if ctx.profile.timestamps {
                options.timestamps = Some((ctx.ts_now(), 0));
            }
        }
    } else {
        if seg.fin {
            flags |= TCP_FIN;
        }
        if seg.len > 0 {
            flags |= TCP_PSH;
        }
        if pcb.ts_enabled {
            options.timestamps = Some((ctx.ts_now(), pcb.ts_recent));
        }
    }

    let out = TcpSegmentOut {
        src_port: pcb.local.port(),
        dst_port: pcb.remote.port(),
        seq: seg.seq,
        ack,
        flags,
        window: advertised_window(pcb),
        options,
        payload: &payload,
    };
    let ident = ctx.next_ident();
    ctx.egress.push(wire::build_tcp_datagram(
        pcb.local.ip(),
        pcb.remote.ip(),
        ident,
        &out,
    ));
}

/// Sends a bare ACK carrying the current window and any SACK ranges.
pub(crate) fn emit_ack(pcb: &TcpPcb, ctx: &mut TcpCtx<'_>) {
    let mut options = TcpOptionsOut::default();
    if pcb.ts_enabled {
        options.timestamps = Some((ctx.ts_now(), pcb.ts_recent));
    }
    if pcb.sack_enabled && !pcb.ooo.is_empty() {
        options.sack_blocks = sack_ranges(pcb);
    }
    let seg = TcpSegmentOut {
        src_port: pcb.local.port(),
        dst_port: pcb.remote.port(),
        seq: pcb.snd_nxt,
        ack: pcb.rcv_nxt,
        flags: TCP_ACK,
        window: advertised_window(pcb),
        options,
        payload: &[],
    };
    let ident = ctx.next_ident();
    ctx.egress.push(wire::build_tcp_datagram(
        pcb.local.ip(),
        pcb.remote.ip(),
        ident,
        &seg,
    ));
}

fn advertised_window(pcb: &TcpPcb) -> u16 {
    (pcb.rcv_wnd >> pcb.rcv_scale).min(u16::MAX as u32) as u16
}

/// Coalesces the out-of-order queue into SACK ranges, most recent hole
/// first, bounded by the profile's range cap.
fn sack_ranges(pcb: &TcpPcb) -> Vec<(u32, u32)> {
    let mut spans: Vec<(u32, u32)> = pcb
        .ooo
        .iter()
        .filter(|o| o.len > 0)
        .map(|o| (o.seq, o.seq.wrapping_add(o.len)))
        .collect();
    spans.sort_unstable_by(|a, b| {
        if seq_lt(a.0, b.0) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    });
    let mut merged: Vec<(u32, u32)> = Vec::new();
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if seq_le(start, last.1) => {
                if seq_lt(last.1, end) {
                    last.1 = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }
    merged.truncate(MAX_SACK_RANGES);
    merged
}

/// Adopts the peer's options during handshake.
pub(crate) fn negotiate_options(pcb: &mut TcpPcb, seg: &TcpView<'_>, profile: &MemoryProfile) {
    if let Some(peer_mss) = seg.options.mss {
        pcb.mss = pcb.mss.min(peer_mss);
    }
    if profile.window_scaling {
        if let Some(scale) = seg.options.window_scale {
            pcb.snd_scale = scale.min(14);
            pcb.rcv_scale = 0;
        }
    }
    pcb.sack_enabled = profile.sack && seg.options.sack_permitted;
    if profile.timestamps {
        if let Some((val, _)) = seg.options.timestamps {
            pcb.ts_enabled = true;
            pcb.ts_recent = val;
        }
    }
    pcb.snd_wnd = (seg.window as u32) << pcb.snd_scale;
    pcb.snd_wl1 = seg.seq;
    pcb.snd_wl2 = seg.ack;
}

/// Retransmits the oldest unacknowledged segment without touching timers.
fn retransmit_front(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) {
    if let Some(seg) = pcb.unacked.pop_front() {
        transmit_segment(pcb, &seg, ctx);
        pcb.unacked.push_front(seg);
    }
}

/// Per-connection timer pass, run from the stack's coarse tick. Order:
/// retransmission, out-of-order expiry, keepalive, TIME_WAIT.
pub(crate) fn on_tick(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_>) {
    // Retransmission timeout.
    if let Some(deadline) = pcb.rtx_deadline {
        if ctx.now >= deadline {
            if !pcb.unacked.is_empty() {
                let (limit, is_handshake) = match pcb.state {
                    TcpState::SynSent | TcpState::SynRcvd => (MAX_SYN_RETRANSMITS, true),
                    _ => (MAX_RETRANSMITS, false),
                };
                let mut count = 0;
                if let Some(front) = pcb.unacked.front_mut() {
                    front.rtx_count = front.rtx_count.saturating_add(1);
                    count = front.rtx_count;
                }
                if count > limit {
                    debug!(remote = %pcb.remote, count, handshake = is_handshake, "retransmission limit; aborting");
                    release_queues(pcb, ctx);
                    pcb.state = TcpState::Closed;
                    ctx.events.push(TcpEvent::Fatal(CloseReason::Aborted));
                    return;
                }
                // Timeout: collapse to slow start and back off the timer.
                let mss = pcb.mss as u32;
                pcb.ssthresh = (pcb.in_flight() / 2).max(2 * mss);
                pcb.cwnd = mss;
                pcb.dup_acks = 0;
                retransmit_front(pcb, ctx);
                pcb.rto_ms = (pcb.rto_ms * 2).min(RTO_MAX_MS);
                pcb.rtx_deadline = Some(ctx.now + pcb.rto_ms);
            } else if !pcb.unsent.is_empty() {
                // Zero-window persist: data is queued, nothing is in
                // flight, and the window-opening ACK may have been lost.
                // Probe until the peer answers.
                let mut count = 0;
                if let Some(front) = pcb.unsent.front_mut() {
                    front.rtx_count = front.rtx_count.saturating_add(1);
                    count = front.rtx_count;
                }
                if count > MAX_RETRANSMITS {
                    debug!(remote = %pcb.remote, "window probe limit; aborting");
                    release_queues(pcb, ctx);
                    pcb.state = TcpState::Closed;
                    ctx.events.push(TcpEvent::Fatal(CloseReason::Aborted));
                    return;
                }
                send_probe(pcb, pcb.snd_una.wrapping_sub(1), ctx);
                pcb.rto_ms = (pcb.rto_ms * 2).min(RTO_MAX_MS);
                pcb.rtx_deadline = Some(ctx.now + pcb.rto_ms);
            } else {
                pcb.rtx_deadline = None;
            }
        }
    }

    // Expire parked out-of-order segments.
    let mut i = 0;
    while i < pcb.ooo.len() {
        if ctx.now.saturating_sub(pcb.ooo[i].arrived_ms) >= REASSEMBLY_TIMEOUT_MS {
            let old = pcb.ooo.swap_remove(i);
            if let Some(chain) = old.chain {
                ctx.bufs.release(ctx.arena, chain);
            }
            ctx.arena.free(ctx.reass_pool, old.slot);
        } else {
            i += 1;
        }
    }

    // Keepalive probing on idle established connections. Outstanding data
    // already drives the retransmission timer.
    if pcb.state == TcpState::Established && pcb.unacked.is_empty() {
        let idle = ctx.now.saturating_sub(pcb.last_activity);
        if idle >= KEEPALIVE_IDLE_MS {
            let due = match pcb.keepalive_deadline {
                Some(d) => ctx.now >= d,
                None => true,
            };
            if due {
                if pcb.keepalive_probes >= KEEPALIVE_PROBES {
                    debug!(remote = %pcb.remote, "keepalive timeout");
                    release_queues(pcb, ctx);
                    pcb.state = TcpState::Closed;
                    ctx.events.push(TcpEvent::Fatal(CloseReason::KeepaliveTimeout));
                    return;
                }
                send_probe(pcb, pcb.snd_nxt.wrapping_sub(1), ctx);
                pcb.keepalive_probes += 1;
                pcb.keepalive_deadline = Some(ctx.now + KEEPALIVE_INTERVAL_MS);
            }
        }
    }

    // TIME_WAIT expiry ends the lifecycle.
    if pcb.state == TcpState::TimeWait {
        if let Some(d) = pcb.timewait_deadline {
            if ctx.now >= d {
                pcb.state = TcpState::Closed;
                ctx.events.push(TcpEvent::CloseDone);
                return;
            }
        }
    }

    // Application poll tick.
    if matches!(pcb.state, TcpState::Established | TcpState::CloseWait) && ctx.now >= pcb.poll_deadline
    {
        pcb.poll_deadline = ctx.now + POLL_INTERVAL_MS;
        ctx.events.push(TcpEvent::Poll);
    }
}

/// A probe is a bare ACK one byte below the peer's window edge, provoking
/// an ACK in return. Used for keepalive and zero-window probing.
fn send_probe(pcb: &TcpPcb, seq: u32, ctx: &mut TcpCtx<'_>) {
    let seg = TcpSegmentOut {
        src_port: pcb.local.port(),
        dst_port: pcb.remote.port(),
        seq,
        ack: pcb.rcv_nxt,
        flags: TCP_ACK,
        window: advertised_window(pcb),
        options: TcpOptionsOut::default(),
        payload: &[],
    };
    let ident = ctx.next_ident();
    ctx.egress.push(wire::build_tcp_datagram(
        pcb.local.ip(),
        pcb.remote.ip(),
        ident,
        &seg,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison_wraps() {
        assert!(seq_lt(0xFFFF_FFF0, 0x10));
        assert!(seq_lt(0, 1));
        assert!(!seq_lt(1, 0));
        assert!(seq_le(5, 5));
        assert!(!seq_le(6, 5));
    }

    #[test]
    fn test_window_acceptance_edges() {
        let profile = MemoryProfile::from_budget(16 * 1024 * 1024).unwrap();
        let local = "10.0.0.1:80".parse().unwrap();
        let remote = "10.0.0.2:4000".parse().unwrap();
        let mut pcb = TcpPcb::new(local, remote, 0, &profile, 0);
        pcb.rcv_nxt = 1000;
        pcb.rcv_wnd = 100;

        assert!(in_receive_window(&pcb, 1000, 0));
        assert!(in_receive_window(&pcb, 1099, 0));
        assert!(!in_receive_window(&pcb, 1100, 0));
        assert!(!in_receive_window(&pcb, 999, 0));
        // Overlapping payload partially in window is acceptable.
        assert!(in_receive_window(&pcb, 950, 100));
        // Entirely below the window is not.
        assert!(!in_receive_window(&pcb, 900, 50));
    }
}
