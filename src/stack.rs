//! The stack core: ingress demux, connection lifecycle, timers, egress.
//!
//! Single-threaded by design. Frames come in through [`ConduitStack::ingest`],
//! time advances through [`ConduitStack::poll`], and produced datagrams are
//! drained from the egress queue. All application interaction happens through
//! handler callbacks dispatched from within those two calls.

use crate::arena::{Arena, ArenaBuilder, PoolId};
use crate::constants::TCP_TICK_MS;
use crate::error::{CloseReason, Error};
use crate::pbuf::BufPool;
use crate::pcb::{ConnHandle, ConnTable, Millis, TcpPcb, TcpState, TxSegment};
use crate::profile::MemoryProfile;
use crate::reass::{ReassKey, ReassTable};
use crate::tcp::{self, TcpCtx, TcpEvent};
use crate::wire::{
    self, IcmpEchoView, IpView, TcpSegmentOut, TcpView, UdpView, PROTO_ICMP, PROTO_TCP, PROTO_UDP,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, trace};

/// Per-connection application callbacks.
///
/// Callbacks receive the stack so they can write, close, or open further
/// connections from inside the event. A handle passed to a callback is valid
/// for the duration of that callback unless the callback itself closes it.
pub trait ConnectionHandler {
    /// The three-way handshake completed.
    fn on_connected(&mut self, _stack: &mut ConduitStack, _conn: ConnHandle) {}

    /// In-order payload arrived, or the peer half-closed (`None`).
    fn on_receive(&mut self, stack: &mut ConduitStack, conn: ConnHandle, data: Option<Bytes>);

    /// The peer acknowledged `bytes` of previously written payload.
    fn on_sent(&mut self, _stack: &mut ConduitStack, _conn: ConnHandle, _bytes: usize) {}

    /// Coarse periodic tick for idle work.
    fn on_poll(&mut self, _stack: &mut ConduitStack, _conn: ConnHandle) {}

    /// The connection died. Fires exactly once; the handle is already
    /// invalid when this is called.
    fn on_error(&mut self, reason: CloseReason);
}

/// Accept gate for a listening port.
pub trait ListenHandler {
    /// A SYN arrived. Return the connection's handler to accept, or `None`
    /// to refuse (the client sees a reset).
    fn on_accept(
        &mut self,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Option<Box<dyn ConnectionHandler + Send>>;
}

/// Datagram callbacks for a bound UDP port.
pub trait UdpHandler {
    fn on_datagram(
        &mut self,
        stack: &mut ConduitStack,
        src: SocketAddr,
        dst: SocketAddr,
        payload: Bytes,
    );
}

struct Listener {
    slot: u32,
    handler: Box<dyn ListenHandler + Send>,
}

struct UdpBind {
    slot: u32,
    handler: Box<dyn UdpHandler + Send>,
}

pub struct ConduitStack {
    profile: MemoryProfile,
    arena: Arena,
    bufs: BufPool,
    seg_pool: PoolId,
    reass_pool: PoolId,
    listen_pool: PoolId,
    udp_pool: PoolId,
    conns: ConnTable,
    reass: ReassTable,
    listeners: HashMap<u16, Listener>,
    udp_binds: HashMap<u16, UdpBind>,
    handlers: HashMap<ConnHandle, Box<dyn ConnectionHandler + Send>>,
    egress: Vec<Vec<u8>>,
    now: Millis,
    last_tick: Millis,
    ident: u16,
}

impl ConduitStack {
    /// Builds the stack, reserving every pool against the profile's budget
    /// up front. Nothing allocates per packet after this returns.
    pub fn new(profile: MemoryProfile) -> Result<Self, Error> {
        let mut builder = ArenaBuilder::new(profile.mem_budget);
        let bufs = BufPool::new(&mut builder, profile.pbuf_count, profile.pbuf_size)?;
        let seg_pool = builder.reserve(
            "tcp-seg",
            profile.seg_count,
            std::mem::size_of::<TxSegment>(),
        )?;
        let conns = ConnTable::new(&mut builder, profile.tcp_pcbs)?;
        let listen_pool = builder.reserve("tcp-listen", profile.listen_pcbs, 64)?;
        let udp_pool = builder.reserve("udp-pcb", profile.udp_pcbs, 64)?;
        let reass_pool = builder.reserve("ip-reass", profile.reass_entries, 64)?;
        let arena = builder.build();
        let reass = ReassTable::new(reass_pool);

        debug!(
            budget = profile.mem_budget,
            pbufs = profile.pbuf_count,
            tcp_pcbs = profile.tcp_pcbs,
            "stack initialized"
        );

        Ok(Self {
            profile,
            arena,
            bufs,
            seg_pool,
            reass_pool,
            listen_pool,
            udp_pool,
            conns,
            reass,
            listeners: HashMap::new(),
            udp_binds: HashMap::new(),
            handlers: HashMap::new(),
            egress: Vec::new(),
            now: 0,
            last_tick: 0,
            ident: 0,
        })
    }

    pub fn profile(&self) -> &MemoryProfile {
        &self.profile
    }

    // ---- application surface ----

    /// Starts accepting connections on `port`, bounded by the listen pool.
    pub fn listen(&mut self, port: u16, handler: Box<dyn ListenHandler + Send>) -> Result<(), Error> {
        if self.listeners.contains_key(&port) {
            return Err(Error::InvalidState("port already listening"));
        }
        let slot = self.arena.alloc(self.listen_pool)?;
        self.listeners.insert(port, Listener { slot, handler });
        Ok(())
    }

    pub fn unlisten(&mut self, port: u16) {
        if let Some(l) = self.listeners.remove(&port) {
            self.arena.free(self.listen_pool, l.slot);
        }
    }

    /// Active open toward `remote`, sourced from `local`.
    pub fn connect(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        handler: Box<dyn ConnectionHandler + Send>,
    ) -> Result<ConnHandle, Error> {
        if local.is_ipv4() != remote.is_ipv4() {
            return Err(Error::Config("mixed address families".into()));
        }
        if self.conns.lookup(local, remote).is_some() {
            return Err(Error::InvalidState("connection already exists"));
        }
        let iss = rand::random::<u32>();
        let pcb = TcpPcb::new(local, remote, iss, &self.profile, self.now);
        let h = self.conns.insert(&mut self.arena, pcb)?;
        self.handlers.insert(h, handler);
        match self.run_engine(h, |p, c| tcp::send_syn(p, c)) {
            Ok(Ok(())) => Ok(h),
            Ok(Err(e)) | Err(e) => {
                self.remove_conn(h);
                self.handlers.remove(&h);
                Err(e)
            }
        }
    }

    /// Writes payload to an established connection; returns bytes accepted.
    pub fn send(&mut self, h: ConnHandle, data: &[u8]) -> Result<usize, Error> {
        self.run_engine(h, |p, c| tcp::send_data(p, data, c))?
    }

    /// Orderly close: FIN after pending data. The handle stays valid until
    /// the teardown completes.
    pub fn close(&mut self, h: ConnHandle) -> Result<(), Error> {
        self.run_engine(h, |p, c| tcp::close(p, c))?
    }

    /// Immediate teardown with a reset. No `on_error` fires; the caller
    /// initiated this.
    pub fn abort(&mut self, h: ConnHandle) -> Result<(), Error> {
        self.run_engine(h, |p, c| tcp::abort(p, c, true))?;
        self.remove_conn(h);
        self.handlers.remove(&h);
        Ok(())
    }

    /// Binds a UDP port, bounded by the UDP endpoint pool.
    pub fn bind_udp(&mut self, port: u16, handler: Box<dyn UdpHandler + Send>) -> Result<(), Error> {
        if self.udp_binds.contains_key(&port) {
            return Err(Error::InvalidState("port already bound"));
        }
        let slot = self.arena.alloc(self.udp_pool)?;
        self.udp_binds.insert(port, UdpBind { slot, handler });
        Ok(())
    }

    pub fn unbind_udp(&mut self, port: u16) {
        if let Some(b) = self.udp_binds.remove(&port) {
            self.arena.free(self.udp_pool, b.slot);
        }
    }

    /// Emits one UDP datagram.
    pub fn send_udp(&mut self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<(), Error> {
        if src.is_ipv4() != dst.is_ipv4() {
            return Err(Error::Config("mixed address families".into()));
        }
        let ident = self.next_ident();
        self.egress.push(wire::build_udp_datagram(
            src.ip(),
            dst.ip(),
            ident,
            src.port(),
            dst.port(),
            payload,
        ));
        Ok(())
    }

    pub fn state(&self, h: ConnHandle) -> Option<TcpState> {
        self.conns.get(h).map(|p| p.state)
    }

    // ---- ingress ----

    /// Processes one raw IP datagram.
    pub fn ingest(&mut self, frame: &[u8], now: Millis) {
        self.now = now;
        let ip = match IpView::parse(frame) {
            Ok(ip) => ip,
            Err(e) => {
                trace!("unparseable frame dropped: {}", e);
                return;
            }
        };
        if self.profile.verify_rx_checksums && !IpView::verify_header_checksum(frame) {
            trace!("bad ip header checksum");
            return;
        }

        if let Some(frag) = ip.frag {
            if frag.is_fragment() {
                let key = ReassKey {
                    src: ip.src,
                    dst: ip.dst,
                    ident: frag.ident,
                    proto: ip.proto,
                };
                match self
                    .reass
                    .push(&mut self.arena, &mut self.bufs, key, frag, ip.payload, now)
                {
                    Ok(Some(whole)) => self.process_transport(ip.src, ip.dst, ip.proto, &whole),
                    Ok(None) => {}
                    Err(e) => trace!("fragment dropped: {}", e),
                }
                return;
            }
        }

        if self.profile.verify_rx_checksums && !wire::verify_transport_checksum(&ip) {
            trace!("bad transport checksum");
            return;
        }
        let (src, dst, proto) = (ip.src, ip.dst, ip.proto);
        self.process_transport(src, dst, proto, ip.payload);
    }

    fn process_transport(&mut self, src: IpAddr, dst: IpAddr, proto: u8, payload: &[u8]) {
        match proto {
            PROTO_TCP => self.tcp_segment(src, dst, payload),
            PROTO_UDP => self.udp_datagram(src, dst, payload),
            PROTO_ICMP => self.icmp_message(src, dst, payload),
            other => trace!(proto = other, "unsupported protocol dropped"),
        }
    }

    fn tcp_segment(&mut self, src: IpAddr, dst: IpAddr, payload: &[u8]) {
        let seg = match TcpView::parse(payload) {
            Ok(seg) => seg,
            Err(e) => {
                trace!("bad tcp segment: {}", e);
                return;
            }
        };
        let local = SocketAddr::new(dst, seg.dst_port);
        let remote = SocketAddr::new(src, seg.src_port);
        match self.conns.lookup(local, remote) {
            Some(h) => {
                let _ = self.run_engine(h, |p, c| tcp::input(p, &seg, c));
            }
            None => self.tcp_open(local, remote, &seg),
        }
    }

    /// Segment for an unknown 4-tuple: a SYN may open a connection on a
    /// listening port; anything else is answered with a reset.
    fn tcp_open(&mut self, local: SocketAddr, remote: SocketAddr, seg: &TcpView<'_>) {
        if seg.flags & wire::TCP_RST != 0 {
            return;
        }
        if seg.flags & wire::TCP_SYN == 0 || seg.flags & wire::TCP_ACK != 0 {
            self.send_rst_for(local, remote, seg);
            return;
        }
        let Some(mut listener) = self.listeners.remove(&local.port()) else {
            debug!(%local, %remote, "syn to closed port");
            self.send_rst_for(local, remote, seg);
            return;
        };
        if self.arena.free_slots(self.conns.pool_id()) == 0 {
            // Table full. Nothing goes back on the wire and the application
            // is not consulted; the client's SYN retransmit gets a fresh
            // chance at a slot.
            self.listeners.insert(local.port(), listener);
            debug!(%remote, "connection slots exhausted, syn dropped");
            return;
        }
        let decision = listener.handler.on_accept(remote, local);
        self.listeners.insert(local.port(), listener);
        let Some(handler) = decision else {
            debug!(%remote, "connection refused by listener");
            self.send_rst_for(local, remote, seg);
            return;
        };

        let iss = rand::random::<u32>();
        let mut pcb = TcpPcb::new(local, remote, iss, &self.profile, self.now);
        pcb.irs = seg.seq;
        pcb.rcv_nxt = seg.seq.wrapping_add(1);
        tcp::negotiate_options(&mut pcb, seg, &self.profile);
        let h = match self.conns.insert(&mut self.arena, pcb) {
            Ok(h) => h,
            Err(_) => return,
        };
        self.handlers.insert(h, handler);
        match self.run_engine(h, |p, c| tcp::send_syn_ack(p, c)) {
            Ok(Ok(())) => {}
            _ => {
                self.remove_conn(h);
                self.handlers.remove(&h);
            }
        }
    }

    fn send_rst_for(&mut self, local: SocketAddr, remote: SocketAddr, seg: &TcpView<'_>) {
        let (seq, ack, flags) = if seg.flags & wire::TCP_ACK != 0 {
            (seg.ack, 0, wire::TCP_RST)
        } else {
            let seg_len = seg.payload.len() as u32
                + (seg.flags & wire::TCP_SYN != 0) as u32
                + (seg.flags & wire::TCP_FIN != 0) as u32;
            (
                0,
                seg.seq.wrapping_add(seg_len),
                wire::TCP_RST | wire::TCP_ACK,
            )
        };
        let out = TcpSegmentOut {
            src_port: local.port(),
            dst_port: remote.port(),
            seq,
            ack,
            flags,
            window: 0,
            options: Default::default(),
            payload: &[],
        };
        let ident = self.next_ident();
        self.egress
            .push(wire::build_tcp_datagram(local.ip(), remote.ip(), ident, &out));
    }

    fn udp_datagram(&mut self, src: IpAddr, dst: IpAddr, payload: &[u8]) {
        let udp = match UdpView::parse(payload) {
            Ok(udp) => udp,
            Err(e) => {
                trace!("bad udp datagram: {}", e);
                return;
            }
        };
        let src_sa = SocketAddr::new(src, udp.src_port);
        let dst_sa = SocketAddr::new(dst, udp.dst_port);
        let Some(mut bind) = self.udp_binds.remove(&udp.dst_port) else {
            trace!(port = udp.dst_port, "udp datagram to unbound port");
            return;
        };
        let data = Bytes::copy_from_slice(udp.payload);
        bind.handler.on_datagram(self, src_sa, dst_sa, data);
        self.udp_binds.insert(dst_sa.port(), bind);
    }

    fn icmp_message(&mut self, src: IpAddr, dst: IpAddr, payload: &[u8]) {
        if !src.is_ipv4() {
            return;
        }
        let echo = match IcmpEchoView::parse(payload) {
            Ok(e) => e,
            Err(_) => return,
        };
        // Echo request; everything else is dropped.
        if echo.icmp_type == 8 && echo.code == 0 {
            let ident = self.next_ident();
            self.egress.push(wire::build_icmp_echo_reply(
                dst,
                src,
                ident,
                echo.identifier,
                echo.sequence,
                echo.payload,
            ));
        }
    }

    // ---- timers ----

    /// Advances stack time. Timer work runs on a coarse grid; calling more
    /// often than the tick interval is harmless.
    pub fn poll(&mut self, now: Millis) {
        self.now = now;
        if now.saturating_sub(self.last_tick) < TCP_TICK_MS {
            return;
        }
        self.last_tick = now;
        for h in self.conns.handles() {
            let _ = self.run_engine(h, |p, c| tcp::on_tick(p, c));
        }
        self.reass.expire(&mut self.arena, &mut self.bufs, now);
    }

    /// Milliseconds until the next timer tick is due.
    pub fn poll_delay(&self, now: Millis) -> Millis {
        (self.last_tick + TCP_TICK_MS).saturating_sub(now)
    }

    // ---- egress ----

    pub fn pop_egress(&mut self) -> Option<Vec<u8>> {
        if self.egress.is_empty() {
            None
        } else {
            Some(self.egress.remove(0))
        }
    }

    pub fn take_egress(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.egress)
    }

    pub fn egress_len(&self) -> usize {
        self.egress.len()
    }

    // ---- introspection, mainly for tests and gauges ----

    pub fn connection_count(&self) -> usize {
        self.conns.handles().len()
    }

    pub fn buffers_in_use(&self) -> usize {
        self.arena.in_use(self.bufs.pool_id())
    }

    pub fn conn_slots_in_use(&self) -> usize {
        self.arena.in_use(self.conns.pool_id())
    }

    pub fn seg_slots_in_use(&self) -> usize {
        self.arena.in_use(self.seg_pool)
    }

    // ---- internals ----

    fn next_ident(&mut self) -> u16 {
        let id = self.ident;
        self.ident = self.ident.wrapping_add(1);
        id
    }

    /// Runs one engine call against a connection: takes the PCB out of the
    /// table so the engine can borrow it next to the pools, restores it, and
    /// dispatches whatever events the call produced.
    fn run_engine<R>(
        &mut self,
        h: ConnHandle,
        f: impl FnOnce(&mut TcpPcb, &mut TcpCtx<'_>) -> R,
    ) -> Result<R, Error> {
        let mut pcb = self.conns.take(h).ok_or(Error::StaleHandle)?;
        let mut events = Vec::new();
        let out = {
            let mut ctx = TcpCtx {
                profile: &self.profile,
                arena: &mut self.arena,
                bufs: &mut self.bufs,
                seg_pool: self.seg_pool,
                reass_pool: self.reass_pool,
                now: self.now,
                ident: &mut self.ident,
                events: &mut events,
                egress: &mut self.egress,
            };
            f(&mut pcb, &mut ctx)
        };
        self.conns.restore(h, pcb);
        self.dispatch(h, events);
        Ok(out)
    }

    fn dispatch(&mut self, h: ConnHandle, events: Vec<TcpEvent>) {
        for ev in events {
            match ev {
                TcpEvent::Established => {
                    if let Some(pcb) = self.conns.get_mut(h) {
                        pcb.accepted = true;
                    }
                    self.with_handler(h, |handler, stack| handler.on_connected(stack, h));
                }
                TcpEvent::DataReady { chain, len } => {
                    let mut data = Vec::with_capacity(len);
                    self.bufs.copy_out(chain, &mut data);
                    self.bufs.release(&mut self.arena, chain);
                    let data = Bytes::from(data);
                    self.with_handler(h, move |handler, stack| {
                        handler.on_receive(stack, h, Some(data))
                    });
                }
                TcpEvent::PeerFin => {
                    self.with_handler(h, |handler, stack| handler.on_receive(stack, h, None));
                }
                TcpEvent::AckedBytes(n) => {
                    self.with_handler(h, move |handler, stack| handler.on_sent(stack, h, n));
                }
                TcpEvent::Poll => {
                    self.with_handler(h, |handler, stack| handler.on_poll(stack, h));
                }
                TcpEvent::Fatal(reason) => {
                    self.remove_conn(h);
                    if let Some(mut handler) = self.handlers.remove(&h) {
                        handler.on_error(reason);
                    }
                }
                TcpEvent::CloseDone => {
                    self.remove_conn(h);
                    self.handlers.remove(&h);
                }
            }
        }
    }

    /// Remove-invoke-reinsert so the handler can borrow the stack mutably.
    fn with_handler(
        &mut self,
        h: ConnHandle,
        f: impl FnOnce(&mut (dyn ConnectionHandler + Send), &mut Self),
    ) {
        if let Some(mut handler) = self.handlers.remove(&h) {
            f(handler.as_mut(), self);
            // The callback may have aborted the connection; only a live one
            // keeps its handler.
            if self.conns.get(h).is_some() {
                self.handlers.insert(h, handler);
            }
        }
    }

    /// Frees the table slot and anything the PCB still holds.
    fn remove_conn(&mut self, h: ConnHandle) {
        let Some(mut pcb) = self.conns.remove(&mut self.arena, h) else {
            return;
        };
        for seg in pcb.unsent.drain(..).chain(pcb.unacked.drain(..)) {
            if let Some(chain) = seg.chain {
                self.bufs.release(&mut self.arena, chain);
            }
            self.arena.free(self.seg_pool, seg.slot);
        }
        for o in pcb.ooo.drain(..) {
            if let Some(chain) = o.chain {
                self.bufs.release(&mut self.arena, chain);
            }
            self.arena.free(self.reass_pool, o.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{TcpOptionsOut, TCP_ACK, TCP_RST, TCP_SYN};
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    const CLIENT: &str = "10.0.0.2:40000";
    const SERVER: &str = "10.0.0.1:8080";

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        log: Log,
        echo: bool,
    }

    impl ConnectionHandler for Recorder {
        fn on_connected(&mut self, _stack: &mut ConduitStack, _conn: ConnHandle) {
            self.log.lock().unwrap().push("connected".into());
        }
        fn on_receive(&mut self, stack: &mut ConduitStack, conn: ConnHandle, data: Option<Bytes>) {
            match data {
                Some(d) => {
                    self.log
                        .lock()
                        .unwrap()
                        .push(format!("data:{}", String::from_utf8_lossy(&d)));
                    if self.echo {
                        stack.send(conn, &d).unwrap();
                    }
                }
                None => self.log.lock().unwrap().push("fin".into()),
            }
        }
        fn on_error(&mut self, reason: CloseReason) {
            self.log.lock().unwrap().push(format!("error:{}", reason));
        }
    }

    struct Acceptor {
        log: Log,
        echo: bool,
    }

    impl ListenHandler for Acceptor {
        fn on_accept(
            &mut self,
            _remote: SocketAddr,
            _local: SocketAddr,
        ) -> Option<Box<dyn ConnectionHandler + Send>> {
            Some(Box::new(Recorder {
                log: self.log.clone(),
                echo: self.echo,
            }))
        }
    }

    fn stack_with_listener(echo: bool) -> (ConduitStack, Log) {
        let profile = MemoryProfile::from_budget(16 * 1024 * 1024).unwrap();
        let mut stack = ConduitStack::new(profile).unwrap();
        let log: Log = Arc::default();
        stack
            .listen(
                8080,
                Box::new(Acceptor {
                    log: log.clone(),
                    echo,
                }),
            )
            .unwrap();
        (stack, log)
    }

    fn client_seg_wnd(seq: u32, ack: u32, flags: u8, window: u16, payload: &[u8]) -> Vec<u8> {
        let client: SocketAddr = CLIENT.parse().unwrap();
        let server: SocketAddr = SERVER.parse().unwrap();
        let options = if flags & TCP_SYN != 0 {
            TcpOptionsOut {
                mss: Some(1460),
                ..Default::default()
            }
        } else {
            TcpOptionsOut::default()
        };
        wire::build_tcp_datagram(
            client.ip(),
            server.ip(),
            7,
            &TcpSegmentOut {
                src_port: client.port(),
                dst_port: server.port(),
                seq,
                ack,
                flags,
                window,
                options,
                payload,
            },
        )
    }

    fn client_seg(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        client_seg_wnd(seq, ack, flags, 65535, payload)
    }

    /// Runs the handshake and returns the server's ISS.
    fn handshake(stack: &mut ConduitStack) -> u32 {
        stack.ingest(&client_seg(999, 0, TCP_SYN, &[]), 0);
        let synack = stack.pop_egress().expect("syn-ack");
        let ip = IpView::parse(&synack).unwrap();
        let tcp = TcpView::parse(ip.payload).unwrap();
        assert_eq!(tcp.flags & (TCP_SYN | TCP_ACK), TCP_SYN | TCP_ACK);
        assert_eq!(tcp.ack, 1000);
        stack.ingest(&client_seg(1000, tcp.seq.wrapping_add(1), TCP_ACK, &[]), 1);
        tcp.seq
    }

    #[test]
    fn test_passive_open_reaches_established() {
        let (mut stack, log) = stack_with_listener(false);
        handshake(&mut stack);
        assert_eq!(log.lock().unwrap().as_slice(), ["connected"]);
        assert_eq!(stack.connection_count(), 1);
    }

    #[test]
    fn test_payload_delivered_and_acked() {
        let (mut stack, log) = stack_with_listener(false);
        let iss = handshake(&mut stack);
        stack.ingest(&client_seg(1000, iss.wrapping_add(1), TCP_ACK, b"ping"), 2);
        assert!(log.lock().unwrap().contains(&"data:ping".to_string()));
        // The delivery is acknowledged.
        let ack = stack.pop_egress().expect("ack");
        let tcp = TcpView::parse(IpView::parse(&ack).unwrap().payload).unwrap();
        assert_eq!(tcp.ack, 1004);
    }

    #[test]
    fn test_echo_through_handler() {
        let (mut stack, _log) = stack_with_listener(true);
        let iss = handshake(&mut stack);
        stack.ingest(&client_seg(1000, iss.wrapping_add(1), TCP_ACK, b"hello"), 2);
        // First egress is the data ACK, then the echoed payload.
        let frames = stack.take_egress();
        let echoed = frames
            .iter()
            .filter_map(|f| {
                let ip = IpView::parse(f).ok()?;
                let tcp = TcpView::parse(ip.payload).ok()?;
                (!tcp.payload.is_empty()).then(|| tcp.payload.to_vec())
            })
            .next();
        assert_eq!(echoed.as_deref(), Some(b"hello".as_slice()));
    }

    #[test]
    fn test_syn_to_closed_port_resets() {
        let profile = MemoryProfile::from_budget(1024 * 1024).unwrap();
        let mut stack = ConduitStack::new(profile).unwrap();
        stack.ingest(&client_seg(5, 0, TCP_SYN, &[]), 0);
        let rst = stack.pop_egress().expect("rst");
        let tcp = TcpView::parse(IpView::parse(&rst).unwrap().payload).unwrap();
        assert_ne!(tcp.flags & TCP_RST, 0);
        assert_eq!(tcp.ack, 6);
    }

    #[test]
    fn test_icmp_echo_reply() {
        let profile = MemoryProfile::from_budget(1024 * 1024).unwrap();
        let mut stack = ConduitStack::new(profile).unwrap();

        let mut icmp = vec![8u8, 0, 0, 0, 0xAB, 0xCD, 0, 9];
        icmp.extend_from_slice(b"payload");
        let csum = wire::internet_checksum(&[&icmp]);
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());
        let req = wire::build_ip_datagram(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            PROTO_ICMP,
            0,
            &icmp,
        );

        stack.ingest(&req, 0);
        let reply = stack.pop_egress().expect("echo reply");
        let ip = IpView::parse(&reply).unwrap();
        assert_eq!(ip.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        let echo = IcmpEchoView::parse(ip.payload).unwrap();
        assert_eq!(echo.icmp_type, 0);
        assert_eq!(echo.identifier, 0xABCD);
        assert_eq!(echo.sequence, 9);
        assert_eq!(echo.payload, b"payload");
    }

    struct UdpEcho;
    impl UdpHandler for UdpEcho {
        fn on_datagram(
            &mut self,
            stack: &mut ConduitStack,
            src: SocketAddr,
            dst: SocketAddr,
            payload: Bytes,
        ) {
            stack.send_udp(dst, src, &payload).unwrap();
        }
    }

    #[test]
    fn test_udp_bind_and_echo() {
        let profile = MemoryProfile::from_budget(1024 * 1024).unwrap();
        let mut stack = ConduitStack::new(profile).unwrap();
        stack.bind_udp(5353, Box::new(UdpEcho)).unwrap();

        let req = wire::build_udp_datagram(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            0,
            9999,
            5353,
            b"query",
        );
        stack.ingest(&req, 0);
        let reply = stack.pop_egress().expect("udp echo");
        let ip = IpView::parse(&reply).unwrap();
        let udp = UdpView::parse(ip.payload).unwrap();
        assert_eq!(udp.src_port, 5353);
        assert_eq!(udp.dst_port, 9999);
        assert_eq!(udp.payload, b"query");
    }

    #[test]
    fn test_orderly_close_returns_slot_after_time_wait() {
        use crate::constants::{TCP_TICK_MS, TIME_WAIT_MS};
        let (mut stack, log) = stack_with_listener(false);
        let iss = handshake(&mut stack);
        let h = stack
            .conns
            .lookup(SERVER.parse().unwrap(), CLIENT.parse().unwrap())
            .unwrap();

        // Local close sends FIN; peer ACKs it, then FINs back.
        stack.close(h).unwrap();
        assert_eq!(stack.state(h), Some(TcpState::FinWait1));
        let fin = stack.pop_egress().expect("fin");
        let tcp = TcpView::parse(IpView::parse(&fin).unwrap().payload).unwrap();
        assert_ne!(tcp.flags & wire::TCP_FIN, 0);

        stack.ingest(&client_seg(1000, iss.wrapping_add(2), TCP_ACK, &[]), 5);
        assert_eq!(stack.state(h), Some(TcpState::FinWait2));
        stack.ingest(
            &client_seg(1000, iss.wrapping_add(2), TCP_ACK | wire::TCP_FIN, &[]),
            6,
        );
        assert_eq!(stack.state(h), Some(TcpState::TimeWait));
        assert!(log.lock().unwrap().contains(&"fin".to_string()));

        // TIME_WAIT expiry frees the slot without an error callback.
        stack.poll(TIME_WAIT_MS + TCP_TICK_MS + 10);
        assert_eq!(stack.state(h), None);
        assert_eq!(stack.conn_slots_in_use(), 0);
        assert!(!log.lock().unwrap().iter().any(|e| e.starts_with("error")));
    }

    #[test]
    fn test_zero_window_stall_recovers() {
        let (mut stack, _log) = stack_with_listener(false);
        let iss = handshake(&mut stack);
        let h = stack
            .conns
            .lookup(SERVER.parse().unwrap(), CLIENT.parse().unwrap())
            .unwrap();

        // Peer closes its window; the write queues but nothing is sent.
        stack.ingest(&client_seg_wnd(1000, iss.wrapping_add(1), TCP_ACK, 0, &[]), 2);
        assert_eq!(stack.send(h, b"stalled").unwrap(), 7);
        assert!(stack.take_egress().iter().all(|f| {
            let tcp = TcpView::parse(IpView::parse(f).unwrap().payload).unwrap();
            tcp.payload.is_empty()
        }));

        // The tick probes into the closed window instead of stalling.
        stack.poll(2_000);
        let frames = stack.take_egress();
        let asked = frames.iter().any(|f| {
            let tcp = TcpView::parse(IpView::parse(f).unwrap().payload).unwrap();
            tcp.payload.is_empty() && tcp.seq == iss
        });
        assert!(asked, "expected a window inquiry below snd_una");

        // The window reopens; the queued data flows.
        stack.ingest(&client_seg(1000, iss.wrapping_add(1), TCP_ACK, &[]), 2_100);
        let sent = stack.take_egress().iter().any(|f| {
            let tcp = TcpView::parse(IpView::parse(f).unwrap().payload).unwrap();
            tcp.payload == b"stalled"
        });
        assert!(sent, "queued data not transmitted after window opened");
    }

    #[test]
    fn test_triple_duplicate_acks_fast_retransmit() {
        let (mut stack, _log) = stack_with_listener(false);
        let iss = handshake(&mut stack);
        let h = stack
            .conns
            .lookup(SERVER.parse().unwrap(), CLIENT.parse().unwrap())
            .unwrap();

        stack.send(h, b"payload!").unwrap();
        let first = stack.take_egress();
        assert!(first.iter().any(|f| {
            let tcp = TcpView::parse(IpView::parse(f).unwrap().payload).unwrap();
            tcp.payload == b"payload!"
        }));

        // Three ACKs for the same snd_una signal a lost segment.
        for t in 0..3u64 {
            stack.ingest(&client_seg(1000, iss.wrapping_add(1), TCP_ACK, &[]), 3 + t);
        }
        let frames = stack.take_egress();
        assert_eq!(frames.len(), 1, "exactly one fast retransmission");
        let tcp = TcpView::parse(IpView::parse(&frames[0]).unwrap().payload).unwrap();
        assert_eq!(tcp.seq, iss.wrapping_add(1));
        assert_eq!(tcp.payload, b"payload!");
    }

    #[test]
    fn test_fin_before_handshake_ack_enters_close_wait() {
        let (mut stack, log) = stack_with_listener(false);
        stack.ingest(&client_seg(999, 0, TCP_SYN, &[]), 0);
        let synack = stack.pop_egress().expect("syn-ack");
        let tcp = TcpView::parse(IpView::parse(&synack).unwrap().payload).unwrap();

        // A FIN that does not acknowledge the SYN-ACK.
        stack.ingest(&client_seg(1000, tcp.seq, TCP_ACK | wire::TCP_FIN, &[]), 1);
        let h = stack
            .conns
            .lookup(SERVER.parse().unwrap(), CLIENT.parse().unwrap())
            .unwrap();
        assert_eq!(stack.state(h), Some(TcpState::CloseWait));
        assert!(log.lock().unwrap().contains(&"fin".to_string()));
    }

    #[test]
    fn test_udp_send_rejects_mixed_families() {
        let profile = MemoryProfile::from_budget(1024 * 1024).unwrap();
        let mut stack = ConduitStack::new(profile).unwrap();
        let v4: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let v6: SocketAddr = "[::1]:53".parse().unwrap();
        assert!(stack.send_udp(v4, v6, b"x").is_err());
        assert_eq!(stack.egress_len(), 0);
    }

    #[test]
    fn test_rst_tears_down_with_single_error() {
        let (mut stack, log) = stack_with_listener(false);
        let iss = handshake(&mut stack);
        stack.ingest(
            &client_seg(1000, iss.wrapping_add(1), TCP_ACK | TCP_RST, &[]),
            3,
        );
        assert_eq!(stack.connection_count(), 0);
        let errors: Vec<_> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("error"))
            .cloned()
            .collect();
        assert_eq!(errors, ["error:connection reset by peer"]);
    }
}
