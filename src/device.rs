//! Frame bridge between async transports and the synchronous stack.
//!
//! The device owns no protocol state. Inbound frames arrive on a bounded
//! mpsc channel from whatever feeds the stack (a tunnel reader, a test
//! harness); outbound datagrams leave on the paired sender. The runtime
//! loop pumps both sides.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::warn;

pub struct ConduitDevice {
    pub rx_queue: mpsc::Receiver<BytesMut>,
    pub tx_queue: mpsc::Sender<Bytes>,
    pub mtu: usize,
}

impl ConduitDevice {
    pub fn new(rx_queue: mpsc::Receiver<BytesMut>, tx_queue: mpsc::Sender<Bytes>, mtu: usize) -> Self {
        Self {
            rx_queue,
            tx_queue,
            mtu,
        }
    }

    /// Non-blocking drain used for batched reads inside the runtime loop.
    pub fn try_recv(&mut self) -> Option<BytesMut> {
        self.rx_queue.try_recv().ok()
    }

    /// Pushes one egress datagram toward the transport. Never blocks the
    /// stack loop; a full queue drops the frame and the peer retransmits.
    pub fn send(&self, frame: Vec<u8>) {
        if let Err(e) = self.tx_queue.try_send(Bytes::from(frame)) {
            warn!("tx queue full or closed: {}", e);
        }
    }
}
