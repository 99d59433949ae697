//! Minimal TCP server on the userspace stack, exercised end to end by a
//! scripted in-memory client speaking raw IP datagrams over the device
//! channels. Run with `cargo run --example hello_server`.

use bytes::{Bytes, BytesMut};
use clap::Parser;
use conduit::constants::CHANNEL_SIZE;
use conduit::stack::{ConnectionHandler, ListenHandler};
use conduit::wire::{self, IpView, TcpSegmentOut, TcpView, TCP_ACK, TCP_FIN, TCP_SYN};
use conduit::{CloseReason, ConduitDevice, ConduitRuntime, ConduitStack, ConnHandle, MemoryProfile};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(about = "Hello-world TCP server on the conduit stack")]
struct Args {
    /// Total memory budget for the stack, in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    budget: usize,

    /// Port the server listens on.
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

struct HelloConn;

impl ConnectionHandler for HelloConn {
    fn on_connected(&mut self, _stack: &mut ConduitStack, conn: ConnHandle) {
        info!(?conn, "client connected");
    }

    fn on_receive(&mut self, stack: &mut ConduitStack, conn: ConnHandle, data: Option<Bytes>) {
        match data {
            Some(req) => {
                info!(bytes = req.len(), "request received");
                let _ = stack.send(conn, b"Hello, World!\n");
                let _ = stack.close(conn);
            }
            None => info!("client half-closed"),
        }
    }

    fn on_error(&mut self, reason: CloseReason) {
        info!(%reason, "connection ended");
    }
}

struct HelloListener;

impl ListenHandler for HelloListener {
    fn on_accept(
        &mut self,
        remote: SocketAddr,
        _local: SocketAddr,
    ) -> Option<Box<dyn ConnectionHandler + Send>> {
        info!(%remote, "accepting");
        Some(Box::new(HelloConn))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let profile = MemoryProfile::from_budget(args.budget)?;
    let mut stack = ConduitStack::new(profile)?;
    stack.listen(args.port, Box::new(HelloListener))?;

    let (frames_in_tx, frames_in_rx) = mpsc::channel::<BytesMut>(CHANNEL_SIZE);
    let (frames_out_tx, frames_out_rx) = mpsc::channel::<Bytes>(CHANNEL_SIZE);
    let device = ConduitDevice::new(frames_in_rx, frames_out_tx, 1500);

    let runtime = ConduitRuntime::new(stack, device);
    let server = tokio::spawn(runtime.run());

    run_client(args.port, frames_in_tx, frames_out_rx).await?;

    server.abort();
    Ok(())
}

/// Plays the client side of one request/response exchange in raw datagrams.
async fn run_client(
    port: u16,
    to_stack: mpsc::Sender<BytesMut>,
    mut from_stack: mpsc::Receiver<Bytes>,
) -> anyhow::Result<()> {
    let client: SocketAddr = "10.0.0.2:49152".parse()?;
    let server: SocketAddr = format!("10.0.0.1:{}", port).parse()?;

    let send = |seq: u32, ack: u32, flags: u8, payload: &[u8]| {
        let seg = TcpSegmentOut {
            src_port: client.port(),
            dst_port: server.port(),
            seq,
            ack,
            flags,
            window: 65535,
            options: Default::default(),
            payload,
        };
        BytesMut::from(&wire::build_tcp_datagram(client.ip(), server.ip(), 0, &seg)[..])
    };

    // SYN, then complete the handshake from the SYN-ACK.
    to_stack.send(send(100, 0, TCP_SYN, &[])).await?;
    let (mut their_seq, _) = expect_flags(&mut from_stack, TCP_SYN | TCP_ACK).await?;
    their_seq = their_seq.wrapping_add(1);
    to_stack.send(send(101, their_seq, TCP_ACK, &[])).await?;

    // One request; collect the greeting.
    to_stack.send(send(101, their_seq, TCP_ACK, b"hi\n")).await?;
    loop {
        let frame = from_stack
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("stack stopped"))?;
        let ip = IpView::parse(&frame)?;
        let tcp = TcpView::parse(ip.payload)?;
        if !tcp.payload.is_empty() {
            info!(reply = %String::from_utf8_lossy(tcp.payload), "got reply");
            let next = tcp.seq.wrapping_add(tcp.payload.len() as u32);
            to_stack.send(send(104, next, TCP_ACK, &[])).await?;
        }
        if tcp.flags & TCP_FIN != 0 {
            let next = tcp
                .seq
                .wrapping_add(tcp.payload.len() as u32)
                .wrapping_add(1);
            to_stack.send(send(104, next, TCP_ACK | TCP_FIN, &[])).await?;
            break;
        }
    }
    Ok(())
}

/// Waits for the first segment carrying all of `flags`.
async fn expect_flags(
    from_stack: &mut mpsc::Receiver<Bytes>,
    flags: u8,
) -> anyhow::Result<(u32, u32)> {
    loop {
        let frame = from_stack
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("stack stopped"))?;
        let ip = IpView::parse(&frame)?;
        let tcp = TcpView::parse(ip.payload)?;
        if tcp.flags & flags == flags {
            return Ok((tcp.seq, tcp.ack));
        }
    }
}
