//! Conduit - an embedded single-threaded TCP/IP core for tunneled traffic.
//!
//! All capacities derive from one memory budget fixed at startup; packet
//! processing allocates from preallocated pools only. The synchronous core
//! is driven by an async runtime loop that feeds it frames and timers.

pub mod arena;
pub mod constants;
pub mod device;
pub mod error;
pub mod pbuf;
pub mod pcb;
pub mod profile;
pub mod reass;
pub mod runtime;
pub mod stack;
pub mod tcp;
pub mod wire;

pub use device::ConduitDevice;
pub use error::{CloseReason, Error};
pub use pcb::{ConnHandle, Millis, TcpState};
pub use profile::MemoryProfile;
pub use runtime::ConduitRuntime;
pub use stack::{ConduitStack, ConnectionHandler, ListenHandler, UdpHandler};
