/// Maximum number of frames to ingest per event-loop wakeup.
/// Higher values reduce context switching overhead but increase latency jitter.
pub const BATCH_SIZE: usize = 64;

/// Internal mpsc channel queue depth for tunnel <-> stack communication.
pub const CHANNEL_SIZE: usize = 8192;

/// Coarse TCP timer granularity. Retransmission, keepalive and TIME_WAIT
/// expiry are checked at this resolution, never finer.
pub const TCP_TICK_MS: u64 = 250;

/// Initial retransmission timeout.
pub const RTO_INITIAL_MS: u64 = 1_000;

/// Upper bound for the doubled retransmission timeout.
pub const RTO_MAX_MS: u64 = 60_000;

/// Consecutive retransmissions of the same segment before the connection
/// is aborted and `on_error` fires.
pub const MAX_RETRANSMITS: u8 = 12;

/// Consecutive SYN / SYN-ACK retransmissions before giving up on a handshake.
pub const MAX_SYN_RETRANSMITS: u8 = 6;

/// Duplicate ACKs that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u8 = 3;

/// Maximum SACK ranges advertised in a single segment.
pub const MAX_SACK_RANGES: usize = 8;

/// Time a closed connection lingers in TIME_WAIT (2 * MSL).
pub const TIME_WAIT_MS: u64 = 120_000;

/// Idle time before the first keepalive probe.
pub const KEEPALIVE_IDLE_MS: u64 = 60_000;

/// Interval between keepalive probes once probing has started.
pub const KEEPALIVE_INTERVAL_MS: u64 = 10_000;

/// Unanswered keepalive probes before the connection is aborted.
pub const KEEPALIVE_PROBES: u8 = 9;

/// Age at which an incomplete IP reassembly or out-of-order TCP queue entry
/// is discarded.
pub const REASSEMBLY_TIMEOUT_MS: u64 = 15_000;

/// Interval between `on_poll` callbacks for an established connection.
pub const POLL_INTERVAL_MS: u64 = 500;

/// IPv4/IPv6 hop limit on egress datagrams.
pub const IP_TTL: u8 = 64;

/// Lower bound for a usable memory budget. Below this the derived windows
/// cannot hold a single segment and startup fails.
pub const MIN_MEM_BUDGET: usize = 16 * 1024;
