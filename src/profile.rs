//! Memory/performance tuning profile.
//!
//! Every capacity in the stack is a pure function of one scalar: the total
//! memory budget. The tier ladder is monotonic; a bigger budget never
//! yields a smaller window or segment count.

use crate::constants::MIN_MEM_BUDGET;
use crate::error::Error;
use serde::{Deserialize, Serialize};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// All derived capacities, computed once at startup and passed by reference
/// to every component. Immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProfile {
    /// The configured total budget, in bytes.
    pub mem_budget: usize,

    /// Number of fixed-size packet buffers in the pool.
    pub pbuf_count: usize,
    /// Payload capacity of a single packet buffer.
    pub pbuf_size: usize,

    /// Maximum TCP segment size.
    pub mss: u16,
    /// Advertised receive window, pre-scaling.
    pub recv_wnd: u32,
    /// Send buffer size; bounds bytes in flight per connection.
    pub snd_buf: u32,
    /// Maximum unacknowledged segments queued per connection.
    pub snd_queue_len: u32,
    /// TCP segment descriptor pool size (shared across connections).
    pub seg_count: usize,

    /// Concurrent TCP connection slots.
    pub tcp_pcbs: usize,
    /// Listening sockets.
    pub listen_pcbs: usize,
    /// UDP endpoint slots.
    pub udp_pcbs: usize,

    /// Concurrent IP reassembly entries.
    pub reass_entries: usize,

    /// Window scaling option enabled.
    pub window_scaling: bool,
    /// TCP timestamps option enabled.
    pub timestamps: bool,
    /// Selective acknowledgment enabled.
    pub sack: bool,

    /// Verify IP/TCP/UDP/ICMP checksums on ingress. Off by default: the
    /// tunnel device is trusted and already validated the frame. Egress
    /// checksums are always computed regardless.
    pub verify_rx_checksums: bool,
}

impl MemoryProfile {
    /// Derives the full profile from a total memory budget.
    ///
    /// Budgets below [`MIN_MEM_BUDGET`] are rejected; the derived windows
    /// would not hold a single segment.
    pub fn from_budget(mem_budget: usize) -> Result<Self, Error> {
        if mem_budget < MIN_MEM_BUDGET {
            return Err(Error::Config(format!(
                "memory budget {} below minimum {}",
                mem_budget, MIN_MEM_BUDGET
            )));
        }

        let (mss, recv_wnd, snd_buf): (u16, u32, u32) = if mem_budget >= 16 * MB {
            (1460, 64 * KB as u32 - 1, 64 * KB as u32)
        } else if mem_budget >= 4 * MB {
            (1460, 32 * KB as u32, 32 * KB as u32)
        } else if mem_budget >= MB {
            (1460, 16 * KB as u32, 32 * KB as u32)
        } else if mem_budget >= 512 * KB {
            (1460, 8 * KB as u32, 16 * KB as u32)
        } else if mem_budget >= 128 * KB {
            (1460, 8 * KB as u32, 8 * KB as u32)
        } else if mem_budget >= 64 * KB {
            (536, 4 * 536, 4 * 536)
        } else {
            (256, 4 * 256, 4 * 256)
        };

        // The window must always cover at least four segments.
        let recv_wnd = recv_wnd.max(4 * mss as u32);

        let snd_queue_len = (4 * snd_buf + mss as u32 - 1) / mss as u32;

        // Pool counts are carved out of fixed budget fractions so the sum of
        // reservations always fits the arena. The planning units are upper
        // bounds on the real per-slot sizes, and the caps are the classic
        // full-size configuration a large budget converges to.
        let pbuf_size = 1600;
        let pbuf_count = ((mem_budget * 45 / 100) / pbuf_size).clamp(4, 512);
        let tcp_pcbs = ((mem_budget * 20 / 100) / 512).clamp(2, 1024);
        let udp_pcbs = ((mem_budget * 5 / 100) / 64).clamp(2, 512);
        let seg_count = ((mem_budget * 15 / 100) / 48)
            .min(8 * snd_queue_len as usize)
            .max(16);

        let reass_ladder = if mem_budget >= 32 * MB {
            150
        } else if mem_budget >= MB {
            100
        } else if mem_budget >= 512 * KB {
            80
        } else if mem_budget >= 256 * KB {
            40
        } else if mem_budget >= 128 * KB {
            20
        } else {
            5
        };
        let reass_entries = reass_ladder.min(((mem_budget * 5 / 100) / 64).max(5));

        Ok(Self {
            mem_budget,
            pbuf_count,
            pbuf_size,
            mss,
            recv_wnd,
            snd_buf,
            snd_queue_len,
            seg_count,
            tcp_pcbs,
            listen_pcbs: 5,
            udp_pcbs,
            reass_entries,
            window_scaling: true,
            timestamps: true,
            sack: true,
            verify_rx_checksums: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_budget_tier() {
        let p = MemoryProfile::from_budget(16 * MB).unwrap();
        assert_eq!(p.pbuf_count, 512);
        assert_eq!(p.pbuf_size, 1600);
        assert_eq!(p.mss, 1460);
        assert_eq!(p.recv_wnd, 65_535);
        assert_eq!(p.snd_buf, 65_536);
        assert_eq!(p.snd_queue_len, (4 * 65_536 + 1459) / 1460);
    }

    #[test]
    fn test_mid_budget_tier() {
        let p = MemoryProfile::from_budget(2 * MB).unwrap();
        assert_eq!(p.mss, 1460);
        assert_eq!(p.recv_wnd, 16 * 1024);
        assert_eq!(p.snd_buf, 32 * 1024);
        assert_eq!(p.reass_entries, 100);
    }

    #[test]
    fn test_small_budget_tier() {
        let p = MemoryProfile::from_budget(96 * KB).unwrap();
        assert_eq!(p.mss, 536);
        assert_eq!(p.recv_wnd, 4 * 536);
        assert_eq!(p.snd_buf, 4 * 536);
        assert_eq!(p.reass_entries, 5);
    }

    #[test]
    fn test_tiny_budget_tier() {
        let p = MemoryProfile::from_budget(32 * KB).unwrap();
        assert_eq!(p.mss, 256);
        assert_eq!(p.recv_wnd, 4 * 256);
        assert_eq!(p.snd_queue_len, (4 * 1024 + 255) / 256);
    }

    #[test]
    fn test_below_minimum_is_fatal() {
        assert!(MemoryProfile::from_budget(8 * KB).is_err());
    }

    #[test]
    fn test_tiering_is_monotonic() {
        let budgets = [
            32 * KB,
            96 * KB,
            256 * KB,
            768 * KB,
            2 * MB,
            8 * MB,
            32 * MB,
        ];
        let mut last_wnd = 0;
        let mut last_reass = 0;
        for b in budgets {
            let p = MemoryProfile::from_budget(b).unwrap();
            assert!(p.recv_wnd >= last_wnd, "window shrank at budget {}", b);
            assert!(p.reass_entries >= last_reass);
            last_wnd = p.recv_wnd;
            last_reass = p.reass_entries;
        }
    }
}
