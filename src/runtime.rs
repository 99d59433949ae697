//! Async driver for the synchronous stack core.
//!
//! One tokio task owns the stack and the device and runs an event loop:
//! wake on inbound frames or on the next timer deadline, feed the stack,
//! then flush whatever it produced. Frames are consumed in batches so a
//! burst does not pay one wakeup per packet.

use crate::constants::BATCH_SIZE;
use crate::device::ConduitDevice;
use crate::pcb::Millis;
use crate::stack::ConduitStack;
use std::time::Instant;
use tokio::time::{self, Duration};
use tracing::debug;

pub struct ConduitRuntime {
    stack: ConduitStack,
    device: ConduitDevice,
    epoch: Instant,
}

impl ConduitRuntime {
    pub fn new(stack: ConduitStack, device: ConduitDevice) -> Self {
        Self {
            stack,
            device,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> Millis {
        self.epoch.elapsed().as_millis() as Millis
    }

    /// Runs the event loop until the inbound channel closes.
    pub async fn run(mut self) -> anyhow::Result<()> {
        debug!("stack runtime started");
        loop {
            let delay = self.stack.poll_delay(self.now_ms());

            tokio::select! {
                res = self.device.rx_queue.recv() => {
                    let Some(frame) = res else {
                        debug!("inbound channel closed, runtime stopping");
                        break;
                    };
                    let now = self.now_ms();
                    self.stack.ingest(&frame, now);
                    // Drain whatever else is already queued, bounded so one
                    // burst cannot starve the timers.
                    for _ in 1..BATCH_SIZE {
                        match self.device.try_recv() {
                            Some(frame) => self.stack.ingest(&frame, now),
                            None => break,
                        }
                    }
                }
                _ = time::sleep(Duration::from_millis(delay)) => {}
            }

            self.stack.poll(self.now_ms());
            for frame in self.stack.take_egress() {
                self.device.send(frame);
            }
        }
        Ok(())
    }
}
