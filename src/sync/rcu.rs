//! Two-phase epoch RCU for snapshot publication.
//!
//! One global 1-bit epoch plus a packed per-worker word {active, observed
//! epoch}. Readers are wait-free: `read_begin` records the current epoch,
//! `read_end` clears the slot. The publisher flips the epoch and busy-waits
//! until no worker is still active under the previous one, twice. After
//! `publish_update` returns, no reader that entered before the first flip is
//! still inside its critical section, so the previous snapshot can be freed.
//!
//! Readers must not nest or block inside a read section; publishers must be
//! externally serialised.

use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

/// Compile-time bound on workers a single RCU instance can track.
pub const RCU_WORKERS: usize = 64;

const ACTIVE: u32 = 1;

/// Per-worker packed state on its own cache line.
#[repr(C, align(64))]
struct WorkerSlot {
    state: AtomicU32,
    _pad: [u32; 15],
}

const _: () = assert!(std::mem::size_of::<WorkerSlot>() == 64);

#[repr(C)]
pub struct Rcu {
    epoch: AtomicU32,
    worker_count: u32,
    workers: [WorkerSlot; RCU_WORKERS],
}

impl Rcu {
    pub fn init(&mut self, worker_count: u32) -> Result<()> {
        if worker_count == 0 || worker_count as usize > RCU_WORKERS {
            return Err(Error::InvalidArgument);
        }
        self.epoch = AtomicU32::new(0);
        self.worker_count = worker_count;
        for slot in self.workers.iter_mut() {
            slot.state = AtomicU32::new(0);
            slot._pad = [0; 15];
        }
        Ok(())
    }

    /// Enter a read-side critical section on behalf of `worker`.
    #[inline]
    pub fn read_begin(&self, worker: u32) {
        debug_assert!(worker < self.worker_count);
        let epoch = self.epoch.load(Ordering::Acquire) & 1;
        self.workers[worker as usize]
            .state
            .store(ACTIVE | (epoch << 1), Ordering::SeqCst);
    }

    /// Leave the read-side critical section.
    #[inline]
    pub fn read_end(&self, worker: u32) {
        debug_assert!(worker < self.worker_count);
        self.workers[worker as usize].state.store(0, Ordering::Release);
    }

    /// Flip the epoch twice, draining readers of the previous epoch each
    /// time. On return the pre-publish snapshot has no remaining readers.
    pub fn publish_update(&self) {
        let epoch = self.epoch.load(Ordering::Relaxed);
        self.epoch.store(epoch ^ 1, Ordering::SeqCst);
        self.wait_epoch_flush(epoch & 1);
        self.epoch.store(epoch, Ordering::SeqCst);
        self.wait_epoch_flush((epoch ^ 1) & 1);
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire) & 1
    }

    /// True while `worker` is inside a read section.
    pub fn is_active(&self, worker: u32) -> bool {
        self.workers[worker as usize].state.load(Ordering::Acquire) & ACTIVE != 0
    }

    fn wait_epoch_flush(&self, old_epoch: u32) {
        for w in 0..self.worker_count as usize {
            loop {
                let state = self.workers[w].state.load(Ordering::Acquire);
                if state & ACTIVE == 0 || (state >> 1) & 1 != old_epoch {
                    break;
                }
                hint::spin_loop();
            }
        }
    }
}
