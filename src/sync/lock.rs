//! Arena-resident lock primitives.
//!
//! Both locks are a single `#[repr(C)]` atomic word so they can live inside
//! shared memory next to the data they guard. The rwlock packs its whole
//! state into one 32-bit counter: bit 0 is the writer-held flag, bit 1 the
//! writer-waiting flag, and the rest counts readers in units of 4. Writer
//! preference comes from the waiting flag: once set, new readers back out
//! until the writer has gone through.

use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};

const WRITER: u32 = 1;
const PENDING: u32 = 2;
const READER: u32 = 4;

/// Reader-writer lock tuned for busy readers.
#[repr(C)]
pub struct ArenaRwLock {
    state: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<ArenaRwLock>() == 4);

impl ArenaRwLock {
    pub fn init(&mut self) {
        self.state = AtomicU32::new(0);
    }

    #[inline]
    pub fn read_lock(&self) {
        loop {
            let prev = self.state.fetch_add(READER, Ordering::Acquire);
            if prev & (WRITER | PENDING) == 0 {
                return;
            }
            // A writer holds or wants the lock: back out and wait.
            self.state.fetch_sub(READER, Ordering::Relaxed);
            while self.state.load(Ordering::Relaxed) & (WRITER | PENDING) != 0 {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn read_unlock(&self) {
        self.state.fetch_sub(READER, Ordering::Release);
    }

    #[inline]
    pub fn write_lock(&self) {
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER == 0 && cur <= PENDING {
                // No readers and no writer; claim the lock, clearing the
                // waiting bit with it.
                if self
                    .state
                    .compare_exchange(cur, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if cur & PENDING == 0 {
                self.state.fetch_or(PENDING, Ordering::Relaxed);
            }
            hint::spin_loop();
        }
    }

    #[inline]
    pub fn write_unlock(&self) {
        self.state.fetch_sub(WRITER, Ordering::Release);
    }
}

/// Pause-spinning mutex guarding the allocator's pools.
#[repr(C)]
pub struct SpinLock {
    state: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<SpinLock>() == 4);

impl SpinLock {
    pub fn init(&mut self) {
        self.state = AtomicU32::new(0);
    }

    #[inline]
    pub fn lock(&self) {
        while self
            .state
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.state.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}
