//! Sliding-window counter over a ring of (value, generation) cells.
//!
//! `put(from, timeout, delta)` adds `delta` at `from` and subtracts it at
//! `from + timeout`; `advance_time` carries the running prefix sum forward
//! one step at a time, so the cell at `now` always holds the number of
//! active intervals. The ring is sized to two full timeout windows; cells
//! left over from previous wraps are cleared lazily by comparing the stored
//! generation (`t / size`) on access.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::mem::context::MemCtx;
use crate::relptr::RelPtr;

#[repr(C)]
struct Cell {
    value: i64,
    gen: u32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<Cell>() == 16);

#[repr(C)]
pub struct IntervalCounter {
    size: u32,
    mask: u32,
    now: u32,
    max_timeout: u32,
    memctx: RelPtr<MemCtx>,
    cells: RelPtr<Cell>,
}

impl IntervalCounter {
    pub fn create(ctx: *mut MemCtx, max_timeout: u32, now: u32) -> Result<NonNull<IntervalCounter>> {
        if max_timeout == 0 || max_timeout > 1 << 30 {
            return Err(Error::InvalidArgument);
        }
        let size = (2 * max_timeout).next_power_of_two();
        let ctx_ref = unsafe { &*ctx };
        let raw = ctx_ref.balloc(std::mem::size_of::<IntervalCounter>()) as *mut IntervalCounter;
        let mut counter = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
        let c = unsafe { counter.as_mut() };
        c.size = size;
        c.mask = size - 1;
        c.now = now;
        c.max_timeout = max_timeout;
        c.memctx.set(ctx);
        let cells = ctx_ref.balloc(size as usize * std::mem::size_of::<Cell>()) as *mut Cell;
        if cells.is_null() {
            unsafe { ctx_ref.bfree(raw as *mut u8, std::mem::size_of::<IntervalCounter>()) };
            return Err(Error::OutOfMemory);
        }
        unsafe { std::ptr::write_bytes(cells as *mut u8, 0, size as usize * std::mem::size_of::<Cell>()) };
        c.cells.set(cells);
        Ok(counter)
    }

    /// # Safety
    /// `counter` must come from [`IntervalCounter::create`] and not be used
    /// after.
    pub unsafe fn destroy(counter: NonNull<IntervalCounter>) {
        let c = counter.as_ref();
        let ctx = c.memctx.get();
        (*ctx).bfree(
            c.cells.get() as *mut u8,
            c.size as usize * std::mem::size_of::<Cell>(),
        );
        (*ctx).bfree(counter.as_ptr() as *mut u8, std::mem::size_of::<IntervalCounter>());
    }

    pub fn now(&self) -> u32 {
        self.now
    }

    /// Register `delta` active from `from` until `from + timeout`.
    pub fn put(&mut self, from: u32, timeout: u32, delta: i64) -> Result<()> {
        if timeout == 0 || timeout > self.max_timeout || from < self.now {
            return Err(Error::InvalidArgument);
        }
        self.cell(from).value += delta;
        self.cell(from + timeout).value -= delta;
        Ok(())
    }

    /// Carry the running sum forward to `to`; time never moves backwards.
    pub fn advance_time(&mut self, to: u32) {
        debug_assert!(to >= self.now);
        while self.now < to {
            let carry = self.cell(self.now).value;
            let next = self.now + 1;
            self.cell(next).value += carry;
            self.now = next;
        }
    }

    /// Number of intervals active at the current time.
    pub fn current_count(&mut self) -> i64 {
        let now = self.now;
        self.cell(now).value
    }

    fn cell(&mut self, t: u32) -> &mut Cell {
        let gen = t / self.size;
        let cell = unsafe { &mut *self.cells.get().add((t & self.mask) as usize) };
        if cell.gen != gen {
            cell.value = 0;
            cell.gen = gen;
        }
        cell
    }
}
