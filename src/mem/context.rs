//! Named accounting wrapper over a block allocator.
//!
//! A memory context does no allocation strategy of its own: it delegates to
//! the allocator and keeps alloc/free counters for leak checks. Children
//! share the parent's allocator and propagate their counters up the parent
//! chain, so a parent context always accounts for its whole subtree even
//! when workers allocate through their own child contexts.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::mem::alloc::BlockAllocator;
use crate::relptr::RelPtr;

pub const MEMCTX_NAME_LEN: usize = 64;

#[repr(C)]
pub struct MemCtx {
    alloc: RelPtr<BlockAllocator>,
    parent: RelPtr<MemCtx>,
    balloc_count: AtomicU64,
    bfree_count: AtomicU64,
    balloc_size: AtomicU64,
    bfree_size: AtomicU64,
    name: [u8; MEMCTX_NAME_LEN],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemCtxStats {
    pub balloc_count: u64,
    pub bfree_count: u64,
    pub balloc_size: u64,
    pub bfree_size: u64,
}

impl MemCtxStats {
    /// True when every allocation seen by this context has been freed.
    pub fn balanced(&self) -> bool {
        self.balloc_count == self.bfree_count && self.balloc_size == self.bfree_size
    }
}

impl MemCtx {
    /// Initialise in place over an allocator.
    pub fn init(&mut self, alloc: *mut BlockAllocator, name: &str) {
        self.alloc.set(alloc);
        self.parent.set_null();
        self.reset_counters();
        self.set_name(name);
    }

    /// Initialise in place as a child sharing `parent`'s allocator.
    pub fn init_from(&mut self, parent: *mut MemCtx, name: &str) {
        unsafe { self.alloc.copy_from(&(*parent).alloc) };
        self.parent.set(parent);
        self.reset_counters();
        self.set_name(name);
    }

    /// Allocate a standalone context from the allocator itself.
    ///
    /// The context's own backing block is not accounted anywhere; it is
    /// released by [`MemCtx::destroy`].
    pub fn create(alloc: *mut BlockAllocator, name: &str) -> Result<NonNull<MemCtx>> {
        let raw = unsafe { (*alloc).alloc(std::mem::size_of::<MemCtx>()) } as *mut MemCtx;
        let mut ptr = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
        unsafe { ptr.as_mut().init(alloc, name) };
        Ok(ptr)
    }

    /// Release a context created with [`MemCtx::create`].
    ///
    /// # Safety
    /// `ctx` must come from `create` and must have no outstanding
    /// allocations or live children.
    pub unsafe fn destroy(ctx: NonNull<MemCtx>) {
        let alloc = ctx.as_ref().alloc.get();
        (*alloc).free(ctx.as_ptr() as *mut u8, std::mem::size_of::<MemCtx>());
    }

    pub fn allocator(&self) -> *mut BlockAllocator {
        self.alloc.get()
    }

    /// Allocate `size` bytes, accounting here and in every ancestor.
    pub fn balloc(&self, size: usize) -> *mut u8 {
        let block = unsafe { (*self.alloc.get()).alloc(size) };
        if !block.is_null() {
            self.account(size, true);
        }
        block
    }

    /// Free a block obtained from [`MemCtx::balloc`] on this context tree.
    ///
    /// # Safety
    /// `block` must have been allocated with the given `size` through a
    /// context sharing this allocator.
    pub unsafe fn bfree(&self, block: *mut u8, size: usize) {
        (*self.alloc.get()).free(block, size);
        self.account(size, false);
    }

    /// Allocate new, copy `min(old_size, new_size)` bytes, free old.
    ///
    /// On failure returns null and leaves the old block intact.
    ///
    /// # Safety
    /// Same contract as [`MemCtx::bfree`] for `block`/`old_size`.
    pub unsafe fn brealloc(&self, block: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        let fresh = self.balloc(new_size);
        if fresh.is_null() {
            return std::ptr::null_mut();
        }
        if !block.is_null() {
            std::ptr::copy_nonoverlapping(block, fresh, old_size.min(new_size));
            self.bfree(block, old_size);
        }
        fresh
    }

    pub fn stats(&self) -> MemCtxStats {
        MemCtxStats {
            balloc_count: self.balloc_count.load(Ordering::Relaxed),
            bfree_count: self.bfree_count.load(Ordering::Relaxed),
            balloc_size: self.balloc_size.load(Ordering::Relaxed),
            bfree_size: self.bfree_size.load(Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(MEMCTX_NAME_LEN);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn account(&self, size: usize, is_alloc: bool) {
        let mut cur = self as *const MemCtx;
        loop {
            let ctx = unsafe { &*cur };
            if is_alloc {
                ctx.balloc_count.fetch_add(1, Ordering::Relaxed);
                ctx.balloc_size.fetch_add(size as u64, Ordering::Relaxed);
            } else {
                ctx.bfree_count.fetch_add(1, Ordering::Relaxed);
                ctx.bfree_size.fetch_add(size as u64, Ordering::Relaxed);
            }
            let parent = ctx.parent.get();
            if parent.is_null() {
                break;
            }
            cur = parent;
        }
    }

    fn reset_counters(&mut self) {
        self.balloc_count = AtomicU64::new(0);
        self.bfree_count = AtomicU64::new(0);
        self.balloc_size = AtomicU64::new(0);
        self.bfree_size = AtomicU64::new(0);
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; MEMCTX_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(MEMCTX_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }
}
