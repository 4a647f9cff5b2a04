//! Dense 256-ary radix tree of fixed depth over big-endian keys.
//!
//! Storage is a flat array of 1 KiB pages (256 entries of `u32`), handed out
//! in chunks of 16 pages to keep reallocation churn down. An entry of
//! `RADIX_INVALID` is empty; at any depth below the last byte a valid entry
//! is the index of the next page, at the last byte it is the stored value.
//! Pages never move once allocated, only the chunk table grows.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::mem::context::MemCtx;
use crate::relptr::RelPtr;

/// Empty-entry sentinel.
pub const RADIX_INVALID: u32 = u32::MAX;

pub(crate) const PAGE_ENTRIES: usize = 256;
const PAGES_PER_CHUNK: usize = 16;
const CHUNK_TABLE_GROW: usize = 16;

#[repr(C)]
pub(crate) struct Page {
    pub slots: [u32; PAGE_ENTRIES],
}

const _: () = assert!(std::mem::size_of::<Page>() == 1024);

/// Chunk-grown page array shared by the radix and LPM trees.
///
/// Freed pages are recycled through a free list threaded through each free
/// page's slot 0.
#[repr(C)]
pub(crate) struct PageStore {
    memctx: RelPtr<MemCtx>,
    chunks: RelPtr<RelPtr<Page>>,
    chunk_cap: u32,
    page_count: u32,
    free_head: u32,
    _pad: u32,
}

impl PageStore {
    pub fn init(&mut self, ctx: *mut MemCtx) {
        self.memctx.set(ctx);
        self.chunks.set_null();
        self.chunk_cap = 0;
        self.page_count = 0;
        self.free_head = RADIX_INVALID;
        self._pad = 0;
    }

    /// Allocate a page with every slot set to `fill`.
    pub fn alloc_page(&mut self, fill: u32) -> Result<u32> {
        let idx = if self.free_head != RADIX_INVALID {
            let idx = self.free_head;
            self.free_head = unsafe { (*self.page(idx)).slots[0] };
            idx
        } else {
            let idx = self.page_count;
            if idx as usize % PAGES_PER_CHUNK == 0 {
                self.push_chunk(idx as usize / PAGES_PER_CHUNK)?;
            }
            self.page_count += 1;
            idx
        };
        let page = self.page(idx);
        unsafe { (*page).slots = [fill; PAGE_ENTRIES] };
        Ok(idx)
    }

    pub fn free_page(&mut self, idx: u32) {
        unsafe { (*self.page(idx)).slots[0] = self.free_head };
        self.free_head = idx;
    }

    pub fn memctx(&self) -> *mut MemCtx {
        self.memctx.get()
    }

    #[inline]
    pub fn page(&self, idx: u32) -> *mut Page {
        let chunk = unsafe { (*self.chunks.get().add(idx as usize / PAGES_PER_CHUNK)).get() };
        unsafe { chunk.add(idx as usize % PAGES_PER_CHUNK) }
    }

    pub fn deinit(&mut self) {
        let ctx = self.memctx.get();
        if ctx.is_null() || self.chunks.is_null() {
            return;
        }
        let chunk_count = (self.page_count as usize).div_ceil(PAGES_PER_CHUNK);
        unsafe {
            for i in 0..chunk_count {
                let chunk = (*self.chunks.get().add(i)).get();
                (*ctx).bfree(
                    chunk as *mut u8,
                    PAGES_PER_CHUNK * std::mem::size_of::<Page>(),
                );
            }
            (*ctx).bfree(self.chunks.get() as *mut u8, self.chunk_cap as usize * 8);
        }
        self.chunks.set_null();
        self.chunk_cap = 0;
        self.page_count = 0;
        self.free_head = RADIX_INVALID;
    }

    fn push_chunk(&mut self, chunk_idx: usize) -> Result<()> {
        let ctx = unsafe { &*self.memctx.get() };
        if chunk_idx == self.chunk_cap as usize {
            // Grow the chunk table. Entries are relative pointers, so they
            // must be re-encoded at the new address, not byte-copied.
            let new_cap = self.chunk_cap as usize + CHUNK_TABLE_GROW;
            let fresh = ctx.balloc(new_cap * 8) as *mut RelPtr<Page>;
            if fresh.is_null() {
                return Err(Error::OutOfMemory);
            }
            let old = self.chunks.get();
            unsafe {
                for i in 0..self.chunk_cap as usize {
                    (*fresh.add(i)).set((*old.add(i)).get());
                }
                for i in self.chunk_cap as usize..new_cap {
                    (*fresh.add(i)).set_null();
                }
                if !old.is_null() {
                    ctx.bfree(old as *mut u8, self.chunk_cap as usize * 8);
                }
            }
            self.chunks.set(fresh);
            self.chunk_cap = new_cap as u32;
        }
        let chunk = ctx.balloc(PAGES_PER_CHUNK * std::mem::size_of::<Page>()) as *mut Page;
        if chunk.is_null() {
            return Err(Error::OutOfMemory);
        }
        unsafe { (*self.chunks.get().add(chunk_idx)).set(chunk) };
        Ok(())
    }
}

/// Fixed-depth k→u32 map, k ∈ {4, 8}.
#[repr(C)]
pub struct RadixTree {
    key_size: u32,
    root: u32,
    store: PageStore,
}

impl RadixTree {
    /// Initialise in place (for embedding); see [`RadixTree::create`].
    pub fn init(&mut self, ctx: *mut MemCtx, key_size: u32) -> Result<()> {
        if key_size != 4 && key_size != 8 {
            return Err(Error::InvalidArgument);
        }
        self.key_size = key_size;
        self.store.init(ctx);
        self.root = self.store.alloc_page(RADIX_INVALID)?;
        Ok(())
    }

    pub fn create(ctx: *mut MemCtx, key_size: u32) -> Result<NonNull<RadixTree>> {
        let ctx_ref = unsafe { &*ctx };
        let raw = ctx_ref.balloc(std::mem::size_of::<RadixTree>()) as *mut RadixTree;
        let mut tree = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
        if let Err(e) = unsafe { tree.as_mut().init(ctx, key_size) } {
            unsafe { ctx_ref.bfree(raw as *mut u8, std::mem::size_of::<RadixTree>()) };
            return Err(e);
        }
        Ok(tree)
    }

    pub fn deinit(&mut self) {
        self.store.deinit();
    }

    /// # Safety
    /// `tree` must come from [`RadixTree::create`] and not be used after.
    pub unsafe fn destroy(mut tree: NonNull<RadixTree>) {
        let ctx = tree.as_ref().store.memctx.get();
        tree.as_mut().deinit();
        (*ctx).bfree(tree.as_ptr() as *mut u8, std::mem::size_of::<RadixTree>());
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn insert(&mut self, key: &[u8], value: u32) -> Result<()> {
        if key.len() != self.key_size as usize || value == RADIX_INVALID {
            return Err(Error::InvalidArgument);
        }
        let mut page_idx = self.root;
        for &b in &key[..key.len() - 1] {
            let slot = unsafe { (*self.store.page(page_idx)).slots[b as usize] };
            page_idx = if slot == RADIX_INVALID {
                let child = self.store.alloc_page(RADIX_INVALID)?;
                unsafe { (*self.store.page(page_idx)).slots[b as usize] = child };
                child
            } else {
                slot
            };
        }
        let last = key[key.len() - 1] as usize;
        unsafe { (*self.store.page(page_idx)).slots[last] = value };
        Ok(())
    }

    pub fn lookup(&self, key: &[u8]) -> u32 {
        if key.len() != self.key_size as usize {
            return RADIX_INVALID;
        }
        let mut entry = self.root;
        for &b in key {
            entry = unsafe { (*self.store.page(entry)).slots[b as usize] };
            if entry == RADIX_INVALID {
                return RADIX_INVALID;
            }
        }
        entry
    }

    /// Depth-first traversal over every stored (key, value), keys ascending.
    pub fn walk(&self, cb: &mut dyn FnMut(&[u8], u32)) {
        let mut key = [0u8; 8];
        self.walk_page(self.root, 0, &mut key, cb);
    }

    fn walk_page(&self, page_idx: u32, depth: usize, key: &mut [u8; 8], cb: &mut dyn FnMut(&[u8], u32)) {
        let k = self.key_size as usize;
        let page = self.store.page(page_idx);
        for b in 0..PAGE_ENTRIES {
            let entry = unsafe { (*page).slots[b] };
            if entry == RADIX_INVALID {
                continue;
            }
            key[depth] = b as u8;
            if depth == k - 1 {
                cb(&key[..k], entry);
            } else {
                self.walk_page(entry, depth + 1, key, cb);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::alloc::tests::TestArena;

    fn with_tree<R>(key_size: u32, f: impl FnOnce(&mut RadixTree, *mut MemCtx) -> R) -> R {
        let arena = TestArena::new(1 << 22);
        let ctx = MemCtx::create(arena.alloc, "radix-test").unwrap();
        let mut tree = RadixTree::create(ctx.as_ptr(), key_size).unwrap();
        f(unsafe { tree.as_mut() }, ctx.as_ptr())
    }

    #[test]
    fn rejects_unsupported_key_sizes() {
        let arena = TestArena::new(1 << 16);
        let ctx = MemCtx::create(arena.alloc, "radix-bad").unwrap();
        assert!(RadixTree::create(ctx.as_ptr(), 6).is_err());
    }

    #[test]
    fn insert_then_lookup() {
        with_tree(4, |t, _| {
            t.insert(&[10, 0, 0, 1], 7).unwrap();
            t.insert(&[10, 0, 0, 2], 9).unwrap();
            t.insert(&[192, 168, 1, 1], 11).unwrap();
            assert_eq!(t.lookup(&[10, 0, 0, 1]), 7);
            assert_eq!(t.lookup(&[10, 0, 0, 2]), 9);
            assert_eq!(t.lookup(&[192, 168, 1, 1]), 11);
            assert_eq!(t.lookup(&[10, 0, 0, 3]), RADIX_INVALID);
            assert_eq!(t.lookup(&[11, 0, 0, 1]), RADIX_INVALID);
        });
    }

    #[test]
    fn overwrite_replaces_value() {
        with_tree(4, |t, _| {
            t.insert(&[1, 2, 3, 4], 5).unwrap();
            t.insert(&[1, 2, 3, 4], 6).unwrap();
            assert_eq!(t.lookup(&[1, 2, 3, 4]), 6);
        });
    }

    #[test]
    fn eight_byte_keys() {
        with_tree(8, |t, _| {
            let key = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 1];
            t.insert(&key, 42).unwrap();
            assert_eq!(t.lookup(&key), 42);
            let mut other = key;
            other[7] = 2;
            assert_eq!(t.lookup(&other), RADIX_INVALID);
        });
    }

    #[test]
    fn walk_visits_keys_in_order() {
        with_tree(4, |t, _| {
            t.insert(&[2, 0, 0, 0], 20).unwrap();
            t.insert(&[1, 0, 0, 0], 10).unwrap();
            t.insert(&[1, 0, 0, 255], 15).unwrap();
            let mut seen = Vec::new();
            t.walk(&mut |key, value| seen.push((key.to_vec(), value)));
            assert_eq!(
                seen,
                vec![
                    (vec![1, 0, 0, 0], 10),
                    (vec![1, 0, 0, 255], 15),
                    (vec![2, 0, 0, 0], 20),
                ]
            );
        });
    }

    #[test]
    fn chunk_table_growth_keeps_old_pages() {
        with_tree(4, |t, _| {
            // Enough distinct prefixes to spill past several page chunks.
            for a in 0..40u8 {
                for b in 0..4u8 {
                    t.insert(&[a, b, 0, 1], (a as u32) << 8 | b as u32).unwrap();
                }
            }
            for a in 0..40u8 {
                for b in 0..4u8 {
                    assert_eq!(t.lookup(&[a, b, 0, 1]), (a as u32) << 8 | b as u32);
                }
            }
        });
    }

    #[test]
    fn destroy_balances_context() {
        let arena = TestArena::new(1 << 22);
        let ctx = MemCtx::create(arena.alloc, "radix-leak").unwrap();
        let mut tree = RadixTree::create(ctx.as_ptr(), 4).unwrap();
        unsafe {
            tree.as_mut().insert(&[1, 2, 3, 4], 1).unwrap();
            RadixTree::destroy(tree);
            assert!((*ctx.as_ptr()).stats().balanced());
        }
    }
}
