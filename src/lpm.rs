//! Longest-prefix-match tree over big-endian 4- or 8-byte keys.
//!
//! Pages have the same 256-wide shape as the radix tree, but entries carry a
//! flag bit: a flagged entry is a stored value covering the whole subtree
//! under that slot, an unflagged entry is a child page index, and
//! `LPM_INVALID` is a hole that must not be walked. Ranges `[from, to]` are
//! inserted byte by byte; a slot fully inside the range takes the flagged
//! value directly, a partially covered slot grows a child page.
//!
//! Inserting over an already-flagged slot propagates the existing value into
//! a freshly allocated child page and keeps descending, so a later insert
//! wins on the overlap and the earlier value survives around it. Inserting a
//! fully covering range over a child page frees the subtree and collapses it
//! back to one flagged entry.

use std::ptr::NonNull;

use ahash::RandomState;
use hashbrown::HashSet;

use crate::error::{Error, Result};
use crate::mem::context::MemCtx;
use crate::radix::{PageStore, PAGE_ENTRIES};
use crate::value::{ValueTable, VALUE_NIL};

/// Hole sentinel.
pub const LPM_INVALID: u32 = u32::MAX;
/// Largest storable value; bit 31 is the value flag.
pub const LPM_VALUE_MAX: u32 = 0x7FFF_FFFE;

const FLAG: u32 = 0x8000_0000;

const ZEROS: [u8; 8] = [0; 8];
const ONES: [u8; 8] = [0xFF; 8];

#[inline]
fn is_value(entry: u32) -> bool {
    entry != LPM_INVALID && entry & FLAG != 0
}

#[inline]
fn is_page(entry: u32) -> bool {
    entry != LPM_INVALID && entry & FLAG == 0
}

/// Big-endian range-to-value map.
#[repr(C)]
pub struct LpmTree {
    key_size: u32,
    root: u32,
    store: PageStore,
}

impl LpmTree {
    /// Initialise in place (for embedding); see [`LpmTree::create`].
    pub fn init(&mut self, ctx: *mut MemCtx, key_size: u32) -> Result<()> {
        if key_size != 4 && key_size != 8 {
            return Err(Error::InvalidArgument);
        }
        self.key_size = key_size;
        self.store.init(ctx);
        self.root = self.store.alloc_page(LPM_INVALID)?;
        Ok(())
    }

    pub fn create(ctx: *mut MemCtx, key_size: u32) -> Result<NonNull<LpmTree>> {
        let ctx_ref = unsafe { &*ctx };
        let raw = ctx_ref.balloc(std::mem::size_of::<LpmTree>()) as *mut LpmTree;
        let mut tree = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
        if let Err(e) = unsafe { tree.as_mut().init(ctx, key_size) } {
            unsafe { ctx_ref.bfree(raw as *mut u8, std::mem::size_of::<LpmTree>()) };
            return Err(e);
        }
        Ok(tree)
    }

    pub fn deinit(&mut self) {
        self.store.deinit();
    }

    /// # Safety
    /// `tree` must come from [`LpmTree::create`] and not be used after.
    pub unsafe fn destroy(mut tree: NonNull<LpmTree>) {
        let ctx = tree.as_ref().store.memctx();
        tree.as_mut().deinit();
        (*ctx).bfree(tree.as_ptr() as *mut u8, std::mem::size_of::<LpmTree>());
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    /// Map every key in `[from, to]` to `value`.
    pub fn insert(&mut self, from: &[u8], to: &[u8], value: u32) -> Result<()> {
        let k = self.key_size as usize;
        if from.len() != k || to.len() != k || value > LPM_VALUE_MAX || from > to {
            return Err(Error::InvalidArgument);
        }
        self.insert_range(self.root, from, to, value)
    }

    /// `from`/`to` are the key suffixes below the current page.
    fn insert_range(&mut self, page_idx: u32, from: &[u8], to: &[u8], value: u32) -> Result<()> {
        let leaf = from.len() == 1;
        let fb = from[0];
        let tb = to[0];
        for b in fb as u16..=tb as u16 {
            let b = b as u8;
            let covers_low = b > fb || from[1..].iter().all(|&x| x == 0);
            let covers_high = b < tb || to[1..].iter().all(|&x| x == 0xFF);
            let entry = unsafe { (*self.store.page(page_idx)).slots[b as usize] };

            if leaf || (covers_low && covers_high) {
                if is_page(entry) {
                    self.free_subtree(entry);
                }
                unsafe { (*self.store.page(page_idx)).slots[b as usize] = FLAG | value };
                continue;
            }

            let child = if entry == LPM_INVALID {
                let child = self.store.alloc_page(LPM_INVALID)?;
                unsafe { (*self.store.page(page_idx)).slots[b as usize] = child };
                child
            } else if is_value(entry) {
                // Spread the covering value one level down, then let the new
                // range overwrite its part of it.
                let child = self.store.alloc_page(entry)?;
                unsafe { (*self.store.page(page_idx)).slots[b as usize] = child };
                child
            } else {
                entry
            };

            let sub_from = if b == fb { &from[1..] } else { &ZEROS[..from.len() - 1] };
            let sub_to = if b == tb { &to[1..] } else { &ONES[..to.len() - 1] };
            self.insert_range(child, sub_from, sub_to, value)?;
        }
        Ok(())
    }

    fn free_subtree(&mut self, page_idx: u32) {
        for b in 0..PAGE_ENTRIES {
            let entry = unsafe { (*self.store.page(page_idx)).slots[b] };
            if is_page(entry) {
                self.free_subtree(entry);
            }
        }
        self.store.free_page(page_idx);
    }

    /// Longest-prefix lookup; `LPM_INVALID` when the key hits a hole.
    pub fn lookup(&self, key: &[u8]) -> u32 {
        if key.len() != self.key_size as usize {
            return LPM_INVALID;
        }
        let mut entry = self.root;
        for &b in key {
            entry = unsafe { (*self.store.page(entry)).slots[b as usize] };
            if entry == LPM_INVALID {
                return LPM_INVALID;
            }
            if entry & FLAG != 0 {
                return entry & !FLAG;
            }
        }
        debug_assert!(false, "unterminated lpm path");
        LPM_INVALID
    }

    /// In-order traversal of `[from, to]`, emitting maximal merged runs of
    /// equal values as `(run_from, run_to, value)`.
    pub fn walk(&self, from: &[u8], to: &[u8], cb: &mut dyn FnMut(&[u8], &[u8], u32)) {
        let k = self.key_size as usize;
        if from.len() != k || to.len() != k || from > to {
            return;
        }
        let mut run: Option<Run> = None;
        let mut prefix = [0u8; 8];
        self.walk_range(self.root, 0, from, to, &mut prefix, &mut run, cb);
        if let Some(r) = run {
            cb(&r.from[..k], &r.to[..k], r.value);
        }
    }

    /// Invoke `cb` once per distinct value stored in `[from, to]`.
    pub fn collect_values(&self, from: &[u8], to: &[u8], cb: &mut dyn FnMut(u32)) {
        let mut seen: HashSet<u32, RandomState> = HashSet::with_hasher(RandomState::new());
        self.walk(from, to, &mut |_, _, value| {
            if seen.insert(value) {
                cb(value);
            }
        });
    }

    /// Rewrite every stored value through the table's compacted mapping.
    /// Values the table maps to nothing become holes.
    pub fn remap(&mut self, table: &ValueTable) {
        self.remap_page(self.root, self.key_size as usize, table);
    }

    fn remap_page(&mut self, page_idx: u32, depth_left: usize, table: &ValueTable) {
        for b in 0..PAGE_ENTRIES {
            let entry = unsafe { (*self.store.page(page_idx)).slots[b] };
            if is_value(entry) {
                let mapped = table.get(0, entry & !FLAG);
                let fresh = if mapped == VALUE_NIL { LPM_INVALID } else { FLAG | mapped };
                unsafe { (*self.store.page(page_idx)).slots[b] = fresh };
            } else if is_page(entry) {
                debug_assert!(depth_left > 1);
                self.remap_page(entry, depth_left - 1, table);
            }
        }
    }

    /// Collapse every page whose 256 entries are one identical flagged value
    /// into its parent's slot. Lookup results are unchanged.
    pub fn compact(&mut self) {
        self.compact_page(self.root);
    }

    fn compact_page(&mut self, page_idx: u32) -> Option<u32> {
        let mut uniform = true;
        let mut first = None;
        for b in 0..PAGE_ENTRIES {
            let mut entry = unsafe { (*self.store.page(page_idx)).slots[b] };
            if is_page(entry) {
                if let Some(folded) = self.compact_page(entry) {
                    self.store.free_page(entry);
                    unsafe { (*self.store.page(page_idx)).slots[b] = folded };
                    entry = folded;
                } else {
                    uniform = false;
                    continue;
                }
            }
            if !is_value(entry) {
                uniform = false;
            }
            match first {
                None => first = Some(entry),
                Some(f) if f != entry => uniform = false,
                _ => {}
            }
        }
        if uniform {
            first.filter(|e| is_value(*e))
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_range(
        &self,
        page_idx: u32,
        depth: usize,
        from: &[u8],
        to: &[u8],
        prefix: &mut [u8; 8],
        run: &mut Option<Run>,
        cb: &mut dyn FnMut(&[u8], &[u8], u32),
    ) {
        let k = self.key_size as usize;
        let fb = from[0];
        let tb = to[0];
        for b in fb as u16..=tb as u16 {
            let b = b as u8;
            prefix[depth] = b;
            let entry = unsafe { (*self.store.page(page_idx)).slots[b as usize] };
            if entry == LPM_INVALID {
                // A hole breaks the current run.
                if let Some(r) = run.take() {
                    cb(&r.from[..k], &r.to[..k], r.value);
                }
                continue;
            }
            if entry & FLAG != 0 {
                let value = entry & !FLAG;
                let mut cell_from = [0u8; 8];
                let mut cell_to = [0xFFu8; 8];
                cell_from[..=depth].copy_from_slice(&prefix[..=depth]);
                cell_to[..=depth].copy_from_slice(&prefix[..=depth]);
                if b == fb {
                    cell_from[depth + 1..k].copy_from_slice(&from[1..]);
                }
                if b == tb {
                    cell_to[depth + 1..k].copy_from_slice(&to[1..]);
                }
                match run {
                    Some(r) if r.value == value => r.to = cell_to,
                    _ => {
                        if let Some(r) = run.take() {
                            cb(&r.from[..k], &r.to[..k], r.value);
                        }
                        *run = Some(Run {
                            from: cell_from,
                            to: cell_to,
                            value,
                        });
                    }
                }
                continue;
            }
            let sub_from = if b == fb { &from[1..] } else { &ZEROS[..from.len() - 1] };
            let sub_to = if b == tb { &to[1..] } else { &ONES[..to.len() - 1] };
            self.walk_range(entry, depth + 1, sub_from, sub_to, prefix, run, cb);
        }
    }
}

struct Run {
    from: [u8; 8],
    to: [u8; 8],
    value: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::alloc::tests::TestArena;

    fn with_lpm<R>(key_size: u32, f: impl FnOnce(&mut LpmTree, *mut MemCtx) -> R) -> R {
        let arena = TestArena::new(1 << 22);
        let ctx = MemCtx::create(arena.alloc, "lpm-test").unwrap();
        let mut tree = LpmTree::create(ctx.as_ptr(), key_size).unwrap();
        f(unsafe { tree.as_mut() }, ctx.as_ptr())
    }

    #[test]
    fn slash24_range() {
        with_lpm(4, |t, _| {
            t.insert(&[10, 0, 0, 0], &[10, 0, 0, 255], 7).unwrap();
            assert_eq!(t.lookup(&[10, 0, 0, 0]), 7);
            assert_eq!(t.lookup(&[10, 0, 0, 255]), 7);
            assert_eq!(t.lookup(&[10, 0, 0, 128]), 7);
            assert_eq!(t.lookup(&[10, 0, 1, 0]), LPM_INVALID);
            assert_eq!(t.lookup(&[9, 255, 255, 255]), LPM_INVALID);
        });
    }

    #[test]
    fn disjoint_ranges_keep_their_values() {
        with_lpm(4, |t, _| {
            t.insert(&[10, 0, 0, 0], &[10, 0, 0, 9], 1).unwrap();
            t.insert(&[10, 0, 0, 10], &[10, 0, 0, 19], 2).unwrap();
            t.insert(&[192, 0, 0, 0], &[193, 255, 255, 255], 3).unwrap();
            assert_eq!(t.lookup(&[10, 0, 0, 5]), 1);
            assert_eq!(t.lookup(&[10, 0, 0, 15]), 2);
            assert_eq!(t.lookup(&[10, 0, 0, 20]), LPM_INVALID);
            assert_eq!(t.lookup(&[192, 88, 99, 1]), 3);
            assert_eq!(t.lookup(&[193, 255, 255, 255]), 3);
        });
    }

    #[test]
    fn later_insert_wins_on_overlap_narrow_over_wide() {
        with_lpm(4, |t, _| {
            t.insert(&[10, 0, 0, 0], &[10, 0, 255, 255], 1).unwrap();
            t.insert(&[10, 0, 7, 0], &[10, 0, 7, 255], 2).unwrap();
            assert_eq!(t.lookup(&[10, 0, 7, 4]), 2);
            // The wider value survives around the overlap.
            assert_eq!(t.lookup(&[10, 0, 6, 255]), 1);
            assert_eq!(t.lookup(&[10, 0, 8, 0]), 1);
        });
    }

    #[test]
    fn later_insert_wins_on_overlap_wide_over_narrow() {
        with_lpm(4, |t, _| {
            t.insert(&[10, 0, 7, 0], &[10, 0, 7, 255], 2).unwrap();
            t.insert(&[10, 0, 0, 0], &[10, 0, 255, 255], 1).unwrap();
            // The covering insert replaces the narrow one entirely.
            assert_eq!(t.lookup(&[10, 0, 7, 4]), 1);
            assert_eq!(t.lookup(&[10, 0, 6, 255]), 1);
        });
    }

    #[test]
    fn single_key_range() {
        with_lpm(4, |t, _| {
            t.insert(&[1, 2, 3, 4], &[1, 2, 3, 4], 9).unwrap();
            assert_eq!(t.lookup(&[1, 2, 3, 4]), 9);
            assert_eq!(t.lookup(&[1, 2, 3, 5]), LPM_INVALID);
            assert_eq!(t.lookup(&[1, 2, 3, 3]), LPM_INVALID);
        });
    }

    #[test]
    fn rejects_bad_arguments() {
        with_lpm(4, |t, _| {
            assert!(t.insert(&[2, 0, 0, 0], &[1, 0, 0, 0], 1).is_err());
            assert!(t.insert(&[1, 0, 0], &[1, 0, 0, 0], 1).is_err());
            assert!(t.insert(&[1, 0, 0, 0], &[2, 0, 0, 0], LPM_VALUE_MAX + 1).is_err());
        });
    }

    #[test]
    fn walk_merges_adjacent_equal_runs() {
        with_lpm(4, |t, _| {
            t.insert(&[10, 0, 0, 0], &[10, 0, 0, 127], 5).unwrap();
            t.insert(&[10, 0, 0, 128], &[10, 0, 0, 255], 5).unwrap();
            t.insert(&[10, 0, 1, 0], &[10, 0, 1, 255], 6).unwrap();
            let mut runs = Vec::new();
            t.walk(&[0, 0, 0, 0], &[255, 255, 255, 255], &mut |f, to, v| {
                runs.push((f.to_vec(), to.to_vec(), v));
            });
            assert_eq!(
                runs,
                vec![
                    (vec![10, 0, 0, 0], vec![10, 0, 0, 255], 5),
                    (vec![10, 0, 1, 0], vec![10, 0, 1, 255], 6),
                ]
            );
        });
    }

    #[test]
    fn walk_clips_to_query_bounds() {
        with_lpm(4, |t, _| {
            t.insert(&[10, 0, 0, 0], &[10, 0, 0, 255], 5).unwrap();
            let mut runs = Vec::new();
            t.walk(&[10, 0, 0, 100], &[10, 0, 0, 200], &mut |f, to, v| {
                runs.push((f.to_vec(), to.to_vec(), v));
            });
            assert_eq!(runs, vec![(vec![10, 0, 0, 100], vec![10, 0, 0, 200], 5)]);
        });
    }

    #[test]
    fn collect_values_deduplicates() {
        with_lpm(4, |t, _| {
            t.insert(&[1, 0, 0, 0], &[1, 0, 0, 9], 3).unwrap();
            t.insert(&[2, 0, 0, 0], &[2, 0, 0, 9], 3).unwrap();
            t.insert(&[3, 0, 0, 0], &[3, 0, 0, 9], 4).unwrap();
            let mut values = Vec::new();
            t.collect_values(&[0, 0, 0, 0], &[255, 255, 255, 255], &mut |v| values.push(v));
            values.sort();
            assert_eq!(values, vec![3, 4]);
        });
    }

    #[test]
    fn compact_preserves_lookups() {
        with_lpm(4, |t, _| {
            t.insert(&[10, 0, 0, 0], &[10, 0, 0, 255], 7).unwrap();
            t.insert(&[10, 0, 1, 3], &[10, 0, 1, 9], 8).unwrap();
            let probes: Vec<[u8; 4]> = vec![
                [10, 0, 0, 0],
                [10, 0, 0, 255],
                [10, 0, 1, 2],
                [10, 0, 1, 5],
                [10, 0, 1, 10],
                [11, 0, 0, 0],
            ];
            let before: Vec<u32> = probes.iter().map(|k| t.lookup(k)).collect();
            t.compact();
            let after: Vec<u32> = probes.iter().map(|k| t.lookup(k)).collect();
            assert_eq!(before, after);
            // The uniform /24 leaf page folded into its parent slot.
            assert_eq!(t.lookup(&[10, 0, 0, 77]), 7);
        });
    }

    #[test]
    fn eight_byte_ranges() {
        with_lpm(8, |t, _| {
            let from = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0];
            let to = [0x20, 0x01, 0x0d, 0xb8, 0xFF, 0xFF, 0xFF, 0xFF];
            t.insert(&from, &to, 12).unwrap();
            assert_eq!(t.lookup(&[0x20, 0x01, 0x0d, 0xb8, 1, 2, 3, 4]), 12);
            assert_eq!(t.lookup(&[0x20, 0x01, 0x0d, 0xb9, 0, 0, 0, 0]), LPM_INVALID);
        });
    }

    #[test]
    fn remap_rewrites_through_table() {
        with_lpm(4, |t, ctx| {
            t.insert(&[10, 0, 0, 0], &[10, 0, 0, 255], 0).unwrap();
            t.insert(&[20, 0, 0, 0], &[20, 0, 0, 255], 1).unwrap();
            let mut table = ValueTable::create(ctx, 1, 16).unwrap();
            let table = unsafe { table.as_mut() };
            table.new_gen();
            table.touch(0, 0).unwrap();
            table.touch(0, 1).unwrap();
            table.compact();
            t.remap(table);
            let a = t.lookup(&[10, 0, 0, 1]);
            let b = t.lookup(&[20, 0, 0, 1]);
            assert_ne!(a, b);
            assert!(a < 2 && b < 2);
        });
    }

    #[test]
    fn destroy_balances_context() {
        let arena = TestArena::new(1 << 22);
        let ctx = MemCtx::create(arena.alloc, "lpm-leak").unwrap();
        let mut tree = LpmTree::create(ctx.as_ptr(), 4).unwrap();
        unsafe {
            tree.as_mut()
                .insert(&[10, 0, 0, 0], &[10, 255, 255, 255], 1)
                .unwrap();
            LpmTree::destroy(tree);
            assert!((*ctx.as_ptr()).stats().balanced());
        }
    }
}
