//! Range collector: turns a set of (network, prefix length) entries into a
//! non-overlapping LPM.
//!
//! Entries are indexed by canonical network address in an internal radix
//! tree; each address carries a bit mask of the prefix lengths announced for
//! it (bit `p-1` set means a /p exists). At collect time the networks are
//! replayed in address order, shortest prefix first, through a stack-based
//! emitter that slices overlapping prefixes into disjoint ranges, narrower
//! cover first. Every emitted range is labelled with a freshly minted dense
//! value, ordered by range.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::lpm::LpmTree;
use crate::mem::context::MemCtx;
use crate::radix::{RadixTree, RADIX_INVALID};
use crate::relptr::RelPtr;

/// Mask-store entries added per growth step.
const MASK_GROW: usize = 64;

#[repr(C)]
pub struct RangeCollector {
    key_size: u32,
    has_default: u32,
    mask_count: u32,
    mask_cap: u32,
    memctx: RelPtr<MemCtx>,
    masks: RelPtr<u8>,
    radix: RadixTree,
}

impl RangeCollector {
    pub fn create(ctx: *mut MemCtx, key_size: u32) -> Result<NonNull<RangeCollector>> {
        if key_size != 4 && key_size != 8 {
            return Err(Error::InvalidArgument);
        }
        let ctx_ref = unsafe { &*ctx };
        let raw = ctx_ref.balloc(std::mem::size_of::<RangeCollector>()) as *mut RangeCollector;
        let mut collector = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
        let c = unsafe { collector.as_mut() };
        c.key_size = key_size;
        c.has_default = 0;
        c.mask_count = 0;
        c.mask_cap = 0;
        c.memctx.set(ctx);
        c.masks.set_null();
        if let Err(e) = c.radix.init(ctx, key_size) {
            unsafe { ctx_ref.bfree(raw as *mut u8, std::mem::size_of::<RangeCollector>()) };
            return Err(e);
        }
        Ok(collector)
    }

    /// # Safety
    /// `collector` must come from [`RangeCollector::create`] and not be used
    /// after.
    pub unsafe fn destroy(mut collector: NonNull<RangeCollector>) {
        let c = collector.as_mut();
        let ctx = c.memctx.get();
        if !c.masks.is_null() {
            (*ctx).bfree(
                c.masks.get(),
                c.mask_cap as usize * c.key_size as usize,
            );
            c.masks.set_null();
        }
        c.radix.deinit();
        (*ctx).bfree(
            collector.as_ptr() as *mut u8,
            std::mem::size_of::<RangeCollector>(),
        );
    }

    /// Record the network `addr`/`prefix_len`. The address is canonicalised
    /// (host bits cleared) before indexing.
    pub fn add(&mut self, prefix_len: u32, addr: &[u8]) -> Result<()> {
        let k = self.key_size as usize;
        if addr.len() != k || prefix_len as usize > 8 * k {
            return Err(Error::InvalidArgument);
        }
        if prefix_len == 0 {
            self.has_default = 1;
            return Ok(());
        }
        let canonical = key_to_u128(addr) & !host_mask(k, prefix_len);
        let key = u128_to_key(canonical, k);

        let mask_idx = match self.radix.lookup(&key[..k]) {
            RADIX_INVALID => {
                let idx = self.alloc_mask()?;
                self.radix.insert(&key[..k], idx)?;
                idx
            }
            idx => idx,
        };
        let bit = prefix_len - 1;
        unsafe {
            let mask = self.masks.get().add(mask_idx as usize * k);
            *mask.add(bit as usize / 8) |= 0x80 >> (bit % 8);
        }
        Ok(())
    }

    /// Replay the collected networks into `lpm` as disjoint ranges. Returns
    /// the number of ranges emitted; their values are `0..count` in range
    /// order.
    pub fn collect(&self, lpm: &mut LpmTree) -> Result<u32> {
        let k = self.key_size as usize;
        if lpm.key_size() != self.key_size {
            return Err(Error::InvalidArgument);
        }
        let mut emitter = Emitter {
            lpm,
            key_size: k,
            stack: Vec::new(),
            cursor: 0,
            next_value: 0,
            failed: None,
        };
        if self.has_default != 0 {
            emitter.add(0, host_mask(k, 0));
        }
        let masks = self.masks.get();
        self.radix.walk(&mut |addr, mask_idx| {
            if emitter.failed.is_some() {
                return;
            }
            let from = key_to_u128(addr);
            let mask = unsafe { std::slice::from_raw_parts(masks.add(mask_idx as usize * k), k) };
            for p in 1..=(8 * k) as u32 {
                let bit = p - 1;
                if mask[bit as usize / 8] & (0x80 >> (bit % 8)) != 0 {
                    emitter.add(from, from | host_mask(k, p));
                }
            }
        });
        emitter.finish();
        match emitter.failed {
            Some(e) => Err(e),
            None => Ok(emitter.next_value),
        }
    }

    fn alloc_mask(&mut self) -> Result<u32> {
        let k = self.key_size as usize;
        if self.mask_count == self.mask_cap {
            let ctx = unsafe { &*self.memctx.get() };
            let new_cap = self.mask_cap as usize + MASK_GROW;
            let fresh = unsafe {
                ctx.brealloc(
                    self.masks.get(),
                    self.mask_cap as usize * k,
                    new_cap * k,
                )
            };
            if fresh.is_null() {
                return Err(Error::OutOfMemory);
            }
            self.masks.set(fresh);
            self.mask_cap = new_cap as u32;
        }
        let idx = self.mask_count;
        self.mask_count += 1;
        unsafe { std::ptr::write_bytes(self.masks.get().add(idx as usize * k), 0, k) };
        Ok(idx)
    }
}

/// Stack-based emitter producing disjoint ranges from nested prefixes.
///
/// The stack holds the upper bounds of prefixes still covering the cursor;
/// a new network starting inside the top cover first flushes the covered
/// span up to its start.
struct Emitter<'a> {
    lpm: &'a mut LpmTree,
    key_size: usize,
    stack: Vec<u128>,
    cursor: u128,
    next_value: u32,
    failed: Option<Error>,
}

impl Emitter<'_> {
    /// Ranges must arrive sorted by start ascending, wider first at equal
    /// starts; prefixes guarantee any two are nested or disjoint.
    fn add(&mut self, from: u128, to: u128) {
        while let Some(&top) = self.stack.last() {
            if top >= from {
                break;
            }
            if self.cursor <= top {
                self.emit(self.cursor, top);
                self.cursor = top + 1;
            }
            self.stack.pop();
        }
        if !self.stack.is_empty() && self.cursor < from {
            self.emit(self.cursor, from - 1);
        }
        self.cursor = from;
        self.stack.push(to);
    }

    fn finish(&mut self) {
        while let Some(top) = self.stack.pop() {
            if self.cursor <= top {
                self.emit(self.cursor, top);
                self.cursor = top + 1;
            }
        }
    }

    fn emit(&mut self, from: u128, to: u128) {
        let value = self.next_value;
        self.next_value += 1;
        let f = u128_to_key(from, self.key_size);
        let t = u128_to_key(to, self.key_size);
        if let Err(e) = self.lpm.insert(&f[..self.key_size], &t[..self.key_size], value) {
            self.failed.get_or_insert(e);
        }
    }
}

/// All-ones suffix below a /p prefix of a k-byte key.
#[inline]
fn host_mask(key_size: usize, prefix_len: u32) -> u128 {
    (1u128 << (8 * key_size as u32 - prefix_len)) - 1
}

#[inline]
fn key_to_u128(key: &[u8]) -> u128 {
    let mut v = 0u128;
    for &b in key {
        v = v << 8 | b as u128;
    }
    v
}

#[inline]
fn u128_to_key(v: u128, key_size: usize) -> [u8; 8] {
    let mut key = [0u8; 8];
    for i in 0..key_size {
        key[i] = (v >> (8 * (key_size - 1 - i))) as u8;
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lpm::LPM_INVALID;
    use crate::mem::alloc::tests::TestArena;

    fn setup<R>(f: impl FnOnce(&mut RangeCollector, &mut LpmTree) -> R) -> R {
        let arena = TestArena::new(1 << 22);
        let ctx = MemCtx::create(arena.alloc, "collector-test").unwrap();
        let mut collector = RangeCollector::create(ctx.as_ptr(), 4).unwrap();
        let mut lpm = LpmTree::create(ctx.as_ptr(), 4).unwrap();
        f(unsafe { collector.as_mut() }, unsafe { lpm.as_mut() })
    }

    #[test]
    fn single_prefix_becomes_one_range() {
        setup(|c, lpm| {
            c.add(24, &[10, 0, 0, 0]).unwrap();
            assert_eq!(c.collect(lpm).unwrap(), 1);
            assert_eq!(lpm.lookup(&[10, 0, 0, 0]), 0);
            assert_eq!(lpm.lookup(&[10, 0, 0, 255]), 0);
            assert_eq!(lpm.lookup(&[10, 0, 1, 0]), LPM_INVALID);
        });
    }

    #[test]
    fn host_bits_are_canonicalised() {
        setup(|c, lpm| {
            c.add(24, &[10, 0, 0, 77]).unwrap();
            assert_eq!(c.collect(lpm).unwrap(), 1);
            assert_eq!(lpm.lookup(&[10, 0, 0, 1]), 0);
        });
    }

    #[test]
    fn nested_prefixes_are_sliced_disjoint() {
        setup(|c, lpm| {
            c.add(8, &[10, 0, 0, 0]).unwrap();
            c.add(24, &[10, 0, 0, 0]).unwrap();
            // Narrower cover emitted first: [10.0.0.0, 10.0.0.255] then the
            // remainder of the /8.
            assert_eq!(c.collect(lpm).unwrap(), 2);
            assert_eq!(lpm.lookup(&[10, 0, 0, 9]), 0);
            assert_eq!(lpm.lookup(&[10, 0, 1, 0]), 1);
            assert_eq!(lpm.lookup(&[10, 255, 255, 255]), 1);
            assert_eq!(lpm.lookup(&[11, 0, 0, 0]), LPM_INVALID);
        });
    }

    #[test]
    fn inner_prefix_in_the_middle_splits_the_outer() {
        setup(|c, lpm| {
            c.add(8, &[10, 0, 0, 0]).unwrap();
            c.add(24, &[10, 0, 7, 0]).unwrap();
            // [10.0.0.0, 10.0.6.255], [10.0.7.0, 10.0.7.255], [10.0.8.0, ...]
            assert_eq!(c.collect(lpm).unwrap(), 3);
            assert_eq!(lpm.lookup(&[10, 0, 6, 255]), 0);
            assert_eq!(lpm.lookup(&[10, 0, 7, 128]), 1);
            assert_eq!(lpm.lookup(&[10, 0, 8, 0]), 2);
        });
    }

    #[test]
    fn sibling_prefixes_get_sequential_values() {
        setup(|c, lpm| {
            c.add(24, &[10, 0, 0, 0]).unwrap();
            c.add(24, &[10, 0, 1, 0]).unwrap();
            c.add(24, &[192, 168, 0, 0]).unwrap();
            assert_eq!(c.collect(lpm).unwrap(), 3);
            assert_eq!(lpm.lookup(&[10, 0, 0, 1]), 0);
            assert_eq!(lpm.lookup(&[10, 0, 1, 1]), 1);
            assert_eq!(lpm.lookup(&[192, 168, 0, 200]), 2);
            assert_eq!(lpm.lookup(&[10, 0, 2, 0]), LPM_INVALID);
        });
    }

    #[test]
    fn default_route_covers_the_gaps() {
        setup(|c, lpm| {
            c.add(0, &[0, 0, 0, 0]).unwrap();
            c.add(8, &[10, 0, 0, 0]).unwrap();
            assert_eq!(c.collect(lpm).unwrap(), 3);
            assert_eq!(lpm.lookup(&[0, 0, 0, 1]), 0);
            assert_eq!(lpm.lookup(&[10, 1, 2, 3]), 1);
            assert_eq!(lpm.lookup(&[250, 0, 0, 1]), 2);
            assert_eq!(lpm.lookup(&[255, 255, 255, 255]), 2);
        });
    }

    #[test]
    fn duplicate_networks_collapse() {
        setup(|c, lpm| {
            c.add(24, &[10, 0, 0, 0]).unwrap();
            c.add(24, &[10, 0, 0, 99]).unwrap();
            assert_eq!(c.collect(lpm).unwrap(), 1);
        });
    }

    #[test]
    fn mask_store_grows_past_one_chunk() {
        setup(|c, lpm| {
            for a in 0..130u8 {
                c.add(16, &[a, 1, 0, 0]).unwrap();
            }
            assert_eq!(c.collect(lpm).unwrap(), 130);
            assert_eq!(lpm.lookup(&[0, 1, 2, 3]), 0);
            assert_eq!(lpm.lookup(&[129, 1, 200, 4]), 129);
        });
    }

    #[test]
    fn rejects_bad_input() {
        setup(|c, _| {
            assert!(c.add(33, &[1, 2, 3, 4]).is_err());
            assert!(c.add(8, &[1, 2, 3]).is_err());
        });
    }

    #[test]
    fn destroy_balances_context() {
        let arena = TestArena::new(1 << 22);
        let ctx = MemCtx::create(arena.alloc, "collector-leak").unwrap();
        let mut c = RangeCollector::create(ctx.as_ptr(), 4).unwrap();
        unsafe {
            c.as_mut().add(24, &[10, 0, 0, 0]).unwrap();
            RangeCollector::destroy(c);
            assert!((*ctx.as_ptr()).stats().balanced());
        }
    }
}
