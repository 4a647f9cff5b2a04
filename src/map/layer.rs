//! Layer map: a stack of TTL maps rotated by age.
//!
//! Writers address only the `active` map. Readers search `active` under its
//! bucket locks, then the hot read-only layer (which writers may still have
//! been filling moments before rotation) under its locks, then the remaining
//! read-only layers lock-free: after one full rotation a layer is never
//! written again.
//!
//! `rotate` promotes `active` to the head of the read-only chain and
//! publishes a recycled (or fresh) map as the new `active`, both through
//! release stores on the relative-pointer slots. Read-only layers whose
//! latest deadline has passed are detached into the `outdated` list and
//! their backing memory is reused by a later rotation; the clear happens at
//! reuse time, at least one full rotation after detachment, which is the
//! grace period in-flight readers get.

use std::ptr::NonNull;

use crate::error::Result;
use crate::map::ttl::{TtlGuard, TtlMap, TtlMapConfig};
use crate::mem::context::MemCtx;
use crate::relptr::RelPtr;

#[repr(C)]
pub struct LayerMap {
    cfg: TtlMapConfig,
    memctx: RelPtr<MemCtx>,
    active: RelPtr<TtlMap>,
    read_only: RelPtr<TtlMap>,
    outdated: RelPtr<TtlMap>,
}

impl LayerMap {
    pub fn create(ctx: *mut MemCtx, cfg: TtlMapConfig) -> Result<NonNull<LayerMap>> {
        let ctx_ref = unsafe { &*ctx };
        let raw = ctx_ref.balloc(std::mem::size_of::<LayerMap>()) as *mut LayerMap;
        let mut map = NonNull::new(raw).ok_or(crate::error::Error::OutOfMemory)?;
        let m = unsafe { map.as_mut() };
        m.cfg = cfg;
        m.memctx.set(ctx);
        m.active.set_null();
        m.read_only.set_null();
        m.outdated.set_null();
        match TtlMap::create(ctx, cfg) {
            Ok(active) => {
                m.cfg = unsafe { *active.as_ref().config() };
                m.active.set(active.as_ptr());
            }
            Err(e) => {
                unsafe { ctx_ref.bfree(raw as *mut u8, std::mem::size_of::<LayerMap>()) };
                return Err(e);
            }
        }
        Ok(map)
    }

    /// # Safety
    /// `map` must come from [`LayerMap::create`], with no concurrent users,
    /// and must not be used after.
    pub unsafe fn destroy(map: NonNull<LayerMap>) {
        let m = map.as_ref();
        let ctx = m.memctx.get();
        let mut chains = [m.active.get(), m.read_only.get(), m.outdated.get()];
        for head in chains.iter_mut() {
            let mut cur = *head;
            while !cur.is_null() {
                let next = (*cur).next.get();
                TtlMap::destroy(NonNull::new_unchecked(cur));
                cur = next;
            }
        }
        (*ctx).bfree(map.as_ptr() as *mut u8, std::mem::size_of::<LayerMap>());
    }

    pub fn config(&self) -> &TtlMapConfig {
        &self.cfg
    }

    /// Insert into the active layer.
    pub fn put(&self, worker: u32, now: u32, ttl: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let active = unsafe { &*self.active.load_acquire() };
        active.put(worker, now, ttl, key, value)
    }

    /// Search active, then the hot read-only layer, then the older layers.
    pub fn get(&self, worker: u32, now: u32, key: &[u8]) -> Option<TtlGuard<'_>> {
        let active = unsafe { &*self.active.load_acquire() };
        if let Some(hit) = active.get(worker, now, key) {
            return Some(hit);
        }
        let hot = self.read_only.load_acquire();
        if hot.is_null() {
            return None;
        }
        if let Some(hit) = unsafe { (*hot).get(worker, now, key) } {
            return Some(hit);
        }
        let mut cur = unsafe { (*hot).next.load_acquire() };
        while !cur.is_null() {
            if let Some(hit) = unsafe { (*cur).get_unlocked(now, key) } {
                return Some(hit);
            }
            cur = unsafe { (*cur).next.load_acquire() };
        }
        None
    }

    /// Delete from the active layer only; older layers age out on their own.
    pub fn delete(&self, worker: u32, now: u32, key: &[u8]) -> bool {
        let active = unsafe { &*self.active.load_acquire() };
        active.delete(worker, now, key)
    }

    /// Retire the current active layer and publish a reused (or fresh) one.
    ///
    /// Must be called from a single maintenance thread; concurrent readers
    /// and writers are fine.
    pub fn rotate(&self, now: u32) -> Result<()> {
        // Detach drained layers behind the hot head; their next pointers
        // keep the rest of the chain reachable for in-flight readers.
        let mut drained: Vec<*mut TtlMap> = Vec::new();
        let hot = self.read_only.load_acquire();
        if !hot.is_null() {
            let mut prev = hot;
            let mut cur = unsafe { (*hot).next.load_acquire() };
            while !cur.is_null() {
                let next = unsafe { (*cur).next.load_acquire() };
                if unsafe { (*cur).max_deadline() } <= now {
                    unsafe { (*prev).next.store_release(next) };
                    drained.push(cur);
                } else {
                    prev = cur;
                }
                cur = next;
            }
        }

        // Reuse the oldest outdated layer, falling back to a fresh map.
        let reused = self.outdated.load_acquire();
        let fresh = if reused.is_null() {
            TtlMap::create(self.memctx.get(), self.cfg)?.as_ptr()
        } else {
            unsafe {
                self.outdated.store_release((*reused).next.load_acquire());
                (*reused).clear();
                (*reused).next.set_null();
            }
            reused
        };

        // Promote active to the head of the read-only chain, then publish
        // the replacement.
        let old_active = self.active.load_acquire();
        unsafe {
            (*old_active).next.store_release(self.read_only.load_acquire());
        }
        self.read_only.store_release(old_active);
        self.active.store_release(fresh);

        // Queue the drained layers for reuse, oldest last.
        for layer in drained {
            unsafe { (*layer).next.set_null() };
            let mut slot = &self.outdated;
            loop {
                let cur = slot.load_acquire();
                if cur.is_null() {
                    slot.store_release(layer);
                    break;
                }
                slot = unsafe { &(*cur).next };
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn active_ptr(&self) -> *mut TtlMap {
        self.active.load_acquire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{EqualFnId, HashFnId, RandFnId};
    use crate::mem::alloc::tests::TestArena;

    fn test_cfg() -> TtlMapConfig {
        TtlMapConfig {
            key_size: 8,
            value_size: 8,
            index_size: 32,
            extra_bucket_count: 8,
            worker_count: 1,
            hash_seed: 23,
            hash_fn: HashFnId::Fnv1a,
            equal_fn: EqualFnId::Memcmp,
            rand_fn: RandFnId::Lcg,
        }
    }

    fn with_layers<R>(f: impl FnOnce(&LayerMap, *mut MemCtx) -> R) -> R {
        let arena = TestArena::new(1 << 23);
        let ctx = MemCtx::create(arena.alloc, "layer-test").unwrap();
        let map = LayerMap::create(ctx.as_ptr(), test_cfg()).unwrap();
        let r = f(unsafe { map.as_ref() }, ctx.as_ptr());
        unsafe { LayerMap::destroy(map) };
        assert!(unsafe { (*ctx.as_ptr()).stats().balanced() });
        r
    }

    fn get_u64(map: &LayerMap, now: u32, key: u64) -> Option<u64> {
        map.get(0, now, &key.to_be_bytes())
            .map(|g| u64::from_be_bytes(unsafe { *(g.value() as *const [u8; 8]) }))
    }

    #[test]
    fn entries_survive_one_rotation_via_the_hot_layer() {
        with_layers(|map, _| {
            map.put(0, 0, 10, &1u64.to_be_bytes(), &11u64.to_be_bytes()).unwrap();
            map.rotate(5).unwrap();
            // Now served from the hot read-only layer.
            assert_eq!(get_u64(map, 5, 1), Some(11));
            // Expired by deadline regardless of which layer holds it.
            map.rotate(20).unwrap();
            assert_eq!(get_u64(map, 20, 1), None);
        });
    }

    #[test]
    fn puts_go_to_the_fresh_active_after_rotation() {
        with_layers(|map, _| {
            map.put(0, 0, 100, &1u64.to_be_bytes(), &1u64.to_be_bytes()).unwrap();
            map.rotate(10).unwrap();
            map.put(0, 10, 100, &2u64.to_be_bytes(), &2u64.to_be_bytes()).unwrap();
            // Both generations visible through one get path.
            assert_eq!(get_u64(map, 20, 1), Some(1));
            assert_eq!(get_u64(map, 20, 2), Some(2));
        });
    }

    #[test]
    fn refreshed_key_shadows_the_old_layer() {
        with_layers(|map, _| {
            map.put(0, 0, 100, &7u64.to_be_bytes(), &1u64.to_be_bytes()).unwrap();
            map.rotate(10).unwrap();
            map.put(0, 10, 100, &7u64.to_be_bytes(), &2u64.to_be_bytes()).unwrap();
            // Active is searched first.
            assert_eq!(get_u64(map, 20, 7), Some(2));
        });
    }

    #[test]
    fn drained_layers_are_reused() {
        with_layers(|map, _| {
            map.put(0, 0, 10, &1u64.to_be_bytes(), &1u64.to_be_bytes()).unwrap();
            let first_active = map.active_ptr();
            // Rotate it out, let it expire, rotate until it cycles through
            // the outdated list back to active.
            map.rotate(5).unwrap();
            map.rotate(20).unwrap();
            map.rotate(30).unwrap();
            map.rotate(40).unwrap();
            let recycled = map.active_ptr();
            assert_eq!(recycled, first_active);
            // The recycled layer is empty.
            assert_eq!(get_u64(map, 40, 1), None);
        });
    }

    #[test]
    fn deep_layer_lookup_is_lock_free_and_correct() {
        with_layers(|map, _| {
            map.put(0, 0, 1000, &5u64.to_be_bytes(), &50u64.to_be_bytes()).unwrap();
            map.rotate(1).unwrap();
            map.rotate(2).unwrap();
            map.rotate(3).unwrap();
            // The entry now sits three layers deep, past the hot layer.
            assert_eq!(get_u64(map, 10, 5), Some(50));
        });
    }

    #[test]
    fn concurrent_reads_during_rotation() {
        struct SendPtr(*const LayerMap);
        unsafe impl Send for SendPtr {}
        unsafe impl Sync for SendPtr {}

        with_layers(|map, _| {
            for k in 0..100u64 {
                map.put(0, 0, 1_000_000, &k.to_be_bytes(), &k.to_be_bytes()).unwrap();
            }
            let shared = SendPtr(map as *const LayerMap);
            std::thread::scope(|s| {
                let reader = s.spawn({
                    let shared = &shared;
                    move || {
                        let map = unsafe { &*shared.0 };
                        for round in 0..200 {
                            for k in 0..100u64 {
                                assert_eq!(
                                    get_u64(map, 10, k),
                                    Some(k),
                                    "round {round} key {k}"
                                );
                            }
                        }
                    }
                });
                for now in 1..20u32 {
                    map.rotate(now).unwrap();
                }
                reader.join().unwrap();
            });
        });
    }
}
