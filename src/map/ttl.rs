//! Session map: fixed-index, bucket-chained hash map with deadlines.
//!
//! The index is an array of buckets of four entries each, chunked so no
//! single allocation exceeds the allocator's largest block. Chain overflow
//! draws buckets from a fixed extra pool. Keys and values live in separate
//! chunked stores addressed by a 32-bit key index; freed indices are
//! recycled through per-worker free lists threaded through the key bytes
//! themselves (hence the minimum key size of four bytes).
//!
//! An entry is live iff `deadline > now` with a caller-supplied monotone
//! clock. A zero signature terminates the probe: slots are only ever handed
//! out in probe order and expired slots are reused in place, so nothing can
//! exist past the first empty slot. Writers serialise per bucket through an
//! [`ArenaRwLock`]; per-worker counters sit on their own cache lines.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::hash::{EqualFnId, HashFnId, RandFnId};
use crate::mem::alloc::BLOCK_MAX_SIZE;
use crate::mem::context::MemCtx;
use crate::relptr::RelPtr;
use crate::sync::lock::ArenaRwLock;

pub(crate) const TTL_BUCKET_SLOTS: usize = 4;
const TTL_MIN_INDEX: u32 = 16;
const TTL_IDX_NONE: u32 = u32::MAX;

/// Chunked flat store: `total` items of `item_size` bytes, split into
/// power-of-two-sized chunks that each fit the allocator's block limit.
#[repr(C)]
struct ChunkedStore {
    chunks: RelPtr<RelPtr<u8>>,
    chunk_count: u32,
    item_size: u32,
    items_per_chunk: u32,
    total: u32,
}

impl ChunkedStore {
    fn init(&mut self, ctx: &MemCtx, item_size: u32, total: u32) -> Result<()> {
        self.chunks.set_null();
        self.chunk_count = 0;
        self.item_size = item_size;
        self.total = total;
        if item_size == 0 || total == 0 {
            self.items_per_chunk = 1;
            return Ok(());
        }
        let max_items = (BLOCK_MAX_SIZE / item_size as usize).max(1);
        let ipc = (1usize << (usize::BITS - 1 - max_items.leading_zeros())) as u32;
        self.items_per_chunk = ipc;
        let chunk_count = (total as usize).div_ceil(ipc as usize);
        let table = ctx.balloc(chunk_count * 8) as *mut RelPtr<u8>;
        if table.is_null() {
            return Err(Error::OutOfMemory);
        }
        for i in 0..chunk_count {
            unsafe { (*table.add(i)).set_null() };
        }
        self.chunks.set(table);
        for i in 0..chunk_count {
            let bytes = self.chunk_bytes(i);
            let chunk = ctx.balloc(bytes);
            if chunk.is_null() {
                return Err(Error::OutOfMemory);
            }
            unsafe {
                std::ptr::write_bytes(chunk, 0, bytes);
                (*table.add(i)).set(chunk);
            }
            self.chunk_count += 1;
        }
        Ok(())
    }

    fn deinit(&mut self, ctx: &MemCtx) {
        if self.chunks.is_null() {
            return;
        }
        let table = self.chunks.get();
        unsafe {
            for i in 0..self.chunk_count as usize {
                let chunk = (*table.add(i)).get();
                if !chunk.is_null() {
                    ctx.bfree(chunk, self.chunk_bytes(i));
                }
            }
            let chunk_count =
                (self.total as usize).div_ceil(self.items_per_chunk as usize);
            ctx.bfree(table as *mut u8, chunk_count * 8);
        }
        self.chunks.set_null();
        self.chunk_count = 0;
    }

    #[inline]
    fn item(&self, idx: u32) -> *mut u8 {
        debug_assert!(idx < self.total);
        if self.item_size == 0 {
            return NonNull::dangling().as_ptr();
        }
        let ipc = self.items_per_chunk;
        let chunk = unsafe { (*self.chunks.get().add((idx / ipc) as usize)).get() };
        unsafe { chunk.add((idx % ipc) as usize * self.item_size as usize) }
    }

    fn zero(&mut self) {
        for i in 0..self.chunk_count as usize {
            let chunk = unsafe { (*self.chunks.get().add(i)).get() };
            unsafe { std::ptr::write_bytes(chunk, 0, self.chunk_bytes(i)) };
        }
    }

    fn chunk_bytes(&self, chunk: usize) -> usize {
        let ipc = self.items_per_chunk as usize;
        let items = (self.total as usize - chunk * ipc).min(ipc);
        items * self.item_size as usize
    }
}

#[repr(C)]
struct TtlEntry {
    sig: u16,
    _pad: u16,
    deadline: u32,
    key_idx: u32,
    /// Reader pin count; writers wait for zero before displacing the entry.
    state: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<TtlEntry>() == 16);

#[repr(C)]
struct TtlBucket {
    entries: [TtlEntry; TTL_BUCKET_SLOTS],
    next: RelPtr<TtlBucket>,
}

#[repr(C, align(64))]
struct TtlWorker {
    free_head: AtomicU32,
    max_chain: AtomicU32,
    max_deadline: AtomicU32,
    _pad0: u32,
    total_elements: AtomicU64,
    _pad1: [u64; 5],
}

const _: () = assert!(std::mem::size_of::<TtlWorker>() == 64);

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TtlMapConfig {
    /// At least 4 bytes; freed key slots carry the free-list link.
    pub key_size: u32,
    pub value_size: u32,
    /// Rounded up to a power of two, minimum 16.
    pub index_size: u32,
    pub extra_bucket_count: u32,
    pub worker_count: u32,
    /// 0 derives a seed through `rand_fn`.
    pub hash_seed: u64,
    pub hash_fn: HashFnId,
    pub equal_fn: EqualFnId,
    pub rand_fn: RandFnId,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TtlMapStats {
    pub total_elements: u64,
    pub max_chain: u32,
    pub key_cursor: u32,
}

#[repr(C)]
pub struct TtlMap {
    cfg: TtlMapConfig,
    index_mask: u64,
    capacity: u32,
    key_cursor: AtomicU32,
    extra_cursor: AtomicU32,
    _pad: u32,
    memctx: RelPtr<MemCtx>,
    index: ChunkedStore,
    extra: ChunkedStore,
    keys: ChunkedStore,
    values: ChunkedStore,
    locks: RelPtr<ArenaRwLock>,
    workers: RelPtr<TtlWorker>,
    /// Layer-map chaining; unused standalone.
    pub(crate) next: RelPtr<TtlMap>,
}

/// Holds the bucket read lock while the caller uses the value pointer.
pub struct TtlGuard<'a> {
    lock: Option<&'a ArenaRwLock>,
    value: *mut u8,
    key_idx: u32,
}

impl TtlGuard<'_> {
    pub fn value(&self) -> *mut u8 {
        self.value
    }

    pub fn key_index(&self) -> u32 {
        self.key_idx
    }
}

impl Drop for TtlGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.read_unlock();
        }
    }
}

/// Pins the value slot past the bucket lock: the owning entry cannot be
/// displaced until the reference drops.
pub struct TtlValueRef<'a> {
    state: &'a AtomicU32,
    value: *mut u8,
    key_idx: u32,
}

impl TtlValueRef<'_> {
    pub fn value(&self) -> *mut u8 {
        self.value
    }

    pub fn key_index(&self) -> u32 {
        self.key_idx
    }
}

impl Drop for TtlValueRef<'_> {
    fn drop(&mut self) {
        self.state.fetch_sub(1, Ordering::Release);
    }
}

impl TtlMap {
    pub fn create(ctx: *mut MemCtx, cfg: TtlMapConfig) -> Result<NonNull<TtlMap>> {
        let ctx_ref = unsafe { &*ctx };
        let raw = ctx_ref.balloc(std::mem::size_of::<TtlMap>()) as *mut TtlMap;
        let mut map = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
        if let Err(e) = unsafe { map.as_mut().init(ctx, cfg) } {
            unsafe { ctx_ref.bfree(raw as *mut u8, std::mem::size_of::<TtlMap>()) };
            return Err(e);
        }
        Ok(map)
    }

    /// Initialise in place (for reuse by the layer map).
    pub fn init(&mut self, ctx: *mut MemCtx, mut cfg: TtlMapConfig) -> Result<()> {
        if cfg.key_size < 4 || cfg.worker_count == 0 || cfg.index_size == 0 {
            return Err(Error::InvalidArgument);
        }
        cfg.index_size = cfg.index_size.next_power_of_two().max(TTL_MIN_INDEX);
        if cfg.hash_seed == 0 {
            cfg.hash_seed = cfg.rand_fn.derive_seed();
        }
        let capacity = (cfg.index_size as u64 + cfg.extra_bucket_count as u64)
            * TTL_BUCKET_SLOTS as u64;
        if capacity >= TTL_IDX_NONE as u64 {
            return Err(Error::InvalidArgument);
        }

        self.cfg = cfg;
        self.index_mask = cfg.index_size as u64 - 1;
        self.capacity = capacity as u32;
        self.key_cursor = AtomicU32::new(0);
        self.extra_cursor = AtomicU32::new(0);
        self._pad = 0;
        self.memctx.set(ctx);
        self.index.chunks.set_null();
        self.extra.chunks.set_null();
        self.keys.chunks.set_null();
        self.values.chunks.set_null();
        self.locks.set_null();
        self.workers.set_null();
        self.next.set_null();

        let ctx_ref = unsafe { &*ctx };
        let result = (|| -> Result<()> {
            let bucket_size = std::mem::size_of::<TtlBucket>() as u32;
            self.index.init(ctx_ref, bucket_size, cfg.index_size)?;
            self.extra.init(ctx_ref, bucket_size, cfg.extra_bucket_count)?;
            self.keys.init(ctx_ref, cfg.key_size, capacity as u32)?;
            self.values.init(ctx_ref, cfg.value_size, capacity as u32)?;

            let locks = ctx_ref.balloc(
                cfg.index_size as usize * std::mem::size_of::<ArenaRwLock>(),
            ) as *mut ArenaRwLock;
            if locks.is_null() {
                return Err(Error::OutOfMemory);
            }
            for i in 0..cfg.index_size as usize {
                unsafe { (*locks.add(i)).init() };
            }
            self.locks.set(locks);

            let workers = ctx_ref
                .balloc(cfg.worker_count as usize * std::mem::size_of::<TtlWorker>())
                as *mut TtlWorker;
            if workers.is_null() {
                return Err(Error::OutOfMemory);
            }
            for w in 0..cfg.worker_count as usize {
                unsafe {
                    let worker = &mut *workers.add(w);
                    worker.free_head = AtomicU32::new(TTL_IDX_NONE);
                    worker.max_chain = AtomicU32::new(0);
                    worker.max_deadline = AtomicU32::new(0);
                    worker._pad0 = 0;
                    worker.total_elements = AtomicU64::new(0);
                    worker._pad1 = [0; 5];
                }
            }
            self.workers.set(workers);
            Ok(())
        })();

        if let Err(e) = result {
            self.deinit();
            return Err(e);
        }
        Ok(())
    }

    /// Release owned stores; idempotent with respect to null fields.
    pub fn deinit(&mut self) {
        let ctx = self.memctx.get();
        if ctx.is_null() {
            return;
        }
        let ctx = unsafe { &*ctx };
        self.index.deinit(ctx);
        self.extra.deinit(ctx);
        self.keys.deinit(ctx);
        self.values.deinit(ctx);
        if !self.locks.is_null() {
            unsafe {
                ctx.bfree(
                    self.locks.get() as *mut u8,
                    self.cfg.index_size as usize * std::mem::size_of::<ArenaRwLock>(),
                )
            };
            self.locks.set_null();
        }
        if !self.workers.is_null() {
            unsafe {
                ctx.bfree(
                    self.workers.get() as *mut u8,
                    self.cfg.worker_count as usize * std::mem::size_of::<TtlWorker>(),
                )
            };
            self.workers.set_null();
        }
    }

    /// # Safety
    /// `map` must come from [`TtlMap::create`], with no concurrent users,
    /// and must not be used after.
    pub unsafe fn destroy(mut map: NonNull<TtlMap>) {
        let ctx = map.as_ref().memctx.get();
        map.as_mut().deinit();
        (*ctx).bfree(map.as_ptr() as *mut u8, std::mem::size_of::<TtlMap>());
    }

    pub fn config(&self) -> &TtlMapConfig {
        &self.cfg
    }

    /// Look up a live entry under the bucket's read lock.
    pub fn get(&self, _worker: u32, now: u32, key: &[u8]) -> Option<TtlGuard<'_>> {
        let (bucket, sig) = self.locate(key);
        let lock = self.bucket_lock(bucket);
        lock.read_lock();
        match self.probe(bucket, sig, now, key) {
            Some(entry) => {
                let e = unsafe { &*entry };
                Some(TtlGuard {
                    lock: Some(lock),
                    value: self.values.item(e.key_idx),
                    key_idx: e.key_idx,
                })
            }
            None => {
                lock.read_unlock();
                None
            }
        }
    }

    /// Lock-free lookup for layers that are no longer written.
    pub fn get_unlocked(&self, now: u32, key: &[u8]) -> Option<TtlGuard<'_>> {
        let (bucket, sig) = self.locate(key);
        self.probe(bucket, sig, now, key).map(|entry| {
            let e = unsafe { &*entry };
            TtlGuard {
                lock: None,
                value: self.values.item(e.key_idx),
                key_idx: e.key_idx,
            }
        })
    }

    /// Look up and pin: the returned reference stays valid after the bucket
    /// lock is released, and blocks writers from displacing the entry.
    pub fn get_ref(&self, _worker: u32, now: u32, key: &[u8]) -> Option<TtlValueRef<'_>> {
        let (bucket, sig) = self.locate(key);
        let lock = self.bucket_lock(bucket);
        lock.read_lock();
        let found = self.probe(bucket, sig, now, key).map(|entry| {
            let e = unsafe { &*entry };
            e.state.fetch_add(1, Ordering::Acquire);
            TtlValueRef {
                state: unsafe { &(*entry).state },
                value: self.values.item(e.key_idx),
                key_idx: e.key_idx,
            }
        });
        lock.read_unlock();
        found
    }

    /// Insert or refresh `key` with deadline `now + ttl`.
    pub fn put(&self, worker: u32, now: u32, ttl: u32, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() != self.cfg.key_size as usize
            || value.len() != self.cfg.value_size as usize
            || worker >= self.cfg.worker_count
        {
            return Err(Error::InvalidArgument);
        }
        let (bucket, sig) = self.locate(key);
        let lock = self.bucket_lock(bucket);
        lock.write_lock();
        let result = self.put_inner(worker, bucket, sig, now, ttl, key, value);
        lock.write_unlock();
        result
    }

    /// Kill a live entry and recycle its key index through the worker's
    /// free list. Returns whether the key was present and live.
    pub fn delete(&self, worker: u32, now: u32, key: &[u8]) -> bool {
        if worker >= self.cfg.worker_count {
            return false;
        }
        let (bucket, sig) = self.locate(key);
        let lock = self.bucket_lock(bucket);
        lock.write_lock();
        let deleted = match self.probe(bucket, sig, now, key) {
            Some(entry) => {
                let e = unsafe { &mut *entry };
                Self::wait_unpinned(&e.state);
                let idx = e.key_idx;
                e.deadline = 0;
                e.key_idx = TTL_IDX_NONE;
                self.push_free(worker, idx);
                self.worker(worker)
                    .total_elements
                    .fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        };
        lock.write_unlock();
        deleted
    }

    /// Reset to empty. Callers must guarantee exclusive access.
    pub fn clear(&mut self) {
        self.index.zero();
        self.extra.zero();
        self.key_cursor.store(0, Ordering::Relaxed);
        self.extra_cursor.store(0, Ordering::Relaxed);
        for w in 0..self.cfg.worker_count {
            let worker = self.worker(w);
            worker.free_head.store(TTL_IDX_NONE, Ordering::Relaxed);
            worker.max_chain.store(0, Ordering::Relaxed);
            worker.max_deadline.store(0, Ordering::Relaxed);
            worker.total_elements.store(0, Ordering::Relaxed);
        }
    }

    /// Latest deadline ever written; the layer map uses this to decide when
    /// a rotated-out layer holds nothing live.
    pub fn max_deadline(&self) -> u32 {
        let mut max = 0;
        for w in 0..self.cfg.worker_count {
            max = max.max(self.worker(w).max_deadline.load(Ordering::Relaxed));
        }
        max
    }

    /// Aggregated per-worker counters. Approximate under concurrency.
    pub fn stats(&self) -> TtlMapStats {
        let mut stats = TtlMapStats {
            key_cursor: self.key_cursor.load(Ordering::Relaxed),
            ..Default::default()
        };
        for w in 0..self.cfg.worker_count {
            let worker = self.worker(w);
            stats.total_elements += worker.total_elements.load(Ordering::Relaxed);
            stats.max_chain = stats.max_chain.max(worker.max_chain.load(Ordering::Relaxed));
        }
        stats
    }

    #[allow(clippy::too_many_arguments)]
    fn put_inner(
        &self,
        worker: u32,
        bucket: usize,
        sig: u16,
        now: u32,
        ttl: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let deadline = now.saturating_add(ttl);
        let mut vacant: Option<*mut TtlEntry> = None;
        let mut chain_len = 0u32;
        let mut last_bucket = self.index.item(bucket as u32) as *mut TtlBucket;

        let mut cur = last_bucket;
        'probe: while !cur.is_null() {
            chain_len += 1;
            last_bucket = cur;
            let entries_base = unsafe { (*cur).entries.as_mut_ptr() };
            for slot in 0..TTL_BUCKET_SLOTS {
                let entry = unsafe { entries_base.add(slot) };
                let e = unsafe { &mut *entry };
                if e.sig == 0 {
                    if vacant.is_none() {
                        vacant = Some(entry);
                    }
                    break 'probe;
                }
                if e.sig == sig && e.deadline > now && self.key_matches(e.key_idx, key) {
                    // Refresh in place once concurrent readers let go.
                    Self::wait_unpinned(&e.state);
                    self.copy_value(e.key_idx, value);
                    e.deadline = deadline;
                    self.note_deadline(worker, deadline, chain_len);
                    return Ok(());
                }
                if vacant.is_none() && e.deadline <= now {
                    vacant = Some(entry);
                }
            }
            cur = unsafe { (*cur).next.load_acquire() };
        }

        let entry = match vacant {
            Some(entry) => entry,
            None => {
                // Chain fully live: draw one bucket from the extra pool.
                let idx = self.alloc_extra()?;
                let fresh = self.extra.item(idx) as *mut TtlBucket;
                unsafe {
                    let e = &mut *fresh;
                    e.next.set_null();
                    let first = &mut e.entries[0] as *mut TtlEntry;
                    self.fill_entry(worker, first, sig, deadline, now, key, value)?;
                    (*last_bucket).next.store_release(fresh);
                }
                self.note_deadline(worker, deadline, chain_len + 1);
                self.worker(worker)
                    .total_elements
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        unsafe { self.fill_entry(worker, entry, sig, deadline, now, key, value)? };
        self.note_deadline(worker, deadline, chain_len);
        self.worker(worker)
            .total_elements
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write a fresh or recycled entry. Caller holds the bucket write lock.
    ///
    /// # Safety
    /// `entry` must point into this map's bucket storage.
    unsafe fn fill_entry(
        &self,
        worker: u32,
        entry: *mut TtlEntry,
        sig: u16,
        deadline: u32,
        now: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let e = &mut *entry;
        let idx = if e.sig != 0 && e.deadline <= now && e.key_idx != TTL_IDX_NONE {
            // Expired entry: its key index is still ours, reuse it in place.
            Self::wait_unpinned(&e.state);
            e.key_idx
        } else {
            self.alloc_key_idx(worker)?
        };
        std::ptr::copy_nonoverlapping(key.as_ptr(), self.keys.item(idx), key.len());
        self.copy_value(idx, value);
        e.key_idx = idx;
        e.deadline = deadline;
        e.state = AtomicU32::new(0);
        e.sig = sig;
        Ok(())
    }

    fn probe(&self, bucket: usize, sig: u16, now: u32, key: &[u8]) -> Option<*mut TtlEntry> {
        let mut cur = self.index.item(bucket as u32) as *mut TtlBucket;
        while !cur.is_null() {
            for entry in unsafe { (*cur).entries.iter() } {
                let e = unsafe { &*(entry as *const TtlEntry) };
                if e.sig == 0 {
                    return None;
                }
                if e.sig == sig && e.deadline > now && self.key_matches(e.key_idx, key) {
                    return Some(entry as *const TtlEntry as *mut TtlEntry);
                }
            }
            cur = unsafe { (*cur).next.load_acquire() };
        }
        None
    }

    fn alloc_key_idx(&self, worker: u32) -> Result<u32> {
        let free = &self.worker(worker).free_head;
        let head = free.load(Ordering::Relaxed);
        if head != TTL_IDX_NONE {
            // Single consumer per worker id: the pop cannot race itself.
            let next = unsafe { *(self.keys.item(head) as *const u32) };
            free.store(next, Ordering::Relaxed);
            return Ok(head);
        }
        loop {
            let cur = self.key_cursor.load(Ordering::Relaxed);
            if cur >= self.capacity {
                return Err(Error::Exhausted);
            }
            if self
                .key_cursor
                .compare_exchange_weak(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(cur);
            }
        }
    }

    fn push_free(&self, worker: u32, idx: u32) {
        let free = &self.worker(worker).free_head;
        let head = free.load(Ordering::Relaxed);
        unsafe { *(self.keys.item(idx) as *mut u32) = head };
        free.store(idx, Ordering::Relaxed);
    }

    fn alloc_extra(&self) -> Result<u32> {
        loop {
            let cur = self.extra_cursor.load(Ordering::Relaxed);
            if cur >= self.cfg.extra_bucket_count {
                return Err(Error::Exhausted);
            }
            if self
                .extra_cursor
                .compare_exchange_weak(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(cur);
            }
        }
    }

    fn key_matches(&self, key_idx: u32, key: &[u8]) -> bool {
        if key_idx == TTL_IDX_NONE {
            return false;
        }
        let stored =
            unsafe { std::slice::from_raw_parts(self.keys.item(key_idx), key.len()) };
        self.cfg.equal_fn.equal(key, stored)
    }

    fn copy_value(&self, key_idx: u32, value: &[u8]) {
        if !value.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    value.as_ptr(),
                    self.values.item(key_idx),
                    value.len(),
                )
            };
        }
    }

    fn note_deadline(&self, worker: u32, deadline: u32, chain_len: u32) {
        let w = self.worker(worker);
        w.max_deadline.fetch_max(deadline, Ordering::Relaxed);
        w.max_chain.fetch_max(chain_len, Ordering::Relaxed);
    }

    fn wait_unpinned(state: &AtomicU32) {
        while state.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
    }

    #[inline]
    fn locate(&self, key: &[u8]) -> (usize, u16) {
        let hash = self.cfg.hash_fn.hash(self.cfg.hash_seed, key);
        let sig = match (hash & 0x7FFF) as u16 {
            0 => 1,
            s => s,
        };
        let bucket = ((hash >> 15) & self.index_mask) as usize;
        (bucket, sig)
    }

    #[inline]
    fn bucket_lock(&self, bucket: usize) -> &ArenaRwLock {
        unsafe { &*self.locks.get().add(bucket) }
    }

    #[inline]
    fn worker(&self, worker: u32) -> &TtlWorker {
        unsafe { &*self.workers.get().add(worker as usize) }
    }
}
