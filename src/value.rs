//! Dense integer remapping with generations.
//!
//! Three pieces that together compact an LPM's value space:
//!
//! - [`RemapTable`]: maps an old value to its current-generation value. Each
//!   touch moves one reference count from the old value to the new one; a
//!   value whose count reaches zero goes on a free list threaded through its
//!   `value` word and is handed out again.
//! - [`ValueTable`]: a rectangular (h, v) grid of values over a remap table,
//!   stored in fixed-size chunks.
//! - [`ValueRegistry`]: builder-side collection of the distinct values seen
//!   per generation; the bridge between LPM walks and table compaction.

use std::ptr::NonNull;

use ahash::RandomState;
use hashbrown::HashSet;

use crate::error::{Error, Result};
use crate::mem::context::MemCtx;
use crate::relptr::RelPtr;

/// Invalid value sentinel shared by the remapping pipeline and the trees.
pub const VALUE_NIL: u32 = u32::MAX;

/// Grid cells per value-table chunk.
const GRID_CHUNK: usize = 16384;

#[repr(C)]
struct RemapItem {
    /// As a key: the value bound in generation `gen`. As a freed value: the
    /// next entry of the free list.
    value: u32,
    /// References held by grid cells (or direct touch callers).
    count: u32,
    gen: u32,
}

const _: () = assert!(std::mem::size_of::<RemapItem>() == 12);

#[repr(C)]
pub struct RemapTable {
    capacity: u32,
    gen: u32,
    cursor: u32,
    free: u32,
    compacted_count: u32,
    _pad: u32,
    memctx: RelPtr<MemCtx>,
    items: RelPtr<RemapItem>,
    compacted: RelPtr<u32>,
}

impl RemapTable {
    /// Initialise in place (for embedding); see [`RemapTable::create`].
    pub fn init(&mut self, ctx: *mut MemCtx, capacity: u32) -> Result<()> {
        if capacity == 0 || capacity == VALUE_NIL {
            return Err(Error::InvalidArgument);
        }
        let ctx_ref = unsafe { &*ctx };
        let items =
            ctx_ref.balloc(capacity as usize * std::mem::size_of::<RemapItem>()) as *mut RemapItem;
        if items.is_null() {
            return Err(Error::OutOfMemory);
        }
        let compacted = ctx_ref.balloc(capacity as usize * 4) as *mut u32;
        if compacted.is_null() {
            unsafe {
                ctx_ref.bfree(
                    items as *mut u8,
                    capacity as usize * std::mem::size_of::<RemapItem>(),
                )
            };
            return Err(Error::OutOfMemory);
        }
        for i in 0..capacity as usize {
            unsafe {
                *items.add(i) = RemapItem {
                    value: VALUE_NIL,
                    count: 0,
                    gen: 0,
                };
                *compacted.add(i) = VALUE_NIL;
            }
        }
        self.capacity = capacity;
        self.gen = 0;
        self.cursor = 0;
        self.free = VALUE_NIL;
        self.compacted_count = 0;
        self._pad = 0;
        self.memctx.set(ctx);
        self.items.set(items);
        self.compacted.set(compacted);
        Ok(())
    }

    pub fn create(ctx: *mut MemCtx, capacity: u32) -> Result<NonNull<RemapTable>> {
        let ctx_ref = unsafe { &*ctx };
        let raw = ctx_ref.balloc(std::mem::size_of::<RemapTable>()) as *mut RemapTable;
        let mut table = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
        if let Err(e) = unsafe { table.as_mut().init(ctx, capacity) } {
            unsafe { ctx_ref.bfree(raw as *mut u8, std::mem::size_of::<RemapTable>()) };
            return Err(e);
        }
        Ok(table)
    }

    /// Release in-place-initialised state. Idempotent with respect to null
    /// fields.
    pub fn deinit(&mut self) {
        let ctx = self.memctx.get();
        if ctx.is_null() {
            return;
        }
        unsafe {
            if !self.items.is_null() {
                (*ctx).bfree(
                    self.items.get() as *mut u8,
                    self.capacity as usize * std::mem::size_of::<RemapItem>(),
                );
                self.items.set_null();
            }
            if !self.compacted.is_null() {
                (*ctx).bfree(self.compacted.get() as *mut u8, self.capacity as usize * 4);
                self.compacted.set_null();
            }
        }
    }

    /// # Safety
    /// `table` must come from [`RemapTable::create`] and not be used after.
    pub unsafe fn destroy(mut table: NonNull<RemapTable>) {
        let ctx = table.as_ref().memctx.get();
        table.as_mut().deinit();
        (*ctx).bfree(table.as_ptr() as *mut u8, std::mem::size_of::<RemapTable>());
    }

    /// Open the next generation.
    pub fn new_gen(&mut self) {
        self.gen += 1;
    }

    pub fn generation(&self) -> u32 {
        self.gen
    }

    /// Re-bind `key` (an old value) to its current-generation value, moving
    /// one reference count from `key` to the result. Stable within a
    /// generation.
    pub fn touch(&mut self, key: u32) -> Result<u32> {
        if key >= self.capacity {
            return Err(Error::InvalidArgument);
        }
        debug_assert!(self.gen > 0, "touch before new_gen");
        let gen = self.gen;
        if self.items()[key as usize].gen != gen {
            let fresh = self.alloc_value()?;
            let items = self.items_mut();
            items[key as usize].value = fresh;
            items[key as usize].gen = gen;
        }
        let items = self.items_mut();
        let value = items[key as usize].value;
        debug_assert!(items[key as usize].count > 0, "touch without a held reference");
        items[value as usize].count += 1;
        items[key as usize].count -= 1;
        let drained = items[key as usize].count == 0;
        if drained {
            self.free_value(key);
        }
        Ok(value)
    }

    /// Register an additional holder of `value`.
    pub fn acquire(&mut self, value: u32) -> Result<()> {
        if value >= self.capacity {
            return Err(Error::InvalidArgument);
        }
        self.items_mut()[value as usize].count += 1;
        Ok(())
    }

    /// Mint a fresh value with one reference and no key binding; used for
    /// grid cells that never held a value.
    pub fn bind_fresh(&mut self) -> Result<u32> {
        debug_assert!(self.gen > 0, "bind before new_gen");
        let value = self.alloc_value()?;
        self.items_mut()[value as usize].count += 1;
        Ok(value)
    }

    pub fn count_of(&self, value: u32) -> u32 {
        self.items()[value as usize].count
    }

    /// Assign dense indices to every value with a positive count.
    pub fn compact(&mut self) {
        let mut next = 0u32;
        for i in 0..self.capacity as usize {
            let out = unsafe { &mut *self.compacted.get().add(i) };
            if self.items()[i].count > 0 {
                *out = next;
                next += 1;
            } else {
                *out = VALUE_NIL;
            }
        }
        self.compacted_count = next;
    }

    /// Dense index assigned by the last [`RemapTable::compact`].
    pub fn compacted(&self, value: u32) -> u32 {
        if value >= self.capacity {
            return VALUE_NIL;
        }
        unsafe { *self.compacted.get().add(value as usize) }
    }

    pub fn compacted_count(&self) -> u32 {
        self.compacted_count
    }

    fn alloc_value(&mut self) -> Result<u32> {
        if self.free != VALUE_NIL {
            let value = self.free;
            self.free = self.items()[value as usize].value;
            return Ok(value);
        }
        if self.cursor == self.capacity {
            return Err(Error::Exhausted);
        }
        let value = self.cursor;
        self.cursor += 1;
        Ok(value)
    }

    fn free_value(&mut self, value: u32) {
        // Nothing references `value` any more, so its binding word is free
        // to carry the list link.
        let free = self.free;
        let items = self.items_mut();
        items[value as usize].value = free;
        items[value as usize].gen = 0;
        self.free = value;
    }

    fn items(&self) -> &[RemapItem] {
        unsafe { std::slice::from_raw_parts(self.items.get(), self.capacity as usize) }
    }

    fn items_mut(&mut self) -> &mut [RemapItem] {
        unsafe { std::slice::from_raw_parts_mut(self.items.get(), self.capacity as usize) }
    }
}

/// Rectangular (h, v) grid of values composed with a remap table.
#[repr(C)]
pub struct ValueTable {
    h_dim: u32,
    v_dim: u32,
    chunk_count: u32,
    _pad: u32,
    memctx: RelPtr<MemCtx>,
    chunks: RelPtr<RelPtr<u32>>,
    remap: RemapTable,
}

impl ValueTable {
    pub fn create(ctx: *mut MemCtx, h_dim: u32, v_dim: u32) -> Result<NonNull<ValueTable>> {
        let total = (h_dim as u64) * (v_dim as u64);
        if h_dim == 0 || v_dim == 0 || total >= VALUE_NIL as u64 {
            return Err(Error::InvalidArgument);
        }
        let ctx_ref = unsafe { &*ctx };
        let raw = ctx_ref.balloc(std::mem::size_of::<ValueTable>()) as *mut ValueTable;
        let mut table = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
        let t = unsafe { table.as_mut() };
        t.h_dim = h_dim;
        t.v_dim = v_dim;
        t.chunk_count = 0;
        t._pad = 0;
        t.memctx.set(ctx);
        t.chunks.set_null();
        t.remap.items.set_null();
        t.remap.compacted.set_null();
        t.remap.memctx.set_null();

        let result = (|| -> Result<()> {
            let chunk_count = ((total as usize) + GRID_CHUNK - 1) / GRID_CHUNK;
            let chunks = ctx_ref.balloc(chunk_count * 8) as *mut RelPtr<u32>;
            if chunks.is_null() {
                return Err(Error::OutOfMemory);
            }
            for i in 0..chunk_count {
                unsafe { (*chunks.add(i)).set_null() };
            }
            t.chunks.set(chunks);
            for i in 0..chunk_count {
                let cells = Self::chunk_cells(total as usize, i);
                let chunk = ctx_ref.balloc(cells * 4) as *mut u32;
                if chunk.is_null() {
                    return Err(Error::OutOfMemory);
                }
                for c in 0..cells {
                    unsafe { *chunk.add(c) = VALUE_NIL };
                }
                unsafe { (*chunks.add(i)).set(chunk) };
                t.chunk_count += 1;
            }
            t.remap.init(ctx, total as u32)
        })();

        if let Err(e) = result {
            unsafe { ValueTable::destroy(table) };
            return Err(e);
        }
        Ok(table)
    }

    /// # Safety
    /// `table` must come from [`ValueTable::create`] and not be used after.
    pub unsafe fn destroy(mut table: NonNull<ValueTable>) {
        let t = table.as_mut();
        let ctx = t.memctx.get();
        let total = (t.h_dim as usize) * (t.v_dim as usize);
        if !t.chunks.is_null() {
            let chunks = t.chunks.get();
            for i in 0..t.chunk_count as usize {
                let chunk = (*chunks.add(i)).get();
                if !chunk.is_null() {
                    (*ctx).bfree(chunk as *mut u8, Self::chunk_cells(total, i) * 4);
                }
            }
            let chunk_count = (total + GRID_CHUNK - 1) / GRID_CHUNK;
            (*ctx).bfree(chunks as *mut u8, chunk_count * 8);
            t.chunks.set_null();
        }
        t.remap.deinit();
        (*ctx).bfree(table.as_ptr() as *mut u8, std::mem::size_of::<ValueTable>());
    }

    pub fn new_gen(&mut self) {
        self.remap.new_gen();
    }

    /// Current-generation value for coordinate (h, v), minting one for
    /// never-used cells.
    pub fn touch(&mut self, h: u32, v: u32) -> Result<u32> {
        let cell = self.cell_ptr(h, v)?;
        let old = unsafe { *cell };
        let value = if old == VALUE_NIL {
            self.remap.bind_fresh()?
        } else {
            self.remap.touch(old)?
        };
        unsafe { *cell = value };
        Ok(value)
    }

    pub fn get(&self, h: u32, v: u32) -> u32 {
        match self.cell_ptr_const(h, v) {
            Some(cell) => unsafe { *cell },
            None => VALUE_NIL,
        }
    }

    /// Compact the remap table, then rewrite every grid cell through the
    /// dense mapping. Cells holding dead values become the invalid sentinel.
    pub fn compact(&mut self) {
        self.remap.compact();
        let total = (self.h_dim as usize) * (self.v_dim as usize);
        for i in 0..self.chunk_count as usize {
            let chunk = unsafe { (*self.chunks.get().add(i)).get() };
            for c in 0..Self::chunk_cells(total, i) {
                let cell = unsafe { &mut *chunk.add(c) };
                if *cell != VALUE_NIL {
                    *cell = self.remap.compacted(*cell);
                }
            }
        }
    }

    pub fn remap_table(&mut self) -> &mut RemapTable {
        &mut self.remap
    }

    pub fn compacted_count(&self) -> u32 {
        self.remap.compacted_count()
    }

    fn chunk_cells(total: usize, chunk: usize) -> usize {
        (total - chunk * GRID_CHUNK).min(GRID_CHUNK)
    }

    fn cell_ptr(&mut self, h: u32, v: u32) -> Result<*mut u32> {
        if h >= self.h_dim || v >= self.v_dim {
            return Err(Error::InvalidArgument);
        }
        let idx = h as usize * self.v_dim as usize + v as usize;
        let chunk = unsafe { (*self.chunks.get().add(idx / GRID_CHUNK)).get() };
        Ok(unsafe { chunk.add(idx % GRID_CHUNK) })
    }

    fn cell_ptr_const(&self, h: u32, v: u32) -> Option<*const u32> {
        if h >= self.h_dim || v >= self.v_dim {
            return None;
        }
        let idx = h as usize * self.v_dim as usize + v as usize;
        let chunk = unsafe { (*self.chunks.get().add(idx / GRID_CHUNK)).get() };
        Some(unsafe { chunk.add(idx % GRID_CHUNK) as *const u32 })
    }
}

/// Builder-side, per-generation collection of distinct values.
pub struct ValueRegistry {
    gens: Vec<GenValues>,
}

struct GenValues {
    values: Vec<u32>,
    seen: HashSet<u32, RandomState>,
}

impl ValueRegistry {
    pub fn new() -> Self {
        ValueRegistry { gens: Vec::new() }
    }

    pub fn new_gen(&mut self) {
        self.gens.push(GenValues {
            values: Vec::new(),
            seen: HashSet::with_hasher(RandomState::new()),
        });
    }

    /// Record `value` in the current generation; duplicates are dropped.
    pub fn collect(&mut self, value: u32) {
        debug_assert!(!self.gens.is_empty(), "collect before new_gen");
        let Some(gen) = self.gens.last_mut() else {
            return;
        };
        if gen.seen.insert(value) {
            gen.values.push(value);
        }
    }

    pub fn gen_count(&self) -> usize {
        self.gens.len()
    }

    /// Distinct values of generation `gen`, in first-seen order.
    pub fn values(&self, gen: usize) -> &[u32] {
        &self.gens[gen].values
    }
}

impl Default for ValueRegistry {
    fn default() -> Self {
        Self::new()
    }
}
