//! Self-relative pointer slots.
//!
//! Every pointer persisted inside an arena is stored as the offset from the
//! slot's own address to the target, with 0 meaning null. A structure built
//! this way stays valid when the whole arena is mapped at a different base
//! address, which is what makes bytewise snapshots of a region directly
//! mappable.
//!
//! A `RelPtr` is only meaningful at the address it was written at. It is
//! deliberately neither `Clone` nor `Copy`; moving one by value would change
//! what it resolves to. Use [`RelPtr::copy_from`] to make one slot resolve to
//! the same target as another.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};

/// A pointer slot encoding `target as offset from &self`, 0 = null.
#[repr(C)]
pub struct RelPtr<T> {
    off: i64,
    _marker: PhantomData<*mut T>,
}

const _: () = assert!(std::mem::size_of::<RelPtr<u64>>() == 8);

impl<T> RelPtr<T> {
    /// Resolve the slot to an absolute pointer.
    #[inline]
    pub fn get(&self) -> *mut T {
        let off = self.off;
        if off == 0 {
            return ptr::null_mut();
        }
        ((self as *const Self as isize).wrapping_add(off as isize)) as *mut T
    }

    /// Point the slot at `target` (or null).
    #[inline]
    pub fn set(&mut self, target: *mut T) {
        self.off = Self::encode(self as *mut Self, target);
    }

    /// Make `self` resolve to the same target as `src`.
    #[inline]
    pub fn copy_from(&mut self, src: &RelPtr<T>) {
        self.set(src.get());
    }

    #[inline]
    pub fn set_null(&mut self) {
        self.off = 0;
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.off == 0
    }

    /// Resolve with acquire ordering. Pairs with [`RelPtr::store_release`]
    /// on slots used to publish structures to concurrent readers.
    #[inline]
    pub fn load_acquire(&self) -> *mut T {
        let slot = self as *const Self as *const AtomicI64;
        // The slot is 8 bytes and 8-byte aligned, so the atomic view is sound.
        let off = unsafe { (*slot).load(Ordering::Acquire) };
        if off == 0 {
            return ptr::null_mut();
        }
        ((self as *const Self as isize).wrapping_add(off as isize)) as *mut T
    }

    /// Publish `target` with release ordering through a shared reference.
    #[inline]
    pub fn store_release(&self, target: *mut T) {
        let off = Self::encode(self as *const Self as *mut Self, target);
        let slot = self as *const Self as *const AtomicI64;
        unsafe { (*slot).store(off, Ordering::Release) };
    }

    #[inline]
    fn encode(slot: *mut Self, target: *mut T) -> i64 {
        if target.is_null() {
            0
        } else {
            (target as isize).wrapping_sub(slot as isize) as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Node {
        next: RelPtr<Node>,
        value: u64,
    }

    #[test]
    fn null_roundtrip() {
        let mut slot: RelPtr<u64> = unsafe { std::mem::zeroed() };
        assert!(slot.is_null());
        assert!(slot.get().is_null());
        slot.set(ptr::null_mut());
        assert!(slot.is_null());
    }

    #[test]
    fn points_within_buffer() {
        let mut buf = vec![0u8; 4096];
        let base = buf.as_mut_ptr();
        let slot = base as *mut RelPtr<u64>;
        let target = unsafe { base.add(128) } as *mut u64;
        unsafe {
            (*slot).set(target);
            (*target) = 0xDEAD_BEEF;
            assert_eq!((*slot).get(), target);
            assert_eq!(*(*slot).get(), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn survives_relocation() {
        // Build a two-node chain inside a buffer, memcpy the buffer, and
        // verify the copy resolves to its own nodes.
        let mut buf = vec![0u8; 256];
        let base = buf.as_mut_ptr();
        unsafe {
            let a = base as *mut Node;
            let b = base.add(64) as *mut Node;
            (*a).value = 1;
            (*b).value = 2;
            (*a).next.set(b);
            (*b).next.set_null();

            let mut copy = vec![0u8; 256];
            ptr::copy_nonoverlapping(base, copy.as_mut_ptr(), 256);
            let ca = copy.as_mut_ptr() as *mut Node;
            let cb = (*ca).next.get();
            assert_eq!(cb as usize, copy.as_ptr() as usize + 64);
            assert_eq!((*cb).value, 2);
            assert!((*cb).next.is_null());
        }
    }

    #[test]
    fn copy_from_aliases_target() {
        let mut buf = vec![0u8; 256];
        let base = buf.as_mut_ptr();
        unsafe {
            let s1 = base as *mut RelPtr<u64>;
            let s2 = base.add(16) as *mut RelPtr<u64>;
            let target = base.add(200) as *mut u64;
            (*s1).set(target);
            (*s2).copy_from(&*s1);
            assert_eq!((*s1).get(), (*s2).get());
        }
    }

    #[test]
    fn release_store_roundtrip() {
        let mut buf = vec![0u8; 64];
        let base = buf.as_mut_ptr();
        unsafe {
            let slot = base as *mut RelPtr<u64>;
            let target = base.add(32) as *mut u64;
            (*slot).store_release(target);
            assert_eq!((*slot).load_acquire(), target);
            (*slot).store_release(ptr::null_mut());
            assert!((*slot).load_acquire().is_null());
        }
    }
}
