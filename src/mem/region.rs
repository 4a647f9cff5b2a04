//! Arena region management using mmap.
//!
//! Creates or opens a named memory-mapped file holding one arena: a fixed
//! header with the root relative pointer, the block allocator, and the
//! allocator-managed remainder. Because everything below the header is
//! addressed through relative pointers, the file can be copied bytewise and
//! mapped anywhere.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::Result as CoreResult;
use crate::mem::alloc::BlockAllocator;
use crate::mem::context::MemCtx;
use crate::relptr::RelPtr;
use std::ptr::NonNull;

/// Magic bytes validating a mapping.
pub const REGION_MAGIC: [u8; 8] = *b"SHMCORE1";

/// Size of the fixed header at the start of the region.
pub const REGION_HEADER_SIZE: usize = 64;

const REGION_VERSION: u32 = 1;

/// Smallest region worth creating: header + allocator + one 4 KiB block.
pub const REGION_MIN_SIZE: usize = 8192;

/// Header at offset 0 of the mapping. Fields are fixed-size and explicitly
/// padded so the layout is identical across compilations and processes.
#[repr(C)]
pub struct RegionHeader {
    pub magic: [u8; 8],     // 0..8
    pub version: u32,       // 8..12
    pub _pad: u32,          // 12..16
    pub size: u64,          // 16..24
    pub root: RelPtr<u8>,   // 24..32
    pub _reserved: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == REGION_HEADER_SIZE);

/// Where to store the mmap files.
fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("shmcore")
    }
}

fn allocator_offset() -> usize {
    REGION_HEADER_SIZE
}

fn arena_offset() -> usize {
    let end = REGION_HEADER_SIZE + std::mem::size_of::<BlockAllocator>();
    (end + 7) & !7
}

/// An owned mapping of one arena file.
pub struct ArenaRegion {
    mmap: MmapMut,
    path: PathBuf,
    publish: Mutex<()>,
}

impl ArenaRegion {
    /// Create a new arena file of `size` bytes, initialising the header and
    /// feeding everything past the allocator into its pools.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        if size < REGION_MIN_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "arena region too small",
            ));
        }
        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = dir.join(format!("{name}.arena"));

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        // Safety: the file was just created and is exclusively ours here.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0);

        let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut RegionHeader) };
        header.magic = REGION_MAGIC;
        header.version = REGION_VERSION;
        header.size = size as u64;
        header.root.set_null();

        unsafe {
            let alloc = &mut *(mmap.as_mut_ptr().add(allocator_offset()) as *mut BlockAllocator);
            alloc.init();
            let arena = mmap.as_mut_ptr().add(arena_offset());
            alloc.put_arena(arena, size - arena_offset());
        }

        mmap.flush()?;
        Ok(ArenaRegion {
            mmap,
            path,
            publish: Mutex::new(()),
        })
    }

    /// Open an existing arena file, validating the header.
    pub fn open(name: &str) -> io::Result<Self> {
        Self::open_path(&shm_dir().join(format!("{name}.arena")))
    }

    pub fn open_path(path: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < REGION_MIN_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "arena file truncated",
            ));
        }
        let header = unsafe { &*(mmap.as_ptr() as *const RegionHeader) };
        if header.magic != REGION_MAGIC || header.version != REGION_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid arena file: bad magic",
            ));
        }
        if header.size != mmap.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid arena file: size mismatch",
            ));
        }
        Ok(ArenaRegion {
            mmap,
            path: path.to_path_buf(),
            publish: Mutex::new(()),
        })
    }

    /// Open when the file already exists with a valid header, otherwise
    /// (re)create it.
    pub fn create_or_open(name: &str, size: usize) -> io::Result<Self> {
        let path = shm_dir().join(format!("{name}.arena"));
        if path.exists() {
            match Self::open_path(&path) {
                Ok(region) if region.mmap.len() == size => return Ok(region),
                // Wrong size or corrupted: recreate below.
                _ => {}
            }
        }
        Self::create(name, size)
    }

    pub fn header(&self) -> &RegionHeader {
        unsafe { &*(self.mmap.as_ptr() as *const RegionHeader) }
    }

    pub fn allocator(&self) -> *mut BlockAllocator {
        unsafe { self.mmap.as_ptr().add(allocator_offset()) as *mut BlockAllocator }
    }

    /// Allocate a named memory context inside this arena.
    pub fn memctx(&self, name: &str) -> CoreResult<NonNull<MemCtx>> {
        MemCtx::create(self.allocator(), name)
    }

    /// Current snapshot root, with acquire ordering.
    pub fn root(&self) -> *mut u8 {
        self.header().root.load_acquire()
    }

    /// Publish a new snapshot root. Publishers serialise on a process-local
    /// mutex; readers see the swap atomically through the release store.
    pub fn publish_root(&self, root: *mut u8) {
        let _guard = self.publish.lock();
        self.header().root.store_release(root);
    }

    /// Copy the region bytewise to `path`. The copy is a valid arena file:
    /// relative pointers make it directly mappable.
    pub fn snapshot_to(&self, path: &Path) -> io::Result<()> {
        fs::write(path, &self.mmap[..])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the backing file.
    pub fn unlink(&self) -> io::Result<()> {
        let _ = fs::remove_file(&self.path);
        Ok(())
    }
}

// All mutation below the header goes through the arena's own locks; the
// publish mutex guards the root slot.
unsafe impl Send for ArenaRegion {}
unsafe impl Sync for ArenaRegion {}

/// Coarse monotonic clock in seconds, for callers that feed deadlines.
pub fn monotonic_now() -> u32 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        ts.tv_sec as u32
    }

    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static BASE: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let base = BASE.get_or_init(Instant::now);
        base.elapsed().as_secs() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("shmcore-test-{}-{tag}", std::process::id())
    }

    #[test]
    fn create_open_roundtrip() {
        let name = unique_name("roundtrip");
        let region = ArenaRegion::create(&name, 1 << 20).unwrap();
        let ctx = region.memctx("root").unwrap();
        let block = unsafe { ctx.as_ref().balloc(128) };
        assert!(!block.is_null());
        region.publish_root(block);
        drop(region);

        let reopened = ArenaRegion::open(&name).unwrap();
        assert!(!reopened.root().is_null());
        reopened.unlink().unwrap();
    }

    #[test]
    fn open_rejects_bad_magic() {
        let name = unique_name("badmagic");
        let region = ArenaRegion::create(&name, 1 << 20).unwrap();
        let path = region.path().to_path_buf();
        drop(region);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        assert!(ArenaRegion::open_path(&path).is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn create_rejects_tiny_regions() {
        assert!(ArenaRegion::create(&unique_name("tiny"), 128).is_err());
    }

    #[test]
    fn monotonic_now_does_not_go_backwards() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }
}
