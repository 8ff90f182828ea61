//! Raw buffer abstraction: either truly shared (POSIX shared memory via a
//! named file under `/dev/shm`) or process-local (plain heap allocation),
//! exposing endian-explicit load/store and atomic 32-bit operations.
//!
//! A region's backing allocation is reserved at its full capacity on
//! construction and never moves for the region's lifetime — "growth" only
//! ever advances a logical-length marker within that fixed allocation.
//! This keeps every pointer handed out by a region stable for as long as
//! any view holds it, which is what lets the lock words embedded in the
//! index region (see `lock.rs`) be addressed directly without a second
//! layer of indirection. When a request would need to grow past the
//! reservation, the region reports [`crate::error::StoreError::CapacityExhausted`]
//! rather than relocating.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::{StoreError, StoreResult};

#[cfg(unix)]
mod shared {
    use std::fs;
    use std::io;
    use std::path::PathBuf;

    use memmap2::MmapMut;

    fn shm_dir() -> PathBuf {
        if cfg!(target_os = "linux") {
            PathBuf::from("/dev/shm")
        } else {
            std::env::temp_dir().join("shareable-store")
        }
    }

    pub fn create(name: &str, cap: usize) -> io::Result<MmapMut> {
        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = dir.join(name);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(cap as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(mmap)
    }
}

/// Backing allocation for a [`Region`].
enum Backing {
    Local(Box<[u8]>),
    #[cfg(unix)]
    Shared(memmap2::MmapMut),
}

impl Backing {
    fn ptr(&self) -> *mut u8 {
        match self {
            Backing::Local(b) => b.as_ptr() as *mut u8,
            #[cfg(unix)]
            Backing::Shared(m) => m.as_ptr() as *mut u8,
        }
    }
}

/// One flat, byte-addressable region (the "I" or "D" buffer of `spec.md`).
///
/// `cap` bytes are allocated and zeroed up front; `len` tracks how much of
/// that allocation is presently in logical use. Reads/writes past `len`
/// are a programmer bug (the core never issues them) but are not bounds
/// checked beyond `cap`, matching the "corrupt offsets are a fatal bug,
/// not silently repaired" stance in `spec.md` §7.
pub struct Region {
    backing: Backing,
    cap: usize,
    len: AtomicUsize,
    shared: bool,
}

// SAFETY: all mutation of the backing bytes is coordinated by the
// `RwLock` encoded inside the index region (see `lock.rs`); `Region`
// itself only hands out raw pointers and atomic views.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocate a process-local region of `cap` bytes, `len` of them
    /// initially logical.
    pub fn new_local(len: usize, cap: usize) -> StoreResult<Self> {
        if len > cap {
            return Err(StoreError::CapacityExhausted {
                requested: len,
                reserved: cap,
            });
        }
        let buf = vec![0u8; cap].into_boxed_slice();
        Ok(Region {
            backing: Backing::Local(buf),
            cap,
            len: AtomicUsize::new(len),
            shared: false,
        })
    }

    /// Build a process-local region from existing bytes, reserving `cap`
    /// bytes of capacity (which may exceed `bytes.len()` to regain growth
    /// headroom after a handoff round-trip).
    pub fn from_bytes(bytes: &[u8], cap: usize) -> StoreResult<Self> {
        let len = bytes.len();
        if len > cap {
            return Err(StoreError::CapacityExhausted {
                requested: len,
                reserved: cap,
            });
        }
        let region = Self::new_local(len, cap)?;
        region.copy_from_slice(0, bytes);
        Ok(region)
    }

    /// Allocate a truly shared region backed by a named file under
    /// `/dev/shm` (or a platform temp directory). Falls back to a
    /// process-local region if shared allocation is unavailable, per
    /// `spec.md` §4.1.
    pub fn new_shared(name: &str, len: usize, cap: usize) -> StoreResult<Self> {
        if len > cap {
            return Err(StoreError::CapacityExhausted {
                requested: len,
                reserved: cap,
            });
        }
        #[cfg(unix)]
        {
            match shared::create(name, cap) {
                Ok(mmap) => {
                    return Ok(Region {
                        backing: Backing::Shared(mmap),
                        cap,
                        len: AtomicUsize::new(len),
                        shared: true,
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, name, "shared region allocation failed, falling back to process-local");
                }
            }
        }
        Self::new_local(len, cap)
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Advance the logical length to `new_len`, zeroing the newly exposed
    /// bytes. Errors if `new_len` exceeds the fixed reservation.
    pub fn grow_to(&self, new_len: usize) -> StoreResult<()> {
        if new_len > self.cap {
            return Err(StoreError::CapacityExhausted {
                requested: new_len,
                reserved: self.cap,
            });
        }
        let old_len = self.len.load(Ordering::Acquire);
        if new_len > old_len {
            unsafe {
                std::ptr::write_bytes(self.as_mut_ptr().add(old_len), 0, new_len - old_len);
            }
        }
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }

    /// Shrink the logical length (used when rebuilding a smaller index
    /// region in place is unnecessary — current users only grow).
    pub fn set_len(&self, new_len: usize) {
        debug_assert!(new_len <= self.cap);
        self.len.store(new_len, Ordering::Release);
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.backing.ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.backing.ptr()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Copy `self`'s logical bytes into a fresh, owned buffer — used to
    /// build a `TransferableState` snapshot.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    // -- endian-explicit scalar accessors (big-endian, per spec.md §3.1) --

    #[inline]
    pub fn load_u8(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.len());
        unsafe { *self.as_ptr().add(offset) }
    }

    #[inline]
    pub fn store_u8(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.len());
        unsafe { *self.as_mut_ptr().add(offset) = value };
    }

    #[inline]
    pub fn load_u16(&self, offset: usize) -> u16 {
        debug_assert!(offset + 2 <= self.len());
        let mut bytes = [0u8; 2];
        unsafe { std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), bytes.as_mut_ptr(), 2) };
        u16::from_be_bytes(bytes)
    }

    #[inline]
    pub fn store_u16(&self, offset: usize, value: u16) {
        debug_assert!(offset + 2 <= self.len());
        let bytes = value.to_be_bytes();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_mut_ptr().add(offset), 2) };
    }

    #[inline]
    pub fn load_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.cap);
        let mut bytes = [0u8; 4];
        unsafe { std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), bytes.as_mut_ptr(), 4) };
        u32::from_be_bytes(bytes)
    }

    #[inline]
    pub fn store_u32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.cap);
        let bytes = value.to_be_bytes();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_mut_ptr().add(offset), 4) };
    }

    #[inline]
    pub fn load_i32(&self, offset: usize) -> i32 {
        self.load_u32(offset) as i32
    }

    #[inline]
    pub fn store_i32(&self, offset: usize, value: i32) {
        self.store_u32(offset, value as u32);
    }

    #[inline]
    pub fn load_u64(&self, offset: usize) -> u64 {
        debug_assert!(offset + 8 <= self.cap);
        let mut bytes = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), bytes.as_mut_ptr(), 8) };
        u64::from_be_bytes(bytes)
    }

    #[inline]
    pub fn store_u64(&self, offset: usize, value: u64) {
        debug_assert!(offset + 8 <= self.cap);
        let bytes = value.to_be_bytes();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_mut_ptr().add(offset), 8) };
    }

    #[inline]
    pub fn load_f64(&self, offset: usize) -> f64 {
        f64::from_bits(self.load_u64(offset))
    }

    #[inline]
    pub fn store_f64(&self, offset: usize, value: f64) {
        self.store_u64(offset, value.to_bits());
    }

    pub fn copy_within(&self, src: usize, dst: usize, count: usize) {
        if count == 0 {
            return;
        }
        unsafe {
            std::ptr::copy(
                self.as_ptr().add(src),
                self.as_mut_ptr().add(dst),
                count,
            );
        }
    }

    pub fn copy_from_slice(&self, dst_offset: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.as_mut_ptr().add(dst_offset),
                data.len(),
            );
        }
    }

    pub fn read_slice(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(offset), len) }
    }

    pub fn zero_range(&self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        unsafe { std::ptr::write_bytes(self.as_mut_ptr().add(offset), 0, len) };
    }

    // -- atomic word access, used only on the lock words (spec.md §4.1) --

    #[inline]
    fn atomic_u32_at(&self, offset: usize) -> &AtomicU32 {
        debug_assert_eq!(offset % 4, 0, "atomic offsets must be 4-byte aligned");
        unsafe { &*(self.as_mut_ptr().add(offset) as *const AtomicU32) }
    }

    #[inline]
    pub fn atomic_load_u32(&self, offset: usize, order: Ordering) -> u32 {
        self.atomic_u32_at(offset).load(order)
    }

    #[inline]
    pub fn atomic_store_u32(&self, offset: usize, value: u32, order: Ordering) {
        self.atomic_u32_at(offset).store(value, order)
    }

    #[inline]
    pub fn atomic_add_u32(&self, offset: usize, value: u32, order: Ordering) -> u32 {
        self.atomic_u32_at(offset).fetch_add(value, order)
    }

    #[inline]
    pub fn atomic_sub_u32(&self, offset: usize, value: u32, order: Ordering) -> u32 {
        self.atomic_u32_at(offset).fetch_sub(value, order)
    }

    #[inline]
    pub fn atomic_compare_exchange_u32(
        &self,
        offset: usize,
        current: u32,
        new: u32,
    ) -> Result<u32, u32> {
        self.atomic_u32_at(offset).compare_exchange(
            current,
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
    }

    pub(crate) fn atomic_ref_u32(&self, offset: usize) -> &AtomicU32 {
        self.atomic_u32_at(offset)
    }
}
