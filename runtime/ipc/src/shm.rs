//! Shared memory region backing one instance
//!
//! On hardware the region is a fixed carve-out both processors map at the
//! same physical address. On a host it is a heap block with the same
//! alignment guarantees, so the rest of the crate cannot tell the difference.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::config::{Role, MEM_ALIGNMENT};
use crate::error::{IpcError, Result};

bitflags! {
    /// Bits of the status word at offset 0 of the region
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        /// Host finished initializing buffers and rings
        const DRIVER_OK = 1 << 0;
        /// Host kicked the remote (polling mode)
        const KICK_TO_REMOTE = 1 << 1;
        /// Remote kicked the host (polling mode)
        const KICK_TO_HOST = 1 << 2;
    }
}

impl StatusFlags {
    /// Kick bit that wakes `role`
    pub fn kick_for(role: Role) -> StatusFlags {
        match role {
            Role::Host => StatusFlags::KICK_TO_HOST,
            Role::Remote => StatusFlags::KICK_TO_REMOTE,
        }
    }
}

#[repr(C, align(16))]
struct Block([u8; MEM_ALIGNMENT]);

/// Shared memory region
pub struct ShmRegion {
    base: NonNull<u8>,
    size: usize,
    /// Heap backing when allocated on the host; `None` for a raw carve-out
    _backing: Option<Box<[UnsafeCell<Block>]>>,
}

// SAFETY: all access to the region goes through atomics or through buffers
// whose single owner is enforced by the descriptor state machine.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Allocate a zeroed, 16-byte aligned region
    pub fn allocate(size: usize) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(IpcError::InvalidConfig);
        }
        let blocks = size.div_ceil(MEM_ALIGNMENT);
        let backing: Box<[UnsafeCell<Block>]> = (0..blocks)
            .map(|_| UnsafeCell::new(Block([0; MEM_ALIGNMENT])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let base = NonNull::new(backing.as_ptr() as *mut u8).ok_or(IpcError::NoSpace)?;

        Ok(Arc::new(Self {
            base,
            size,
            _backing: Some(backing),
        }))
    }

    /// Wrap an existing shared memory carve-out
    ///
    /// # Safety
    /// `base..base + size` must be valid, mapped read-write for the lifetime
    /// of the region, and used by nothing but the two IPC peers.
    pub unsafe fn from_raw_parts(base: *mut u8, size: usize) -> Result<Self> {
        let base = NonNull::new(base).ok_or(IpcError::InvalidConfig)?;
        if size == 0 {
            return Err(IpcError::InvalidConfig);
        }
        Ok(Self {
            base,
            size,
            _backing: None,
        })
    }

    /// Address of the first byte
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `ptr` points into the region
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.base() && addr < self.base() + self.size
    }

    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.size);
        // SAFETY: offset is within the region (checked by the layout)
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// 32-bit atomic word at `offset`
    pub(crate) fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.size);
        // SAFETY: aligned, in bounds, and the region outlives the reference
        unsafe { &*(self.ptr_at(offset) as *const AtomicU32) }
    }

    /// # Safety
    /// The caller must own the bytes (no concurrent writer).
    pub(crate) unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.size);
        core::slice::from_raw_parts(self.ptr_at(offset), len)
    }

    /// # Safety
    /// The caller must exclusively own the bytes.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.size);
        core::slice::from_raw_parts_mut(self.ptr_at(offset), len)
    }

    /// Zero `len` bytes at `offset`
    pub(crate) fn zero(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.size);
        // SAFETY: in bounds; only called by the host before the link is up
        unsafe { core::ptr::write_bytes(self.ptr_at(offset), 0, len) }
    }

    /// Status word at offset 0
    pub fn status(&self) -> StatusFlags {
        StatusFlags::from_bits_truncate(self.atomic_u32(0).load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, flags: StatusFlags) {
        self.atomic_u32(0).fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flags`, returning whether any of them were set
    pub(crate) fn take_status(&self, flags: StatusFlags) -> bool {
        let old = self.atomic_u32(0).fetch_and(!flags.bits(), Ordering::AcqRel);
        old & flags.bits() != 0
    }
}

impl core::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size)
            .finish()
    }
}
