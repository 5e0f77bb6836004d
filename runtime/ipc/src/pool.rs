//! Buffer pool - fixed-size buffers carved out of shared memory
//!
//! One pool covers one direction of the link. Each buffer's owner-state tag
//! lives in its ring descriptor so both processors see the same state:
//!
//! ```text
//! Free -> Reserved -> InFlight -> Free
//!           |            |
//!           v            v
//!          Free     DeliveredHeld -> Free
//! ```
//!
//! The tag word packs the state (low 8 bits) with a 24-bit generation that
//! advances on every `Free -> Reserved`. A [`BufferId`] names one issue of
//! a buffer, so a stale id can never act on a later reservation.
//!
//! Generations run `1..=GEN_MAX` and wrap back to 1. Ids are compared by
//! their distance behind the slot's current generation: up to half the
//! range behind counts as a stale issue, anything else as never issued.
//!
//! Every transition is a single compare-exchange on the tag word; there is
//! no lock on the data path.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{BUFFER_HEADER_SIZE, RING_ENTRY_SIZE};
use crate::error::{IpcError, Result};
use crate::layout::{Direction, ShmLayout};
use crate::shm::ShmRegion;

const STATE_MASK: u32 = 0xff;
const GEN_SHIFT: u32 = 8;
const GEN_MAX: u32 = (1 << 24) - 1;

/// Descriptor word offsets within one ring entry
const DESC_STATE: usize = 0;
const DESC_SEQ: usize = 4;

/// Owner-state tag of one buffer
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the pool
    Free = 0,
    /// Owned by the caller, not yet sent
    Reserved = 1,
    /// Enqueued, owned by the transport
    InFlight = 2,
    /// Received and kept past the callback by the application
    DeliveredHeld = 3,
}

impl BufferState {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(BufferState::Free),
            1 => Some(BufferState::Reserved),
            2 => Some(BufferState::InFlight),
            3 => Some(BufferState::DeliveredHeld),
            _ => None,
        }
    }
}

/// One issue of a pool buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub index: u16,
    pub generation: u32,
}

fn pack(state: BufferState, generation: u32) -> u32 {
    (generation << GEN_SHIFT) | state as u32
}

fn unpack(word: u32) -> (Option<BufferState>, u32) {
    (BufferState::from_bits(word & STATE_MASK), word >> GEN_SHIFT)
}

fn next_generation(generation: u32) -> u32 {
    if generation >= GEN_MAX {
        1
    } else {
        generation + 1
    }
}

/// Issues between `issued` and `current`, counting across the wrap
fn generation_age(current: u32, issued: u32) -> u32 {
    if current >= issued {
        current - issued
    } else {
        GEN_MAX - issued + current
    }
}

fn atomic_slice(len: usize) -> Box<[AtomicU32]> {
    (0..len).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice()
}

/// Buffers and descriptors for one direction
///
/// Shared state lives in the region. The per-slot bookkeeping below is
/// private to this side: the producer side records owners and drops, the
/// consumer side records releases.
pub struct BufferPool {
    shm: Arc<ShmRegion>,
    dir: Direction,
    area: usize,
    ring: usize,
    slots: usize,
    element_size: usize,
    /// Endpoint address holding each reservation
    owners: Box<[AtomicU32]>,
    /// Last generation dropped from each slot
    dropped: Box<[AtomicU32]>,
    /// Last generation released from each slot
    released: Box<[AtomicU32]>,
}

impl BufferPool {
    pub fn new(shm: Arc<ShmRegion>, layout: &ShmLayout, dir: Direction) -> Self {
        Self {
            shm,
            dir,
            area: layout.area(dir),
            ring: layout.ring(dir),
            slots: layout.slots,
            element_size: layout.element_size,
            owners: atomic_slice(layout.slots),
            dropped: atomic_slice(layout.slots),
            released: atomic_slice(layout.slots),
        }
    }

    /// Reset every descriptor to Free, generation 0
    ///
    /// Only the host calls this, before it sets `DRIVER_OK`.
    pub fn init(&self) {
        self.shm.zero(self.area, self.slots * self.element_size);
        self.shm.zero(self.ring, self.slots * RING_ENTRY_SIZE);
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn max_payload(&self) -> usize {
        self.element_size - BUFFER_HEADER_SIZE
    }

    fn tag(&self, index: usize) -> &AtomicU32 {
        self.shm.atomic_u32(self.ring + index * RING_ENTRY_SIZE + DESC_STATE)
    }

    fn seq_word(&self, index: usize) -> &AtomicU32 {
        self.shm.atomic_u32(self.ring + index * RING_ENTRY_SIZE + DESC_SEQ)
    }

    /// Current state of buffer `index`
    pub fn state(&self, index: usize) -> Option<BufferState> {
        if index >= self.slots {
            return None;
        }
        unpack(self.tag(index).load(Ordering::Acquire)).0
    }

    /// Id of the current issue of buffer `index`
    pub fn current_id(&self, index: usize) -> Option<BufferId> {
        if index >= self.slots {
            return None;
        }
        let (_, generation) = unpack(self.tag(index).load(Ordering::Acquire));
        Some(BufferId {
            index: index as u16,
            generation,
        })
    }

    /// Number of buffers currently Free
    pub fn free_count(&self) -> usize {
        (0..self.slots)
            .filter(|i| self.state(*i) == Some(BufferState::Free))
            .count()
    }

    /// Load the tag for `id`, rejecting ids this pool never issued
    fn load(&self, id: BufferId) -> Result<(BufferState, u32)> {
        let index = id.index as usize;
        if index >= self.slots {
            return Err(IpcError::NotFromPool);
        }
        let (state, generation) = unpack(self.tag(index).load(Ordering::Acquire));
        let state = state.ok_or(IpcError::HardwareFault)?;
        // Generation 0 is never issued; anything ahead of the slot was
        // fabricated.
        if id.generation == 0
            || id.generation > GEN_MAX
            || generation == 0
            || generation_age(generation, id.generation) > GEN_MAX / 2
        {
            return Err(IpcError::NotFromPool);
        }
        Ok((state, generation))
    }

    fn transition(&self, id: BufferId, from: BufferState, to: BufferState) -> bool {
        self.tag(id.index as usize)
            .compare_exchange(
                pack(from, id.generation),
                pack(to, id.generation),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Take a Free buffer for `owner` (`Free -> Reserved`)
    ///
    /// # Errors
    /// `NoBuffers` if every buffer is reserved, in flight or held
    pub fn reserve(&self, owner: u32) -> Result<BufferId> {
        for index in 0..self.slots {
            let tag = self.tag(index);
            let word = tag.load(Ordering::Acquire);
            let (state, generation) = unpack(word);
            if state != Some(BufferState::Free) {
                continue;
            }
            let generation = next_generation(generation);
            if tag
                .compare_exchange(
                    word,
                    pack(BufferState::Reserved, generation),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.owners[index].store(owner, Ordering::Release);
                return Ok(BufferId {
                    index: index as u16,
                    generation,
                });
            }
        }
        Err(IpcError::NoBuffers)
    }

    /// Return an unsent buffer to the pool (`Reserved -> Free`)
    ///
    /// # Errors
    /// - `NotFromPool` if the id was never issued
    /// - `AlreadyDropped` if this issue was dropped before
    /// - `InvalidConfig` if the buffer is not reserved by `owner`
    pub fn drop_reserved(&self, id: BufferId, owner: u32) -> Result<()> {
        let (state, generation) = self.load(id)?;
        let index = id.index as usize;
        let dropped = self.dropped[index].load(Ordering::Acquire) == id.generation;

        if generation != id.generation {
            return Err(if dropped {
                IpcError::AlreadyDropped
            } else {
                IpcError::InvalidConfig
            });
        }
        match state {
            BufferState::Reserved => {
                if self.owners[index].load(Ordering::Acquire) != owner {
                    return Err(IpcError::InvalidConfig);
                }
                if !self.transition(id, BufferState::Reserved, BufferState::Free) {
                    return Err(IpcError::InvalidConfig);
                }
                self.dropped[index].store(id.generation, Ordering::Release);
                Ok(())
            }
            BufferState::Free if dropped => Err(IpcError::AlreadyDropped),
            _ => Err(IpcError::InvalidConfig),
        }
    }

    /// Check that `id` is the live reservation of `owner`
    pub fn check_reserved(&self, id: BufferId, owner: u32) -> Result<()> {
        let (state, generation) = self.load(id).map_err(|_| IpcError::InvalidConfig)?;
        if generation != id.generation
            || state != BufferState::Reserved
            || self.owners[id.index as usize].load(Ordering::Acquire) != owner
        {
            return Err(IpcError::InvalidConfig);
        }
        Ok(())
    }

    /// Hand a reserved buffer to the transport (`Reserved -> InFlight`)
    ///
    /// `seq` is stored in the descriptor before the state is published, so a
    /// consumer that observes InFlight also observes the sequence number.
    ///
    /// # Errors
    /// `InvalidConfig` if the buffer is not the live reservation of `owner`
    pub fn mark_in_flight(&self, id: BufferId, owner: u32, seq: u32) -> Result<()> {
        self.check_reserved(id, owner)?;
        self.seq_word(id.index as usize).store(seq, Ordering::Relaxed);
        if !self.transition(id, BufferState::Reserved, BufferState::InFlight) {
            return Err(IpcError::InvalidConfig);
        }
        Ok(())
    }

    /// Sequence number stamped by the last `mark_in_flight`
    pub(crate) fn seq(&self, index: usize) -> u32 {
        self.seq_word(index).load(Ordering::Relaxed)
    }

    /// Recycle a consumed buffer (`InFlight -> Free`)
    ///
    /// Returns `false` without changing anything when the buffer was held.
    pub fn complete(&self, id: BufferId) -> Result<bool> {
        let (state, generation) = self.load(id)?;
        if generation != id.generation {
            return Err(IpcError::InvalidConfig);
        }
        match state {
            BufferState::InFlight => {
                if self.transition(id, BufferState::InFlight, BufferState::Free) {
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            BufferState::DeliveredHeld => Ok(false),
            _ => Err(IpcError::InvalidConfig),
        }
    }

    /// Keep a received buffer past its callback (`InFlight -> DeliveredHeld`)
    ///
    /// # Errors
    /// - `AlreadyHeld` if the buffer is already held
    /// - `InvalidConfig` if the buffer is not being delivered
    pub fn hold(&self, id: BufferId) -> Result<()> {
        let (state, generation) = self.load(id).map_err(|_| IpcError::InvalidConfig)?;
        if generation != id.generation {
            return Err(IpcError::InvalidConfig);
        }
        match state {
            BufferState::InFlight => {
                if self.transition(id, BufferState::InFlight, BufferState::DeliveredHeld) {
                    Ok(())
                } else {
                    Err(IpcError::InvalidConfig)
                }
            }
            BufferState::DeliveredHeld => Err(IpcError::AlreadyHeld),
            _ => Err(IpcError::InvalidConfig),
        }
    }

    /// Return a held buffer to the pool (`DeliveredHeld -> Free`)
    ///
    /// # Errors
    /// - `AlreadyReleased` if this issue was released before
    /// - `NotHeld` if the buffer was never held
    pub fn release(&self, id: BufferId) -> Result<()> {
        let (state, generation) = self.load(id).map_err(|_| IpcError::NotHeld)?;
        let index = id.index as usize;
        let released = self.released[index].load(Ordering::Acquire) == id.generation;

        if generation != id.generation {
            return Err(if released {
                IpcError::AlreadyReleased
            } else {
                IpcError::NotHeld
            });
        }
        match state {
            BufferState::DeliveredHeld => {
                if !self.transition(id, BufferState::DeliveredHeld, BufferState::Free) {
                    return Err(IpcError::NotHeld);
                }
                self.released[index].store(id.generation, Ordering::Release);
                Ok(())
            }
            BufferState::Free if released => Err(IpcError::AlreadyReleased),
            _ => Err(IpcError::NotHeld),
        }
    }

    pub(crate) fn shm(&self) -> &ShmRegion {
        &self.shm
    }

    pub(crate) fn element_offset(&self, index: usize) -> usize {
        self.area + index * self.element_size
    }

    /// Payload bytes of buffer `index`
    ///
    /// # Safety
    /// The caller must own the buffer and `len` must not exceed `max_payload`.
    pub(crate) unsafe fn payload(&self, index: usize, len: usize) -> &[u8] {
        self.shm.bytes(self.element_offset(index) + BUFFER_HEADER_SIZE, len)
    }

    /// # Safety
    /// The caller must hold the reservation and `len` must not exceed
    /// `max_payload`.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self, index: usize, len: usize) -> &mut [u8] {
        self.shm
            .bytes_mut(self.element_offset(index) + BUFFER_HEADER_SIZE, len)
    }

    /// Whether `[ptr, ptr + len)` overlaps this pool's buffer area
    pub fn overlaps(&self, ptr: *const u8, len: usize) -> bool {
        let start = self.shm.base() + self.area;
        let end = start + self.slots * self.element_size;
        let addr = ptr as usize;
        addr < end && addr + len.max(1) > start
    }
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("dir", &self.dir)
            .field("slots", &self.slots)
            .field("free", &self.free_count())
            .finish()
    }
}
