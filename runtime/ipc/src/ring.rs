//! Ring transport - FIFO of buffer indices for one direction
//!
//! # Architecture
//! The vring has no head/tail words in shared memory. Each descriptor
//! carries a sequence number; the producer stamps the next number and then
//! publishes `Reserved -> InFlight` with release ordering, and the consumer
//! takes the in-flight descriptor whose number it expects next. Both
//! counters are private to their side, so the only shared writes are the
//! descriptor words themselves.
//!
//! # Lock-Free Guarantees
//! - Single producer side, single consumer side
//! - Producer publishes with one compare-exchange per frame
//! - Consumer never blocks the producer

use crate::config::BUFFER_HEADER_SIZE;
use crate::error::{IpcError, Result};
use crate::pool::{BufferId, BufferPool, BufferState};

/// Header at the start of every buffer element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Sending endpoint address
    pub src: u32,
    /// Receiving endpoint address
    pub dst: u32,
    /// Payload length
    pub len: u16,
    pub flags: u16,
}

impl MessageHeader {
    pub fn new(src: u32, dst: u32, len: u16) -> Self {
        Self {
            src,
            dst,
            len,
            flags: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; BUFFER_HEADER_SIZE] {
        let mut raw = [0u8; BUFFER_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.src.to_le_bytes());
        raw[4..8].copy_from_slice(&self.dst.to_le_bytes());
        // 8..12 reserved
        raw[12..14].copy_from_slice(&self.len.to_le_bytes());
        raw[14..16].copy_from_slice(&self.flags.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8; BUFFER_HEADER_SIZE]) -> Self {
        Self {
            src: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            dst: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            len: u16::from_le_bytes([raw[12], raw[13]]),
            flags: u16::from_le_bytes([raw[14], raw[15]]),
        }
    }
}

/// One dequeued ring entry: (buffer, length, endpoint tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    pub id: BufferId,
    pub header: MessageHeader,
}

/// FIFO of pool buffers for one direction
pub trait RingTransport {
    /// Take a free buffer for `owner`
    fn try_acquire(&self, owner: u32) -> Result<BufferId>;

    /// Publish a reserved buffer; `header.src` must own the reservation
    fn enqueue(&self, id: BufferId, header: MessageHeader) -> Result<()>;

    /// Next entry in send order, if any
    fn dequeue(&self) -> Option<RingEntry>;

    /// Entries published but not yet dequeued
    fn pending(&self) -> usize;
}

/// Vring over one direction of a shared region
pub struct StaticVring {
    pool: BufferPool,
    /// Next sequence number to stamp (producer side)
    next_tx: spin::Mutex<u32>,
    /// Next sequence number to take (consumer side)
    next_rx: spin::Mutex<u32>,
}

impl StaticVring {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            next_tx: spin::Mutex::new(0),
            next_rx: spin::Mutex::new(0),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn producer(&self) -> Producer<'_> {
        Producer::new(self)
    }

    pub fn consumer(&self) -> Consumer<'_> {
        Consumer::new(self)
    }

    fn write_header(&self, index: usize, header: &MessageHeader) {
        let offset = self.pool.element_offset(index);
        // SAFETY: the caller holds the reservation for `index`
        let raw = unsafe { self.pool.shm().bytes_mut(offset, BUFFER_HEADER_SIZE) };
        raw.copy_from_slice(&header.to_bytes());
    }

    fn read_header(&self, index: usize) -> MessageHeader {
        let offset = self.pool.element_offset(index);
        let mut raw = [0u8; BUFFER_HEADER_SIZE];
        // SAFETY: the buffer is in flight to this side and no longer written
        raw.copy_from_slice(unsafe { self.pool.shm().bytes(offset, BUFFER_HEADER_SIZE) });
        MessageHeader::from_bytes(&raw)
    }
}

impl RingTransport for StaticVring {
    fn try_acquire(&self, owner: u32) -> Result<BufferId> {
        self.pool.reserve(owner)
    }

    fn enqueue(&self, id: BufferId, header: MessageHeader) -> Result<()> {
        if header.len as usize > self.pool.max_payload() {
            return Err(IpcError::BadMessage);
        }
        self.pool.check_reserved(id, header.src)?;
        self.write_header(id.index as usize, &header);

        // Stamping and publishing happen together so sequence numbers are
        // published without gaps.
        let mut next = self.next_tx.lock();
        self.pool.mark_in_flight(id, header.src, *next)?;
        *next = next.wrapping_add(1);
        Ok(())
    }

    fn dequeue(&self) -> Option<RingEntry> {
        let mut expected = self.next_rx.lock();
        for index in 0..self.pool.slots() {
            if self.pool.state(index) != Some(BufferState::InFlight) {
                continue;
            }
            if self.pool.seq(index) != *expected {
                continue;
            }
            let id = self.pool.current_id(index)?;
            let header = self.read_header(index);
            *expected = expected.wrapping_add(1);
            return Some(RingEntry { id, header });
        }
        None
    }

    fn pending(&self) -> usize {
        let expected = *self.next_rx.lock();
        let slots = self.pool.slots() as u32;
        (0..self.pool.slots())
            .filter(|i| self.pool.state(*i) == Some(BufferState::InFlight))
            .filter(|i| self.pool.seq(*i).wrapping_sub(expected) < slots)
            .count()
    }
}

/// Producer handle for a vring
///
/// Only allows the transmit side operations.
pub struct Producer<'a> {
    ring: &'a StaticVring,
}

impl<'a> Producer<'a> {
    pub fn new(ring: &'a StaticVring) -> Self {
        Self { ring }
    }

    pub fn try_acquire(&self, owner: u32) -> Result<BufferId> {
        self.ring.try_acquire(owner)
    }

    pub fn enqueue(&self, id: BufferId, header: MessageHeader) -> Result<()> {
        self.ring.enqueue(id, header)
    }

    /// Return an unsent buffer
    pub fn cancel(&self, id: BufferId, owner: u32) -> Result<()> {
        self.ring.pool.drop_reserved(id, owner)
    }

    /// # Safety
    /// `id` must be a live reservation held by the caller.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self, id: BufferId, len: usize) -> &'a mut [u8] {
        self.ring.pool.payload_mut(id.index as usize, len)
    }

    pub fn free_count(&self) -> usize {
        self.ring.pool.free_count()
    }
}

/// Consumer handle for a vring
///
/// Only allows the receive side operations.
pub struct Consumer<'a> {
    ring: &'a StaticVring,
}

impl<'a> Consumer<'a> {
    pub fn new(ring: &'a StaticVring) -> Self {
        Self { ring }
    }

    pub fn dequeue(&self) -> Option<RingEntry> {
        self.ring.dequeue()
    }

    pub fn pending(&self) -> usize {
        self.ring.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Recycle a delivered buffer unless it was held
    pub fn complete(&self, id: BufferId) -> Result<bool> {
        self.ring.pool.complete(id)
    }

    pub fn hold(&self, id: BufferId) -> Result<()> {
        self.ring.pool.hold(id)
    }

    pub fn release(&self, id: BufferId) -> Result<()> {
        self.ring.pool.release(id)
    }

    /// # Safety
    /// The entry must be delivered to (or held by) this side.
    pub(crate) unsafe fn payload(&self, id: BufferId, len: usize) -> &'a [u8] {
        self.ring.pool.payload(id.index as usize, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ELEMENT_SIZE;
    use crate::layout::{Direction, ShmLayout};
    use crate::shm::ShmRegion;
    use alloc::sync::Arc;

    /// Producer and consumer views of one direction of one region
    fn pair(slots: usize) -> (StaticVring, StaticVring) {
        let size = ShmLayout::required_size(slots, ELEMENT_SIZE);
        let shm = ShmRegion::allocate(size).unwrap();
        let layout = ShmLayout::compute(shm.base(), size, slots, ELEMENT_SIZE).unwrap();
        let tx = BufferPool::new(Arc::clone(&shm), &layout, Direction::HostToRemote);
        tx.init();
        let rx = BufferPool::new(shm, &layout, Direction::HostToRemote);
        (StaticVring::new(tx), StaticVring::new(rx))
    }

    fn send(ring: &StaticVring, owner: u32, bytes: &[u8]) -> BufferId {
        let p = ring.producer();
        let id = p.try_acquire(owner).unwrap();
        unsafe { p.payload_mut(id, bytes.len()) }.copy_from_slice(bytes);
        p.enqueue(id, MessageHeader::new(owner, 2000, bytes.len() as u16))
            .unwrap();
        id
    }

    #[test]
    fn test_header_layout() {
        let h = MessageHeader {
            src: 0x0400,
            dst: 0x0401,
            len: 496,
            flags: 3,
        };
        let raw = h.to_bytes();
        assert_eq!(&raw[0..4], &[0x00, 0x04, 0, 0]);
        assert_eq!(&raw[8..12], &[0, 0, 0, 0]);
        assert_eq!(&raw[12..14], &496u16.to_le_bytes());
        assert_eq!(MessageHeader::from_bytes(&raw), h);
    }

    #[test]
    fn test_fifo_across_out_of_order_slots() {
        let (tx, rx) = pair(4);

        let a = send(&tx, 1, b"a");
        send(&tx, 1, b"b");
        let c = rx.consumer();
        assert_eq!(c.pending(), 2);
        assert_eq!(c.dequeue().unwrap().id, a);
        assert!(c.complete(a).unwrap());

        // "c" reuses slot 0, below "b" in slot 1
        let third = send(&tx, 1, b"c");
        assert_eq!(third.index, 0);
        send(&tx, 1, b"d");

        let mut seen = alloc::vec::Vec::new();
        while let Some(entry) = c.dequeue() {
            let payload = unsafe { c.payload(entry.id, entry.header.len as usize) };
            seen.push(payload[0]);
            c.complete(entry.id).unwrap();
        }
        assert_eq!(seen, b"bcd");
        assert!(c.is_empty());
    }

    #[test]
    fn test_enqueue_rejects_foreign_buffer() {
        let (tx, rx) = pair(2);
        let p = tx.producer();
        let id = p.try_acquire(1).unwrap();

        let err = p.enqueue(id, MessageHeader::new(2, 0, 4)).unwrap_err();
        assert_eq!(err, IpcError::InvalidConfig);

        let forged = BufferId { index: 1, generation: 1 };
        let err = p.enqueue(forged, MessageHeader::new(1, 0, 4)).unwrap_err();
        assert_eq!(err, IpcError::InvalidConfig);
        assert!(rx.consumer().dequeue().is_none());
    }

    #[test]
    fn test_enqueue_rejects_oversized_len() {
        let (tx, _rx) = pair(1);
        let p = tx.producer();
        let id = p.try_acquire(1).unwrap();
        let err = p.enqueue(id, MessageHeader::new(1, 0, 497)).unwrap_err();
        assert_eq!(err, IpcError::BadMessage);
        p.cancel(id, 1).unwrap();
        assert_eq!(p.free_count(), 1);
    }
}
