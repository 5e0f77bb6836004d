//! Typed buffer guards
//!
//! A [`TxBuffer`] is a reservation the caller fills in place. Sending or
//! dropping it consumes the guard, so touching a buffer after it was sent
//! does not compile. A [`HeldRxBuffer`] is a received buffer kept past its
//! callback; letting either guard go out of scope returns the buffer to
//! the pool.

use alloc::sync::Arc;
use core::fmt;
use core::ops::{Deref, DerefMut};

use thiserror::Error;

use crate::endpoint::EndpointShared;
use crate::error::{IpcError, Result};
use crate::instance::Instance;
use crate::pool::BufferId;

/// Reserved tx buffer
pub struct TxBuffer {
    instance: Arc<Instance>,
    endpoint: Arc<EndpointShared>,
    id: BufferId,
    capacity: usize,
    armed: bool,
}

impl TxBuffer {
    pub(crate) fn new(
        instance: Arc<Instance>,
        endpoint: Arc<EndpointShared>,
        id: BufferId,
        capacity: usize,
    ) -> Self {
        Self {
            instance,
            endpoint,
            id,
            capacity,
            armed: true,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Payload bytes available
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Address of the endpoint holding the reservation
    pub fn owner(&self) -> u32 {
        self.endpoint.addr
    }

    pub(crate) fn belongs_to(&self, instance: &Instance, endpoint: &EndpointShared) -> bool {
        core::ptr::eq(Arc::as_ptr(&self.instance), instance)
            && core::ptr::eq(Arc::as_ptr(&self.endpoint), endpoint)
    }

    /// The buffer now belongs to the transport or the pool
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Deref for TxBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the reservation is live while the guard is armed
        unsafe {
            self.instance
                .tx_ring()
                .pool()
                .payload(self.id.index as usize, self.capacity)
        }
    }
}

impl DerefMut for TxBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: the reservation is live and this guard is its only handle
        unsafe {
            self.instance
                .tx_ring()
                .pool()
                .payload_mut(self.id.index as usize, self.capacity)
        }
    }
}

impl Drop for TxBuffer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.instance.tx_ring().pool().drop_reserved(self.id, self.endpoint.addr) {
            log::warn!("{}: tx buffer {} not returned: {}", self.endpoint.name, self.id.index, err);
        }
        self.endpoint.release_reservation();
    }
}

impl fmt::Debug for TxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxBuffer")
            .field("id", &self.id)
            .field("owner", &format_args!("{:#x}", self.endpoint.addr))
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Failed zero-copy send; the buffer is still reserved and comes back to
/// the caller to retry or drop
#[derive(Debug, Error)]
#[error("zero-copy send failed: {kind}")]
pub struct NoCopyError {
    pub kind: IpcError,
    pub buffer: TxBuffer,
}

impl NoCopyError {
    pub fn into_parts(self) -> (IpcError, TxBuffer) {
        (self.kind, self.buffer)
    }
}

/// Rejected drop; the buffer is still reserved by its owner
#[derive(Debug, Error)]
#[error("tx buffer not dropped: {kind}")]
pub struct DropError {
    pub kind: IpcError,
    pub buffer: TxBuffer,
}

impl DropError {
    pub fn into_parts(self) -> (IpcError, TxBuffer) {
        (self.kind, self.buffer)
    }
}

/// Frame handed to [`EndpointHandler::received`](crate::EndpointHandler::received)
pub struct RxFrame<'a> {
    instance: &'a Arc<Instance>,
    id: BufferId,
    src: u32,
    dst: u32,
    data: &'a [u8],
}

impl<'a> RxFrame<'a> {
    pub(crate) fn new(
        instance: &'a Arc<Instance>,
        id: BufferId,
        src: u32,
        dst: u32,
        data: &'a [u8],
    ) -> Self {
        Self {
            instance,
            id,
            src,
            dst,
            data,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Sending endpoint address
    pub fn src(&self) -> u32 {
        self.src
    }

    /// Receiving endpoint address
    pub fn dst(&self) -> u32 {
        self.dst
    }

    pub fn instance(&self) -> &'a Arc<Instance> {
        self.instance
    }

    /// Keep the buffer after the callback returns
    ///
    /// # Errors
    /// `AlreadyHeld` if this frame was held before
    pub fn hold(&self) -> Result<HeldRxBuffer> {
        self.instance.rx_ring().consumer().hold(self.id)?;
        Ok(HeldRxBuffer {
            instance: Arc::clone(self.instance),
            id: self.id,
            src: self.src,
            dst: self.dst,
            len: self.data.len(),
            armed: true,
        })
    }

    /// Send `data` back to the frame's sender from the receiving endpoint
    pub fn reply(&self, data: &[u8]) -> Result<()> {
        self.instance.reply(self.dst, self.src, data)
    }
}

impl Deref for RxFrame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl fmt::Debug for RxFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxFrame")
            .field("id", &self.id)
            .field("src", &format_args!("{:#x}", self.src))
            .field("dst", &format_args!("{:#x}", self.dst))
            .field("len", &self.data.len())
            .finish()
    }
}

/// Received buffer kept past its callback
pub struct HeldRxBuffer {
    instance: Arc<Instance>,
    id: BufferId,
    src: u32,
    dst: u32,
    len: usize,
    armed: bool,
}

impl HeldRxBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn src(&self) -> u32 {
        self.src
    }

    pub fn dst(&self) -> u32 {
        self.dst
    }

    pub(crate) fn belongs_to(&self, instance: &Instance, addr: u32) -> bool {
        core::ptr::eq(Arc::as_ptr(&self.instance), instance) && self.dst == addr
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

/// Rejected release; the buffer is still held
#[derive(Debug, Error)]
#[error("rx buffer not released: {kind}")]
pub struct ReleaseError {
    pub kind: IpcError,
    pub held: HeldRxBuffer,
}

impl ReleaseError {
    pub fn into_parts(self) -> (IpcError, HeldRxBuffer) {
        (self.kind, self.held)
    }
}

impl Deref for HeldRxBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the buffer stays DeliveredHeld until this guard releases it
        unsafe {
            self.instance
                .rx_ring()
                .consumer()
                .payload(self.id, self.len)
        }
    }
}

impl Drop for HeldRxBuffer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.instance.rx_ring().consumer().release(self.id) {
            log::warn!("rx buffer {} not released: {}", self.id.index, err);
        }
    }
}

impl fmt::Debug for HeldRxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldRxBuffer")
            .field("id", &self.id)
            .field("src", &format_args!("{:#x}", self.src))
            .field("len", &self.len)
            .finish()
    }
}
