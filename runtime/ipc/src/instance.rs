//! Instance - one shared memory link and everything multiplexed over it
//!
//! # Architecture
//! An instance owns both vrings of its region (one per direction), the
//! endpoint table and the notifier. The host zeroes the region and sets
//! `DRIVER_OK`; the remote attaches to whatever the host laid out.
//!
//! Binding follows the rpmsg name service: the remote announces each
//! endpoint to [`NS_ADDR`], the host matches the announcement against its
//! own endpoints (caching it until a matching registration arrives) and
//! answers with a zero-length frame that binds the remote side. The host
//! endpoint binds only once that frame is queued; without a free buffer the
//! acknowledgement is retried on the next receive pass or registration.
//!
//! # Locking
//! The endpoint table sits behind a spin lock held only while slots are
//! looked up or changed. Handler callbacks always run after it is
//! released.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::buffer::{DropError, HeldRxBuffer, NoCopyError, ReleaseError, RxFrame, TxBuffer};
use crate::config::{
    Delay, EndpointConfig, InstanceConfig, Role, TxWait, UserKick, EPT_ADDR_BASE, NS_ADDR,
    NUM_ENDPOINTS,
};
use crate::endpoint::{Endpoint, EndpointHandler, EndpointShared};
use crate::error::{IpcError, Result};
use crate::layout::{Direction, ShmLayout};
use crate::mailbox::{MailboxNotifier, NotifierBackend, StatusWordNotifier};
use crate::ns::{NsMessage, NS_DESTROY};
use crate::pool::BufferPool;
use crate::registry::ErrorSink;
use crate::ring::{MessageHeader, RingEntry, StaticVring};
use crate::shm::{ShmRegion, StatusFlags};

/// Instance lifecycle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Not opened
    Ready = 0,
    /// Open in progress
    Busy = 1,
    /// Region and rings initialized
    Inited = 2,
}

impl InstanceState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => InstanceState::Busy,
            2 => InstanceState::Inited,
            _ => InstanceState::Ready,
        }
    }
}

/// Outcome of one [`Instance::receive`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    /// Frames handed to a `received` callback
    pub delivered: usize,
    /// Name service and bind frames
    pub control: usize,
    /// Frames that could not be routed or were malformed
    pub dropped: usize,
}

enum EndpointSlot {
    Empty,
    /// Name announced by the peer before a local endpoint of that name exists
    Announced { name: String, dest: u32 },
    Registered(Arc<EndpointShared>),
}

/// One shared memory link
pub struct Instance {
    name: String,
    role: Role,
    index: usize,
    shm: Arc<ShmRegion>,
    layout: ShmLayout,
    tx: StaticVring,
    rx: StaticVring,
    notifier: Arc<dyn NotifierBackend>,
    mbox_data_send: u32,
    mbox_data_rcv: u32,
    user_kick: Option<UserKick>,
    delay: Arc<dyn Delay>,
    state: AtomicU8,
    /// Set while a receive pass runs
    receiving: AtomicBool,
    endpoints: spin::Mutex<Vec<EndpointSlot>>,
    sink: Arc<ErrorSink>,
}

impl Instance {
    /// Lay out the region, pick the notifier and (host) initialize the rings
    ///
    /// # Errors
    /// - `InvalidConfig` for an empty name, bad geometry or a region too
    ///   small for the layout
    pub(crate) fn open(config: InstanceConfig, index: usize, sink: Arc<ErrorSink>) -> Result<Arc<Self>> {
        if config.name.is_empty() {
            return Err(IpcError::InvalidConfig);
        }
        let shm = config.shm;
        let layout = ShmLayout::compute(shm.base(), shm.size(), config.slots, config.element_size)?;

        let notifier: Arc<dyn NotifierBackend> = match (config.notifier, config.mailbox) {
            (Some(notifier), _) => notifier,
            (None, Some(mailbox)) => Arc::new(MailboxNotifier::new(mailbox)),
            (None, None) => Arc::new(StatusWordNotifier::new(Arc::clone(&shm), config.role)),
        };

        let role = config.role;
        let tx = BufferPool::new(Arc::clone(&shm), &layout, Direction::outbound(role));
        let rx = BufferPool::new(Arc::clone(&shm), &layout, Direction::inbound(role));

        let instance = Arc::new(Self {
            name: config.name,
            role,
            index,
            shm,
            layout,
            tx: StaticVring::new(tx),
            rx: StaticVring::new(rx),
            notifier,
            mbox_data_send: config.mbox_data_send,
            mbox_data_rcv: config.mbox_data_rcv,
            user_kick: config.user_kick,
            delay: config.delay,
            state: AtomicU8::new(InstanceState::Ready as u8),
            receiving: AtomicBool::new(false),
            endpoints: spin::Mutex::new((0..NUM_ENDPOINTS).map(|_| EndpointSlot::Empty).collect()),
            sink,
        });

        instance
            .state
            .compare_exchange(
                InstanceState::Ready as u8,
                InstanceState::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| IpcError::AlreadyOpen)?;

        if role == Role::Host {
            instance.shm.zero(layout.status, layout.rx_area - layout.status);
            instance.tx.pool().init();
            instance.rx.pool().init();
            instance.shm.set_status(StatusFlags::DRIVER_OK);
        }

        instance
            .state
            .store(InstanceState::Inited as u8, Ordering::Release);

        log::debug!(
            "instance {} opened as {:?}: {} slots x {} bytes at {:#x}",
            instance.name,
            role,
            layout.slots,
            layout.element_size,
            instance.shm.base()
        );
        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Registry slot; also the instance's bit in the kick bitmap
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    pub fn shm(&self) -> &Arc<ShmRegion> {
        &self.shm
    }

    pub fn mbox_data_send(&self) -> u32 {
        self.mbox_data_send
    }

    pub fn mbox_data_rcv(&self) -> u32 {
        self.mbox_data_rcv
    }

    pub(crate) fn user_kick(&self) -> Option<&UserKick> {
        self.user_kick.as_ref()
    }

    /// Payload bytes per buffer
    pub fn max_payload(&self) -> usize {
        self.layout.max_payload()
    }

    /// Pool this side transmits from
    pub fn tx_pool(&self) -> &BufferPool {
        self.tx.pool()
    }

    /// Pool this side receives into
    pub fn rx_pool(&self) -> &BufferPool {
        self.rx.pool()
    }

    pub(crate) fn tx_ring(&self) -> &StaticVring {
        &self.tx
    }

    pub(crate) fn rx_ring(&self) -> &StaticVring {
        &self.rx
    }

    /// Whether the host has initialized the region
    pub fn link_up(&self) -> bool {
        self.role == Role::Host || self.shm.status().contains(StatusFlags::DRIVER_OK)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            InstanceState::Inited => Ok(()),
            InstanceState::Busy => Err(IpcError::Busy),
            InstanceState::Ready => Err(IpcError::NoBackend),
        }
    }

    /// Read and clear this side's kick bit in the status word
    pub fn poll_kick(&self) -> bool {
        self.shm.take_status(StatusFlags::kick_for(self.role))
    }

    /// Number of registered endpoints
    pub fn endpoint_count(&self) -> usize {
        self.endpoints
            .lock()
            .iter()
            .filter(|slot| matches!(slot, EndpointSlot::Registered(_)))
            .count()
    }

    fn lookup(&self, addr: u32) -> Option<Arc<EndpointShared>> {
        let slot = addr.checked_sub(EPT_ADDR_BASE)? as usize;
        match self.endpoints.lock().get(slot)? {
            EndpointSlot::Registered(ept) => Some(Arc::clone(ept)),
            _ => None,
        }
    }

    fn owned<'e>(&self, ept: &'e Endpoint) -> Result<&'e Arc<EndpointShared>> {
        if !ept.is_on(self) {
            return Err(IpcError::InvalidConfig);
        }
        Ok(ept.shared())
    }

    /// Register an endpoint
    ///
    /// On the remote the endpoint is announced to the host; on the host it
    /// binds at once if the remote announced the name already.
    ///
    /// # Errors
    /// - `InvalidConfig` for a bad or duplicate name
    /// - `NoBackend` if the instance was never opened
    /// - `Busy` while the instance is opening or the host has not finished
    ///   initializing the region
    /// - `NoSpace` if the endpoint table is full
    pub fn register_endpoint<H>(self: &Arc<Self>, cfg: EndpointConfig, handler: H) -> Result<Endpoint>
    where
        H: EndpointHandler + 'static,
    {
        cfg.validate()?;
        self.ensure_open()?;
        if !self.link_up() {
            return Err(IpcError::Busy);
        }

        let (slot, shared, announced) = {
            let mut table = self.endpoints.lock();
            let duplicate = table.iter().any(|s| match s {
                EndpointSlot::Registered(ept) => ept.name == cfg.name,
                _ => false,
            });
            if duplicate {
                return Err(IpcError::InvalidConfig);
            }

            let slot = table
                .iter()
                .position(|s| matches!(s, EndpointSlot::Announced { name, .. } if *name == cfg.name))
                .or_else(|| table.iter().position(|s| matches!(s, EndpointSlot::Empty)))
                .ok_or(IpcError::NoSpace)?;
            let announced = match &table[slot] {
                EndpointSlot::Announced { dest, .. } => Some(*dest),
                _ => None,
            };

            let addr = EPT_ADDR_BASE + slot as u32;
            let shared = Arc::new(EndpointShared::new(&cfg, addr, Box::new(handler)));
            table[slot] = EndpointSlot::Registered(Arc::clone(&shared));
            (slot, shared, announced)
        };

        log::debug!("{}: endpoint {} registered at {:#x}", self.name, shared.name, shared.addr);

        match self.role {
            Role::Host => {
                if let Some(dest) = announced {
                    self.bind(&shared, dest);
                }
                self.retry_bind_acks();
            }
            Role::Remote => {
                let announce = NsMessage::create(&shared.name, shared.addr)
                    .encode()
                    .and_then(|raw| self.transmit(shared.addr, NS_ADDR, &raw));
                if let Err(err) = announce {
                    self.endpoints.lock()[slot] = EndpointSlot::Empty;
                    return Err(err);
                }
                self.kick_peer(Some(&shared));
            }
        }

        Ok(Endpoint::new(Arc::downgrade(self), shared))
    }

    /// Copying send
    ///
    /// # Errors
    /// - `InvalidConfig` if the endpoint belongs elsewhere or `data` lies in
    ///   this instance's tx buffers (those go through `send_nocopy`)
    /// - `NotBound` before the bind handshake completed
    /// - `BadMessage` if `data` is empty or longer than `max_payload`
    /// - `Busy` if the host has not initialized the region
    /// - `NoBuffers` if the pool is exhausted
    pub fn send(&self, ept: &Endpoint, data: &[u8]) -> Result<()> {
        let shared = self.owned(ept)?;
        self.ensure_open()?;
        if self.tx.pool().overlaps(data.as_ptr(), data.len()) {
            return Err(IpcError::InvalidConfig);
        }
        if !shared.is_bound() {
            return Err(IpcError::NotBound);
        }
        if data.is_empty() || data.len() > self.max_payload() {
            return Err(IpcError::BadMessage);
        }
        if !self.link_up() {
            return Err(IpcError::Busy);
        }

        self.transmit(shared.addr, shared.dest(), data)?;
        log::trace!("{}: {} bytes {:#x} -> {:#x}", self.name, data.len(), shared.addr, shared.dest());
        self.kick_peer(Some(shared));
        Ok(())
    }

    /// Send from local endpoint `src` to `dest`, as a reply from a callback
    pub(crate) fn reply(&self, src: u32, dest: u32, data: &[u8]) -> Result<()> {
        let shared = self.lookup(src).ok_or(IpcError::InvalidConfig)?;
        if data.is_empty() || data.len() > self.max_payload() {
            return Err(IpcError::BadMessage);
        }
        self.transmit(src, dest, data)?;
        self.kick_peer(Some(&shared));
        Ok(())
    }

    pub fn get_tx_buffer_size(&self, ept: &Endpoint) -> Result<usize> {
        self.owned(ept)?;
        self.ensure_open()?;
        Ok(self.max_payload())
    }

    /// Reserve a tx buffer for in-place fill
    ///
    /// `size` 0 asks for the maximum. The returned buffer always spans the
    /// full payload capacity.
    ///
    /// # Errors
    /// - `TooLarge` if `size` exceeds the payload capacity, carrying the
    ///   capacity
    /// - `AlreadyReserved` if the endpoint holds its maximum of unsent
    ///   buffers
    /// - `NoBuffers` if no buffer freed up within `wait`
    /// - `NotBound` before the bind handshake completed
    pub fn get_tx_buffer(self: &Arc<Self>, ept: &Endpoint, size: usize, wait: TxWait) -> Result<TxBuffer> {
        let shared = self.owned(ept)?;
        self.ensure_open()?;
        if !shared.is_bound() {
            return Err(IpcError::NotBound);
        }
        let max = self.max_payload();
        if size > max {
            return Err(IpcError::TooLarge { max });
        }
        shared.try_reserve()?;

        let producer = self.tx.producer();
        let mut waited: u32 = 0;
        let id = loop {
            match producer.try_acquire(shared.addr) {
                Ok(id) => break id,
                Err(IpcError::NoBuffers) => {
                    let keep_waiting = match wait {
                        TxWait::NoWait => false,
                        TxWait::Millis(ms) => waited < ms,
                        TxWait::Forever => true,
                    };
                    if !keep_waiting {
                        shared.release_reservation();
                        return Err(IpcError::NoBuffers);
                    }
                    self.delay.delay_ms(1);
                    waited = waited.saturating_add(1);
                }
                Err(err) => {
                    shared.release_reservation();
                    return Err(err);
                }
            }
        };

        Ok(TxBuffer::new(Arc::clone(self), Arc::clone(shared), id, max))
    }

    /// Zero-copy send of the first `len` bytes of `buffer`
    ///
    /// On failure the buffer is still reserved and comes back inside the
    /// error.
    ///
    /// # Errors
    /// - `InvalidConfig` if the buffer was reserved on another endpoint or
    ///   instance
    /// - `BadMessage` if `len` is 0 or exceeds the buffer
    /// - `NotBound`, `Busy` as for [`send`](Self::send)
    pub fn send_nocopy(
        &self,
        ept: &Endpoint,
        buffer: TxBuffer,
        len: usize,
    ) -> core::result::Result<usize, NoCopyError> {
        let shared = match self.owned(ept) {
            Ok(shared) if buffer.belongs_to(self, shared) => shared,
            _ => {
                return Err(NoCopyError {
                    kind: IpcError::InvalidConfig,
                    buffer,
                })
            }
        };
        let ready = self.ensure_open().and_then(|()| {
            if !shared.is_bound() {
                Err(IpcError::NotBound)
            } else if len == 0 || len > buffer.capacity() {
                Err(IpcError::BadMessage)
            } else if !self.link_up() {
                Err(IpcError::Busy)
            } else {
                Ok(())
            }
        });
        if let Err(kind) = ready {
            return Err(NoCopyError { kind, buffer });
        }

        let header = MessageHeader::new(shared.addr, shared.dest(), len as u16);
        if let Err(kind) = self.tx.producer().enqueue(buffer.id(), header) {
            return Err(NoCopyError { kind, buffer });
        }
        buffer.disarm();
        shared.release_reservation();

        log::trace!("{}: {} bytes zero-copy {:#x} -> {:#x}", self.name, len, header.src, header.dst);
        self.kick_peer(Some(shared));
        Ok(len)
    }

    /// Return a reserved buffer without sending it
    ///
    /// On failure the buffer stays reserved and comes back inside the
    /// error.
    ///
    /// # Errors
    /// `InvalidConfig` if the buffer was reserved on another endpoint or
    /// instance
    pub fn drop_tx_buffer(&self, ept: &Endpoint, buffer: TxBuffer) -> core::result::Result<(), DropError> {
        let shared = match self.owned(ept) {
            Ok(shared) if buffer.belongs_to(self, shared) => shared,
            _ => {
                return Err(DropError {
                    kind: IpcError::InvalidConfig,
                    buffer,
                })
            }
        };
        if let Err(kind) = self.tx.producer().cancel(buffer.id(), shared.addr) {
            return Err(DropError { kind, buffer });
        }
        buffer.disarm();
        shared.release_reservation();
        Ok(())
    }

    /// Return a held rx buffer to the pool
    ///
    /// On failure the buffer stays held and comes back inside the error.
    ///
    /// # Errors
    /// `InvalidConfig` if the buffer was delivered to another endpoint
    pub fn release_rx_buffer(&self, ept: &Endpoint, held: HeldRxBuffer) -> core::result::Result<(), ReleaseError> {
        let shared = match self.owned(ept) {
            Ok(shared) if held.belongs_to(self, shared.addr) => shared,
            _ => {
                return Err(ReleaseError {
                    kind: IpcError::InvalidConfig,
                    held,
                })
            }
        };
        if let Err(kind) = self.rx.consumer().release(held.id()) {
            log::debug!("{}: release on {} failed: {}", self.name, shared.name, kind);
            return Err(ReleaseError { kind, held });
        }
        held.disarm();
        Ok(())
    }

    /// Dispatch every pending inbound frame
    ///
    /// Frames are delivered in arrival order. Unless a callback held its
    /// frame, the buffer is back in the pool when its callback returns.
    /// Bind acknowledgements that earlier found no free buffer are sent
    /// first.
    ///
    /// # Errors
    /// - `Busy`/`NoBackend` if the instance is not open
    /// - `Busy` if a receive pass on this instance is already running,
    ///   for instance when a callback calls `receive` itself
    pub fn receive(self: &Arc<Self>) -> Result<ReceiveSummary> {
        self.ensure_open()?;
        let Some(_pass) = ReceivePass::enter(&self.receiving) else {
            log::error!("{}: receive entered while a receive pass is running", self.name);
            return Err(IpcError::Busy);
        };
        self.retry_bind_acks();
        let mut summary = ReceiveSummary::default();
        let consumer = self.rx.consumer();

        while let Some(entry) = consumer.dequeue() {
            self.dispatch(&entry, &mut summary);
            match consumer.complete(entry.id) {
                Ok(true) => {}
                Ok(false) => log::trace!("{}: rx buffer {} held", self.name, entry.id.index),
                Err(err) => log::warn!("{}: rx buffer {} not recycled: {}", self.name, entry.id.index, err),
            }
        }
        Ok(summary)
    }

    fn dispatch(self: &Arc<Self>, entry: &RingEntry, summary: &mut ReceiveSummary) {
        let header = entry.header;
        let len = header.len as usize;

        if len > self.max_payload() {
            log::warn!("{}: dropping frame of {} bytes for {:#x}", self.name, len, header.dst);
            match self.lookup(header.dst) {
                Some(ept) => ept.notify_error(IpcError::BadMessage),
                None => self.sink.report(&self.name, IpcError::BadMessage),
            }
            summary.dropped += 1;
            return;
        }

        // SAFETY: the entry was dequeued and stays InFlight until completed
        let data = unsafe { self.rx.consumer().payload(entry.id, len) };

        if header.dst == NS_ADDR {
            self.handle_ns(data);
            summary.control += 1;
            return;
        }

        let Some(ept) = self.lookup(header.dst) else {
            self.sink
                .report(&self.name, IpcError::UnknownEndpoint { addr: header.dst });
            summary.dropped += 1;
            return;
        };

        if len == 0 {
            // Bind acknowledgement
            if ept.bind(header.src) {
                log::debug!("{}: endpoint {} bound to {:#x}", self.name, ept.name, header.src);
                ept.invoke_bound();
            }
            summary.control += 1;
            return;
        }

        log::trace!("{}: {} bytes {:#x} -> {:#x}", self.name, len, header.src, header.dst);
        let frame = RxFrame::new(self, entry.id, header.src, header.dst, data);
        ept.invoke_received(&frame);
        summary.delivered += 1;
    }

    fn handle_ns(&self, data: &[u8]) {
        if self.role != Role::Host {
            log::debug!("{}: ignoring name service frame", self.name);
            return;
        }
        let msg = match NsMessage::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                self.sink.report(&self.name, err);
                return;
            }
        };
        if msg.flags == NS_DESTROY {
            log::debug!("{}: peer destroyed endpoint {}", self.name, msg.name);
            return;
        }

        match self.match_announcement(&msg) {
            Ok(Some(ept)) => self.bind(&ept, msg.addr),
            Ok(None) => log::debug!("{}: cached announcement of {} at {:#x}", self.name, msg.name, msg.addr),
            Err(err) => self.sink.report(&self.name, err),
        }
    }

    /// Find the registered endpoint an announcement refers to, or cache it
    fn match_announcement(&self, msg: &NsMessage) -> Result<Option<Arc<EndpointShared>>> {
        let mut table = self.endpoints.lock();
        let mut free = None;
        for (i, slot) in table.iter_mut().enumerate() {
            match slot {
                EndpointSlot::Registered(ept) if ept.name == msg.name => {
                    return Ok(Some(Arc::clone(ept)));
                }
                EndpointSlot::Announced { name, dest } if *name == msg.name => {
                    *dest = msg.addr;
                    return Ok(None);
                }
                EndpointSlot::Empty if free.is_none() => free = Some(i),
                _ => {}
            }
        }
        let slot = free.ok_or(IpcError::NoSpace)?;
        table[slot] = EndpointSlot::Announced {
            name: msg.name.clone(),
            dest: msg.addr,
        };
        Ok(None)
    }

    /// Host side of the handshake: record the peer, acknowledge, notify
    ///
    /// The endpoint only counts as bound once the acknowledgement is in
    /// the ring. If no buffer is free the acknowledgement stays pending and
    /// is retried by [`retry_bind_acks`](Self::retry_bind_acks).
    fn bind(&self, ept: &Arc<EndpointShared>, dest: u32) {
        ept.set_peer(dest);
        if let Err(err) = self.transmit(ept.addr, dest, &[]) {
            if !ept.set_ack_pending(true) {
                log::warn!("{}: bind ack for {} deferred: {}", self.name, ept.name, err);
                ept.notify_error(err);
            }
            return;
        }
        ept.set_ack_pending(false);
        self.kick_peer(Some(ept));
        if ept.bind(dest) {
            log::debug!("{}: endpoint {} bound to {:#x}", self.name, ept.name, dest);
            ept.invoke_bound();
        }
    }

    /// Send every bind acknowledgement that failed for lack of buffers
    fn retry_bind_acks(&self) {
        if self.role != Role::Host {
            return;
        }
        let pending: Vec<Arc<EndpointShared>> = self
            .endpoints
            .lock()
            .iter()
            .filter_map(|slot| match slot {
                EndpointSlot::Registered(ept) if ept.ack_pending() => Some(Arc::clone(ept)),
                _ => None,
            })
            .collect();
        for ept in pending {
            self.bind(&ept, ept.dest());
        }
    }

    /// Copy `payload` into a fresh buffer and enqueue it
    fn transmit(&self, src: u32, dst: u32, payload: &[u8]) -> Result<()> {
        let producer = self.tx.producer();
        let id = producer.try_acquire(src)?;
        // SAFETY: `id` was just reserved for `src` and nobody else sees it
        unsafe { producer.payload_mut(id, payload.len()) }.copy_from_slice(payload);
        if let Err(err) = producer.enqueue(id, MessageHeader::new(src, dst, payload.len() as u16)) {
            let _ = producer.cancel(id, src);
            return Err(err);
        }
        Ok(())
    }

    /// Wake the peer; a failure here never fails the send that queued data
    fn kick_peer(&self, ept: Option<&EndpointShared>) {
        if let Err(err) = self.notifier.kick(self.mbox_data_send) {
            log::warn!("{}: kick {:#x} failed: {}", self.name, self.mbox_data_send, err);
            match ept {
                Some(ept) => ept.notify_error(err),
                None => self.sink.report(&self.name, err),
            }
        }
    }
}

/// Marks one receive pass; cleared on drop, unwinding included
struct ReceivePass<'a>(&'a AtomicBool);

impl<'a> ReceivePass<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::Acquire)).then_some(Self(flag))
    }
}

impl Drop for ReceivePass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("index", &self.index)
            .field("state", &self.state())
            .field("tx", self.tx.pool())
            .field("rx", self.rx.pool())
            .finish()
    }
}
