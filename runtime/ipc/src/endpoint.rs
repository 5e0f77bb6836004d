//! Endpoints - named channels multiplexed over one instance
//!
//! An endpoint goes `Registered (unbound) -> Bound` once and then stays
//! bound for the life of the process. The handler set by the application
//! is the strongly typed replacement for a callback struct plus a private
//! data pointer.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::buffer::{DropError, HeldRxBuffer, NoCopyError, ReleaseError, RxFrame, TxBuffer};
use crate::config::{EndpointConfig, TxWait};
use crate::error::{IpcError, Result};
use crate::instance::Instance;

/// Peer address before the endpoint is bound
pub const ADDR_ANY: u32 = u32::MAX;

/// Callbacks of one endpoint
///
/// Callbacks run on the receive path, outside every lock of the service.
/// They must not block for long. Calling `receive` on the same instance
/// from a callback fails with `Busy`.
pub trait EndpointHandler: Send {
    /// The peer's endpoint of the same name was found
    fn bound(&mut self) {}

    /// A frame arrived; call [`RxFrame::hold`] to keep the buffer after
    /// returning
    fn received(&mut self, frame: &RxFrame<'_>);

    /// An asynchronous failure concerning this endpoint
    fn error(&mut self, err: IpcError) {
        log::warn!("unhandled endpoint error: {}", err);
    }
}

/// Handler built from a closure over received frames
pub struct FnHandler<F> {
    on_received: F,
}

impl<F> FnHandler<F>
where
    F: FnMut(&RxFrame<'_>) + Send,
{
    pub fn new(on_received: F) -> Self {
        Self { on_received }
    }
}

impl<F> EndpointHandler for FnHandler<F>
where
    F: FnMut(&RxFrame<'_>) + Send,
{
    fn received(&mut self, frame: &RxFrame<'_>) {
        (self.on_received)(frame)
    }
}

/// Endpoint state shared by the instance table and every handle
pub(crate) struct EndpointShared {
    pub(crate) name: String,
    pub(crate) addr: u32,
    pub(crate) priority: u8,
    dest: AtomicU32,
    bound: AtomicBool,
    /// Host side: peer known, bind acknowledgement not yet enqueued
    ack_pending: AtomicBool,
    reservations: AtomicUsize,
    max_reservations: usize,
    handler: spin::Mutex<Box<dyn EndpointHandler>>,
    /// Errors raised while the handler was busy
    deferred: spin::Mutex<Vec<IpcError>>,
}

impl EndpointShared {
    pub(crate) fn new(cfg: &EndpointConfig, addr: u32, handler: Box<dyn EndpointHandler>) -> Self {
        Self {
            name: cfg.name.clone(),
            addr,
            priority: cfg.priority,
            dest: AtomicU32::new(ADDR_ANY),
            bound: AtomicBool::new(false),
            ack_pending: AtomicBool::new(false),
            reservations: AtomicUsize::new(0),
            max_reservations: cfg.max_tx_reservations,
            handler: spin::Mutex::new(handler),
            deferred: spin::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub(crate) fn dest(&self) -> u32 {
        self.dest.load(Ordering::Acquire)
    }

    /// Record the peer address; returns whether this call bound the endpoint
    pub(crate) fn bind(&self, dest: u32) -> bool {
        self.dest.store(dest, Ordering::Release);
        !self.bound.swap(true, Ordering::AcqRel)
    }

    /// Record the peer address without binding yet
    pub(crate) fn set_peer(&self, dest: u32) {
        self.dest.store(dest, Ordering::Release);
    }

    /// Returns the previous value
    pub(crate) fn set_ack_pending(&self, pending: bool) -> bool {
        self.ack_pending.swap(pending, Ordering::AcqRel)
    }

    pub(crate) fn ack_pending(&self) -> bool {
        self.ack_pending.load(Ordering::Acquire)
    }

    /// Count one more unsent tx buffer
    pub(crate) fn try_reserve(&self) -> Result<()> {
        self.reservations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_reservations).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| IpcError::AlreadyReserved)
    }

    pub(crate) fn release_reservation(&self) {
        let _ = self
            .reservations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn invoke_bound(&self) {
        self.handler.lock().bound();
        self.flush_deferred();
    }

    pub(crate) fn invoke_received(&self, frame: &RxFrame<'_>) {
        self.handler.lock().received(frame);
        self.flush_deferred();
    }

    /// Deliver `err` to the error callback
    ///
    /// Raised from inside one of this endpoint's own callbacks (a reply
    /// whose kick failed, say), the error is queued and delivered once the
    /// callback returns.
    pub(crate) fn notify_error(&self, err: IpcError) {
        match self.handler.try_lock() {
            Some(mut handler) => handler.error(err),
            None => self.deferred.lock().push(err),
        }
    }

    fn flush_deferred(&self) {
        let pending = core::mem::take(&mut *self.deferred.lock());
        if pending.is_empty() {
            return;
        }
        let mut handler = self.handler.lock();
        for err in pending {
            handler.error(err);
        }
    }
}

/// Handle to a registered endpoint
///
/// Holds only a weak reference to its instance; operations on an endpoint
/// whose instance is gone fail with `NoBackend`.
#[derive(Clone)]
pub struct Endpoint {
    instance: Weak<Instance>,
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    pub(crate) fn new(instance: Weak<Instance>, shared: Arc<EndpointShared>) -> Self {
        Self { instance, shared }
    }

    pub(crate) fn shared(&self) -> &Arc<EndpointShared> {
        &self.shared
    }

    /// Whether this handle was registered on `instance`
    pub(crate) fn is_on(&self, instance: &Instance) -> bool {
        core::ptr::eq(self.instance.as_ptr(), instance)
    }

    pub fn instance(&self) -> Result<Arc<Instance>> {
        self.instance.upgrade().ok_or(IpcError::NoBackend)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Local address; tags every frame this endpoint sends
    pub fn addr(&self) -> u32 {
        self.shared.addr
    }

    /// Peer address once bound
    pub fn dest(&self) -> Option<u32> {
        self.is_bound().then(|| self.shared.dest())
    }

    pub fn priority(&self) -> u8 {
        self.shared.priority
    }

    pub fn is_bound(&self) -> bool {
        self.shared.is_bound()
    }

    /// Copy `data` into a pool buffer and send it
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.instance()?.send(self, data)
    }

    /// Largest payload a tx buffer holds
    pub fn tx_buffer_size(&self) -> Result<usize> {
        self.instance()?.get_tx_buffer_size(self)
    }

    /// Reserve a tx buffer for in-place fill (`size` 0 asks for the maximum)
    pub fn get_tx_buffer(&self, size: usize, wait: TxWait) -> Result<TxBuffer> {
        self.instance()?.get_tx_buffer(self, size, wait)
    }

    /// Send the first `len` bytes of a reserved buffer
    pub fn send_nocopy(&self, buffer: TxBuffer, len: usize) -> core::result::Result<usize, NoCopyError> {
        match self.instance() {
            Ok(instance) => instance.send_nocopy(self, buffer, len),
            Err(kind) => Err(NoCopyError { kind, buffer }),
        }
    }

    /// Return a reserved buffer without sending it
    pub fn drop_tx_buffer(&self, buffer: TxBuffer) -> core::result::Result<(), DropError> {
        match self.instance() {
            Ok(instance) => instance.drop_tx_buffer(self, buffer),
            Err(kind) => Err(DropError { kind, buffer }),
        }
    }

    /// Keep a received buffer past its callback
    pub fn hold_rx_buffer(&self, frame: &RxFrame<'_>) -> Result<HeldRxBuffer> {
        if frame.dst() != self.addr() {
            return Err(IpcError::InvalidConfig);
        }
        frame.hold()
    }

    /// Return a held buffer to the pool
    pub fn release_rx_buffer(&self, held: HeldRxBuffer) -> core::result::Result<(), ReleaseError> {
        match self.instance() {
            Ok(instance) => instance.release_rx_buffer(self, held),
            Err(kind) => Err(ReleaseError { kind, held }),
        }
    }

    /// Poll until the endpoint is bound
    ///
    /// `poll` drives the link, usually by calling `receive` on the instance
    /// (and on the peer, in a loopback setup). It runs at most `max_polls`
    /// times.
    ///
    /// # Errors
    /// `TimedOut` if the endpoint is still unbound afterwards
    pub fn wait_bound<F: FnMut()>(&self, max_polls: usize, mut poll: F) -> Result<()> {
        for _ in 0..max_polls {
            if self.is_bound() {
                return Ok(());
            }
            poll();
        }
        if self.is_bound() {
            Ok(())
        } else {
            Err(IpcError::TimedOut)
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.shared.name)
            .field("addr", &format_args!("{:#x}", self.shared.addr))
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        errors: Arc<AtomicUsize>,
    }

    impl EndpointHandler for Counting {
        fn received(&mut self, _frame: &RxFrame<'_>) {}
        fn error(&mut self, _err: IpcError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shared(max: usize) -> (EndpointShared, Arc<AtomicUsize>) {
        let errors = Arc::new(AtomicUsize::new(0));
        let cfg = EndpointConfig::new("ep").max_tx_reservations(max);
        let handler = Box::new(Counting {
            errors: errors.clone(),
        });
        (EndpointShared::new(&cfg, 1024, handler), errors)
    }

    #[test]
    fn test_reservation_limit() {
        let (ept, _) = shared(2);
        ept.try_reserve().unwrap();
        ept.try_reserve().unwrap();
        assert_eq!(ept.try_reserve(), Err(IpcError::AlreadyReserved));
        ept.release_reservation();
        ept.try_reserve().unwrap();
    }

    #[test]
    fn test_bind_once() {
        let (ept, _) = shared(1);
        assert!(!ept.is_bound());
        assert_eq!(ept.dest(), ADDR_ANY);
        assert!(ept.bind(0x401));
        assert!(!ept.bind(0x402));
        assert_eq!(ept.dest(), 0x402);
    }

    struct ReportsOnBind {
        me: Arc<spin::Once<Weak<EndpointShared>>>,
        errors: Arc<AtomicUsize>,
    }

    impl EndpointHandler for ReportsOnBind {
        fn bound(&mut self) {
            if let Some(me) = self.me.get().and_then(Weak::upgrade) {
                me.notify_error(IpcError::HardwareFault);
            }
        }
        fn received(&mut self, _frame: &RxFrame<'_>) {}
        fn error(&mut self, _err: IpcError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_error_raised_in_bound_delivered_after_it() {
        let me = Arc::new(spin::Once::new());
        let errors = Arc::new(AtomicUsize::new(0));
        let handler = Box::new(ReportsOnBind {
            me: me.clone(),
            errors: errors.clone(),
        });
        let ept = Arc::new(EndpointShared::new(&EndpointConfig::new("ep"), 1024, handler));
        me.call_once(|| Arc::downgrade(&ept));

        ept.invoke_bound();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(ept.deferred.lock().is_empty());
    }

    #[test]
    fn test_error_deferred_while_handler_busy() {
        let (ept, errors) = shared(1);
        {
            let _busy = ept.handler.lock();
            ept.notify_error(IpcError::Busy);
            assert_eq!(errors.load(Ordering::SeqCst), 0);
        }
        ept.flush_deferred();
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        ept.notify_error(IpcError::HardwareFault);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }
}
