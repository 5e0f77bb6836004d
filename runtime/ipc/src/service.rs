//! Service facade
//!
//! Free functions over the process-wide registry, one per operation of the
//! service API. Applications that manage their own [`InstanceRegistry`]
//! call the same operations on [`Instance`] and [`Endpoint`] directly.
//!
//! [`InstanceRegistry`]: crate::InstanceRegistry

use alloc::sync::Arc;

use crate::buffer::{DropError, HeldRxBuffer, NoCopyError, ReleaseError, RxFrame, TxBuffer};
use crate::config::{EndpointConfig, InstanceConfig, TxWait};
use crate::endpoint::{Endpoint, EndpointHandler};
use crate::error::Result;
use crate::instance::{Instance, ReceiveSummary};
use crate::mailbox::Mailbox;
use crate::registry;

/// Open an instance in the global registry
///
/// # Errors
/// `AlreadyOpen` if an instance of the same name exists; callers retrying
/// start-up can treat it as success and fetch the handle with
/// [`instance`]
pub fn create_instance(config: InstanceConfig) -> Result<Arc<Instance>> {
    registry::global().create(config)
}

/// Look up an open instance by name
pub fn instance(name: &str) -> Option<Arc<Instance>> {
    registry::global().get(name)
}

pub fn register_endpoint<H>(instance: &Arc<Instance>, cfg: EndpointConfig, handler: H) -> Result<Endpoint>
where
    H: EndpointHandler + 'static,
{
    instance.register_endpoint(cfg, handler)
}

pub fn send(ept: &Endpoint, data: &[u8]) -> Result<()> {
    ept.send(data)
}

pub fn get_tx_buffer_size(ept: &Endpoint) -> Result<usize> {
    ept.tx_buffer_size()
}

pub fn get_tx_buffer(ept: &Endpoint, size: usize, wait: TxWait) -> Result<TxBuffer> {
    ept.get_tx_buffer(size, wait)
}

pub fn drop_tx_buffer(ept: &Endpoint, buffer: TxBuffer) -> core::result::Result<(), DropError> {
    ept.drop_tx_buffer(buffer)
}

pub fn send_nocopy(ept: &Endpoint, buffer: TxBuffer, len: usize) -> core::result::Result<usize, NoCopyError> {
    ept.send_nocopy(buffer, len)
}

pub fn hold_rx_buffer(ept: &Endpoint, frame: &RxFrame<'_>) -> Result<HeldRxBuffer> {
    ept.hold_rx_buffer(frame)
}

pub fn release_rx_buffer(ept: &Endpoint, held: HeldRxBuffer) -> core::result::Result<(), ReleaseError> {
    ept.release_rx_buffer(held)
}

pub fn is_endpoint_bound(ept: &Endpoint) -> bool {
    ept.is_bound()
}

pub fn receive(instance: &Arc<Instance>) -> Result<ReceiveSummary> {
    instance.receive()
}

/// Drain `mbox` and set the bit of every instance that was kicked
pub fn mailbox_event_handle(mbox: &dyn Mailbox, received: &mut u32) -> Result<()> {
    registry::global().mailbox_event_handle(mbox, received)
}

/// Install the global hook for errors no endpoint can claim
pub fn set_error_sink<F>(hook: F)
where
    F: Fn(&str, crate::IpcError) + Send + Sync + 'static,
{
    registry::global().set_error_sink(hook)
}
