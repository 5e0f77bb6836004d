//! Shared Memory IPC Service - endpoints over an inter-processor link
//!
//! # Purpose
//! Moves data between a host CPU and a companion processor across a
//! physically shared memory region, with a mailbox word as the only
//! signal. Many named endpoints are multiplexed over one link; payloads go
//! either through a copy or, zero-copy, straight from a pool buffer the
//! caller fills in place.
//!
//! # Integration Points
//! - Depends on: a shared memory carve-out ([`ShmRegion`]) and a
//!   [`Mailbox`] driver, or neither in polling mode
//! - Provides to: applications on either processor, through [`service`]
//!   or directly through [`Instance`] and [`Endpoint`]
//! - Interrupt entry: [`InstanceRegistry::mailbox_event_handle`], followed
//!   by [`Instance::receive`] for every kicked instance
//!
//! # Architecture
//! ```text
//! InstanceRegistry ──> Instance ──> endpoint table ──> EndpointHandler
//!                         │
//!                         ├── tx StaticVring ──> BufferPool (outbound area)
//!                         ├── rx StaticVring ──> BufferPool (inbound area)
//!                         └── NotifierBackend ──> Mailbox / status word
//! ```
//! Buffer ownership is a tagged state (`Free`, `Reserved`, `InFlight`,
//! `DeliveredHeld`) kept in shared memory and changed only by
//! compare-exchange. The caller sees it as guard types: [`TxBuffer`] is
//! consumed by sending it and [`HeldRxBuffer`] by releasing it.
//!
//! # Design
//! - No global state besides the instance registry
//! - FIFO per direction from per-side sequence counters, no shared
//!   head/tail words
//! - Callbacks never run under a lock of the service
//! - Every failure is returned to the caller; failures found on the
//!   receive path also reach the endpoint's `error` callback

#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod buffer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod instance;
pub mod layout;
pub mod mailbox;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ns;
pub mod pool;
pub mod registry;
pub mod ring;
pub mod service;
pub mod shm;

pub use buffer::{DropError, HeldRxBuffer, NoCopyError, ReleaseError, RxFrame, TxBuffer};
pub use config::{Delay, EndpointConfig, InstanceConfig, Role, SpinDelay, TxWait};
#[cfg(feature = "std")]
pub use config::StdDelay;
pub use endpoint::{Endpoint, EndpointHandler, FnHandler};
pub use error::{IpcError, Result};
pub use instance::{Instance, InstanceState, ReceiveSummary};
pub use layout::{Direction, ShmLayout};
pub use mailbox::{Mailbox, MailboxErr, MailboxInt, MailboxNotifier, NotifierBackend, StatusWordNotifier};
pub use pool::{BufferId, BufferPool, BufferState};
pub use registry::{ErrorSink, InstanceRegistry};
pub use ring::{Consumer, MessageHeader, Producer, RingTransport, StaticVring};
pub use shm::{ShmRegion, StatusFlags};
