//! Compile-time limits and runtime configuration
//!
//! The limits mirror the static rpmsg configuration both processors are
//! built with: both sides must agree on them out of band.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use static_assertions::const_assert;

use crate::error::{IpcError, Result};
use crate::instance::Instance;
use crate::mailbox::{Mailbox, NotifierBackend};
use crate::shm::ShmRegion;

/// Maximum number of instances in one process
pub const NUM_INSTANCES: usize = 4;

/// Endpoint slots per instance
pub const NUM_ENDPOINTS: usize = 8;

/// Size of one buffer element in the shared region (header + payload)
pub const ELEMENT_SIZE: usize = 512;

/// Message header at the start of every buffer element
pub const BUFFER_HEADER_SIZE: usize = 16;

/// Largest payload that fits in a default element
pub const MAX_PAYLOAD_SIZE: usize = ELEMENT_SIZE - BUFFER_HEADER_SIZE;

/// Status word at the base of the shared region
pub const STATUS_SIZE: usize = 4;

/// One descriptor in ring metadata
pub const RING_ENTRY_SIZE: usize = 16;

/// Minimum bus-transfer alignment for every region boundary
pub const MEM_ALIGNMENT: usize = 16;

/// Buffers per direction when the caller does not choose
pub const DEFAULT_NUM_SLOTS: usize = 8;

/// Endpoint name field size, including the NUL terminator
pub const RPMSG_NAME_SIZE: usize = 32;

/// Reserved address of the name service endpoint
pub const NS_ADDR: u32 = 53;

/// First address handed to user endpoints
pub const EPT_ADDR_BASE: u32 = 1024;

const_assert!(MAX_PAYLOAD_SIZE == 496);
const_assert!(ELEMENT_SIZE % MEM_ALIGNMENT == 0);
const_assert!(RING_ENTRY_SIZE % MEM_ALIGNMENT == 0);
const_assert!(NUM_INSTANCES <= 32); // one bit per instance in the kick bitmap
const_assert!(EPT_ADDR_BASE > NS_ADDR);
const_assert!(RPMSG_NAME_SIZE + 8 <= MAX_PAYLOAD_SIZE);

/// Which side of the link this instance runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initializes the shared region and answers name-service announcements
    Host,
    /// Attaches to the host's region and announces its endpoints
    Remote,
}

impl Role {
    pub const RAW_HOST: u32 = 0;
    pub const RAW_REMOTE: u32 = 1;

    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Remote,
            Role::Remote => Role::Host,
        }
    }
}

impl TryFrom<u32> for Role {
    type Error = IpcError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            Role::RAW_HOST => Ok(Role::Host),
            Role::RAW_REMOTE => Ok(Role::Remote),
            _ => Err(IpcError::InvalidConfig),
        }
    }
}

/// How long `get_tx_buffer` may wait for a free buffer
///
/// The unit is milliseconds, measured with the instance's [`Delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxWait {
    /// Fail immediately with `NoBuffers`
    #[default]
    NoWait,
    /// Poll once per millisecond for at most this many milliseconds
    Millis(u32),
    /// Poll until a buffer frees up
    Forever,
}

/// Millisecond delay source used by bounded waits
pub trait Delay: Send + Sync {
    fn delay_ms(&self, ms: u32);
}

/// Counting spin loop, for targets without a timer
#[derive(Debug, Clone, Copy)]
pub struct SpinDelay {
    pub spins_per_ms: u32,
}

impl Default for SpinDelay {
    fn default() -> Self {
        Self { spins_per_ms: 10_000 }
    }
}

impl Delay for SpinDelay {
    fn delay_ms(&self, ms: u32) {
        for _ in 0..(ms as u64 * self.spins_per_ms as u64) {
            core::hint::spin_loop();
        }
    }
}

/// Thread sleep backed delay
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

#[cfg(feature = "std")]
impl Delay for StdDelay {
    fn delay_ms(&self, ms: u32) {
        extern crate std;
        std::thread::sleep(core::time::Duration::from_millis(ms as u64));
    }
}

/// Called from `mailbox_event_handle` each time a kick for the instance
/// arrives. Runs in interrupt context on real hardware: must not block.
/// Returns whether the application acknowledged the kick.
pub type UserKick = Arc<dyn Fn(&Instance) -> bool + Send + Sync>;

/// Instance descriptor
pub struct InstanceConfig {
    /// Unique instance name
    pub name: String,
    pub role: Role,
    /// Shared memory region of this link
    pub shm: Arc<ShmRegion>,
    /// Buffers per direction
    pub slots: usize,
    /// Bytes per buffer element, header included
    pub element_size: usize,
    /// Mailbox word this side writes to kick the peer
    pub mbox_data_send: u32,
    /// Mailbox word the peer writes to kick this side
    pub mbox_data_rcv: u32,
    /// Notification strategy; derived from `mailbox` or the status word when unset
    pub notifier: Option<Arc<dyn NotifierBackend>>,
    /// Mailbox used by the default notifier
    pub mailbox: Option<Arc<dyn Mailbox>>,
    pub user_kick: Option<UserKick>,
    pub delay: Arc<dyn Delay>,
}

impl InstanceConfig {
    pub fn builder(name: &str, role: Role, shm: Arc<ShmRegion>) -> InstanceConfigBuilder {
        InstanceConfigBuilder {
            config: InstanceConfig {
                name: String::from(name),
                role,
                shm,
                slots: DEFAULT_NUM_SLOTS,
                element_size: ELEMENT_SIZE,
                mbox_data_send: 0,
                mbox_data_rcv: 0,
                notifier: None,
                mailbox: None,
                user_kick: None,
                delay: Arc::new(SpinDelay::default()),
            },
        }
    }

    /// Payload bytes available in one element
    pub fn max_payload(&self) -> usize {
        self.element_size.saturating_sub(BUFFER_HEADER_SIZE)
    }
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("shm_base", &format_args!("{:#x}", self.shm.base()))
            .field("shm_size", &self.shm.size())
            .field("slots", &self.slots)
            .field("element_size", &self.element_size)
            .field("mbox_data_send", &format_args!("{:#x}", self.mbox_data_send))
            .field("mbox_data_rcv", &format_args!("{:#x}", self.mbox_data_rcv))
            .field("notifier", &self.notifier.is_some())
            .field("mailbox", &self.mailbox.is_some())
            .finish()
    }
}

/// Builder for [`InstanceConfig`]
pub struct InstanceConfigBuilder {
    config: InstanceConfig,
}

impl InstanceConfigBuilder {
    pub fn slots(mut self, slots: usize) -> Self {
        self.config.slots = slots;
        self
    }

    pub fn element_size(mut self, bytes: usize) -> Self {
        self.config.element_size = bytes;
        self
    }

    pub fn kick_codes(mut self, send: u32, rcv: u32) -> Self {
        self.config.mbox_data_send = send;
        self.config.mbox_data_rcv = rcv;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotifierBackend>) -> Self {
        self.config.notifier = Some(notifier);
        self
    }

    pub fn mailbox(mut self, mailbox: Arc<dyn Mailbox>) -> Self {
        self.config.mailbox = Some(mailbox);
        self
    }

    pub fn user_kick<F>(mut self, cbk: F) -> Self
    where
        F: Fn(&Instance) -> bool + Send + Sync + 'static,
    {
        self.config.user_kick = Some(Arc::new(cbk));
        self
    }

    pub fn delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.config.delay = delay;
        self
    }

    pub fn build(self) -> InstanceConfig {
        self.config
    }
}

/// Endpoint registration parameters
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Unique within the instance; at most `RPMSG_NAME_SIZE - 1` bytes
    pub name: String,
    /// Advisory ordering hint
    pub priority: u8,
    /// Unsent tx buffers this endpoint may hold at once
    pub max_tx_reservations: usize,
}

impl EndpointConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            priority: 0,
            max_tx_reservations: 1,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_tx_reservations(mut self, n: usize) -> Self {
        self.max_tx_reservations = n;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() >= RPMSG_NAME_SIZE {
            return Err(IpcError::InvalidConfig);
        }
        if self.name.as_bytes().contains(&0) {
            return Err(IpcError::InvalidConfig);
        }
        if self.max_tx_reservations == 0 {
            return Err(IpcError::InvalidConfig);
        }
        Ok(())
    }
}
