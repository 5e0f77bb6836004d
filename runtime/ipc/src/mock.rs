//! In-process loopback link
//!
//! Simulates both halves of a physical link inside one process: a shared
//! region from the heap and a mailbox whose two ends feed each other's
//! FIFO. Used by the integration tests, the benchmarks and the stress tool.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossbeam::queue::ArrayQueue;

use crate::config::{InstanceConfig, InstanceConfigBuilder, Role};
use crate::error::{IpcError, Result};
use crate::layout::ShmLayout;
use crate::mailbox::{Mailbox, MailboxErr, MailboxInt};
use crate::shm::ShmRegion;

/// Kick word the host sends on `channel`
pub const fn host_kick_code(channel: u16) -> u32 {
    0x4800_0000 | channel as u32
}

/// Kick word the remote sends on `channel`
pub const fn remote_kick_code(channel: u16) -> u32 {
    0x5200_0000 | channel as u32
}

/// One end of a simulated mailbox
pub struct LoopbackMailbox {
    /// Words the peer wrote to us
    inbox: Arc<ArrayQueue<u32>>,
    /// Peer's inbox
    outbox: Arc<ArrayQueue<u32>>,
    /// Our error register
    errors: Arc<AtomicU32>,
    /// Peer's error register
    peer_errors: Arc<AtomicU32>,
    read_fault: AtomicBool,
}

impl LoopbackMailbox {
    /// Both ends of a mailbox with `depth`-word FIFOs
    pub fn pair(depth: usize) -> (LoopbackMailbox, LoopbackMailbox) {
        let depth = depth.max(1);
        let a_inbox = Arc::new(ArrayQueue::new(depth));
        let b_inbox = Arc::new(ArrayQueue::new(depth));
        let a_errors = Arc::new(AtomicU32::new(0));
        let b_errors = Arc::new(AtomicU32::new(0));

        let a = LoopbackMailbox {
            inbox: Arc::clone(&a_inbox),
            outbox: Arc::clone(&b_inbox),
            errors: Arc::clone(&a_errors),
            peer_errors: Arc::clone(&b_errors),
            read_fault: AtomicBool::new(false),
        };
        let b = LoopbackMailbox {
            inbox: b_inbox,
            outbox: a_inbox,
            errors: b_errors,
            peer_errors: a_errors,
            read_fault: AtomicBool::new(false),
        };
        (a, b)
    }

    /// Make the next `read` fail with `HardwareFault`
    pub fn inject_read_fault(&self) {
        self.read_fault.store(true, Ordering::Release);
    }

    /// Words waiting to be read on this end
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl Mailbox for LoopbackMailbox {
    fn write(&self, word: u32) -> Result<()> {
        self.outbox.push(word).map_err(|_| {
            self.peer_errors
                .fetch_or(MailboxErr::FULL.bits(), Ordering::AcqRel);
            IpcError::Busy
        })
    }

    fn read(&self) -> Result<Option<u32>> {
        if self.read_fault.swap(false, Ordering::AcqRel) {
            return Err(IpcError::HardwareFault);
        }
        Ok(self.inbox.pop())
    }

    fn int_status(&self) -> Result<MailboxInt> {
        let mut status = MailboxInt::empty();
        if !self.inbox.is_empty() {
            status |= MailboxInt::THRESHOLD;
        }
        if self.errors.load(Ordering::Acquire) != 0 {
            status |= MailboxInt::ERROR;
        }
        Ok(status)
    }

    fn clear_int(&self, _bits: MailboxInt) -> Result<()> {
        // Level triggered: status follows the FIFO and error register
        Ok(())
    }

    fn error_status(&self) -> Result<MailboxErr> {
        Ok(MailboxErr::from_bits_truncate(self.errors.load(Ordering::Acquire)))
    }

    fn clear_error(&self, bits: MailboxErr) -> Result<()> {
        self.errors.fetch_and(!bits.bits(), Ordering::AcqRel);
        Ok(())
    }
}

/// Shared region plus mailbox pair for one simulated link
pub struct LoopbackLink {
    shm: Arc<ShmRegion>,
    host_mbox: Arc<LoopbackMailbox>,
    remote_mbox: Arc<LoopbackMailbox>,
    slots: usize,
    element_size: usize,
    channel: u16,
}

impl LoopbackLink {
    /// Mailbox FIFO depth of a fresh link
    pub const MAILBOX_DEPTH: usize = 64;

    /// Allocate a region sized for `slots` buffers per direction
    pub fn new(slots: usize, element_size: usize) -> Result<Self> {
        let (host, remote) = LoopbackMailbox::pair(Self::MAILBOX_DEPTH);
        Self::with_mailboxes(slots, element_size, Arc::new(host), Arc::new(remote), 0)
    }

    fn with_mailboxes(
        slots: usize,
        element_size: usize,
        host_mbox: Arc<LoopbackMailbox>,
        remote_mbox: Arc<LoopbackMailbox>,
        channel: u16,
    ) -> Result<Self> {
        let shm = ShmRegion::allocate(ShmLayout::required_size(slots, element_size))?;
        Ok(Self {
            shm,
            host_mbox,
            remote_mbox,
            slots,
            element_size,
            channel,
        })
    }

    /// Another link of the same geometry that shares this link's mailbox,
    /// told apart by `channel` in the kick words
    pub fn share_mailbox(&self, channel: u16) -> Result<Self> {
        if channel == self.channel {
            return Err(IpcError::InvalidConfig);
        }
        Self::with_mailboxes(
            self.slots,
            self.element_size,
            Arc::clone(&self.host_mbox),
            Arc::clone(&self.remote_mbox),
            channel,
        )
    }

    pub fn shm(&self) -> &Arc<ShmRegion> {
        &self.shm
    }

    /// The host's end of the mailbox
    pub fn host_mailbox(&self) -> &Arc<LoopbackMailbox> {
        &self.host_mbox
    }

    /// The remote's end of the mailbox
    pub fn remote_mailbox(&self) -> &Arc<LoopbackMailbox> {
        &self.remote_mbox
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    fn builder(&self, name: &str, role: Role) -> InstanceConfigBuilder {
        let host = host_kick_code(self.channel);
        let remote = remote_kick_code(self.channel);
        let (send, rcv, mbox) = match role {
            Role::Host => (host, remote, &self.host_mbox),
            Role::Remote => (remote, host, &self.remote_mbox),
        };
        let mailbox: Arc<dyn Mailbox> = Arc::clone(mbox) as Arc<dyn Mailbox>;
        InstanceConfig::builder(name, role, Arc::clone(&self.shm))
            .slots(self.slots)
            .element_size(self.element_size)
            .kick_codes(send, rcv)
            .mailbox(mailbox)
    }

    /// Config for the host side of the link
    pub fn host_config(&self, name: &str) -> InstanceConfigBuilder {
        self.builder(name, Role::Host)
    }

    /// Config for the remote side of the link
    pub fn remote_config(&self, name: &str) -> InstanceConfigBuilder {
        self.builder(name, Role::Remote)
    }
}

impl core::fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackLink")
            .field("shm", &self.shm)
            .field("slots", &self.slots)
            .field("element_size", &self.element_size)
            .field("channel", &self.channel)
            .finish()
    }
}
