//! Mailbox and notifier
//!
//! A kick is one 32-bit word meaning "something changed"; it carries no
//! payload. [`NotifierBackend`] is the strategy an instance uses to send a
//! kick, chosen when the instance is built. [`Mailbox`] models the hardware
//! FIFO the default notifier writes to and the receive side drains.

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::config::Role;
use crate::error::Result;
use crate::shm::{ShmRegion, StatusFlags};

bitflags! {
    /// Mailbox interrupt status
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MailboxInt: u32 {
        /// FIFO holds at least one word
        const THRESHOLD = 1 << 0;
        /// Error register has bits set
        const ERROR = 1 << 1;
    }
}

bitflags! {
    /// Mailbox error register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MailboxErr: u32 {
        /// Write to a full FIFO
        const FULL = 1 << 0;
        /// Read from an empty FIFO
        const EMPTY = 1 << 1;
    }
}

/// Mailbox hardware FIFO, one end
pub trait Mailbox: Send + Sync {
    /// Push one word to the peer
    ///
    /// # Errors
    /// `Busy` if the peer FIFO is full, `HardwareFault` on register failure
    fn write(&self, word: u32) -> Result<()>;

    /// Pop one word sent by the peer; `Ok(None)` when the FIFO is empty
    ///
    /// # Errors
    /// `HardwareFault` if the data register cannot be read
    fn read(&self) -> Result<Option<u32>>;

    fn int_status(&self) -> Result<MailboxInt>;

    fn clear_int(&self, bits: MailboxInt) -> Result<()>;

    fn error_status(&self) -> Result<MailboxErr>;

    fn clear_error(&self, bits: MailboxErr) -> Result<()>;
}

/// Strategy for waking the peer
pub trait NotifierBackend: Send + Sync {
    /// Signal the peer with `code`
    fn kick(&self, code: u32) -> Result<()>;
}

/// Writes the kick code to a mailbox FIFO
pub struct MailboxNotifier {
    mailbox: Arc<dyn Mailbox>,
}

impl MailboxNotifier {
    pub fn new(mailbox: Arc<dyn Mailbox>) -> Self {
        Self { mailbox }
    }
}

impl NotifierBackend for MailboxNotifier {
    fn kick(&self, code: u32) -> Result<()> {
        self.mailbox.write(code)
    }
}

/// Sets the peer's kick bit in the shared status word
///
/// For deployments without a mailbox: the peer polls with
/// [`Instance::poll_kick`](crate::Instance::poll_kick).
pub struct StatusWordNotifier {
    shm: Arc<ShmRegion>,
    peer: Role,
}

impl StatusWordNotifier {
    /// Notifier used by `role` to wake its peer
    pub fn new(shm: Arc<ShmRegion>, role: Role) -> Self {
        Self {
            shm,
            peer: role.peer(),
        }
    }
}

impl NotifierBackend for StatusWordNotifier {
    fn kick(&self, _code: u32) -> Result<()> {
        self.shm.set_status(StatusFlags::kick_for(self.peer));
        Ok(())
    }
}
