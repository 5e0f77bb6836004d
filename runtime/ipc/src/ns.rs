//! Name service announcements
//!
//! The remote announces each endpoint it registers by sending this message
//! to [`NS_ADDR`](crate::config::NS_ADDR). The host answers with a
//! zero-length frame once its endpoint of the same name exists.

use alloc::string::String;

use crate::config::RPMSG_NAME_SIZE;
use crate::error::{IpcError, Result};

/// Endpoint created
pub const NS_CREATE: u32 = 0;
/// Endpoint destroyed
pub const NS_DESTROY: u32 = 1;

/// Wire size of one announcement
pub const NS_MESSAGE_SIZE: usize = RPMSG_NAME_SIZE + 8;

/// `{ name[32], addr: u32, flags: u32 }`, little endian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsMessage {
    pub name: String,
    pub addr: u32,
    pub flags: u32,
}

impl NsMessage {
    pub fn create(name: &str, addr: u32) -> Self {
        Self {
            name: String::from(name),
            addr,
            flags: NS_CREATE,
        }
    }

    /// # Errors
    /// `InvalidConfig` if the name does not fit with its terminator
    pub fn encode(&self) -> Result<[u8; NS_MESSAGE_SIZE]> {
        let name = self.name.as_bytes();
        if name.is_empty() || name.len() >= RPMSG_NAME_SIZE {
            return Err(IpcError::InvalidConfig);
        }
        let mut raw = [0u8; NS_MESSAGE_SIZE];
        raw[..name.len()].copy_from_slice(name);
        raw[RPMSG_NAME_SIZE..RPMSG_NAME_SIZE + 4].copy_from_slice(&self.addr.to_le_bytes());
        raw[RPMSG_NAME_SIZE + 4..].copy_from_slice(&self.flags.to_le_bytes());
        Ok(raw)
    }

    /// # Errors
    /// `BadMessage` on a short frame, a name that is empty or not UTF-8, or
    /// unknown flags
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < NS_MESSAGE_SIZE {
            return Err(IpcError::BadMessage);
        }
        let field = &raw[..RPMSG_NAME_SIZE];
        let end = field.iter().position(|b| *b == 0).unwrap_or(RPMSG_NAME_SIZE);
        if end == 0 {
            return Err(IpcError::BadMessage);
        }
        let name = core::str::from_utf8(&field[..end]).map_err(|_| IpcError::BadMessage)?;

        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let addr = word(RPMSG_NAME_SIZE);
        let flags = word(RPMSG_NAME_SIZE + 4);
        if flags != NS_CREATE && flags != NS_DESTROY {
            return Err(IpcError::BadMessage);
        }

        Ok(Self {
            name: String::from(name),
            addr,
            flags,
        })
    }
}
