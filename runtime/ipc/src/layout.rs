//! Shared memory layout
//!
//! Both sides compute the same layout from the same (base, size, slots,
//! element size) tuple, so nothing about the layout is exchanged at runtime.
//!
//! ```text
//! +----------------+  base
//! | status word    |  STATUS_SIZE, padded to MEM_ALIGNMENT
//! +----------------+
//! | rx area        |  slots x element_size   (remote -> host buffers)
//! +----------------+
//! | tx area        |  slots x element_size   (host -> remote buffers)
//! +----------------+
//! | rx ring        |  slots x RING_ENTRY_SIZE
//! +----------------+
//! | tx ring        |  slots x RING_ENTRY_SIZE
//! +----------------+  base + total
//! ```
//!
//! "rx"/"tx" are named from the host's point of view; the remote transmits
//! on the rx pair and receives on the tx pair.

use crate::config::{Role, BUFFER_HEADER_SIZE, MEM_ALIGNMENT, RING_ENTRY_SIZE, STATUS_SIZE};
use crate::error::{IpcError, Result};

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Transfer direction through the region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host transmits, remote receives (tx area and tx ring)
    HostToRemote,
    /// Remote transmits, host receives (rx area and rx ring)
    RemoteToHost,
}

impl Direction {
    /// Direction `role` transmits on
    pub fn outbound(role: Role) -> Direction {
        match role {
            Role::Host => Direction::HostToRemote,
            Role::Remote => Direction::RemoteToHost,
        }
    }

    /// Direction `role` receives on
    pub fn inbound(role: Role) -> Direction {
        Direction::outbound(role.peer())
    }
}

/// Offsets of every sub-region, relative to the region base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLayout {
    pub slots: usize,
    pub element_size: usize,
    pub status: usize,
    pub rx_area: usize,
    pub tx_area: usize,
    pub rx_ring: usize,
    pub tx_ring: usize,
    /// Bytes used from the base
    pub total: usize,
}

impl ShmLayout {
    /// Bytes a region needs for `slots` buffers of `element_size` per direction
    pub const fn required_size(slots: usize, element_size: usize) -> usize {
        let status = align_up(STATUS_SIZE, MEM_ALIGNMENT);
        status + 2 * slots * element_size + 2 * slots * RING_ENTRY_SIZE
    }

    /// Carve `size` bytes at `base` into status, areas and rings
    ///
    /// # Errors
    /// - `InvalidConfig` if `base` or `size` is zero, `base` is not 16-byte
    ///   aligned, `slots` is zero or does not fit a 16-bit index, or
    ///   `element_size` is unaligned or leaves no room for payload, or the
    ///   layout does not fit in `size`
    pub fn compute(base: usize, size: usize, slots: usize, element_size: usize) -> Result<Self> {
        if base == 0 || size == 0 || base % MEM_ALIGNMENT != 0 {
            return Err(IpcError::InvalidConfig);
        }
        if slots == 0 || slots > u16::MAX as usize {
            return Err(IpcError::InvalidConfig);
        }
        if element_size <= BUFFER_HEADER_SIZE || element_size % MEM_ALIGNMENT != 0 {
            return Err(IpcError::InvalidConfig);
        }
        // Payload length is carried in a 16-bit header field
        if element_size - BUFFER_HEADER_SIZE > u16::MAX as usize {
            return Err(IpcError::InvalidConfig);
        }

        let area = slots.checked_mul(element_size).ok_or(IpcError::InvalidConfig)?;
        let ring = slots * RING_ENTRY_SIZE;

        let status = 0;
        let rx_area = align_up(STATUS_SIZE, MEM_ALIGNMENT);
        let tx_area = rx_area + area;
        let rx_ring = tx_area + area;
        let tx_ring = rx_ring + ring;
        let total = tx_ring + ring;

        if total > size {
            log::error!(
                "shm too small: need {:#x} bytes for {} slots of {}, have {:#x}",
                total,
                slots,
                element_size,
                size
            );
            return Err(IpcError::InvalidConfig);
        }

        Ok(Self {
            slots,
            element_size,
            status,
            rx_area,
            tx_area,
            rx_ring,
            tx_ring,
            total,
        })
    }

    /// Buffer area offset for `dir`
    pub fn area(&self, dir: Direction) -> usize {
        match dir {
            Direction::HostToRemote => self.tx_area,
            Direction::RemoteToHost => self.rx_area,
        }
    }

    /// Ring metadata offset for `dir`
    pub fn ring(&self, dir: Direction) -> usize {
        match dir {
            Direction::HostToRemote => self.tx_ring,
            Direction::RemoteToHost => self.rx_ring,
        }
    }

    /// Payload bytes per element
    pub fn max_payload(&self) -> usize {
        self.element_size - BUFFER_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_NUM_SLOTS, ELEMENT_SIZE};

    #[test]
    fn test_layout_is_ordered_and_aligned() {
        let size = ShmLayout::required_size(DEFAULT_NUM_SLOTS, ELEMENT_SIZE);
        let l = ShmLayout::compute(0x1000, size, DEFAULT_NUM_SLOTS, ELEMENT_SIZE).unwrap();

        assert_eq!(l.status, 0);
        assert_eq!(l.rx_area, 16);
        assert_eq!(l.tx_area, 16 + 8 * 512);
        assert_eq!(l.rx_ring, 16 + 16 * 512);
        assert_eq!(l.tx_ring, l.rx_ring + 8 * 16);
        assert_eq!(l.total, size);

        for off in [l.rx_area, l.tx_area, l.rx_ring, l.tx_ring] {
            assert_eq!(off % MEM_ALIGNMENT, 0);
        }
    }

    #[test]
    fn test_directions_swap_by_role() {
        let size = ShmLayout::required_size(4, ELEMENT_SIZE);
        let l = ShmLayout::compute(0x1000, size, 4, ELEMENT_SIZE).unwrap();

        let host_out = Direction::outbound(Role::Host);
        assert_eq!(host_out, Direction::inbound(Role::Remote));
        assert_eq!(l.area(host_out), l.tx_area);
        assert_eq!(l.ring(Direction::outbound(Role::Remote)), l.rx_ring);
    }

    #[test]
    fn test_region_too_small() {
        let size = ShmLayout::required_size(8, ELEMENT_SIZE);
        assert_eq!(
            ShmLayout::compute(0x1000, size - 1, 8, ELEMENT_SIZE),
            Err(IpcError::InvalidConfig)
        );
        assert!(ShmLayout::compute(0x1000, size, 8, ELEMENT_SIZE).is_ok());
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert_eq!(ShmLayout::compute(0x1004, 1 << 20, 8, 512), Err(IpcError::InvalidConfig));
        assert_eq!(ShmLayout::compute(0, 1 << 20, 8, 512), Err(IpcError::InvalidConfig));
        assert_eq!(ShmLayout::compute(0x1000, 0, 8, 512), Err(IpcError::InvalidConfig));
        assert_eq!(ShmLayout::compute(0x1000, 1 << 20, 0, 512), Err(IpcError::InvalidConfig));
        assert_eq!(ShmLayout::compute(0x1000, 1 << 20, 8, 500), Err(IpcError::InvalidConfig));
        assert_eq!(ShmLayout::compute(0x1000, 1 << 20, 8, 16), Err(IpcError::InvalidConfig));
    }
}
