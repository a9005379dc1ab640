use bitflags::bitflags;

use crate::byteorder::ByteOrder;

pub const MIN_BUFFER_LEN: usize = 1526;
pub const NET_HDR_SIZE: usize = 10;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct NetFeature: u64 {
        /// Device handles packets with partial checksum.
        const CSUM = 1 << 0;
        /// Driver handles packets with partial checksum.
        const GUEST_CSUM = 1 << 1;
        /// Device has given MAC address.
        const MAC = 1 << 5;
        /// Configuration status field is available.
        const STATUS = 1 << 16;

        const RING_EVENT_IDX = 1 << 29;
        const VERSION_1       = 1 << 32;
    }
}

/// This driver never offers checksum/segmentation offload or multiqueue:
/// it asks only for the bits it uses. `MAC` so the device-provided address
/// in config space is meaningful, `STATUS` so link state can be read,
/// `RING_EVENT_IDX` to let the transport suppress notifications, and
/// `VERSION_1` so a modern transport sees it come back in the negotiated
/// set before it will accept `FEATURES_OK`.
pub const SUPPORTED_FEATURES: NetFeature = NetFeature::MAC
    .union(NetFeature::STATUS)
    .union(NetFeature::RING_EVENT_IDX)
    .union(NetFeature::VERSION_1);

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct LinkStatus: u16 {
        const LINK_UP = 1;
        const ANNOUNCE = 2;
    }
}

pub const QUEUE_RECEIVE: u16 = 0;
pub const QUEUE_TRANSMIT: u16 = 1;

/// Config space fields this driver reads: the MAC address and link status.
/// Multiqueue pair count and MTU reporting are out of scope.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub mac: [u8; 6],
    pub status: LinkStatus,
}

/// The per-packet header every virtio-net buffer is prefixed with (virtio
/// spec 5.1.6), stored as raw wire bytes like [`crate::queue::Descriptor`].
/// `num_buffers` (only present with `VIRTIO_NET_F_MRG_RXBUF`, which this
/// driver never negotiates) is omitted.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioNetHdr {
    bytes: [u8; NET_HDR_SIZE],
}

impl VirtioNetHdr {
    /// A fully zero-filled header: what this driver always sends, since it
    /// negotiates none of the GSO/checksum-offload features and `hdr_len`
    /// is only meaningful when one of those is in play.
    pub fn none(_order: &ByteOrder) -> Self {
        Self { bytes: [0u8; NET_HDR_SIZE] }
    }

    pub fn as_bytes(&self) -> &[u8; NET_HDR_SIZE] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_fully_zeroed() {
        let order = ByteOrder::native();
        let hdr = VirtioNetHdr::none(&order);
        assert_eq!(*hdr.as_bytes(), [0u8; NET_HDR_SIZE]);
    }
}
