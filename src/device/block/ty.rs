use bitflags::bitflags;

use crate::error::{VirtIoError, VirtIoResult};

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct BlkFeature: u64 {
        /// Device supports request barriers. (legacy)
        const BARRIER       = 1 << 0;
        /// Maximum size of any single segment is in `size_max`.
        const SIZE_MAX      = 1 << 1;
        /// Maximum number of segments in a request is in `seg_max`.
        const SEG_MAX       = 1 << 2;
        /// Disk-style geometry specified in geometry.
        const GEOMETRY      = 1 << 4;
        /// Device is read-only.
        const RO            = 1 << 5;
        /// Block size of disk is in `blk_size`.
        const BLK_SIZE      = 1 << 6;
        /// Cache flush command support.
        const FLUSH         = 1 << 9;
        /// Device exports information on optimal I/O alignment.
        const TOPOLOGY      = 1 << 10;
        /// Device can toggle its cache between writeback and writethrough modes.
        const CONFIG_WCE    = 1 << 11;

        const RING_EVENT_IDX = 1 << 29;
        const VERSION_1       = 1 << 32;
    }
}

/// The feature subset this driver asks for: none of them change request
/// framing (barriers/discard/multiqueue and the rest are out of scope), so
/// the only bits actually requested are the one that lets the transport
/// negotiate event-index suppression and `VERSION_1` itself, which a modern
/// transport requires back in the negotiated set before it will accept
/// `FEATURES_OK`.
pub const SUPPORTED_FEATURES: BlkFeature = BlkFeature::RING_EVENT_IDX.union(BlkFeature::VERSION_1);

#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum BlkReqType {
    In = 0,
    Out = 1,
}

/// The 16-byte request header that precedes every block request's data
/// segment. Stored as raw wire bytes (little-endian once `VERSION_1` is
/// negotiated, legacy-native otherwise), same as the ring itself.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlkReqHeader {
    bytes: [u8; 16],
}

impl BlkReqHeader {
    pub fn new(order: &crate::byteorder::ByteOrder, ty: BlkReqType, sector: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&order.write_u32(ty as u32));
        // bytes[4..8] reserved, left zero
        bytes[8..16].copy_from_slice(&order.write_u64(sector));
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }
}

/// `VIRTIO_BLK_S_*`. Kept as three distinct outcomes rather than collapsed
/// into one generic I/O error, since callers (and tests) care which one
/// happened.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlkRespStatus {
    Ok,
    IoErr,
    Unsupported,
}

impl BlkRespStatus {
    pub fn from_byte(byte: u8) -> VirtIoResult<Self> {
        match byte {
            0 => Ok(Self::Ok),
            1 => Ok(Self::IoErr),
            2 => Ok(Self::Unsupported),
            _ => Err(VirtIoError::ProtocolError),
        }
    }

    pub fn into_result(self) -> VirtIoResult<()> {
        match self {
            Self::Ok => Ok(()),
            Self::IoErr => Err(VirtIoError::IoError),
            Self::Unsupported => Err(VirtIoError::Unsupported),
        }
    }
}

/// Config space laid out per virtio spec 5.2.4, limited to the fields this
/// driver actually reads: everything past `capacity` (geometry, discard
/// limits, and the rest) is out of scope.
#[derive(Debug, Clone, Copy)]
pub struct BlkConfig {
    pub capacity_sectors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byteorder::ByteOrder;

    #[test]
    fn header_encodes_type_and_sector_little_endian_when_modern() {
        let order = ByteOrder::new(true, true);
        let header = BlkReqHeader::new(&order, BlkReqType::Out, 0x42);
        let bytes = header.as_bytes();
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &[0x42, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn header_follows_guest_native_order_when_legacy() {
        let order = ByteOrder::new(false, true);
        let header = BlkReqHeader::new(&order, BlkReqType::In, 1);
        let bytes = header.as_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn resp_status_rejects_unknown_byte() {
        assert_eq!(
            BlkRespStatus::from_byte(0xaa).unwrap_err(),
            VirtIoError::ProtocolError
        );
    }
}
