//! The synchronous block device request protocol (component E).
//!
//! Ref: `drivers/block/virtio.c` (`virtblk_do_req`) and virtio spec 5.2.

mod ty;

use core::hint::spin_loop;
use core::marker::PhantomData;

pub use ty::{BlkConfig, BlkFeature, BlkReqHeader, BlkReqType, BlkRespStatus};
use ty::SUPPORTED_FEATURES;

use crate::byteorder::ByteOrder;
use crate::error::{VirtIoError, VirtIoResult};
use crate::hal::Hal;
use crate::queue::{Buffer, VirtQueue};
use crate::transport::mmio::has_version_1;
use crate::transport::{read_config_guarded, DeviceStatus, Transport};
use crate::{pages, PhysAddr};
use log::info;

pub const QUEUE_SIZE: usize = 16;
pub const SECTOR_SIZE: usize = 512;

/// A bound, fully initialized virtio block device.
pub struct VirtIOBlk<H: Hal<QUEUE_SIZE>, T: Transport> {
    transport: T,
    queue: VirtQueue<QUEUE_SIZE>,
    byte_order: ByteOrder,
    capacity_sectors: u64,
    _hal: PhantomData<H>,
}

/// Everything [`VirtIOBlk::init`] builds except the transport itself, which
/// the caller still owns by value and re-attaches afterwards.
struct Initialized<const QUEUE_SIZE: usize> {
    queue: VirtQueue<QUEUE_SIZE>,
    byte_order: ByteOrder,
    capacity_sectors: u64,
}

impl<H: Hal<QUEUE_SIZE>, T: Transport> VirtIOBlk<H, T> {
    /// Drives `transport` through the full device initialization handshake
    /// and sets up its single request queue.
    pub fn new(mut transport: T) -> VirtIoResult<Self> {
        match Self::init(&mut transport) {
            Ok(built) => Ok(Self {
                transport,
                queue: built.queue,
                byte_order: built.byte_order,
                capacity_sectors: built.capacity_sectors,
                _hal: PhantomData,
            }),
            Err(e) => {
                let status = transport.get_status().unwrap_or(DeviceStatus::empty());
                let _ = transport.set_status(status | DeviceStatus::FAILED);
                Err(e)
            }
        }
    }

    fn init(transport: &mut T) -> VirtIoResult<Initialized<QUEUE_SIZE>> {
        transport.reset()?;
        let mut status = DeviceStatus::ACKNOWLEDGE;
        transport.set_status(status)?;
        status |= DeviceStatus::DRIVER;
        transport.set_status(status)?;

        let device_features = transport.read_device_features()?;
        let negotiated = device_features & SUPPORTED_FEATURES.bits();
        transport.write_driver_features(negotiated)?;

        if !transport.requires_legacy_layout() && !has_version_1(negotiated) {
            return Err(VirtIoError::Unsupported);
        }
        if has_version_1(negotiated) {
            status |= DeviceStatus::FEATURES_OK;
            transport.set_status(status)?;
            if !transport.get_status()?.contains(DeviceStatus::FEATURES_OK) {
                return Err(VirtIoError::Unsupported);
            }
        }

        let byte_order = ByteOrder::new(has_version_1(negotiated), false);
        let event_idx_enabled = negotiated & BlkFeature::RING_EVENT_IDX.bits() != 0;

        let max_queue_size = transport.max_queue_size(0)?;
        if (max_queue_size as usize) < QUEUE_SIZE {
            return Err(VirtIoError::Unsupported);
        }

        let queue_page = H::dma_alloc(pages(VirtQueue::<QUEUE_SIZE>::total_size()))?;
        let queue = VirtQueue::new(queue_page, byte_order, event_idx_enabled)?;
        transport.set_queue(
            0,
            QUEUE_SIZE as u16,
            queue.desc_table_addr(),
            queue.avail_ring_addr(),
            queue.used_ring_addr(),
        )?;

        let config = read_config_guarded(transport, |t| {
            let low = t.config_read32(0)?;
            let high = t.config_read32(4)?;
            Ok(BlkConfig {
                capacity_sectors: (low as u64) | ((high as u64) << 32),
            })
        })?;

        status |= DeviceStatus::DRIVER_OK;
        transport.set_status(status)?;

        info!(
            "block device capacity: {} sectors ({}KB)",
            config.capacity_sectors,
            config.capacity_sectors / 2
        );

        Ok(Initialized {
            queue,
            byte_order,
            capacity_sectors: config.capacity_sectors,
        })
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    /// `buf.len()` must be a nonzero multiple of [`SECTOR_SIZE`].
    pub fn read_blocks(&mut self, sector: u64, buf: &mut [u8]) -> VirtIoResult<()> {
        if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
            return Err(VirtIoError::InvalidParam);
        }
        self.do_request(BlkReqType::In, sector, None, Some(buf))
    }

    /// `buf.len()` must be a nonzero multiple of [`SECTOR_SIZE`].
    pub fn write_blocks(&mut self, sector: u64, buf: &[u8]) -> VirtIoResult<()> {
        if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
            return Err(VirtIoError::InvalidParam);
        }
        self.do_request(BlkReqType::Out, sector, Some(buf), None)
    }

    fn do_request(
        &mut self,
        ty: BlkReqType,
        sector: u64,
        out: Option<&[u8]>,
        mut inp: Option<&mut [u8]>,
    ) -> VirtIoResult<()> {
        let req = BlkReqHeader::new(&self.byte_order, ty, sector);
        let mut resp = [0xffu8; 1];

        let mut buffers = alloc::vec::Vec::with_capacity(3);
        buffers.push(Buffer {
            addr: req.as_bytes().as_ptr() as PhysAddr,
            len: req.as_bytes().len() as u32,
            device_writable: false,
        });
        if let Some(out) = out {
            buffers.push(Buffer {
                addr: out.as_ptr() as PhysAddr,
                len: out.len() as u32,
                device_writable: false,
            });
        }
        if let Some(inp) = inp.as_deref_mut() {
            buffers.push(Buffer {
                addr: inp.as_mut_ptr() as PhysAddr,
                len: inp.len() as u32,
                device_writable: true,
            });
        }
        buffers.push(Buffer {
            addr: resp.as_mut_ptr() as PhysAddr,
            len: 1,
            device_writable: true,
        });

        let token = match self.queue.add(&buffers) {
            Ok(token) => token,
            Err(VirtIoError::NoSpace) => {
                // Courtesy kick: this request has outbound (host-readable)
                // segments sitting unsubmitted, so nudge the device in case
                // it has completions waiting that would free up room.
                if buffers.iter().any(|b| !b.device_writable) && self.queue.should_notify() {
                    self.transport.notify(0)?;
                }
                return Err(VirtIoError::NoSpace);
            }
            Err(e) => return Err(e),
        };
        if self.queue.should_notify() {
            self.transport.notify(0)?;
        }
        while !self.queue.can_pop() {
            spin_loop();
        }
        self.queue.pop_used(token)?;
        BlkRespStatus::from_byte(resp[0])?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::QueuePage;
    use crate::queue::{AvailRing, Descriptor, UsedRing};
    use crate::transport::DeviceType;
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use core::cell::RefCell;

    struct MockPage<const SIZE: usize> {
        desc: [Descriptor; SIZE],
        avail: AvailRing<SIZE>,
        used: UsedRing<SIZE>,
    }

    impl<const SIZE: usize> QueuePage<SIZE> for MockPage<SIZE> {
        fn descriptors(&self, _offset: usize) -> &[Descriptor; SIZE] {
            &self.desc
        }
        fn descriptors_mut(&mut self, _offset: usize) -> &mut [Descriptor; SIZE] {
            &mut self.desc
        }
        fn avail(&self, _offset: usize) -> &AvailRing<SIZE> {
            &self.avail
        }
        fn avail_mut(&mut self, _offset: usize) -> &mut AvailRing<SIZE> {
            &mut self.avail
        }
        fn used(&self, _offset: usize) -> &UsedRing<SIZE> {
            &self.used
        }
        fn used_mut(&mut self, _offset: usize) -> &mut UsedRing<SIZE> {
            &mut self.used
        }
        fn phys_addr(&self) -> PhysAddr {
            0x9000
        }
    }

    /// A `Transport` backed by an in-memory register map, standing in for a
    /// block device that advertises `capacity_bytes` sectors of capacity
    /// and never actually completes a request (notify is a no-op).
    struct MockTransport {
        regs: RefCell<BTreeMap<usize, u32>>,
        legacy: bool,
        reject_features_ok: bool,
    }

    impl MockTransport {
        fn new(capacity_sectors: u64, legacy: bool) -> Self {
            let mut regs = BTreeMap::new();
            regs.insert(0x200, capacity_sectors as u32);
            regs.insert(0x204, (capacity_sectors >> 32) as u32);
            Self {
                regs: RefCell::new(regs),
                legacy,
                reject_features_ok: false,
            }
        }
    }

    impl Transport for MockTransport {
        fn device_type(&self) -> DeviceType {
            DeviceType::Block
        }
        fn read_device_features(&mut self) -> VirtIoResult<u64> {
            Ok(BlkFeature::RING_EVENT_IDX.bits() | BlkFeature::VERSION_1.bits())
        }
        fn write_driver_features(&mut self, _features: u64) -> VirtIoResult<()> {
            Ok(())
        }
        fn max_queue_size(&mut self, _queue: u16) -> VirtIoResult<u32> {
            Ok(QUEUE_SIZE as u32)
        }
        fn set_queue(
            &mut self,
            _queue: u16,
            _queue_size: u16,
            _descriptors: PhysAddr,
            _driver_area: PhysAddr,
            _device_area: PhysAddr,
        ) -> VirtIoResult<()> {
            Ok(())
        }
        fn requires_legacy_layout(&self) -> bool {
            self.legacy
        }
        fn notify(&mut self, _queue: u16) -> VirtIoResult<()> {
            Ok(())
        }
        fn get_status(&self) -> VirtIoResult<DeviceStatus> {
            let bits = *self.regs.borrow().get(&0x070).unwrap_or(&0);
            Ok(DeviceStatus::from_bits_truncate(bits))
        }
        fn set_status(&mut self, status: DeviceStatus) -> VirtIoResult<()> {
            let mut status = status;
            if self.reject_features_ok {
                status.remove(DeviceStatus::FEATURES_OK);
            }
            self.regs.borrow_mut().insert(0x070, status.bits());
            Ok(())
        }
        fn reset(&mut self) -> VirtIoResult<()> {
            self.regs.borrow_mut().insert(0x070, 0);
            Ok(())
        }
        fn config_generation(&self) -> VirtIoResult<u32> {
            Ok(0)
        }
        fn config_read8(&self, offset: usize) -> VirtIoResult<u8> {
            Ok(*self.regs.borrow().get(&(0x200 + offset)).unwrap_or(&0) as u8)
        }
        fn config_read16(&self, offset: usize) -> VirtIoResult<u16> {
            Ok(*self.regs.borrow().get(&(0x200 + offset)).unwrap_or(&0) as u16)
        }
        fn config_read32(&self, offset: usize) -> VirtIoResult<u32> {
            Ok(*self.regs.borrow().get(&(0x200 + offset)).unwrap_or(&0))
        }
        fn config_write8(&mut self, offset: usize, value: u8) -> VirtIoResult<()> {
            self.regs.borrow_mut().insert(0x200 + offset, value as u32);
            Ok(())
        }
    }

    struct WorkingHal;
    impl Hal<QUEUE_SIZE> for WorkingHal {
        fn dma_alloc(_pages: usize) -> VirtIoResult<Box<dyn QueuePage<QUEUE_SIZE>>> {
            Ok(Box::new(MockPage::<QUEUE_SIZE> {
                desc: [Descriptor::default(); QUEUE_SIZE],
                avail: AvailRing::<QUEUE_SIZE>::zeroed(),
                used: UsedRing::<QUEUE_SIZE>::zeroed(),
            }))
        }
    }

    #[test]
    fn new_reads_capacity_from_config_space() {
        let transport = MockTransport::new(20_000, true);
        let blk = VirtIOBlk::<WorkingHal, MockTransport>::new(transport).unwrap();
        assert_eq!(blk.capacity_sectors(), 20_000);
    }

    #[test]
    fn new_sets_driver_ok_on_success() {
        let transport = MockTransport::new(1, false);
        let blk = VirtIOBlk::<WorkingHal, MockTransport>::new(transport).unwrap();
        let status = blk.transport.get_status().unwrap();
        assert!(status.contains(DeviceStatus::DRIVER_OK));
        assert!(!status.contains(DeviceStatus::FAILED));
    }

    #[test]
    fn new_fails_and_sets_failed_when_modern_device_rejects_features_ok() {
        let mut transport = MockTransport::new(1, false);
        transport.reject_features_ok = true;
        let err = VirtIOBlk::<WorkingHal, MockTransport>::new(transport);
        assert!(err.is_err());
    }

    #[test]
    fn read_blocks_rejects_non_sector_aligned_buffer() {
        let transport = MockTransport::new(1, true);
        let mut blk = VirtIOBlk::<WorkingHal, MockTransport>::new(transport).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(
            blk.read_blocks(0, &mut buf).unwrap_err(),
            VirtIoError::InvalidParam
        );
    }

    #[test]
    fn write_blocks_rejects_empty_buffer() {
        let transport = MockTransport::new(1, true);
        let mut blk = VirtIOBlk::<WorkingHal, MockTransport>::new(transport).unwrap();
        assert_eq!(
            blk.write_blocks(0, &[]).unwrap_err(),
            VirtIoError::InvalidParam
        );
    }

    #[test]
    fn resp_status_distinguishes_io_error_from_unsupported() {
        assert_eq!(
            BlkRespStatus::from_byte(1).unwrap().into_result().unwrap_err(),
            VirtIoError::IoError
        );
        assert_eq!(
            BlkRespStatus::from_byte(2).unwrap().into_result().unwrap_err(),
            VirtIoError::Unsupported
        );
        assert!(BlkRespStatus::from_byte(0).unwrap().into_result().is_ok());
    }
}
