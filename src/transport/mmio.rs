//! The virtio-mmio transport state machine (component C): register layout,
//! the device-status handshake, feature negotiation and queue placement,
//! for both the legacy (v1) and modern (v2) register sets.
//!
//! Ref: virtio spec 4.2 (Virtio Over MMIO) and `drivers/virtio/virtio_mmio.c`.

use alloc::boxed::Box;

use crate::error::{VirtIoError, VirtIoResult};
use crate::hal::VirtIoDeviceIo;
use crate::transport::{DeviceStatus, DeviceType, Transport};
use crate::volatile::{ReadOnly, ReadVolatile, ReadWrite, WriteOnly, WriteVolatile};
use crate::{PhysAddr, PAGE_SIZE};
use log::{debug, warn};

pub const MAGIC: u32 = 0x_7472_6976;

/// Bit 32 of the feature bitmap: negotiating it switches the wire format to
/// little-endian-always and is what makes a modern (v2) transport legal.
const VIRTIO_F_VERSION_1: u64 = 1 << 32;

mod offset {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const VENDOR_ID: usize = 0x00c;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    pub const LEGACY_GUEST_PAGE_SIZE: usize = 0x028;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const LEGACY_QUEUE_ALIGN: usize = 0x03c;
    pub const LEGACY_QUEUE_PFN: usize = 0x040;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_DRIVER_LOW: usize = 0x090;
    pub const QUEUE_DRIVER_HIGH: usize = 0x094;
    pub const QUEUE_DEVICE_LOW: usize = 0x0a0;
    pub const QUEUE_DEVICE_HIGH: usize = 0x0a4;
    pub const CONFIG_GENERATION: usize = 0x0fc;
    pub const CONFIG: usize = 0x100;
}

/// A bound virtio-mmio device register window, at the point where
/// [`MmioTransport::new`] has confirmed the magic/version/device-id/
/// queue-max checks but has not yet touched the status register.
pub struct MmioTransport {
    io: Box<dyn VirtIoDeviceIo>,
    /// 1 for legacy, 2 for modern. Anything else is rejected in `new`.
    version: u32,
    device_id: u32,
}

impl MmioTransport {
    /// Probes the register window at `io` and returns a bound transport if
    /// it looks like a live virtio-mmio device: magic word present, version
    /// 1 or 2, non-zero device id. Matches the first three checks in
    /// `virtio_mmio_probe`.
    pub fn new(io: Box<dyn VirtIoDeviceIo>) -> VirtIoResult<Self> {
        let magic = ReadOnly::<{ offset::MAGIC }, u32>::default().read(&*io)?;
        if magic != MAGIC {
            warn!("invalid virtio-mmio magic value: {:#x}", magic);
            return Err(VirtIoError::NotPresent);
        }
        let version = ReadOnly::<{ offset::VERSION }, u32>::default().read(&*io)?;
        if version != 1 && version != 2 {
            warn!("unsupported virtio-mmio version: {version}");
            return Err(VirtIoError::Unsupported);
        }
        let device_id = ReadOnly::<{ offset::DEVICE_ID }, u32>::default().read(&*io)?;
        if device_id == 0 {
            return Err(VirtIoError::NotPresent);
        }
        debug!("detected virtio-mmio device id {device_id}, version {version}");
        Ok(Self { io, version, device_id })
    }

    pub fn vendor_id(&self) -> VirtIoResult<u32> {
        ReadOnly::<{ offset::VENDOR_ID }, u32>::default().read(&*self.io)
    }

    pub fn is_legacy(&self) -> bool {
        self.version == 1
    }

    fn select_queue(&mut self, queue: u16) -> VirtIoResult<()> {
        WriteOnly::<{ offset::QUEUE_SEL }, u32>::default().write(queue as u32, &*self.io)
    }
}

impl Transport for MmioTransport {
    fn device_type(&self) -> DeviceType {
        DeviceType::from(self.device_id)
    }

    fn read_device_features(&mut self) -> VirtIoResult<u64> {
        WriteOnly::<{ offset::DEVICE_FEATURES_SEL }, u32>::default().write(0, &*self.io)?;
        let low = ReadOnly::<{ offset::DEVICE_FEATURES }, u32>::default().read(&*self.io)?;
        WriteOnly::<{ offset::DEVICE_FEATURES_SEL }, u32>::default().write(1, &*self.io)?;
        let high = ReadOnly::<{ offset::DEVICE_FEATURES }, u32>::default().read(&*self.io)?;
        Ok((low as u64) | ((high as u64) << 32))
    }

    fn write_driver_features(&mut self, features: u64) -> VirtIoResult<()> {
        WriteOnly::<{ offset::DRIVER_FEATURES_SEL }, u32>::default().write(0, &*self.io)?;
        WriteOnly::<{ offset::DRIVER_FEATURES }, u32>::default().write(features as u32, &*self.io)?;
        WriteOnly::<{ offset::DRIVER_FEATURES_SEL }, u32>::default().write(1, &*self.io)?;
        WriteOnly::<{ offset::DRIVER_FEATURES }, u32>::default()
            .write((features >> 32) as u32, &*self.io)
    }

    fn max_queue_size(&mut self, queue: u16) -> VirtIoResult<u32> {
        self.select_queue(queue)?;
        ReadOnly::<{ offset::QUEUE_NUM_MAX }, u32>::default().read(&*self.io)
    }

    fn set_queue(
        &mut self,
        queue: u16,
        queue_size: u16,
        descriptors: PhysAddr,
        driver_area: PhysAddr,
        device_area: PhysAddr,
    ) -> VirtIoResult<()> {
        self.select_queue(queue)?;
        let ready = ReadWrite::<{ offset::QUEUE_READY }, u32>::default().read(&*self.io)?;
        if ready != 0 {
            return Err(VirtIoError::AlreadySet);
        }
        WriteOnly::<{ offset::QUEUE_NUM }, u32>::default().write(queue_size as u32, &*self.io)?;
        if self.is_legacy() {
            // The legacy layout packs descriptors/avail/used into one
            // contiguous, page-aligned allocation: the device only ever
            // learns the page number of byte 0.
            WriteOnly::<{ offset::LEGACY_QUEUE_ALIGN }, u32>::default()
                .write(PAGE_SIZE as u32, &*self.io)?;
            let pfn = descriptors / PAGE_SIZE;
            ReadWrite::<{ offset::LEGACY_QUEUE_PFN }, u32>::default().write(pfn as u32, &*self.io)
        } else {
            WriteOnly::<{ offset::QUEUE_DESC_LOW }, u32>::default()
                .write(descriptors as u32, &*self.io)?;
            WriteOnly::<{ offset::QUEUE_DESC_HIGH }, u32>::default()
                .write((descriptors as u64 >> 32) as u32, &*self.io)?;
            WriteOnly::<{ offset::QUEUE_DRIVER_LOW }, u32>::default()
                .write(driver_area as u32, &*self.io)?;
            WriteOnly::<{ offset::QUEUE_DRIVER_HIGH }, u32>::default()
                .write((driver_area as u64 >> 32) as u32, &*self.io)?;
            WriteOnly::<{ offset::QUEUE_DEVICE_LOW }, u32>::default()
                .write(device_area as u32, &*self.io)?;
            WriteOnly::<{ offset::QUEUE_DEVICE_HIGH }, u32>::default()
                .write((device_area as u64 >> 32) as u32, &*self.io)?;
            ReadWrite::<{ offset::QUEUE_READY }, u32>::default().write(1, &*self.io)
        }
    }

    fn requires_legacy_layout(&self) -> bool {
        self.is_legacy()
    }

    fn notify(&mut self, queue: u16) -> VirtIoResult<()> {
        WriteOnly::<{ offset::QUEUE_NOTIFY }, u32>::default().write(queue as u32, &*self.io)
    }

    fn get_status(&self) -> VirtIoResult<DeviceStatus> {
        let bits = ReadWrite::<{ offset::STATUS }, u32>::default().read(&*self.io)?;
        Ok(DeviceStatus::from_bits_truncate(bits))
    }

    fn set_status(&mut self, status: DeviceStatus) -> VirtIoResult<()> {
        ReadWrite::<{ offset::STATUS }, u32>::default().write(status.bits(), &*self.io)
    }

    fn reset(&mut self) -> VirtIoResult<()> {
        ReadWrite::<{ offset::STATUS }, u32>::default().write(0, &*self.io)
    }

    fn config_generation(&self) -> VirtIoResult<u32> {
        ReadOnly::<{ offset::CONFIG_GENERATION }, u32>::default().read(&*self.io)
    }

    fn config_read8(&self, offset: usize) -> VirtIoResult<u8> {
        self.io.read8(offset::CONFIG + offset)
    }

    fn config_read16(&self, offset: usize) -> VirtIoResult<u16> {
        self.io.read16(offset::CONFIG + offset)
    }

    fn config_read32(&self, offset: usize) -> VirtIoResult<u32> {
        self.io.read32(offset::CONFIG + offset)
    }

    fn config_write8(&mut self, offset: usize, value: u8) -> VirtIoResult<()> {
        self.io.write8(offset::CONFIG + offset, value)
    }
}

/// Whether `VIRTIO_F_VERSION_1` must appear in the negotiated feature set
/// for this transport version. Legacy (v1) never requires it; modern (v2)
/// always does. Mirrors `vm_finalize_features`.
pub(crate) const fn version_1_required(version: u32) -> bool {
    version == 2
}

pub(crate) const fn has_version_1(features: u64) -> bool {
    features & VIRTIO_F_VERSION_1 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use core::cell::RefCell;

    struct FakeRegs {
        regs: RefCell<BTreeMap<usize, u32>>,
    }

    impl FakeRegs {
        fn new(device_id: u32, version: u32) -> Self {
            let mut regs = BTreeMap::new();
            regs.insert(offset::MAGIC, MAGIC);
            regs.insert(offset::VERSION, version);
            regs.insert(offset::DEVICE_ID, device_id);
            regs.insert(offset::VENDOR_ID, 0x1af4);
            regs.insert(offset::QUEUE_READY, 0);
            regs.insert(offset::STATUS, 0);
            regs.insert(offset::CONFIG_GENERATION, 0);
            Self { regs: RefCell::new(regs) }
        }
    }

    impl VirtIoDeviceIo for FakeRegs {
        fn read8(&self, offset: usize) -> VirtIoResult<u8> {
            Ok(*self.regs.borrow().get(&offset).unwrap_or(&0) as u8)
        }
        fn write8(&self, offset: usize, data: u8) -> VirtIoResult<()> {
            self.regs.borrow_mut().insert(offset, data as u32);
            Ok(())
        }
        fn read16(&self, offset: usize) -> VirtIoResult<u16> {
            Ok(*self.regs.borrow().get(&offset).unwrap_or(&0) as u16)
        }
        fn write16(&self, offset: usize, data: u16) -> VirtIoResult<()> {
            self.regs.borrow_mut().insert(offset, data as u32);
            Ok(())
        }
        fn read32(&self, offset: usize) -> VirtIoResult<u32> {
            Ok(*self.regs.borrow().get(&offset).unwrap_or(&0))
        }
        fn write32(&self, offset: usize, data: u32) -> VirtIoResult<()> {
            self.regs.borrow_mut().insert(offset, data);
            Ok(())
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let regs = FakeRegs::new(2, 2);
        regs.regs.borrow_mut().insert(offset::MAGIC, 0xdead_beef);
        assert_eq!(
            MmioTransport::new(Box::new(regs)).unwrap_err(),
            VirtIoError::NotPresent
        );
    }

    #[test]
    fn rejects_bad_version_as_unsupported_not_absent() {
        let regs = FakeRegs::new(2, 3);
        assert_eq!(
            MmioTransport::new(Box::new(regs)).unwrap_err(),
            VirtIoError::Unsupported
        );
    }

    #[test]
    fn rejects_zero_device_id() {
        let regs = FakeRegs::new(0, 2);
        assert_eq!(
            MmioTransport::new(Box::new(regs)).unwrap_err(),
            VirtIoError::NotPresent
        );
    }

    #[test]
    fn probes_block_device_and_reports_type() {
        let regs = FakeRegs::new(2, 2);
        let transport = MmioTransport::new(Box::new(regs)).unwrap();
        assert_eq!(transport.device_type(), DeviceType::Block);
        assert!(!transport.is_legacy());
    }

    #[test]
    fn second_set_queue_on_same_index_is_already_set() {
        let regs = FakeRegs::new(1, 2);
        let mut transport = MmioTransport::new(Box::new(regs)).unwrap();
        transport.set_queue(0, 8, 0x1000, 0x2000, 0x3000).unwrap();
        assert_eq!(
            transport.set_queue(0, 8, 0x1000, 0x2000, 0x3000).unwrap_err(),
            VirtIoError::AlreadySet
        );
    }

    #[test]
    fn version_1_required_only_on_modern_transport() {
        assert!(!version_1_required(1));
        assert!(version_1_required(2));
        assert!(has_version_1(VIRTIO_F_VERSION_1));
        assert!(!has_version_1(0));
    }

    #[test]
    fn config_generation_guard_retries_on_mismatch() {
        let regs = FakeRegs::new(2, 2);
        regs.regs.borrow_mut().insert(offset::CONFIG_GENERATION, 0);
        let transport = MmioTransport::new(Box::new(regs)).unwrap();
        let mut calls = 0;
        let value = crate::transport::read_config_guarded(&transport, |t| {
            calls += 1;
            if calls == 1 {
                // Simulate the device bumping the generation mid-read by
                // writing it again before the guard's second check.
                t.io
                    .write32(offset::CONFIG_GENERATION, 1)
                    .expect("fake io never fails");
            }
            t.config_read32(0)
        })
        .unwrap();
        assert_eq!(value, 0);
        assert_eq!(calls, 2);
    }
}
