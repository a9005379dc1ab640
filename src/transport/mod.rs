use bitflags::bitflags;

use crate::error::VirtIoResult;
use crate::PhysAddr;

pub mod mmio;

/// `VIRTIO_ID_*`, the device-type field every virtio transport exposes.
/// Only the two types this crate drives request protocols for are named;
/// anything else still round-trips through [`DeviceType::Other`] so the
/// transport and driver-matching layers work for devices this crate doesn't
/// implement a protocol for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceType {
    Network,
    Block,
    Other(u32),
}

impl From<u32> for DeviceType {
    fn from(id: u32) -> Self {
        match id {
            1 => DeviceType::Network,
            2 => DeviceType::Block,
            other => DeviceType::Other(other),
        }
    }
}

/// The device-facing half of a virtio transport: feature negotiation, queue
/// placement, notification and status, plus width-matched config-space
/// access. Implemented once per transport kind (here, just MMIO); a driver
/// never talks to registers directly, only through this trait, so it works
/// unchanged if a PCI transport is added later.
pub trait Transport: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Reads the device's full 64-bit feature bitmap (banked as two 32-bit
    /// halves on the wire).
    fn read_device_features(&mut self) -> VirtIoResult<u64>;

    /// Writes the negotiated subset back (also banked as two halves).
    fn write_driver_features(&mut self, features: u64) -> VirtIoResult<()>;

    /// `QUEUE_NUM_MAX` for the currently selected queue.
    fn max_queue_size(&mut self, queue: u16) -> VirtIoResult<u32>;

    /// Programs one queue's size and ring addresses and marks it live.
    fn set_queue(
        &mut self,
        queue: u16,
        queue_size: u16,
        descriptors: PhysAddr,
        driver_area: PhysAddr,
        device_area: PhysAddr,
    ) -> VirtIoResult<()>;

    /// Whether this transport needs the legacy single-contiguous-allocation
    /// queue layout (`vring_size`-based) rather than three independent
    /// addresses.
    fn requires_legacy_layout(&self) -> bool;

    fn notify(&mut self, queue: u16) -> VirtIoResult<()>;

    fn get_status(&self) -> VirtIoResult<DeviceStatus>;
    fn set_status(&mut self, status: DeviceStatus) -> VirtIoResult<()>;

    /// Writes status 0, which the device interprets as a full reset.
    fn reset(&mut self) -> VirtIoResult<()>;

    /// Monotonically-increasing counter the device bumps whenever config
    /// space changes; used to detect a torn read across several accesses.
    fn config_generation(&self) -> VirtIoResult<u32>;

    fn config_read8(&self, offset: usize) -> VirtIoResult<u8>;
    fn config_read16(&self, offset: usize) -> VirtIoResult<u16>;
    fn config_read32(&self, offset: usize) -> VirtIoResult<u32>;
    fn config_write8(&mut self, offset: usize, value: u8) -> VirtIoResult<()>;
}

/// Reads a multi-field config-space structure without tearing: retries the
/// whole read if [`Transport::config_generation`] changed partway through.
/// Grounded in `vm_get`/the generation dance in `virtio_mmio.c`, generalized
/// so block and net config reads share one implementation.
pub fn read_config_guarded<T, R>(
    transport: &T,
    mut read: impl FnMut(&T) -> VirtIoResult<R>,
) -> VirtIoResult<R>
where
    T: Transport + ?Sized,
{
    loop {
        let before = transport.config_generation()?;
        let value = read(transport)?;
        let after = transport.config_generation()?;
        if before == after {
            return Ok(value);
        }
    }
}

bitflags! {
    /// The device status field. Writing 0 into this field resets the device.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct DeviceStatus: u32 {
        /// Indicates that the guest OS has found the device and recognized it
        /// as a valid virtio device.
        const ACKNOWLEDGE = 1;
        /// Indicates that the guest OS knows how to drive the device.
        const DRIVER = 2;
        /// Indicates that something went wrong in the guest, and it has given
        /// up on the device. This could be an internal error, or the driver
        /// didn’t like the device for some reason, or even a fatal error
        /// during device operation.
        const FAILED = 128;
        /// Indicates that the driver has acknowledged all the features it
        /// understands, and feature negotiation is complete.
        const FEATURES_OK = 8;
        /// Indicates that the driver is set up and ready to drive the device.
        const DRIVER_OK = 4;
        /// Indicates that the device has experienced an error from which it
        /// can’t recover.
        const DEVICE_NEEDS_RESET = 64;
    }
}
