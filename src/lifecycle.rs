//! Device lifecycle and driver registry (component D).
//!
//! This is the part of the crate that plays the role of `virtio_uclass.c`:
//! given a bound transport, walk it through the eight-step initialization
//! handshake from the virtio spec (3.1.1), picking a class driver out of a
//! registry by (vendor, device) match the way `virtio_find_and_bind_driver`
//! does.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{VirtIoError, VirtIoResult};
use crate::transport::mmio::has_version_1;
use crate::transport::{DeviceStatus, DeviceType, Transport};
use log::{debug, info};

/// Matches any vendor or device id. Mirrors `VIRTIO_DEV_ANY_ID` in
/// `virtio_uclass.c`.
pub const ANY_ID: u32 = 0xFFFF_FFFF;

/// One entry in a class driver's match table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MatchEntry {
    pub vendor: u32,
    pub device: u32,
}

impl MatchEntry {
    pub const fn new(vendor: u32, device: u32) -> Self {
        Self { vendor, device }
    }

    pub const fn any_vendor(device: u32) -> Self {
        Self::new(ANY_ID, device)
    }

    fn matches(&self, vendor: u32, device: u32) -> bool {
        (self.vendor == ANY_ID || self.vendor == vendor)
            && (self.device == ANY_ID || self.device == device)
    }
}

/// A class driver: declares which (vendor, device) pairs it wants, and
/// finishes initialization once the core has finished feature negotiation.
/// `probe` is called between `FEATURES_OK` and `DRIVER_OK`, matching where
/// `virtio_probe_child_device` calls the child uclass's probe method.
pub trait ClassDriver {
    /// The feature bits this driver knows how to use; ANDed with the
    /// device's own advertised features before `FEATURES_OK` is set.
    fn requested_features(&self) -> u64;

    /// Runs after features are finalized and before `DRIVER_OK`. Set up
    /// virtqueues and read config space here.
    fn probe(&mut self, transport: &mut dyn Transport) -> VirtIoResult<()>;
}

/// A linear, first-match-wins table of registered class drivers, exactly
/// like `virtio_find_and_bind_driver`'s walk over the uclass's driver list.
pub struct DriverRegistry {
    drivers: Vec<(MatchEntry, Box<dyn ClassDriver>)>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self { drivers: Vec::new() }
    }

    pub fn register(&mut self, entry: MatchEntry, driver: Box<dyn ClassDriver>) {
        self.drivers.push((entry, driver));
    }

    fn find(&mut self, vendor: u32, device: u32) -> Option<&mut Box<dyn ClassDriver>> {
        self.drivers
            .iter_mut()
            .find(|(entry, _)| entry.matches(vendor, device))
            .map(|(_, driver)| driver)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the full device initialization handshake against `transport`,
/// picking and probing a driver out of `registry`. On any failure past step
/// 2 (ACKNOWLEDGE), writes `FAILED` before returning the error, matching
/// `virtio_probe_child_device`'s cleanup path.
///
/// Steps (virtio spec 3.1.1):
/// 1. Reset the device.
/// 2. Set ACKNOWLEDGE.
/// 3. Find and bind a driver for this (vendor, device) pair.
/// 4. Set DRIVER.
/// 5. Negotiate features: AND device features with what the driver and
///    this crate both understand, write the result back.
/// 6. If this is a modern (v2) transport, set FEATURES_OK and re-read it to
///    confirm the device accepted the set.
/// 7. Probe the bound driver (queue setup, config reads).
/// 8. Set DRIVER_OK.
pub fn initialize_device(
    transport: &mut dyn Transport,
    registry: &mut DriverRegistry,
) -> VirtIoResult<()> {
    // Step 1.
    transport.reset()?;
    let mut status = DeviceStatus::empty();

    // Step 2.
    status |= DeviceStatus::ACKNOWLEDGE;
    transport.set_status(status)?;

    let result = drive_handshake(transport, registry, &mut status);
    if result.is_err() {
        let _ = transport.set_status(status | DeviceStatus::FAILED);
    }
    result
}

fn drive_handshake(
    transport: &mut dyn Transport,
    registry: &mut DriverRegistry,
    status: &mut DeviceStatus,
) -> VirtIoResult<()> {
    let vendor = match transport.device_type() {
        // Vendor id isn't exposed through `Transport` directly since only
        // MMIO needs it split out like this; class drivers that care about
        // vendor match on `ANY_ID` unless they're MMIO-specific, so this
        // crate treats it as opaque here and leaves exact vendor matching
        // to whatever constructs the registry.
        DeviceType::Network | DeviceType::Block | DeviceType::Other(_) => ANY_ID,
    };
    let device_id = match transport.device_type() {
        DeviceType::Network => 1,
        DeviceType::Block => 2,
        DeviceType::Other(id) => id,
    };

    // Step 3.
    let driver = registry
        .find(vendor, device_id)
        .ok_or(VirtIoError::Unsupported)?;

    // Step 4.
    *status |= DeviceStatus::DRIVER;
    transport.set_status(*status)?;

    // Step 5.
    let device_features = transport.read_device_features()?;
    let negotiated = device_features & driver.requested_features();
    debug!("negotiated features {:#x}", negotiated);
    transport.write_driver_features(negotiated)?;

    // Step 6. A modern transport must see VIRTIO_F_VERSION_1 come back in
    // the negotiated set. FEATURES_OK itself is gated on whether VERSION_1
    // was actually negotiated, not on the transport's wire layout: a legacy
    // transport that somehow did negotiate it still gets FEATURES_OK, and a
    // modern one that didn't still only fails via the check below, not by
    // silently setting the bit anyway.
    if !transport.requires_legacy_layout() && !has_version_1(negotiated) {
        return Err(VirtIoError::Unsupported);
    }
    if has_version_1(negotiated) {
        *status |= DeviceStatus::FEATURES_OK;
        transport.set_status(*status)?;
        let confirmed = transport.get_status()?;
        if !confirmed.contains(DeviceStatus::FEATURES_OK) {
            return Err(VirtIoError::Unsupported);
        }
    }

    // Step 7.
    driver.probe(transport)?;

    // Step 8.
    *status |= DeviceStatus::DRIVER_OK;
    transport.set_status(*status)?;
    info!("device bound, driver ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_entry_wildcards() {
        let any_vendor = MatchEntry::any_vendor(2);
        assert!(any_vendor.matches(0x1af4, 2));
        assert!(any_vendor.matches(0x9999, 2));
        assert!(!any_vendor.matches(0x1af4, 3));

        let exact = MatchEntry::new(0x1af4, 2);
        assert!(exact.matches(0x1af4, 2));
        assert!(!exact.matches(0x1af5, 2));
    }

    #[test]
    fn registry_first_match_wins() {
        struct Noop;
        impl ClassDriver for Noop {
            fn requested_features(&self) -> u64 {
                0
            }
            fn probe(&mut self, _transport: &mut dyn Transport) -> VirtIoResult<()> {
                Ok(())
            }
        }
        let mut registry = DriverRegistry::new();
        registry.register(MatchEntry::any_vendor(2), Box::new(Noop));
        registry.register(MatchEntry::new(0x1af4, 2), Box::new(Noop));
        assert!(registry.find(0x1af4, 2).is_some());
        assert!(registry.find(0x1234, 2).is_some());
        assert!(registry.find(0x1234, 3).is_none());
    }
}
