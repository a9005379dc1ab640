//! The collaborator contracts this crate asks its host to provide: a
//! page-aligned DMA allocator for virtqueue memory, and volatile MMIO
//! register access. Both traits are implemented outside this crate (the
//! crate itself is `#![forbid(unsafe_code)]`); a firmware binary backs
//! them with `unsafe` pointer access the way the pack's
//! `qemu/src/my_impl.rs` backs the teacher crate's equivalents.

use crate::error::VirtIoResult;
use crate::queue::{AvailRing, Descriptor, UsedRing};
use alloc::boxed::Box;

/// Volatile access to one MMIO register window. Implemented by whatever
/// owns the memory-mapped device: a device-model framework, a test mock,
/// or a raw pointer wrapper in firmware init code.
///
/// The core never coalesces accesses: one call here is one load/store at
/// the given byte offset.
pub trait VirtIoDeviceIo: Send + Sync {
    fn read8(&self, offset: usize) -> VirtIoResult<u8>;
    fn write8(&self, offset: usize, data: u8) -> VirtIoResult<()>;
    fn read16(&self, offset: usize) -> VirtIoResult<u16>;
    fn write16(&self, offset: usize, data: u16) -> VirtIoResult<()>;
    fn read32(&self, offset: usize) -> VirtIoResult<u32>;
    fn write32(&self, offset: usize, data: u32) -> VirtIoResult<()>;
}

/// A typed view over one virtqueue's backing DMA page(s): the descriptor
/// table, the available ring, and the used ring, each reachable at a byte
/// offset the ring engine computes from `SIZE`.
pub trait QueuePage<const SIZE: usize>: Send + Sync {
    fn descriptors(&self, offset: usize) -> &[Descriptor; SIZE];
    fn descriptors_mut(&mut self, offset: usize) -> &mut [Descriptor; SIZE];
    fn avail(&self, offset: usize) -> &AvailRing<SIZE>;
    fn avail_mut(&mut self, offset: usize) -> &mut AvailRing<SIZE>;
    fn used(&self, offset: usize) -> &UsedRing<SIZE>;
    fn used_mut(&mut self, offset: usize) -> &mut UsedRing<SIZE>;
    /// Physical (DMA) address of byte 0 of this allocation, i.e. of the
    /// descriptor table, which always sits at offset 0.
    fn phys_addr(&self) -> crate::PhysAddr;
}

/// The "allocator" collaborator: a page-aligned DMA allocator for virtqueue
/// memory, parameterized by the ring capacity it needs to back.
pub trait Hal<const SIZE: usize>: Send + Sync {
    /// Allocate `pages` page-aligned, zeroed pages of DMA memory and return
    /// a typed view over them sized for a `SIZE`-entry virtqueue.
    fn dma_alloc(pages: usize) -> VirtIoResult<Box<dyn QueuePage<SIZE>>>;
}
