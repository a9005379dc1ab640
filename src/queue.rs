//! The split virtqueue ring engine (component B).
//!
//! A virtqueue is a descriptor table plus two rings (available, used) in one
//! contiguous, page-aligned DMA allocation. The driver and the device each
//! own one ring: the driver publishes descriptor chains on the available
//! ring, the device consumes them and publishes completions on the used
//! ring. [`VirtQueue`] owns the free-descriptor list and the index
//! bookkeeping; it never allocates or frees the backing memory itself, that
//! is [`crate::hal::Hal::dma_alloc`]'s job.

use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;
use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use log::trace;

use crate::byteorder::ByteOrder;
use crate::error::{VirtIoError, VirtIoResult};
use crate::hal::QueuePage;
use crate::{align_up, PhysAddr, PAGE_SIZE};

bitflags! {
    /// `VRING_DESC_F_*`. Indirect descriptors are out of scope; no bit is
    /// defined for them here.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct DescFlags: u16 {
        /// This descriptor continues via `next`.
        const NEXT = 1;
        /// Buffer is device-writable (host writes into it). Omitted means
        /// device-readable (driver wrote it).
        const WRITE = 2;
    }
}

bitflags! {
    /// `VRING_USED_F_*`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    struct UsedFlags: u16 {
        const NO_NOTIFY = 1;
    }
}

/// One descriptor. Every scalar field is stored as raw wire bytes and is
/// only ever interpreted through a [`ByteOrder`], so the in-memory layout
/// never depends on the host's own endianness.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    addr: [u8; 8],
    len: [u8; 4],
    flags: [u8; 2],
    next: [u8; 2],
}

static_assertions::const_assert_eq!(size_of::<Descriptor>(), 16);

impl Descriptor {
    fn write(&mut self, order: &ByteOrder, addr: PhysAddr, len: u32, flags: DescFlags, next: u16) {
        self.addr = order.write_u64(addr as u64);
        self.len = order.write_u32(len);
        self.flags = order.write_u16(flags.bits());
        self.next = order.write_u16(next);
    }

    fn flags(&self, order: &ByteOrder) -> DescFlags {
        DescFlags::from_bits_truncate(order.read_u16(self.flags))
    }

    fn next(&self, order: &ByteOrder) -> u16 {
        order.read_u16(self.next)
    }

    fn set_next(&mut self, order: &ByteOrder, next: u16) {
        self.next = order.write_u16(next);
    }
}

/// The driver-owned ring: descriptor chain heads the driver has submitted,
/// not yet necessarily consumed by the device.
#[repr(C)]
#[derive(Debug)]
pub struct AvailRing<const SIZE: usize> {
    flags: [u8; 2],
    idx: [u8; 2],
    ring: [[u8; 2]; SIZE],
    /// Only meaningful with `VIRTIO_F_EVENT_IDX`: where the driver wants the
    /// device to raise its next interrupt. Interrupts are out of scope here,
    /// so this crate never reads it back, only keeps the field present.
    used_event: [u8; 2],
}

impl<const SIZE: usize> AvailRing<SIZE> {
    pub(crate) fn zeroed() -> Self {
        Self {
            flags: [0; 2],
            idx: [0; 2],
            ring: [[0; 2]; SIZE],
            used_event: [0; 2],
        }
    }

    fn idx(&self, order: &ByteOrder) -> u16 {
        order.read_u16(self.idx)
    }

    fn set_idx(&mut self, order: &ByteOrder, idx: u16) {
        self.idx = order.write_u16(idx);
    }

    fn set_entry(&mut self, order: &ByteOrder, slot: usize, desc_id: u16) {
        self.ring[slot] = order.write_u16(desc_id);
    }
}

/// One completion record on the device-owned ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct UsedElem {
    id: [u8; 4],
    len: [u8; 4],
}

impl UsedElem {
    fn id(&self, order: &ByteOrder) -> u32 {
        order.read_u32(self.id)
    }

    fn len(&self, order: &ByteOrder) -> u32 {
        order.read_u32(self.len)
    }
}

/// The device-owned ring: completed descriptor chains, in the order the
/// device finished them (not necessarily submission order).
#[repr(C)]
#[derive(Debug)]
pub struct UsedRing<const SIZE: usize> {
    flags: [u8; 2],
    idx: [u8; 2],
    ring: [UsedElem; SIZE],
    /// Only meaningful with `VIRTIO_F_EVENT_IDX`: the avail idx at which the
    /// device wants its next kick.
    avail_event: [u8; 2],
}

impl<const SIZE: usize> UsedRing<SIZE> {
    pub(crate) fn zeroed() -> Self {
        Self {
            flags: [0; 2],
            idx: [0; 2],
            ring: [UsedElem::default(); SIZE],
            avail_event: [0; 2],
        }
    }

    fn idx(&self, order: &ByteOrder) -> u16 {
        order.read_u16(self.idx)
    }

    fn flags(&self, order: &ByteOrder) -> UsedFlags {
        UsedFlags::from_bits_truncate(order.read_u16(self.flags))
    }

    fn avail_event(&self, order: &ByteOrder) -> u16 {
        order.read_u16(self.avail_event)
    }
}

/// `new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)`: the
/// standard event-index test, ported from `vring_need_event` in
/// `virtio_ring.c`. True when the device's requested notification point
/// falls strictly within `(old, new]`.
fn vring_need_event(event: u16, new_idx: u16, old_idx: u16) -> bool {
    new_idx
        .wrapping_sub(event)
        .wrapping_sub(1)
        < new_idx.wrapping_sub(old_idx)
}

/// One buffer segment to hand to the device: a physical address, a length,
/// and which side writes into it.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub addr: PhysAddr,
    pub len: u32,
    pub device_writable: bool,
}

/// A split virtqueue with a fixed, compile-time capacity.
///
/// `SIZE` mirrors the teacher crate's own per-device queue-size constants:
/// the negotiated `QUEUE_NUM_MAX` is clamped down to a size the caller
/// picked at compile time via [`chosen_queue_size`], rather than the ring
/// itself shrinking at runtime.
pub struct VirtQueue<const SIZE: usize> {
    queue_page: alloc::boxed::Box<dyn QueuePage<SIZE>>,
    byte_order: ByteOrder,
    /// Head of the free-descriptor singly linked list, threaded through
    /// `Descriptor::next`.
    free_head: u16,
    num_free: u16,
    avail_idx_shadow: u16,
    avail_idx_at_last_kick: u16,
    last_used_idx: u16,
    event_idx_enabled: bool,
}

/// Prints the shadow-state fields, not the ring contents: the equivalent of
/// what a `dump_virtqueue`-style debug dump would show without walking the
/// descriptor table itself.
impl<const SIZE: usize> fmt::Debug for VirtQueue<SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtQueue")
            .field("size", &SIZE)
            .field("free_head", &self.free_head)
            .field("num_free", &self.num_free)
            .field("avail_idx_shadow", &self.avail_idx_shadow)
            .field("avail_idx_at_last_kick", &self.avail_idx_at_last_kick)
            .field("last_used_idx", &self.last_used_idx)
            .field("event_idx_enabled", &self.event_idx_enabled)
            .finish()
    }
}

impl<const SIZE: usize> VirtQueue<SIZE> {
    const DESC_OFFSET: usize = 0;
    const AVAIL_OFFSET: usize = size_of::<Descriptor>() * SIZE;
    const USED_OFFSET: usize =
        align_up(size_of::<Descriptor>() * SIZE + size_of::<AvailRing<SIZE>>(), PAGE_SIZE);

    /// Total bytes the legacy (page-aligned) layout needs for a queue of
    /// this capacity, including the used ring's own page alignment.
    pub const fn total_size() -> usize {
        Self::USED_OFFSET + size_of::<UsedRing<SIZE>>()
    }

    pub fn new(
        mut queue_page: alloc::boxed::Box<dyn QueuePage<SIZE>>,
        byte_order: ByteOrder,
        event_idx_enabled: bool,
    ) -> VirtIoResult<Self> {
        if SIZE == 0 || SIZE > u16::MAX as usize {
            return Err(VirtIoError::InvalidParam);
        }
        {
            let desc = queue_page.descriptors_mut(Self::DESC_OFFSET);
            for (i, d) in desc.iter_mut().enumerate() {
                *d = Descriptor::default();
                let next = if i + 1 < SIZE { (i + 1) as u16 } else { 0 };
                d.set_next(&byte_order, next);
            }
        }
        *queue_page.avail_mut(Self::AVAIL_OFFSET) = AvailRing::zeroed();
        *queue_page.used_mut(Self::USED_OFFSET) = UsedRing::zeroed();
        Ok(Self {
            queue_page,
            byte_order,
            free_head: 0,
            num_free: SIZE as u16,
            avail_idx_shadow: 0,
            avail_idx_at_last_kick: 0,
            last_used_idx: 0,
            event_idx_enabled,
        })
    }

    pub fn desc_table_addr(&self) -> PhysAddr {
        self.queue_page.phys_addr() + Self::DESC_OFFSET
    }

    pub fn avail_ring_addr(&self) -> PhysAddr {
        self.queue_page.phys_addr() + Self::AVAIL_OFFSET
    }

    pub fn used_ring_addr(&self) -> PhysAddr {
        self.queue_page.phys_addr() + Self::USED_OFFSET
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    pub fn is_empty(&self) -> bool {
        self.num_free as usize == SIZE
    }

    /// Submits a descriptor chain built from `buffers`, in order, and
    /// returns the head descriptor id (the token later passed to
    /// [`Self::pop_used`]).
    ///
    /// On `NoSpace`, the caller should ring the doorbell as a courtesy
    /// before propagating the error, in case the host has completions
    /// sitting unconsumed that would free up room: call [`Self::should_notify`]
    /// and notify the transport if it returns true. `VirtQueue` doesn't hold
    /// a transport handle itself, so it can't do this kick directly.
    pub fn add(&mut self, buffers: &[Buffer]) -> VirtIoResult<u16> {
        if buffers.is_empty() {
            return Err(VirtIoError::InvalidParam);
        }
        if (self.num_free as usize) < buffers.len() {
            return Err(VirtIoError::NoSpace);
        }

        let mut ids = Vec::with_capacity(buffers.len());
        {
            let desc = self.queue_page.descriptors(Self::DESC_OFFSET);
            let mut cur = self.free_head;
            for _ in 0..buffers.len() {
                ids.push(cur);
                cur = desc[cur as usize].next(&self.byte_order);
            }
            self.free_head = cur;
        }

        {
            let desc = self.queue_page.descriptors_mut(Self::DESC_OFFSET);
            for (i, buf) in buffers.iter().enumerate() {
                let mut flags = if buf.device_writable {
                    DescFlags::WRITE
                } else {
                    DescFlags::empty()
                };
                let next = if i + 1 < ids.len() {
                    flags |= DescFlags::NEXT;
                    ids[i + 1]
                } else {
                    0
                };
                desc[ids[i] as usize].write(&self.byte_order, buf.addr, buf.len, flags, next);
            }
        }
        self.num_free -= buffers.len() as u16;

        let head = ids[0];
        let slot = (self.avail_idx_shadow as usize) % SIZE;
        let avail = self.queue_page.avail_mut(Self::AVAIL_OFFSET);
        avail.set_entry(&self.byte_order, slot, head);

        // The device must never observe the new avail.idx before it can see
        // the descriptor chain and ring entry that idx points at.
        fence(Ordering::Release);

        self.avail_idx_shadow = self.avail_idx_shadow.wrapping_add(1);
        avail.set_idx(&self.byte_order, self.avail_idx_shadow);
        trace!("queue after add: {:?}", self);
        Ok(head)
    }

    /// Whether the device should be notified (kicked) after the adds done
    /// since the last call to this method. Always call this after `add`,
    /// before deciding whether to notify: it also resets the event-index
    /// baseline for the next round.
    pub fn should_notify(&mut self) -> bool {
        // Full fence: the device must be able to see the avail entries this
        // round's `add` calls published before we act on its feedback
        // (avail_event / used.flags).
        fence(Ordering::SeqCst);

        // If this many chains have been published since the last kick
        // without a notify, force one regardless of the event-index/
        // NO_NOTIFY hint: one more add would wrap `num_added` and could hide
        // a publish across the wrap.
        let num_added = self.avail_idx_shadow.wrapping_sub(self.avail_idx_at_last_kick);
        let forced = num_added == u16::MAX;

        let notify = if forced {
            true
        } else if self.event_idx_enabled {
            let used = self.queue_page.used(Self::USED_OFFSET);
            let event = used.avail_event(&self.byte_order);
            vring_need_event(event, self.avail_idx_shadow, self.avail_idx_at_last_kick)
        } else {
            let used = self.queue_page.used(Self::USED_OFFSET);
            !used.flags(&self.byte_order).contains(UsedFlags::NO_NOTIFY)
        };
        self.avail_idx_at_last_kick = self.avail_idx_shadow;
        notify
    }

    /// Whether the device has completed at least one more chain than the
    /// driver has consumed, without consuming it.
    pub fn can_pop(&self) -> bool {
        let used = self.queue_page.used(Self::USED_OFFSET);
        used.idx(&self.byte_order) != self.last_used_idx
    }

    /// The head descriptor id of the next unconsumed used-ring entry, if
    /// any, without freeing its descriptors. Used by non-blocking receive
    /// paths that need to know which buffer completed before deciding how
    /// to handle it.
    pub fn peek_used(&self) -> Option<u16> {
        if !self.can_pop() {
            return None;
        }
        let used = self.queue_page.used(Self::USED_OFFSET);
        let slot = (self.last_used_idx as usize) % SIZE;
        Some(used.ring[slot].id(&self.byte_order) as u16)
    }

    /// Consumes the oldest unconsumed used-ring entry, which must belong to
    /// `token` (the id returned by the matching `add`), frees its
    /// descriptor chain, and returns the byte length the device wrote.
    pub fn pop_used(&mut self, token: u16) -> VirtIoResult<u32> {
        if !self.can_pop() {
            return Err(VirtIoError::NotReady);
        }
        // Pairs with the Release fence in `add`: makes sure we read the
        // used-ring entry the device wrote, not a stale one.
        fence(Ordering::Acquire);
        let used = self.queue_page.used(Self::USED_OFFSET);
        let slot = (self.last_used_idx as usize) % SIZE;
        let elem = used.ring[slot];
        let id = elem.id(&self.byte_order) as u16;
        if id != token {
            return Err(VirtIoError::ProtocolError);
        }
        let len = elem.len(&self.byte_order);
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        self.free_chain(token);
        Ok(len)
    }

    fn free_chain(&mut self, head: u16) {
        let desc = self.queue_page.descriptors_mut(Self::DESC_OFFSET);
        let mut tail = head;
        let mut freed = 1u16;
        while desc[tail as usize].flags(&self.byte_order).contains(DescFlags::NEXT) {
            tail = desc[tail as usize].next(&self.byte_order);
            freed += 1;
        }
        desc[tail as usize].set_next(&self.byte_order, self.free_head);
        self.free_head = head;
        self.num_free += freed;
    }
}

/// The legacy `vring_size()` formula from the virtio spec: total bytes for a
/// `queue_size`-entry ring laid out with the descriptor table and available
/// ring packed together, `align`-rounded, followed directly by the used
/// ring. Exposed so callers picking a compile-time [`VirtQueue`] capacity
/// can reason about the allocation the same way the wire format does.
pub const fn vring_size(queue_size: usize, align: usize) -> usize {
    let desc_and_avail = size_of::<Descriptor>() * queue_size + 6 + 2 * queue_size;
    let aligned = (desc_and_avail + align - 1) & !(align - 1);
    let used = 6 + 8 * queue_size;
    aligned + used
}

/// Picks the compile-time queue capacity to use for a device whose
/// `QUEUE_NUM_MAX` is `device_max`, never exceeding `requested`.
pub const fn chosen_queue_size(device_max: u32, requested: usize) -> usize {
    if (device_max as usize) < requested {
        device_max as usize
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::QueuePage;
    use alloc::boxed::Box;

    struct MockPage<const SIZE: usize> {
        desc: [Descriptor; SIZE],
        avail: AvailRing<SIZE>,
        used: UsedRing<SIZE>,
    }

    impl<const SIZE: usize> MockPage<SIZE> {
        fn new() -> Self {
            Self {
                desc: [Descriptor::default(); SIZE],
                avail: AvailRing::zeroed(),
                used: UsedRing::zeroed(),
            }
        }
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
            0x1000
        }
    }

    fn new_queue<const SIZE: usize>() -> VirtQueue<SIZE> {
        VirtQueue::new(Box::new(MockPage::<SIZE>::new()), ByteOrder::native(), false).unwrap()
    }

    /// Simulates the device consuming whatever is on the avail ring and
    /// completing it immediately, writing one used-ring entry per chain
    /// head it sees.
    fn device_completes<const SIZE: usize>(q: &mut VirtQueue<SIZE>, len: u32) {
        let avail_idx = q.queue_page.avail(VirtQueue::<SIZE>::AVAIL_OFFSET).idx(&q.byte_order);
        let used = q.queue_page.used_mut(VirtQueue::<SIZE>::USED_OFFSET);
        let used_idx = used.idx(&q.byte_order);
        if used_idx == avail_idx {
            return;
        }
        let avail = q.queue_page.avail(VirtQueue::<SIZE>::AVAIL_OFFSET);
        let slot = (used_idx as usize) % SIZE;
        let head = avail.ring[slot];
        let head = q.byte_order.read_u16(head);
        let used = q.queue_page.used_mut(VirtQueue::<SIZE>::USED_OFFSET);
        let used_slot = (used_idx as usize) % SIZE;
        used.ring[used_slot] = UsedElem {
            id: q.byte_order.write_u32(head as u32),
            len: q.byte_order.write_u32(len),
        };
        used.set_idx_for_test(&q.byte_order, used_idx.wrapping_add(1));
    }

    impl<const SIZE: usize> UsedRing<SIZE> {
        fn set_idx_for_test(&mut self, order: &ByteOrder, idx: u16) {
            self.idx = order.write_u16(idx);
        }
    }

    #[test]
    fn add_then_pop_round_trips_length_and_frees_descriptors() {
        let mut q = new_queue::<4>();
        assert_eq!(q.num_free(), 4);
        let token = q
            .add(&[
                Buffer { addr: 0x2000, len: 16, device_writable: false },
                Buffer { addr: 0x3000, len: 512, device_writable: true },
            ])
            .unwrap();
        assert_eq!(q.num_free(), 2);
        device_completes(&mut q, 512);
        let len = q.pop_used(token).unwrap();
        assert_eq!(len, 512);
        assert_eq!(q.num_free(), 4);
    }

    #[test]
    fn queue_full_when_descriptors_exhausted() {
        let mut q = new_queue::<2>();
        q.add(&[
            Buffer { addr: 0x1000, len: 8, device_writable: false },
            Buffer { addr: 0x2000, len: 8, device_writable: false },
        ])
        .unwrap();
        let err = q
            .add(&[Buffer { addr: 0x3000, len: 8, device_writable: false }])
            .unwrap_err();
        assert_eq!(err, VirtIoError::NoSpace);
    }

    #[test]
    fn empty_buffer_list_is_rejected() {
        let mut q = new_queue::<4>();
        assert_eq!(q.add(&[]).unwrap_err(), VirtIoError::InvalidParam);
    }

    #[test]
    fn mismatched_token_is_protocol_error() {
        let mut q = new_queue::<4>();
        let token = q
            .add(&[Buffer { addr: 0x1000, len: 8, device_writable: true }])
            .unwrap();
        device_completes(&mut q, 8);
        assert_eq!(
            q.pop_used(token.wrapping_add(1)).unwrap_err(),
            VirtIoError::ProtocolError
        );
    }

    #[test]
    fn should_notify_respects_no_notify_flag() {
        let mut q = new_queue::<4>();
        q.add(&[Buffer { addr: 0x1000, len: 8, device_writable: false }])
            .unwrap();
        assert!(q.should_notify());

        q.add(&[Buffer { addr: 0x1000, len: 8, device_writable: false }])
            .unwrap();
        q.queue_page
            .used_mut(VirtQueue::<4>::USED_OFFSET)
            .flags = q.byte_order.write_u16(UsedFlags::NO_NOTIFY.bits());
        assert!(!q.should_notify());
    }

    #[test]
    fn vring_need_event_fires_exactly_within_window() {
        assert!(vring_need_event(5, 6, 4));
        assert!(!vring_need_event(5, 5, 4));
        assert!(!vring_need_event(10, 6, 4));
    }

    #[test]
    fn chosen_queue_size_clamps_to_device_max() {
        assert_eq!(chosen_queue_size(256, 16), 16);
        assert_eq!(chosen_queue_size(8, 16), 8);
    }
}
