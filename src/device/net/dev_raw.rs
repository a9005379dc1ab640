//! The non-blocking, buffer-management-free half of the net device protocol.
//! [`VirtIONet`](super::VirtIONet) builds receive-buffer bookkeeping on top
//! of this; this layer only knows how to post one descriptor chain at a
//! time and poll for its completion.

use core::hint::spin_loop;

use super::ty::{NetFeature, VirtioNetHdr, MIN_BUFFER_LEN, NET_HDR_SIZE, QUEUE_RECEIVE, QUEUE_TRANSMIT, SUPPORTED_FEATURES};
use super::read_net_config;
use crate::byteorder::ByteOrder;
use crate::error::{VirtIoError, VirtIoResult};
use crate::hal::Hal;
use crate::queue::{Buffer, VirtQueue};
use crate::pages;
use crate::transport::mmio::has_version_1;
use crate::transport::{DeviceStatus, Transport};
use crate::PhysAddr;
use log::{debug, info, warn};

pub struct VirtIONetRaw<H: Hal<QUEUE_SIZE>, T: Transport, const QUEUE_SIZE: usize> {
    transport: T,
    byte_order: ByteOrder,
    mac: [u8; 6],
    version_1_negotiated: bool,
    recv_queue: VirtQueue<QUEUE_SIZE>,
    send_queue: VirtQueue<QUEUE_SIZE>,
    _hal: core::marker::PhantomData<H>,
}

struct Initialized<const QUEUE_SIZE: usize> {
    byte_order: ByteOrder,
    mac: [u8; 6],
    version_1_negotiated: bool,
    recv_queue: VirtQueue<QUEUE_SIZE>,
    send_queue: VirtQueue<QUEUE_SIZE>,
}

impl<H: Hal<QUEUE_SIZE>, T: Transport, const QUEUE_SIZE: usize> VirtIONetRaw<H, T, QUEUE_SIZE> {
    pub fn new(mut transport: T) -> VirtIoResult<Self> {
        match Self::init(&mut transport) {
            Ok(built) => Ok(Self {
                transport,
                byte_order: built.byte_order,
                mac: built.mac,
                version_1_negotiated: built.version_1_negotiated,
                recv_queue: built.recv_queue,
                send_queue: built.send_queue,
                _hal: core::marker::PhantomData,
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
        info!("negotiated net features {:#x}", negotiated);
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

        let version_1_negotiated = has_version_1(negotiated);
        let byte_order = ByteOrder::new(version_1_negotiated, false);
        let event_idx_enabled = negotiated & NetFeature::RING_EVENT_IDX.bits() != 0;

        let config = read_net_config(transport)?;
        // The config-provided MAC address is authoritative and is never
        // overwritten with a fixed fallback address here.
        let mac = config.mac;
        debug!("got MAC={:02x?}, status={:?}", mac, config.status);

        let recv_max = transport.max_queue_size(QUEUE_RECEIVE)?;
        let send_max = transport.max_queue_size(QUEUE_TRANSMIT)?;
        if (recv_max as usize) < QUEUE_SIZE || (send_max as usize) < QUEUE_SIZE {
            return Err(VirtIoError::Unsupported);
        }

        let recv_page = H::dma_alloc(pages(VirtQueue::<QUEUE_SIZE>::total_size()))?;
        let recv_queue = VirtQueue::new(recv_page, byte_order, event_idx_enabled)?;
        transport.set_queue(
            QUEUE_RECEIVE,
            QUEUE_SIZE as u16,
            recv_queue.desc_table_addr(),
            recv_queue.avail_ring_addr(),
            recv_queue.used_ring_addr(),
        )?;

        let send_page = H::dma_alloc(pages(VirtQueue::<QUEUE_SIZE>::total_size()))?;
        let send_queue = VirtQueue::new(send_page, byte_order, event_idx_enabled)?;
        transport.set_queue(
            QUEUE_TRANSMIT,
            QUEUE_SIZE as u16,
            send_queue.desc_table_addr(),
            send_queue.avail_ring_addr(),
            send_queue.used_ring_addr(),
        )?;

        status |= DeviceStatus::DRIVER_OK;
        transport.set_status(status)?;

        Ok(Initialized {
            byte_order,
            mac,
            version_1_negotiated,
            recv_queue,
            send_queue,
        })
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    /// Writes `mac` into config space byte by byte. Mirrors
    /// `virtnet_write_hwaddr`: only meaningful once `VIRTIO_F_VERSION_1` is
    /// negotiated (pre-`VERSION_1` devices don't define config space as
    /// writable), so this fails with `Unsupported` otherwise.
    pub fn write_hwaddr(&mut self, mac: [u8; 6]) -> VirtIoResult<()> {
        if !self.version_1_negotiated {
            return Err(VirtIoError::Unsupported);
        }
        for (i, byte) in mac.iter().enumerate() {
            self.transport.config_write8(i, *byte)?;
        }
        self.mac = mac;
        Ok(())
    }

    /// Two free descriptors means room for one more header+payload chain.
    pub fn can_send(&self) -> bool {
        self.send_queue.num_free() >= 2
    }

    fn check_rx_buf_len(rx_buf: &[u8]) -> VirtIoResult<()> {
        if rx_buf.len() < MIN_BUFFER_LEN {
            warn!("receive buffer len {} is too small", rx_buf.len());
            Err(VirtIoError::InvalidParam)
        } else {
            Ok(())
        }
    }

    /// Submits `rx_buf` to the receive queue without waiting for a packet to
    /// land in it. The caller must not touch `rx_buf` again until
    /// [`Self::receive_complete`] returns for the same token.
    pub fn receive_begin(&mut self, rx_buf: &mut [u8]) -> VirtIoResult<u16> {
        Self::check_rx_buf_len(rx_buf)?;
        let token = match self.recv_queue.add(&[Buffer {
            addr: rx_buf.as_mut_ptr() as PhysAddr,
            len: rx_buf.len() as u32,
            device_writable: true,
        }]) {
            Ok(token) => token,
            // A receive post has no outbound segments, so there's nothing
            // to courtesy-kick for: the host can't drain anything this
            // buffer would have contributed to.
            Err(VirtIoError::NoSpace) => return Err(VirtIoError::NoSpace),
            Err(e) => return Err(e),
        };
        if self.recv_queue.should_notify() {
            self.transport.notify(QUEUE_RECEIVE)?;
        }
        Ok(token)
    }

    /// Returns the token of a posted receive buffer the device has filled,
    /// if any, without popping it.
    pub fn poll_receive(&self) -> Option<u16> {
        self.recv_queue.peek_used()
    }

    /// Returns `(header_len, packet_len)` for the buffer that was posted
    /// with the matching `receive_begin` token.
    pub fn receive_complete(&mut self, token: u16) -> VirtIoResult<(usize, usize)> {
        let len = self.recv_queue.pop_used(token)? as usize;
        let packet_len = len.checked_sub(NET_HDR_SIZE).ok_or(VirtIoError::ProtocolError)?;
        Ok((NET_HDR_SIZE, packet_len))
    }

    /// Sends a packet, blocking until the device has consumed it.
    pub fn send(&mut self, tx_buf: &[u8]) -> VirtIoResult<()> {
        let header = VirtioNetHdr::none(&self.byte_order);
        let mut buffers = alloc::vec::Vec::with_capacity(2);
        buffers.push(Buffer {
            addr: header.as_bytes().as_ptr() as PhysAddr,
            len: header.as_bytes().len() as u32,
            device_writable: false,
        });
        if !tx_buf.is_empty() {
            buffers.push(Buffer {
                addr: tx_buf.as_ptr() as PhysAddr,
                len: tx_buf.len() as u32,
                device_writable: false,
            });
        }
        let token = match self.send_queue.add(&buffers) {
            Ok(token) => token,
            Err(VirtIoError::NoSpace) => {
                if self.send_queue.should_notify() {
                    self.transport.notify(QUEUE_TRANSMIT)?;
                }
                return Err(VirtIoError::NoSpace);
            }
            Err(e) => return Err(e),
        };
        if self.send_queue.should_notify() {
            self.transport.notify(QUEUE_TRANSMIT)?;
        }
        while !self.send_queue.can_pop() {
            spin_loop();
        }
        self.send_queue.pop_used(token)?;
        Ok(())
    }

    /// Blocks until a packet is received; returns `(header_len, packet_len)`.
    pub fn receive_wait(&mut self, rx_buf: &mut [u8]) -> VirtIoResult<(usize, usize)> {
        let token = self.receive_begin(rx_buf)?;
        while self.poll_receive() != Some(token) {
            spin_loop();
        }
        self.receive_complete(token)
    }
}
