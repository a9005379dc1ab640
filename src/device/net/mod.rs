//! The net device request protocol (component F).
//!
//! Ref: `drivers/net/virtio.c` and virtio spec 5.1.

mod dev_raw;
mod ty;

extern crate alloc;

use alloc::vec::Vec;

pub use dev_raw::VirtIONetRaw;
pub use ty::{LinkStatus, NetConfig, NetFeature};

use crate::error::{VirtIoError, VirtIoResult};
use crate::hal::Hal;
use crate::transport::{read_config_guarded, Transport};

/// Reads the MAC address and link status out of config space, retrying on a
/// torn read the same way [`crate::device::block`] reads capacity.
fn read_net_config<T: Transport + ?Sized>(transport: &T) -> VirtIoResult<NetConfig> {
    read_config_guarded(transport, |t| {
        let mut mac = [0u8; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = t.config_read8(i)?;
        }
        let status = LinkStatus::from_bits_truncate(t.config_read16(6)?);
        Ok(NetConfig { mac, status })
    })
}

/// A bound virtio net device with its own receive-buffer pool.
///
/// Unlike [`VirtIONetRaw`], this owns one heap-allocated buffer per receive
/// descriptor and keeps all of them posted to the device, so callers never
/// have to manage receive-buffer lifetime themselves.
pub struct VirtIONet<H: Hal<QUEUE_SIZE>, T: Transport, const QUEUE_SIZE: usize> {
    inner: VirtIONetRaw<H, T, QUEUE_SIZE>,
    rx_buffers: [Vec<u8>; QUEUE_SIZE],
}

impl<H: Hal<QUEUE_SIZE>, T: Transport, const QUEUE_SIZE: usize> VirtIONet<H, T, QUEUE_SIZE> {
    /// Builds the device and pre-posts `QUEUE_SIZE` receive buffers of
    /// `buf_len` bytes each. `buf_len` must be at least
    /// [`ty::MIN_BUFFER_LEN`].
    pub fn new(transport: T, buf_len: usize) -> VirtIoResult<Self> {
        let mut inner = VirtIONetRaw::new(transport)?;

        const NONE_BUF: Vec<u8> = Vec::new();
        let mut rx_buffers = [NONE_BUF; QUEUE_SIZE];
        for (i, rx_buf) in rx_buffers.iter_mut().enumerate() {
            rx_buf.resize(buf_len, 0);
            let token = inner.receive_begin(rx_buf.as_mut_slice())?;
            assert_eq!(token, i as u16);
        }

        Ok(VirtIONet { inner, rx_buffers })
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.inner.mac_address()
    }

    pub fn write_hwaddr(&mut self, mac: [u8; 6]) -> VirtIoResult<()> {
        self.inner.write_hwaddr(mac)
    }

    pub fn can_send(&self) -> bool {
        self.inner.can_send()
    }

    /// Whether a packet is waiting to be read, without consuming it.
    pub fn can_recv(&self) -> bool {
        self.inner.poll_receive().is_some()
    }

    /// Copies the next completed packet into `data`, reposts the buffer it
    /// arrived in, and returns the packet length. Returns
    /// [`VirtIoError::NotReady`] if nothing has arrived yet.
    pub fn receive(&mut self, data: &mut [u8]) -> VirtIoResult<usize> {
        let token = self.inner.poll_receive().ok_or(VirtIoError::NotReady)?;
        let (hdr_len, pkt_len) = self.inner.receive_complete(token)?;
        let rx_buf = &self.rx_buffers[token as usize];
        data[..pkt_len].copy_from_slice(&rx_buf[hdr_len..hdr_len + pkt_len]);
        self.inner
            .receive_begin(self.rx_buffers[token as usize].as_mut_slice())?;
        Ok(pkt_len)
    }

    /// Sends `tx_buf`, blocking until the device has consumed it.
    pub fn send(&mut self, tx_buf: &[u8]) -> VirtIoResult<()> {
        self.inner.send(tx_buf)
    }
}
