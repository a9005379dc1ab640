use core::fmt;
use core::fmt::{Display, Formatter};

/// The type returned by driver methods.
pub type VirtIoResult<T> = Result<T, VirtIoError>;

/// The error kinds surfaced by the transport, ring engine and class drivers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VirtIoError {
    /// MAGIC mismatch, VERSION out of range, DEVICE_ID 0, or QUEUE_NUM_MAX 0.
    NotPresent,
    /// Modern transport without VERSION_1 in the accepted feature set, or no
    /// matching driver was found for a (vendor, device) pair.
    Unsupported,
    /// The virtqueue has insufficient free descriptors for this submission.
    NoSpace,
    /// The used ring handed back something that doesn't make sense: an
    /// out-of-range descriptor id, or a length the reader wasn't expecting.
    ProtocolError,
    /// The host reported a request-level failure (e.g. a non-OK block status).
    IoError,
    /// A DMA or bookkeeping allocation failed.
    OutOfMemory,
    /// A queue setup was attempted on a queue that is already live.
    AlreadySet,
    /// A parameter supplied by the caller was invalid (wrong buffer length,
    /// empty scatter/gather list, and the like).
    InvalidParam,
    /// The device has not finished the request yet. Not a failure; used by
    /// non-blocking poll-style calls such as net receive.
    NotReady,
}

impl Display for VirtIoError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::NotPresent => write!(f, "virtio device not present"),
            Self::Unsupported => write!(f, "request or transport mode not supported"),
            Self::NoSpace => write!(f, "virtqueue has no free descriptors"),
            Self::ProtocolError => write!(f, "device violated the virtio wire protocol"),
            Self::IoError => write!(f, "device reported a request failure"),
            Self::OutOfMemory => write!(f, "failed to allocate DMA or bookkeeping memory"),
            Self::AlreadySet => write!(f, "queue is already set up"),
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::NotReady => write!(f, "device has not completed the request yet"),
        }
    }
}
