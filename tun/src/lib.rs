//! Platform TUN devices behind one blocking byte-stream contract.
//!
//! Each platform module owns one kernel TUN handle and adapts its quirks
//! (utun AF headers, Wintun ring sessions, `/dev/net/tun` readiness) to the
//! same three operations: [`Tun::read`], [`Tun::write`] and [`Tun::close`].

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::io;

pub mod frame;

#[cfg(target_family = "unix")]
pub mod ioctl;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as platform;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as platform;

#[cfg(target_os = "windows")]
pub mod windows;
#[cfg(target_os = "windows")]
pub use windows as platform;

/// One host TUN interface as a bi-directional stream of IP packets.
///
/// `read` and `write` may block. One thread may read while another writes;
/// concurrent reads (or concurrent writes) are not supported. `close` is the
/// cancel signal for both: any blocked `read`/`write` on the device returns
/// [`Error::Closed`] within bounded time, and `close` itself is idempotent
/// and safe to call from any thread.
pub trait Tun: std::fmt::Debug + Send + Sync + 'static {
    /// Receive one packet into `buf`, returning the packet length.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send one packet, returning the number of payload bytes accepted.
    fn write(&self, packet: &[u8]) -> Result<usize>;

    /// Release the device and wake any blocked reader or writer.
    fn close(&self) -> Result<()>;

    /// The OS name of the interface.
    fn name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device has been closed; no further I/O is possible.
    #[error("TUN device is closed")]
    Closed,
    /// A zero-length write was attempted.
    #[error("empty packet")]
    EmptyPacket,
    /// The read destination cannot hold the packet. The packet is dropped,
    /// never truncated.
    #[error("destination slice too small: packet is {packet} bytes, destination holds {capacity}")]
    DestinationTooSmall { packet: usize, capacity: usize },
    /// The packet exceeds what the device can carry.
    #[error("packet of {len} bytes exceeds device maximum of {max}")]
    PacketTooLarge { len: usize, max: usize },
    /// Failure to create or configure the underlying device.
    #[error("failed to open TUN device: {0}")]
    Device(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the packet-size family of errors
    /// ([`Error::EmptyPacket`], [`Error::DestinationTooSmall`],
    /// [`Error::PacketTooLarge`]).
    pub fn is_packet_size(&self) -> bool {
        matches!(
            self,
            Error::EmptyPacket
                | Error::DestinationTooSmall { .. }
                | Error::PacketTooLarge { .. }
        )
    }

    pub(crate) fn device(msg: impl std::fmt::Display) -> Self {
        Error::Device(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
