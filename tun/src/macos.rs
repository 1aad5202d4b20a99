//! TUN device on macOS: a utun control socket.
//!
//! utun frames every packet with a 4-byte big-endian address-family word.
//! Reads strip it with a two-element `recvmsg` iovec; writes derive it from
//! the packet's version nibble and prepend it in a single `sendmsg`. The
//! caller only ever sees raw IP packets.

use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{
    AF_SYSTEM, CTLIOCGINFO, IF_NAMESIZE, MSG_TRUNC, SOCK_DGRAM, SYSPROTO_CONTROL,
    UTUN_OPT_IFNAME, close, connect, ctl_info, getsockopt, iovec, ioctl, msghdr, recvmsg, sendmsg,
    sockaddr_ctl, socket, socklen_t,
};

use crate::frame;
use crate::{Error, Result};

const CTL_NAME: &[u8] = b"com.apple.net.utun_control";

/// `sockaddr_ctl.ss_sysaddr` for kernel control sockets; `libc` doesn't
/// export it.
const AF_SYS_CONTROL: u16 = 2;

#[derive(Debug)]
pub struct Tun {
    fd: RawFd,
    closed: AtomicBool,
    name: String,
}

impl Tun {
    /// Allocates a utun interface.
    ///
    /// `name` must be `utun<N>` to request a specific unit, or `utun` to let
    /// the kernel pick the next free one.
    pub fn new(name: &str) -> Result<Self> {
        let unit = parse_unit(name)?;

        let fd = match unsafe { socket(AF_SYSTEM, SOCK_DGRAM, SYSPROTO_CONTROL) } {
            -1 => {
                return Err(Error::device(format!(
                    "failed to open control socket: {}",
                    io::Error::last_os_error()
                )));
            }
            fd => fd,
        };

        let mut info = ctl_info {
            ctl_id: 0,
            ctl_name: [0; 96],
        };
        // Safety: We only care about maintaining the same byte values, the
        // slice is a blob of bytes; `c_char` just happens to be `i8`.
        info.ctl_name[..CTL_NAME.len()]
            .copy_from_slice(unsafe { &*(CTL_NAME as *const [u8] as *const [i8]) });

        // Safety: `info` is a properly initialized `ctl_info`.
        if unsafe { ioctl(fd, CTLIOCGINFO, &mut info as *mut ctl_info) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(Error::device(format!(
                "failed to resolve utun control id: {e}"
            )));
        }

        let addr = sockaddr_ctl {
            sc_len: size_of::<sockaddr_ctl>() as u8,
            sc_family: AF_SYSTEM as u8,
            ss_sysaddr: AF_SYS_CONTROL,
            sc_id: info.ctl_id,
            // 0 lets the kernel allocate; unit N claims utun(N-1).
            sc_unit: unit.map(|u| u + 1).unwrap_or(0),
            sc_reserved: Default::default(),
        };

        // Safety: `addr` is a properly initialized `sockaddr_ctl`.
        if unsafe {
            connect(
                fd,
                &addr as *const sockaddr_ctl as _,
                size_of::<sockaddr_ctl>() as socklen_t,
            )
        } != 0
        {
            let e = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(Error::device(format!("failed to connect utun `{name}`: {e}")));
        }

        let name = match interface_name(fd) {
            Ok(name) => name,
            Err(e) => {
                unsafe { close(fd) };
                return Err(e);
            }
        };

        tracing::debug!(%name, %fd, "Opened utun device");

        Ok(Self {
            fd,
            closed: AtomicBool::new(false),
            name,
        })
    }
}

impl crate::Tun for Tun {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut hdr = [0u8; 4];

        let mut iov = [
            iovec {
                iov_base: hdr.as_mut_ptr() as _,
                iov_len: hdr.len(),
            },
            iovec {
                iov_base: buf.as_mut_ptr() as _,
                iov_len: buf.len(),
            },
        ];

        let mut msg_hdr = msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov[0],
            msg_iovlen: iov.len() as _,
            msg_control: std::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
        };

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            // Safety: The fd is valid until `close`; the iovecs outlive the
            // call.
            match unsafe { recvmsg(self.fd, &mut msg_hdr, 0) } {
                -1 => {
                    let errno = io::Error::last_os_error();
                    match errno.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(libc::EBADF) => return Err(Error::Closed),
                        _ => return Err(errno.into()),
                    }
                }
                0 => return Err(Error::Closed),
                n => {
                    // The packet is dropped by the kernel, never truncated
                    // into the destination.
                    if msg_hdr.msg_flags & MSG_TRUNC != 0 {
                        return Err(Error::DestinationTooSmall {
                            packet: n as usize,
                            capacity: buf.len(),
                        });
                    }

                    return Ok((n as usize).saturating_sub(hdr.len()));
                }
            }
        }
    }

    fn write(&self, packet: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let mut hdr = frame::family_header(packet)?;

        let mut iov = [
            iovec {
                iov_base: hdr.as_mut_ptr() as _,
                iov_len: hdr.len(),
            },
            iovec {
                iov_base: packet.as_ptr() as _,
                iov_len: packet.len(),
            },
        ];

        let msg_hdr = msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov[0],
            msg_iovlen: iov.len() as _,
            msg_control: std::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
        };

        loop {
            // Safety: See `read`.
            match unsafe { sendmsg(self.fd, &msg_hdr, 0) } {
                -1 => {
                    let errno = io::Error::last_os_error();
                    match errno.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(libc::EBADF) => return Err(Error::Closed),
                        _ => return Err(errno.into()),
                    }
                }
                n => return Ok((n as usize).saturating_sub(hdr.len())),
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        unsafe { close(self.fd) };

        tracing::debug!(name = %self.name, "Closed utun device");

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Tun {
    fn drop(&mut self) {
        let _ = crate::Tun::close(self);
    }
}

fn parse_unit(name: &str) -> Result<Option<u32>> {
    let Some(suffix) = name.strip_prefix("utun") else {
        return Err(Error::device(format!(
            "`{name}` is not a utun interface name"
        )));
    };

    if suffix.is_empty() {
        return Ok(None);
    }

    suffix
        .parse::<u32>()
        .map(Some)
        .map_err(|_| Error::device(format!("`{name}` has an invalid utun unit")))
}

fn interface_name(fd: RawFd) -> Result<String> {
    let mut tunnel_name = [0u8; IF_NAMESIZE];
    let mut tunnel_name_len = tunnel_name.len() as socklen_t;

    if unsafe {
        getsockopt(
            fd,
            SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            tunnel_name.as_mut_ptr() as _,
            &mut tunnel_name_len,
        )
    } < 0
        || tunnel_name_len == 0
    {
        return Err(Error::device(format!(
            "failed to read utun name: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(String::from_utf8_lossy(&tunnel_name[..(tunnel_name_len - 1) as usize]).to_string())
}
