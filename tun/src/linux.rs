//! TUN device on Linux: `/dev/net/tun` + `TUNSETIFF` with non-blocking I/O.
//!
//! Readiness is tracked by two independent epoll instances, one registered
//! for `IN|ERR|HUP` and one for `OUT|ERR|HUP`. A single instance watching
//! both directions would report `EPOLLOUT` on almost every wakeup and turn a
//! blocked reader into a hot spin; with the split pair a blocked `read`
//! parks in `epoll_wait` until a packet actually arrives.

use std::ffi::CStr;
use std::fs;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{
    EAGAIN, EBADF, EINTR, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EWOULDBLOCK, F_DUPFD_CLOEXEC,
    F_GETFL, F_SETFL, O_NONBLOCK, O_RDWR, S_IFCHR, close, fcntl, makedev, mknod, open,
};

use crate::ioctl;
use crate::{Error, Result};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUN_DEV_MAJOR: u32 = 10;
const TUN_DEV_MINOR: u32 = 200;

const TUN_FILE: &CStr = c"/dev/net/tun";

/// One open TUN interface.
///
/// The wrapper owns a duplicate of the kernel fd, so its lifetime is
/// independent of whatever handle created the interface.
#[derive(Debug)]
pub struct Tun {
    fd: RawFd,
    read_epoll: Epoll,
    write_epoll: Epoll,
    closed: AtomicBool,
    name: String,
}

impl Tun {
    /// Creates (or attaches to) the TUN interface `name`.
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() >= libc::IF_NAMESIZE {
            return Err(Error::device(format!("invalid interface name `{name}`")));
        }

        create_tun_device_node()?;

        let raw = match unsafe { open(TUN_FILE.as_ptr() as _, O_RDWR) } {
            -1 => {
                return Err(Error::device(format!(
                    "failed to open {TUN_FILE:?}: {}",
                    io::Error::last_os_error()
                )));
            }
            fd => fd,
        };

        // Safety: We just opened the file descriptor.
        let setiff = unsafe {
            ioctl::exec(
                raw,
                TUNSETIFF,
                &mut ioctl::Request::<ioctl::SetTunFlagsPayload>::new(name),
            )
        };
        if let Err(e) = setiff {
            unsafe { close(raw) };
            return Err(Error::device(format!("TUNSETIFF `{name}` failed: {e}")));
        }

        // Duplicate so our fd outlives the one TUNSETIFF was issued on.
        let fd = match unsafe { fcntl(raw, F_DUPFD_CLOEXEC, 0) } {
            -1 => {
                let e = io::Error::last_os_error();
                unsafe { close(raw) };
                return Err(Error::device(format!("failed to duplicate TUN fd: {e}")));
            }
            fd => fd,
        };
        unsafe { close(raw) };

        if let Err(e) = set_non_blocking(fd) {
            unsafe { close(fd) };
            return Err(Error::device(format!(
                "failed to make TUN device non-blocking: {e}"
            )));
        }

        let read_epoll = match Epoll::new(fd, (EPOLLIN | EPOLLERR | EPOLLHUP) as u32) {
            Ok(e) => e,
            Err(e) => {
                unsafe { close(fd) };
                return Err(e.into());
            }
        };
        let write_epoll = match Epoll::new(fd, (EPOLLOUT | EPOLLERR | EPOLLHUP) as u32) {
            Ok(e) => e,
            Err(e) => {
                read_epoll.close();
                unsafe { close(fd) };
                return Err(e.into());
            }
        };

        tracing::debug!(%name, %fd, "Opened TUN device");

        Ok(Self {
            fd,
            read_epoll,
            write_epoll,
            closed: AtomicBool::new(false),
            name: name.to_owned(),
        })
    }
}

impl crate::Tun for Tun {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            // Safety: The fd stays valid until `close` flips the flag; a
            // racing close surfaces as EBADF below.
            match unsafe { libc::read(self.fd, buf.as_mut_ptr() as _, buf.len()) } {
                -1 => {
                    let errno = io::Error::last_os_error();
                    match errno.raw_os_error() {
                        Some(EINTR) => continue,
                        Some(code) if code == EAGAIN || code == EWOULDBLOCK => {
                            self.read_epoll.wait(&self.closed)?;
                        }
                        Some(EBADF) => return Err(Error::Closed),
                        _ => return Err(errno.into()),
                    }
                }
                0 => return Err(Error::Closed),
                n => return Ok(n as usize),
            }
        }
    }

    fn write(&self, packet: &[u8]) -> Result<usize> {
        if packet.is_empty() {
            return Err(Error::EmptyPacket);
        }

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            // Safety: See `read`.
            match unsafe { libc::write(self.fd, packet.as_ptr() as _, packet.len()) } {
                -1 => {
                    let errno = io::Error::last_os_error();
                    match errno.raw_os_error() {
                        Some(EINTR) => continue,
                        Some(code) if code == EAGAIN || code == EWOULDBLOCK => {
                            self.write_epoll.wait(&self.closed)?;
                        }
                        Some(EBADF) => return Err(Error::Closed),
                        _ => return Err(errno.into()),
                    }
                }
                n => return Ok(n as usize),
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Epolls first: blocked waiters wake with EBADF before the data fd
        // goes away.
        self.read_epoll.close();
        self.write_epoll.close();
        unsafe { close(self.fd) };

        tracing::debug!(name = %self.name, "Closed TUN device");

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

/// One epoll instance watching a single fd for one readiness direction.
#[derive(Debug)]
struct Epoll {
    fd: RawFd,
}

impl Epoll {
    fn new(target: RawFd, events: u32) -> io::Result<Self> {
        let fd = match unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } {
            -1 => return Err(io::Error::last_os_error()),
            fd => fd,
        };

        let mut event = libc::epoll_event {
            events,
            u64: target as u64,
        };

        if unsafe { libc::epoll_ctl(fd, libc::EPOLL_CTL_ADD, target, &mut event) } == -1 {
            let e = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(e);
        }

        Ok(Self { fd })
    }

    /// Blocks until the watched direction is ready.
    ///
    /// Returns [`Error::Closed`] if the device was closed while waiting or
    /// the kernel reported `ERR`/`HUP` on the fd.
    fn wait(&self, closed: &AtomicBool) -> Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };

        loop {
            match unsafe { libc::epoll_wait(self.fd, &mut event, 1, -1) } {
                -1 => {
                    let errno = io::Error::last_os_error();
                    match errno.raw_os_error() {
                        Some(EINTR) => continue,
                        Some(EBADF) => return Err(Error::Closed),
                        _ => return Err(errno.into()),
                    }
                }
                _ => {
                    if closed.load(Ordering::Acquire) {
                        return Err(Error::Closed);
                    }
                    if event.events & (EPOLLERR | EPOLLHUP) as u32 != 0 {
                        return Err(Error::Closed);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn close(&self) {
        unsafe { close(self.fd) };
    }
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    match unsafe { fcntl(fd, F_GETFL) } {
        -1 => Err(io::Error::last_os_error()),
        flags => match unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        },
    }
}

/// Creates `/dev/net/tun` on hosts (containers, mostly) that lack it.
fn create_tun_device_node() -> Result<()> {
    let path = Path::new(
        TUN_FILE
            .to_str()
            .map_err(|e| Error::device(format!("invalid device path: {e}")))?,
    );

    if path.exists() {
        return Ok(());
    }

    let parent_dir = path
        .parent()
        .expect("const-declared path always has a parent");
    fs::create_dir_all(parent_dir).map_err(Error::Io)?;
    let permissions = fs::Permissions::from_mode(0o751);
    fs::set_permissions(parent_dir, permissions).map_err(Error::Io)?;

    if unsafe {
        mknod(
            TUN_FILE.as_ptr() as _,
            S_IFCHR,
            makedev(TUN_DEV_MAJOR, TUN_DEV_MINOR),
        )
    } != 0
    {
        return Err(io::Error::last_os_error().into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_interface_names() {
        assert!(matches!(Tun::new(""), Err(Error::Device(_))));
        assert!(matches!(
            Tun::new("a-name-well-beyond-ifnamsiz"),
            Err(Error::Device(_))
        ));
    }
}
