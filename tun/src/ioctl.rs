//! Typed `ioctl` requests against interface file descriptors.

use std::io;
use std::os::fd::RawFd;

/// An ioctl argument carrying an interface name and a typed payload, laid
/// out like the kernel's `struct ifreq`.
#[repr(C)]
pub struct Request<P> {
    name: [u8; libc::IF_NAMESIZE],
    payload: P,
}

/// Executes the ioctl described by `code` on `fd`.
///
/// # Safety
///
/// `code` must identify an ioctl whose argument has the layout of
/// [`Request<P>`].
pub unsafe fn exec<P>(fd: RawFd, code: libc::c_ulong, req: &mut Request<P>) -> io::Result<()> {
    // Safety: Upheld by the caller.
    let ret = unsafe { libc::ioctl(fd, code as _, req as *mut Request<P>) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(target_os = "linux")]
#[repr(C)]
pub struct SetTunFlagsPayload {
    flags: std::ffi::c_short,
}

#[cfg(target_os = "linux")]
impl Request<SetTunFlagsPayload> {
    /// A `TUNSETIFF` request for `name`: TUN mode, no packet-info header.
    pub fn new(name: &str) -> Self {
        let name_as_bytes = name.as_bytes();
        debug_assert!(name_as_bytes.len() < libc::IF_NAMESIZE);

        let mut name = [0u8; libc::IF_NAMESIZE];
        name[..name_as_bytes.len()].copy_from_slice(name_as_bytes);

        Self {
            name,
            payload: SetTunFlagsPayload {
                flags: (libc::IFF_TUN | libc::IFF_NO_PI) as _,
            },
        }
    }
}
