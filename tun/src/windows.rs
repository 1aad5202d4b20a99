//! TUN device on Windows: a Wintun ring-buffer session.
//!
//! Three things shape this module:
//!
//! - a manual-reset close event is created up front and every blocked read
//!   waits on `{session-read-event, close-event}`, so `close` unblocks
//!   readers immediately;
//! - a session can die with `ERROR_HANDLE_EOF` when the ring resets, and is
//!   reopened without tearing down the adapter. The live session sits behind
//!   an RCU-style pointer: I/O increments the current ref's in-flight
//!   counter, reopen publishes a new ref and waits on a drain event until
//!   the old ref's in-flight count reaches zero;
//! - a full TX ring (`ERROR_BUFFER_OVERFLOW`) is invisible to the caller:
//!   the writer yields twice, then sleeps in escalating 1 ms steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Threading::{
    CreateEventW, INFINITE, SetEvent, WaitForMultipleObjects, WaitForSingleObject,
};
use windows::core::PCWSTR;

use crate::{Error, Result};

/// The ring buffer size used for Wintun.
///
/// Must be a power of two within a certain range
/// <https://docs.rs/wintun/latest/wintun/struct.Adapter.html#method.start_session>.
/// 1 MiB of ring absorbs roughly 8 ms of traffic at 1 Gbps before packets
/// drop.
const RING_BUFFER_SIZE: u32 = 0x10_0000;

const TUNNEL_TYPE: &str = "TunGo";

// See <https://learn.microsoft.com/en-us/windows/win32/debug/system-error-codes--0-499->.
const ERROR_BUFFER_OVERFLOW: i32 = 0x6F;
const ERROR_HANDLE_EOF: i32 = 0x26;

#[derive(Debug)]
pub struct Tun {
    /// Keeps `wintun.dll` loaded for as long as the device lives.
    _wintun: wintun::Wintun,
    adapter: Arc<wintun::Adapter>,

    current: RwLock<Arc<SessionRef>>,
    /// Serializes session reopens; the I/O hot path never takes it.
    reopen: Mutex<()>,

    close_event: Event,
    closed: AtomicBool,
    name: String,
}

/// One ring session plus the bookkeeping needed to retire it safely.
struct SessionRef {
    session: wintun::Session,
    in_flight: AtomicUsize,
    retired: AtomicBool,
    drained: Event,
}

impl SessionRef {
    fn new(session: wintun::Session) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            session,
            in_flight: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            drained: Event::manual_reset()?,
        }))
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 && self.retired.load(Ordering::Acquire)
        {
            self.drained.set();
        }
    }
}

impl Tun {
    /// Creates (or reuses) the Wintun adapter `name` and starts a session.
    pub fn new(name: &str) -> Result<Self> {
        // Safety: `wintun.dll` is arbitrary C code; there is no way to prove
        // it safe beyond trusting the official driver package.
        let wintun = unsafe { wintun::load() }
            .map_err(|e| Error::device(format!("failed to load wintun.dll: {e}")))?;

        let adapter = wintun::Adapter::create(&wintun, name, TUNNEL_TYPE, None)
            .map_err(|e| Error::device(format!("failed to create adapter `{name}`: {e}")))?;

        let session = adapter
            .start_session(RING_BUFFER_SIZE)
            .map_err(|e| Error::device(format!("failed to start session on `{name}`: {e}")))?;

        tracing::debug!(%name, "Opened Wintun adapter");

        Ok(Self {
            _wintun: wintun,
            adapter,
            current: RwLock::new(SessionRef::new(session)?),
            reopen: Mutex::new(()),
            close_event: Event::manual_reset()?,
            closed: AtomicBool::new(false),
            name: name.to_owned(),
        })
    }

    /// Pins the live session for one I/O operation.
    ///
    /// The increment-then-recheck dance closes the race against a concurrent
    /// reopen: if the pointer was swapped (or the device closed) after we
    /// incremented, we roll back and retry against the new pointer.
    fn acquire(&self) -> Result<Arc<SessionRef>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let session = self.current.read().clone();
            session.in_flight.fetch_add(1, Ordering::AcqRel);

            if session.retired.load(Ordering::Acquire) {
                session.release();
                continue;
            }
            if self.closed.load(Ordering::Acquire) {
                session.release();
                return Err(Error::Closed);
            }

            return Ok(session);
        }
    }

    /// Replaces `old` with a fresh ring session.
    ///
    /// Publishes the new pointer first, then drains `old`: in-flight users
    /// finish, the drain event fires at zero, and only then is the old
    /// session ended. Waiting on the event (not spinning) keeps reopen cheap
    /// no matter how slow the stragglers are.
    fn reopen_session(&self, old: &Arc<SessionRef>) -> Result<()> {
        let _guard = self.reopen.lock();

        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        // Lost the race: someone else already swapped this one out.
        if !Arc::ptr_eq(&*self.current.read(), old) {
            return Ok(());
        }

        tracing::debug!(name = %self.name, "Reopening Wintun session after ring reset");

        let session = self
            .adapter
            .start_session(RING_BUFFER_SIZE)
            .map_err(|e| Error::device(format!("failed to reopen session: {e}")))?;
        let fresh = SessionRef::new(session)?;

        *self.current.write() = fresh;

        old.retired.store(true, Ordering::Release);

        // A reader parked on the old session's read event still holds an
        // in-flight pin; kick it so the count can reach zero.
        if let Ok(event) = old.session.get_read_wait_event() {
            // Safety: The handle stays valid while `old` is alive.
            let _ = unsafe { SetEvent(HANDLE(event as *mut core::ffi::c_void)) };
        }

        if old.in_flight.load(Ordering::Acquire) == 0 {
            old.drained.set();
        }
        old.drained.wait();

        let _ = old.session.shutdown();

        Ok(())
    }

    fn wait_readable(&self, session: &SessionRef) -> Result<()> {
        let read_event = HANDLE(session.session.get_read_wait_event().map_err(|e| {
            Error::device(format!("failed to get session read event: {e}"))
        })? as *mut core::ffi::c_void);

        let handles = [read_event, self.close_event.0];

        // Safety: Both handles are valid for the duration of the wait; the
        // close event lives as long as `self`.
        let status = unsafe { WaitForMultipleObjects(&handles, false, INFINITE) };

        if status == WAIT_OBJECT_0 {
            return Ok(());
        }

        // Anything but "read event signalled" means the close event fired
        // or the wait itself failed; in both cases the device is done.
        Err(Error::Closed)
    }
}

impl crate::Tun for Tun {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let session = self.acquire()?;

            match session.session.try_receive() {
                Ok(Some(packet)) => {
                    let bytes = packet.bytes();
                    let len = bytes.len();

                    if len > buf.len() {
                        // Drop the packet, never truncate.
                        session.release();
                        return Err(Error::DestinationTooSmall {
                            packet: len,
                            capacity: buf.len(),
                        });
                    }

                    buf[..len].copy_from_slice(bytes);
                    session.release();
                    return Ok(len);
                }
                Ok(None) => {
                    let waited = self.wait_readable(&session);
                    session.release();
                    waited?;
                }
                Err(wintun::Error::ShuttingDown) => {
                    session.release();
                    if self.closed.load(Ordering::Acquire) {
                        return Err(Error::Closed);
                    }
                    // A reopen is retiring this session under us; loop and
                    // pick up the new one.
                }
                Err(wintun::Error::Io(e))
                    if e.raw_os_error().is_some_and(|code| code == ERROR_HANDLE_EOF) =>
                {
                    session.release();
                    self.reopen_session(&session)?;
                }
                Err(e) => {
                    session.release();
                    return Err(Error::device(format!("wintun receive failed: {e}")));
                }
            }
        }
    }

    fn write(&self, packet: &[u8]) -> Result<usize> {
        if packet.is_empty() {
            return Err(Error::EmptyPacket);
        }
        let len = u16::try_from(packet.len()).map_err(|_| Error::PacketTooLarge {
            len: packet.len(),
            max: u16::MAX as usize,
        })?;

        let mut attempts: u32 = 0;

        loop {
            let session = self.acquire()?;

            match session.session.allocate_send_packet(len) {
                Ok(mut send_packet) => {
                    send_packet.bytes_mut().copy_from_slice(packet);
                    // `send_packet` cannot fail to enqueue: space was already
                    // allocated in the ring.
                    session.session.send_packet(send_packet);
                    session.release();

                    if attempts > 0 {
                        tracing::trace!(%attempts, "Sent packet after TX backpressure");
                    }

                    return Ok(packet.len());
                }
                Err(wintun::Error::Io(e))
                    if e.raw_os_error()
                        .is_some_and(|code| code == ERROR_BUFFER_OVERFLOW) =>
                {
                    session.release();

                    if attempts == 0 {
                        tracing::trace!("Wintun TX ring is full");
                    }

                    if attempts < 2 {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(Duration::from_millis(u64::from(
                            (attempts - 1).min(10),
                        )));
                    }
                    attempts += 1;
                }
                Err(wintun::Error::ShuttingDown) => {
                    session.release();
                    if self.closed.load(Ordering::Acquire) {
                        return Err(Error::Closed);
                    }
                }
                Err(wintun::Error::Io(e))
                    if e.raw_os_error().is_some_and(|code| code == ERROR_HANDLE_EOF) =>
                {
                    session.release();
                    self.reopen_session(&session)?;
                }
                Err(e) => {
                    session.release();
                    return Err(Error::device(format!("wintun send failed: {e}")));
                }
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Wake blocked readers before ending the session.
        self.close_event.set();

        let session = self.current.read().clone();
        let _ = session.session.shutdown();

        tracing::debug!(name = %self.name, "Closed Wintun adapter");

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

/// A manual-reset Win32 event.
struct Event(HANDLE);

// Safety: Event handles may be used from any thread.
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    fn manual_reset() -> Result<Self> {
        // Safety: No special requirements.
        let handle = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }
            .map_err(|e| Error::device(format!("failed to create event: {e}")))?;

        Ok(Self(handle))
    }

    fn set(&self) {
        // Safety: The handle is valid until drop.
        let _ = unsafe { SetEvent(self.0) };
    }

    fn wait(&self) {
        // Safety: The handle is valid until drop.
        unsafe { WaitForSingleObject(self.0, INFINITE) };
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // Safety: The handle is owned by us and closed exactly once.
        let _ = unsafe { CloseHandle(self.0) };
    }
}
