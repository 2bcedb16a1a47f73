//! Thin epoll wrapper
//!
//! Level-triggered registration keyed by a caller token (the reactor's
//! slot index), returned verbatim with every readiness report. The
//! reactor re-applies interest through its mask cache instead of using
//! edge-triggered mode, so nothing here sets EPOLLET.

use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use netplex_core::error::{ReactorError, ReactorResult};

/// Map a raw OS errno into the reactor error space
pub(crate) fn os_err(errno: Errno) -> ReactorError {
    ReactorError::Os(errno as i32)
}

/// One epoll instance
pub struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub fn new() -> ReactorResult<Poller> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(os_err)?;
        Ok(Poller { epoll })
    }

    /// Register `fd` with `interest`, tagging its reports with `token`
    pub fn add(&self, fd: RawFd, interest: EpollFlags, token: u64) -> ReactorResult<()> {
        // Safety: the handle contract keeps fd open for the whole
        // registration.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(fd, EpollEvent::new(interest, token))
            .map_err(|e| match e {
                Errno::EEXIST => ReactorError::AlreadyRegistered,
                e => os_err(e),
            })
    }

    /// Replace the interest mask of a registered descriptor
    pub fn modify(&self, fd: RawFd, interest: EpollFlags, token: u64) -> ReactorResult<()> {
        // Safety: as in `add`.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(interest, token);
        self.epoll.modify(fd, &mut event).map_err(os_err)
    }

    /// Deregister a descriptor
    pub fn delete(&self, fd: RawFd) -> ReactorResult<()> {
        // Safety: as in `add`.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(fd).map_err(os_err)
    }

    /// Wait up to `timeout_ms` for readiness reports
    ///
    /// An interrupted wait reads as zero events, so the caller's loop
    /// falls through to its run-flag check instead of special-casing
    /// EINTR.
    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: u64) -> ReactorResult<usize> {
        let timeout = EpollTimeout::from(timeout_ms.min(u16::MAX as u64) as u16);
        match self.epoll.wait(events, timeout) {
            Ok(n) => Ok(n),
            Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(os_err(e)),
        }
    }
}
