//! Kernel-backed level-triggered interest set.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Interest-set mutation opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CtlOp {
    Add,
    Mod,
    Del,
}

/// Owned epoll object.
///
/// Conceptually a mapping from fd to the set of directions currently
/// requested for level-triggered readiness notification. Mutated only
/// through [`ctl`](InterestSet::ctl) during the update-drain phase of a
/// tick; the descriptor is closed on drop.
pub(crate) struct InterestSet {
    epfd: OwnedFd,
}

impl InterestSet {
    /// Creates a fresh epoll object.
    pub(crate) fn create() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Applies one ADD/MOD/DEL mutation for `fd` with the readiness
    /// mask `events`.
    pub(crate) fn ctl(&self, op: CtlOp, fd: RawFd, events: u32) -> io::Result<()> {
        let opcode = match op {
            CtlOp::Add => libc::EPOLL_CTL_ADD,
            CtlOp::Mod => libc::EPOLL_CTL_MOD,
            CtlOp::Del => libc::EPOLL_CTL_DEL,
        };

        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), opcode, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Waits up to `timeout_ms` for readiness events, filling `events`.
    ///
    /// Returns the number of events stored.
    pub(crate) fn wait(
        &self,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(n as usize)
    }
}
