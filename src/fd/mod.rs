//! File descriptor table: per-fd readiness state, the update list and
//! the speculative list.
//!
//! The table is the shared ground between descriptor owners and the
//! poller:
//!
//! - owners register descriptors with [`FdTab::insert`] and drop them
//!   with [`FdTab::delete`],
//! - callbacks declare interest through [`FdTab::set_active`] /
//!   [`FdTab::set_polled`] / [`FdTab::clear`],
//! - the poller drains the update list, maintains the speculative list
//!   and dispatches readiness through the stored callbacks.
//!
//! All mutating operations here are O(1) and never perform a syscall
//! (except [`FdTab::delete`], which closes the descriptor). They may be
//! called from inside an I/O callback, including on descriptors other
//! than the one being dispatched: changes are recorded in the update
//! list and applied at the start of the next tick.

pub(crate) mod event;
pub(crate) mod state;

pub use event::IoEvents;
pub use state::{Direction, FdState, EV_ACTIVE, EV_POLLED, EV_STATUS};

use state::{EV_CURR_MASK, EV_PREV_MASK};

use std::os::fd::RawFd;
use std::rc::Rc;

use log::trace;

/// I/O callback invoked when a descriptor is deemed ready.
///
/// Callbacks receive the table itself so they may mutate the readiness
/// state of any descriptor, including creating or deleting descriptors.
/// They run to completion on the polling thread and must not block; a
/// callback that cannot make progress calls [`FdTab::set_polled`] and
/// returns.
pub type IoCallback = Rc<dyn Fn(&mut FdTab, RawFd)>;

/// Spec-list back-pointer value for "not a member".
const NO_SPEC: usize = usize::MAX;

/// One slot of the descriptor table.
pub(crate) struct FdEntry {
    /// Whether the slot is currently owned by an open descriptor.
    pub(crate) owned: bool,

    /// Callback driving the descriptor, if any.
    pub(crate) iocb: Option<IoCallback>,

    /// Readiness bits as of the last dispatch.
    pub(crate) ev: IoEvents,

    /// Packed current/previous readiness state.
    pub(crate) state: FdState,

    /// The fd is enqueued in the update list.
    pub(crate) updated: bool,

    /// The fd was created since the currently executing tick began.
    pub(crate) new: bool,

    /// Back-pointer into the spec list, or [`NO_SPEC`].
    pub(crate) spec_pos: usize,
}

impl FdEntry {
    fn vacant() -> Self {
        Self {
            owned: false,
            iocb: None,
            ev: IoEvents::empty(),
            state: FdState::default(),
            updated: false,
            new: false,
            spec_pos: NO_SPEC,
        }
    }
}

/// The descriptor table.
///
/// Sized once for `maxsock` descriptors; slots are addressed directly
/// by fd number. The table also owns the two lists that drive the
/// speculative poller:
///
/// - the *update list*, an insertion-ordered, deduplicated queue of fds
///   whose state changed since the last tick,
/// - the *spec list*, a dense set of fds currently carrying at least
///   one active direction, with an index back-pointer on each slot so
///   membership changes are O(1) swap-with-last.
pub struct FdTab {
    entries: Vec<FdEntry>,

    /// Fds whose state changed since the last drain, in enqueue order.
    pub(crate) updt: Vec<RawFd>,

    /// Dense list of fds with at least one active direction.
    pub(crate) spec: Vec<RawFd>,

    /// One past the highest owned fd.
    maxfd: usize,

    /// Set by the poller while callbacks are firing.
    pub(crate) in_poll_loop: bool,
}

impl FdTab {
    /// Creates a table with room for `maxsock` descriptors.
    pub fn new(maxsock: usize) -> Self {
        assert!(maxsock > 0, "maxsock must be > 0");

        Self {
            entries: (0..maxsock).map(|_| FdEntry::vacant()).collect(),
            updt: Vec::with_capacity(maxsock),
            spec: Vec::with_capacity(maxsock),
            maxfd: 0,
            in_poll_loop: false,
        }
    }

    /// Number of slots in the table.
    pub fn maxsock(&self) -> usize {
        self.entries.len()
    }

    /// One past the highest fd currently in use.
    pub fn max_fd_in_use(&self) -> usize {
        self.maxfd
    }

    /// Number of fds enqueued in the update list.
    pub fn nb_updt(&self) -> usize {
        self.updt.len()
    }

    /// Number of fds in the speculative list.
    pub fn nb_spec(&self) -> usize {
        self.spec.len()
    }

    /// Whether poller callbacks are currently firing.
    ///
    /// Callbacks must not re-enter the poll loop; this flag lets
    /// external code assert that.
    pub fn in_poll_loop(&self) -> bool {
        self.in_poll_loop
    }

    /// Whether `fd` is currently owned.
    pub fn is_owned(&self, fd: RawFd) -> bool {
        self.entries[fd as usize].owned
    }

    /// Whether `fd` currently sits in the speculative list.
    pub fn in_spec_list(&self, fd: RawFd) -> bool {
        self.entries[fd as usize].spec_pos != NO_SPEC
    }

    /// Whether `fd` currently sits in the update list.
    pub fn is_updated(&self, fd: RawFd) -> bool {
        self.entries[fd as usize].updated
    }

    /// Packed readiness state of `fd`.
    pub fn state(&self, fd: RawFd) -> FdState {
        self.entries[fd as usize].state
    }

    /// Readiness bits of `fd` as of the last dispatch.
    pub fn ev(&self, fd: RawFd) -> IoEvents {
        self.entries[fd as usize].ev
    }

    /// ORs `bits` into the readiness bits of `fd`.
    ///
    /// Combined with the sticky subset this lets external code pin a
    /// deferred error indication on a descriptor so the next dispatch
    /// sees it.
    pub fn add_ev(&mut self, fd: RawFd, bits: IoEvents) {
        self.entries[fd as usize].ev |= bits;
    }

    /// Registers an open descriptor.
    ///
    /// The slot is reset, marked owned and flagged `new` so the poller
    /// can drive it once within the tick that created it. The
    /// descriptor enters the update list only when a state operation is
    /// first applied to it.
    ///
    /// # Panics
    ///
    /// Panics if `fd` is outside the table.
    pub fn insert(&mut self, fd: RawFd, iocb: Option<IoCallback>) {
        let idx = fd as usize;
        assert!(idx < self.entries.len(), "fd {fd} beyond table capacity");

        let e = &mut self.entries[idx];
        debug_assert!(!e.owned, "fd {fd} inserted twice");

        e.owned = true;
        e.iocb = iocb;
        e.ev = IoEvents::empty();
        e.state = FdState::default();
        e.updated = false;
        e.new = true;
        e.spec_pos = NO_SPEC;

        if idx >= self.maxfd {
            self.maxfd = idx + 1;
        }

        trace!("fd {fd} registered");
    }

    /// Releases a descriptor and closes it.
    ///
    /// The spec-list entry is dropped and both state nibbles are zeroed
    /// before the close; no kernel interest-set DEL is issued since the
    /// OS drops closed descriptors from the interest set itself. A
    /// stale update-list entry may remain; the next drain turns it into
    /// a no-op.
    pub fn delete(&mut self, fd: RawFd) {
        debug_assert!(self.entries[fd as usize].owned, "delete on closed fd {fd}");

        self.close_notify(fd);

        unsafe {
            libc::close(fd);
        }

        let e = &mut self.entries[fd as usize];
        e.owned = false;
        e.iocb = None;
        e.ev = IoEvents::empty();
        e.new = false;

        while self.maxfd > 0 && !self.entries[self.maxfd - 1].owned {
            self.maxfd -= 1;
        }

        trace!("fd {fd} released");
    }

    /// Current status bits of `fd` for `dir`; any nonzero value means
    /// the callback has declared interest in that direction.
    pub fn is_set(&self, fd: RawFd, dir: Direction) -> u8 {
        debug_assert!(self.entries[fd as usize].owned, "is_set on closed fd {fd}");

        self.entries[fd as usize].state.status(dir)
    }

    /// Requests a speculative invocation of `fd` for `dir` next tick.
    ///
    /// The polled bit is deliberately left in place: clearing it would
    /// cost a syscall on the next drain with no gain, since a
    /// descriptor that is ready now will typically stay ready.
    pub fn set_active(&mut self, fd: RawFd, dir: Direction) {
        debug_assert!(
            self.entries[fd as usize].owned,
            "set_active on closed fd {fd}"
        );

        let i = self.entries[fd as usize].state.status(dir);
        if i & EV_ACTIVE != 0 {
            return;
        }

        self.updt_fd(fd);
        self.entries[fd as usize].state.0 |= EV_ACTIVE << dir.shift();
    }

    /// Hands `fd` back to the kernel interest set for `dir`.
    ///
    /// Called by a callback that consumed nothing and needs readiness
    /// reported by the kernel. The direction transitions to exactly
    /// polled, clearing the active bit.
    pub fn set_polled(&mut self, fd: RawFd, dir: Direction) {
        debug_assert!(
            self.entries[fd as usize].owned,
            "set_polled on closed fd {fd}"
        );

        let i = self.entries[fd as usize].state.status(dir);
        if i == EV_POLLED {
            return;
        }

        self.updt_fd(fd);
        self.entries[fd as usize].state.0 ^= (i ^ EV_POLLED) << dir.shift();
    }

    /// Drops all interest of `fd` in `dir`.
    pub fn clear(&mut self, fd: RawFd, dir: Direction) {
        debug_assert!(self.entries[fd as usize].owned, "clear on closed fd {fd}");

        let i = self.entries[fd as usize].state.status(dir);
        if i == 0 {
            return;
        }

        self.updt_fd(fd);
        self.entries[fd as usize].state.0 ^= i << dir.shift();
    }

    /// Drops all interest of `fd` in both directions.
    pub fn remove(&mut self, fd: RawFd) {
        self.clear(fd, Direction::Read);
        self.clear(fd, Direction::Write);
    }

    /// Forgets all readiness state of `fd` ahead of a close.
    ///
    /// The spec-list entry is released and both nibbles zeroed. No
    /// kernel DEL is issued: the OS removes closed descriptors from the
    /// interest set automatically, so the fd simply appears as never
    /// set.
    pub fn close_notify(&mut self, fd: RawFd) {
        self.release_spec_entry(fd);
        self.entries[fd as usize].state.0 &= !(EV_CURR_MASK | EV_PREV_MASK);
    }

    /// Appends `fd` to the update list unless already enqueued.
    pub(crate) fn updt_fd(&mut self, fd: RawFd) {
        let e = &mut self.entries[fd as usize];
        if e.updated {
            return;
        }

        e.updated = true;
        self.updt.push(fd);
    }

    /// Grants `fd` a spec-list slot unless it already has one.
    pub(crate) fn alloc_spec_entry(&mut self, fd: RawFd) {
        let e = &mut self.entries[fd as usize];
        if e.spec_pos != NO_SPEC {
            return;
        }

        e.spec_pos = self.spec.len();
        self.spec.push(fd);
    }

    /// Releases the spec-list slot of `fd`, if any.
    ///
    /// The last list element is swapped into the freed position and its
    /// back-pointer fixed up, so removal never shifts the list.
    pub(crate) fn release_spec_entry(&mut self, fd: RawFd) {
        let pos = self.entries[fd as usize].spec_pos;
        if pos == NO_SPEC {
            return;
        }

        self.entries[fd as usize].spec_pos = NO_SPEC;

        let last = self.spec.pop().expect("spec list empty with live entry");
        if pos < self.spec.len() {
            self.spec[pos] = last;
            self.entries[last as usize].spec_pos = pos;
        }
    }

    /// Clone of the callback stored for `fd`, if any.
    pub(crate) fn callback(&self, fd: RawFd) -> Option<IoCallback> {
        self.entries[fd as usize].iocb.clone()
    }

    pub(crate) fn entry(&self, fd: RawFd) -> &FdEntry {
        &self.entries[fd as usize]
    }

    pub(crate) fn entry_mut(&mut self, fd: RawFd) -> &mut FdEntry {
        &mut self.entries[fd as usize]
    }
}
