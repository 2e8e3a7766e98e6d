//! Speculative epoll poller.
//!
//! This poller layers a user-space readiness model on top of the
//! kernel's level-triggered interest set to avoid syscalls on the
//! common case of short activity bursts on a few descriptors:
//!
//! - a direction marked *active* is assumed ready; the callback is
//!   invoked next tick straight from the spec list, without consulting
//!   the kernel,
//! - a direction marked *polled* is delegated to the kernel interest
//!   set; the callback runs when the kernel reports readiness,
//! - a callback that consumes nothing demotes its direction from
//!   active to polled, handing the descriptor back to the kernel.
//!
//! Each tick proceeds in a fixed order: drain the update list (batching
//! interest-set mutations), compute the wait time, wait on the kernel,
//! dispatch kernel events, drive descriptors created inside the tick
//! (the nested drain), then drive the spec list. Callbacks may mutate
//! any descriptor's state at any point; changes are queued on the
//! update list and applied at the next tick's drain.

use super::epoll::{CtlOp, InterestSet};
use super::{Backlog, Poller};

use crate::config::Config;
use crate::fd::state::{
    EV_ACTIVE_R, EV_ACTIVE_RW, EV_ACTIVE_W, EV_POLLED_R, EV_POLLED_RW, EV_POLLED_W, EV_STATUS_R,
    EV_STATUS_W,
};
use crate::fd::{Direction, FdTab, IoEvents};
use crate::time::{tick_is_expired, tick_remain, Clock, Tick, MAX_DELAY_MS, TICK_ETERNITY};

use std::io;
use std::os::fd::RawFd;

use log::{debug, trace};

/// Kernel interest-set activity counters.
///
/// Cheap enough to maintain unconditionally; they feed load diagnostics
/// and make the poller's syscall behavior observable.
#[derive(Clone, Copy, Default, Debug)]
pub struct PollStats {
    /// ADD mutations issued against the interest set.
    pub ctl_add: u64,

    /// MOD mutations issued against the interest set.
    pub ctl_mod: u64,

    /// DEL mutations issued against the interest set.
    pub ctl_del: u64,

    /// Kernel waits performed.
    pub wait_calls: u64,

    /// Kernel events accepted for dispatch.
    pub polled_events: u64,

    /// Callback invocations made from the spec list.
    pub spec_dispatches: u64,
}

/// The speculative epoll poller.
///
/// Holds the kernel interest set, the reusable event buffer and the
/// poll-loop clock. Created unselected; [`init`](Poller::init)
/// allocates the kernel object, [`term`](Poller::term) releases it and
/// [`fork`](Poller::fork) replaces it after a process fork.
pub struct SpecPoll {
    /// Kernel interest set, present between `init` and `term`.
    interest: Option<InterestSet>,

    /// Reusable kernel event buffer, sized `absmaxevents`.
    events: Vec<libc::epoll_event>,

    /// Absolute maximum amount of polled events.
    absmaxevents: usize,

    /// Per-wait event budget, copied from the configuration.
    maxpollevents: usize,

    /// Selection preference; zeroed when the poller is unusable.
    pref: u16,

    clock: Clock,
    stats: PollStats,
}

impl SpecPoll {
    /// Startup selection preference.
    pub const PREF: u16 = 400;

    /// Creates the poller in its unselected state.
    pub fn new() -> Self {
        Self {
            interest: None,
            events: Vec::new(),
            absmaxevents: 0,
            maxpollevents: 0,
            pref: Self::PREF,
            clock: Clock::new(),
            stats: PollStats::default(),
        }
    }

    /// Size of the kernel event buffer, zero before `init`.
    pub fn absmaxevents(&self) -> usize {
        self.absmaxevents
    }

    /// Current tick of the poll-loop clock.
    pub fn now_ms(&self) -> Tick {
        self.clock.now_ms()
    }

    /// Share of recent wall time spent blocked in the kernel wait.
    pub fn idle_pct(&self) -> u32 {
        self.clock.idle_pct()
    }

    /// Activity counters since creation.
    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Applies every queued state change: kernel interest-set
    /// mutations, previous-state commit and spec-list membership.
    ///
    /// Mutations are issued in enqueue order. Failures are logged and
    /// ignored; the descriptor may have been closed since, and the next
    /// drain reconciles.
    fn drain_updates(&mut self, fdtab: &mut FdTab) {
        for updt_idx in 0..fdtab.updt.len() {
            let fd = fdtab.updt[updt_idx];
            let state = fdtab.entry(fd).state;
            let en = state.current();
            let eo = state.previous();

            if fdtab.entry(fd).owned && eo != en {
                if (eo ^ en) & EV_POLLED_RW != 0 {
                    let op = if en & EV_POLLED_RW == 0 {
                        CtlOp::Del
                    } else if eo & EV_POLLED_RW == 0 {
                        CtlOp::Add
                    } else {
                        CtlOp::Mod
                    };

                    let mut mask = 0u32;
                    if en & EV_POLLED_R != 0 {
                        mask |= libc::EPOLLIN as u32;
                    }
                    if en & EV_POLLED_W != 0 {
                        mask |= libc::EPOLLOUT as u32;
                    }

                    match op {
                        CtlOp::Add => self.stats.ctl_add += 1,
                        CtlOp::Mod => self.stats.ctl_mod += 1,
                        CtlOp::Del => self.stats.ctl_del += 1,
                    }

                    if let Some(set) = &self.interest {
                        if let Err(err) = set.ctl(op, fd, mask) {
                            debug!("epoll_ctl {op:?} on fd {fd} failed: {err}");
                        }
                    }
                }

                fdtab.entry_mut(fd).state.commit();

                if en & EV_ACTIVE_RW == 0 {
                    fdtab.release_spec_entry(fd);
                } else if (en & !eo) & EV_ACTIVE_RW != 0 {
                    fdtab.alloc_spec_entry(fd);
                }
            }

            let e = fdtab.entry_mut(fd);
            e.updated = false;
            e.new = false;
        }

        fdtab.updt.clear();
    }

    /// Computes the kernel wait time for this tick, in milliseconds.
    fn compute_wait(&self, fdtab: &FdTab, exp: Tick, backlog: Backlog) -> i32 {
        if fdtab.nb_spec() > 0 || backlog.any() {
            // speculative events or pending tasks must not be delayed
            // by a sleeping wait
            return 0;
        }

        if exp == TICK_ETERNITY {
            return MAX_DELAY_MS;
        }

        let now = self.clock.now_ms();
        if tick_is_expired(exp, now) {
            return 0;
        }

        // +1 prevents a tight loop against sub-millisecond remainders
        let remain = tick_remain(now, exp).saturating_add(1);
        remain.min(MAX_DELAY_MS as u32) as i32
    }

    /// Drives descriptors created by the callback that just returned.
    ///
    /// Fresh connections get one full cycle within the tick that
    /// accepted them, cutting the latency to their first byte. Walking
    /// backwards from the tail lets trailing entries that ended up
    /// fully idle be popped right away, shrinking later scans;
    /// non-trailing idle entries stay until the next drain, where they
    /// become no-ops.
    fn drain_new_fds(&mut self, fdtab: &mut FdTab, old_updt: usize) {
        let mut new_updt = fdtab.nb_updt();

        while new_updt > old_updt {
            let fd = fdtab.updt[new_updt - 1];

            if fdtab.entry(fd).new {
                let e = fdtab.entry_mut(fd);
                e.new = false;
                e.ev &= IoEvents::STICKY;

                let status = e.state.0;
                if status & EV_STATUS_R == EV_ACTIVE_R {
                    e.ev |= IoEvents::IN;
                }
                if status & EV_STATUS_W == EV_ACTIVE_W {
                    e.ev |= IoEvents::OUT;
                }

                let ev = e.ev;
                if !ev.is_empty() && fdtab.entry(fd).owned {
                    if let Some(iocb) = fdtab.callback(fd) {
                        iocb(fdtab, fd);
                    }
                }

                if new_updt == fdtab.nb_updt() && fdtab.entry(fd).state.0 == 0 {
                    fdtab.entry_mut(fd).updated = false;
                    fdtab.updt.pop();
                }
            }

            new_updt -= 1;
        }
    }

    /// Invokes the callback of every descriptor whose directions are
    /// exactly active.
    ///
    /// A callback may release the entry under iteration; the last list
    /// element is then swapped into the current slot, so the index only
    /// advances when the slot still holds the descriptor it held before
    /// the call.
    fn drive_spec_list(&mut self, fdtab: &mut FdTab) {
        let mut spec_idx = 0;

        while spec_idx < fdtab.spec.len() {
            let fd = fdtab.spec[spec_idx];
            let eo = fdtab.entry(fd).state.0;

            let e = fdtab.entry_mut(fd);
            e.ev &= IoEvents::STICKY;
            if eo & EV_STATUS_R == EV_ACTIVE_R {
                e.ev |= IoEvents::IN;
            }
            if eo & EV_STATUS_W == EV_ACTIVE_W {
                e.ev |= IoEvents::OUT;
            }

            let ev = e.ev;
            if !ev.is_empty() && fdtab.entry(fd).owned {
                if let Some(iocb) = fdtab.callback(fd) {
                    self.stats.spec_dispatches += 1;
                    iocb(fdtab, fd);
                }
            }

            if spec_idx < fdtab.spec.len() && fdtab.spec[spec_idx] != fd {
                // the callback released this entry and the swapped-in
                // successor now occupies the slot
                continue;
            }

            spec_idx += 1;
        }
    }
}

impl Poller for SpecPoll {
    fn name(&self) -> &'static str {
        "sepoll"
    }

    fn pref(&self) -> u16 {
        self.pref
    }

    fn test(&mut self, _cfg: &Config) -> bool {
        InterestSet::create().is_ok()
    }

    fn init(&mut self, cfg: &Config) -> io::Result<()> {
        match InterestSet::create() {
            Ok(set) => self.interest = Some(set),
            Err(err) => {
                self.pref = 0;
                return Err(err);
            }
        }

        self.absmaxevents = cfg.maxpollevents.max(cfg.maxsock);
        self.events = vec![libc::epoll_event { events: 0, u64: 0 }; self.absmaxevents];
        self.maxpollevents = cfg.maxpollevents;

        trace!("sepoll initialized, absmaxevents {}", self.absmaxevents);
        Ok(())
    }

    fn term(&mut self) {
        self.events = Vec::new();
        self.absmaxevents = 0;
        self.maxpollevents = 0;
        self.interest = None;
        self.pref = 0;

        trace!("sepoll terminated");
    }

    fn poll(&mut self, fdtab: &mut FdTab, exp: Tick, backlog: Backlog) {
        debug_assert!(self.interest.is_some(), "poll called before init");
        if self.interest.is_none() {
            return;
        }

        self.clock.update_now();
        self.drain_updates(fdtab);

        let wait_ms = self.compute_wait(fdtab, exp, backlog);

        let cap = fdtab.max_fd_in_use().min(self.maxpollevents).max(1);
        self.clock.enter_poll();
        self.stats.wait_calls += 1;

        let status = match &self.interest {
            Some(set) => set.wait(&mut self.events[..cap], wait_ms).unwrap_or(0),
            None => 0,
        };

        self.clock.leave_poll();

        fdtab.in_poll_loop = true;

        for i in 0..status {
            let kev = self.events[i];
            let fd = kev.u64 as RawFd;

            if !fdtab.is_owned(fd) {
                // closed by an earlier callback in this batch
                continue;
            }

            self.stats.polled_events += 1;

            let ev = (fdtab.ev(fd) & IoEvents::STICKY) | translate(kev.events);
            fdtab.entry_mut(fd).ev = ev;

            if ev.is_empty() {
                continue;
            }
            let Some(iocb) = fdtab.callback(fd) else {
                continue;
            };

            let old_updt = fdtab.nb_updt();

            // Mark the directions speculative before dispatching so
            // that a callback unable to make progress is still
            // revisited through the spec list next tick; its
            // set_polled call overrides this when needed.
            if ev.intersects(IoEvents::IN | IoEvents::HUP | IoEvents::ERR) {
                fdtab.set_active(fd, Direction::Read);
            }
            if ev.intersects(IoEvents::OUT | IoEvents::ERR) {
                fdtab.set_active(fd, Direction::Write);
            }

            iocb(fdtab, fd);

            self.drain_new_fds(fdtab, old_updt);
        }

        self.drive_spec_list(fdtab);

        fdtab.in_poll_loop = false;
    }

    fn fork(&mut self, _cfg: &Config) -> io::Result<()> {
        self.interest = None;
        self.interest = Some(InterestSet::create()?);

        trace!("sepoll kernel object recreated after fork");
        Ok(())
    }
}

impl Default for SpecPoll {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a kernel readiness mask onto callback-visible bits.
fn translate(mask: u32) -> IoEvents {
    let mut ev = IoEvents::empty();

    if mask & libc::EPOLLIN as u32 != 0 {
        ev |= IoEvents::IN;
    }
    if mask & libc::EPOLLPRI as u32 != 0 {
        ev |= IoEvents::PRI;
    }
    if mask & libc::EPOLLOUT as u32 != 0 {
        ev |= IoEvents::OUT;
    }
    if mask & libc::EPOLLERR as u32 != 0 {
        ev |= IoEvents::ERR;
    }
    if mask & libc::EPOLLHUP as u32 != 0 {
        ev |= IoEvents::HUP;
    }

    ev
}
