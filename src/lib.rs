//! # Speculo
//!
//! **Speculo** is a speculative readiness event poller for
//! single-threaded network I/O cores, built to multiplex tens of
//! thousands of non-blocking file descriptors while keeping syscalls
//! off the hot path.
//!
//! Readiness is tracked on two levels. Every descriptor direction is
//! either *active* — the poller assumes it is still ready and invokes
//! its callback next tick without asking the kernel — or *polled* —
//! the kernel's level-triggered interest set reports readiness. A
//! descriptor moves from active to polled only when its callback
//! stalls, and back the moment the kernel reports it ready again. On
//! workloads dominated by short bursts on a few descriptors, most
//! dispatches never touch the kernel.
//!
//! The crate provides:
//!
//! - A **descriptor table** ([`FdTab`]) holding per-fd state, the
//!   update list and the speculative list, with O(1) syscall-free
//!   state operations callable from inside callbacks
//! - A **speculative epoll poller** ([`SpecPoll`]) running the
//!   tick algorithm: batched interest-set mutations, bounded kernel
//!   wait, kernel-event dispatch, same-tick drive of freshly created
//!   descriptors, speculative dispatch
//! - A **poller registry** ([`Registry`]) selecting the best working
//!   poller by preference at startup
//! - **Tick utilities** ([`time`]) for deadlines and idle accounting
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use speculo::{Backlog, Config, Direction, FdTab, Registry};
//! use speculo::time::TICK_ETERNITY;
//! use std::rc::Rc;
//!
//! let cfg = Config::default();
//! let mut fdtab = FdTab::new(cfg.maxsock);
//! let mut registry = Registry::with_default_pollers();
//! let poller = registry.select(&cfg).expect("no working poller");
//!
//! // Register a non-blocking socket and ask the kernel to watch it.
//! fdtab.insert(fd, Some(Rc::new(|tab: &mut FdTab, fd| {
//!     // read until EAGAIN, then hand the fd back to the kernel
//!     tab.set_polled(fd, Direction::Read);
//! })));
//! fdtab.set_polled(fd, Direction::Read);
//!
//! loop {
//!     poller.poll(&mut fdtab, TICK_ETERNITY, Backlog::default());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`] — Tuning knobs read at poller initialization
//! - [`fd`] — Descriptor table, readiness state and callback contract
//! - [`poller`] — Poller trait, registry and the speculative poller
//! - [`time`] — Ticks, deadlines and the poll-loop clock

pub mod config;
pub mod fd;
pub mod poller;
pub mod time;

pub use config::Config;
pub use fd::{Direction, FdTab, IoCallback, IoEvents};
pub use poller::{Backlog, PollStats, Poller, Registry, SpecPoll};
