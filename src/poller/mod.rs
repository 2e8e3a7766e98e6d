//! Poller plug-in table.
//!
//! This module defines the interface every readiness poller implements
//! and the registry through which the runtime picks one at startup:
//!
//! - [`Poller`] is the vtable: lifecycle (`test` / `init` / `term` /
//!   `fork`) plus the per-tick [`poll`](Poller::poll) entry point,
//! - [`Registry`] is an ordered plug-in table with preference-based
//!   selection,
//! - [`Backlog`] carries the scheduler's "work is pending elsewhere"
//!   flags into the wait-time computation.
//!
//! The concrete speculative poller lives in [`sepoll`].

pub(crate) mod epoll;
pub mod sepoll;

pub use sepoll::{PollStats, SpecPoll};

use crate::config::Config;
use crate::fd::FdTab;
use crate::time::Tick;

use std::io;

/// Maximum number of pollers the registry will accept.
pub const MAX_POLLERS: usize = 10;

/// Work pending elsewhere in the runtime.
///
/// The poll loop only reads these flags to decide whether the kernel
/// wait may block: when either queue is non-empty the wait time is
/// forced to zero so pending tasks and signals are not delayed by a
/// sleeping poller.
#[derive(Clone, Copy, Default, Debug)]
pub struct Backlog {
    /// The task run queue is non-empty.
    pub run_queue: bool,

    /// The signal queue is non-empty.
    pub signal_queue: bool,
}

impl Backlog {
    pub(crate) fn any(self) -> bool {
        self.run_queue || self.signal_queue
    }
}

/// A readiness poller selectable through the [`Registry`].
pub trait Poller {
    /// Short identifier used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Selection preference; higher wins, zero marks the poller
    /// unselectable.
    fn pref(&self) -> u16;

    /// Probes whether the poller can work on this system, without
    /// keeping any resource.
    fn test(&mut self, cfg: &Config) -> bool;

    /// Allocates the kernel object and event buffer.
    ///
    /// On failure the poller marks itself unselectable (preference
    /// zero) so the registry falls through to the next candidate.
    fn init(&mut self, cfg: &Config) -> io::Result<()>;

    /// Releases everything `init` allocated and marks the poller
    /// unselectable.
    fn term(&mut self);

    /// Runs one tick: applies pending updates, waits for readiness and
    /// dispatches callbacks.
    ///
    /// `exp` is the next deadline as a tick ([`TICK_ETERNITY`] for
    /// none); `backlog` reports work pending elsewhere in the runtime.
    ///
    /// [`TICK_ETERNITY`]: crate::time::TICK_ETERNITY
    fn poll(&mut self, fdtab: &mut FdTab, exp: Tick, backlog: Backlog);

    /// Recreates the kernel object after a fork.
    ///
    /// The inherited object must not be reused: a poll object shared
    /// across forked processes has been observed to deliver readiness
    /// for descriptors already removed in the sibling process.
    fn fork(&mut self, cfg: &Config) -> io::Result<()>;
}

/// Ordered plug-in table of registered pollers.
///
/// # Examples
///
/// ```rust,ignore
/// let cfg = Config::default();
/// let mut registry = Registry::with_default_pollers();
/// let poller = registry.select(&cfg).expect("no working poller");
/// ```
pub struct Registry {
    pollers: Vec<Box<dyn Poller>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            pollers: Vec::with_capacity(MAX_POLLERS),
        }
    }

    /// Creates a registry pre-populated with the pollers this crate
    /// provides, at their startup preferences.
    pub fn with_default_pollers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SpecPoll::new()));
        registry
    }

    /// Publishes a poller. Silently a no-op when the table is full.
    pub fn register(&mut self, poller: Box<dyn Poller>) {
        if self.pollers.len() >= MAX_POLLERS {
            return;
        }

        self.pollers.push(poller);
    }

    /// Number of registered pollers.
    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Selects and initializes the best working poller.
    ///
    /// Candidates are tried in descending preference order; a poller
    /// whose probe or initialization fails is skipped. Returns the
    /// first poller whose `init` succeeded.
    pub fn select(&mut self, cfg: &Config) -> Option<&mut (dyn Poller + '_)> {
        let mut order: Vec<usize> = (0..self.pollers.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.pollers[i].pref()));

        let mut chosen = None;
        for i in order {
            let poller = &mut self.pollers[i];
            if poller.pref() == 0 {
                continue;
            }
            if !poller.test(cfg) {
                continue;
            }
            if poller.init(cfg).is_ok() {
                chosen = Some(i);
                break;
            }
        }

        match chosen {
            Some(i) => Some(&mut *self.pollers[i]),
            None => None,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
