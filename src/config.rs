//! Poller configuration.
//!
//! A [`Config`] carries the two tuning knobs the pollers read at
//! initialization time:
//!
//! - `maxsock` — hard cap on concurrently open descriptors,
//! - `maxpollevents` — upper bound on events accepted from one kernel wait.
//!
//! Both are plain positive integers; the configuration is copied into the
//! poller at [`init`](crate::poller::Poller::init) and never re-read.

/// Tuning knobs read at poller initialization.
///
/// # Examples
///
/// ```rust,ignore
/// let cfg = Config::new(4096, 200);
/// let mut registry = Registry::with_default_pollers();
/// let poller = registry.select(&cfg).expect("no working poller");
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Hard cap on concurrently open file descriptors. Sizes the fd
    /// table and the event buffer.
    pub maxsock: usize,

    /// Maximum number of readiness events accepted from a single
    /// kernel wait.
    pub maxpollevents: usize,
}

impl Config {
    /// Creates a configuration with explicit limits.
    ///
    /// # Panics
    ///
    /// Panics if either limit is zero.
    pub fn new(maxsock: usize, maxpollevents: usize) -> Self {
        assert!(maxsock > 0, "maxsock must be > 0");
        assert!(maxpollevents > 0, "maxpollevents must be > 0");

        Self {
            maxsock,
            maxpollevents,
        }
    }
}

impl Default for Config {
    /// Default limits: 1024 sockets, 200 events per kernel wait.
    fn default() -> Self {
        Self {
            maxsock: 1024,
            maxpollevents: 200,
        }
    }
}
