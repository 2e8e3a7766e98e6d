//! Readiness bits handed to I/O callbacks.

use bitflags::bitflags;

bitflags! {
    /// Readiness events carried on an fd record between the poller and
    /// its I/O callback.
    ///
    /// The poller rewrites these bits on every dispatch, except for the
    /// [`STICKY`](IoEvents::STICKY) subset which survives the per-tick
    /// reset so that deferred error indications pinned on by external
    /// code are not lost.
    #[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
    pub struct IoEvents: u8 {
        /// Data can be read.
        const IN = 0x01;

        /// Priority data can be read.
        const PRI = 0x02;

        /// Data can be written.
        const OUT = 0x04;

        /// A pending error was reported on the descriptor.
        const ERR = 0x08;

        /// The peer hung up.
        const HUP = 0x10;

        /// Bits that survive the per-tick reset.
        const STICKY = Self::ERR.bits() | Self::HUP.bits();
    }
}
