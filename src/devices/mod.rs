//! Peripheral chip models.
//!
//! Each chip is self-contained and reachable from a board assembly in
//! [`crate::machine`].  Host byte I/O goes through the injected
//! [`crate::tty::Console`]; chips on the flat-IRQ board raise and drop
//! their sources through a borrowed [`crate::irq::IrqMask`].

pub mod acia;
pub mod ctc;
pub mod rtc;
pub mod sio;
pub mod uart16x50;
pub mod via;
