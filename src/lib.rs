//! Emulation fabric for RC2014-family single-board computers.
//!
//! The CPU cores are delegated to the `mos6502` and `rz80` crates;
//! everything else — memory banking, the I/O decoder, the peripheral
//! chips, and interrupt delivery — lives here.  Two board assemblies
//! are provided under [`machine`]: the KZ80 Z80 laptop and the
//! RC2014 6502 processor card.

pub mod devices;
pub mod ide;
pub mod irq;
pub mod machine;
pub mod memory;
pub mod nic;
pub mod trace;
pub mod tty;
