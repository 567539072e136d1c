//! Board assemblies.
//!
//! Each machine wires a CPU core to the memory fabric and a
//! complement of peripherals, and owns the run loop: execute a
//! T-state quantum, tick the chips, poll the host, deliver
//! interrupts.

pub mod kz80;
pub mod rc6502;
