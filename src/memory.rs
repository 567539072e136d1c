//! Banked memory fabric for the 6502 processor card.
//!
//! One megabyte of backing store: the first 512 KiB is flash ROM, the
//! second 512 KiB is RAM.  Four bank registers map 16 KiB pages into
//! the quadrants of the CPU's 64 KiB address space, Zeta style.  The
//! board may also invert address lines (A15 on the real card) before
//! decode, which is modeled as an XOR mask applied to the incoming
//! address.
//!
//! With banking disabled the whole address space repeats page 0 of the
//! ROM and nothing is writable.

use crate::trace::{self, Trace};

pub const BACKING_SIZE: usize = 1024 * 1024;
pub const ROM_SIZE: usize = 512 * 1024;

/// Bank numbers at or above this index select the RAM half.
pub const RAM_BANK_BASE: u8 = 32;

pub struct BankedMemory {
    backing: Vec<u8>,
    bankreg: [u8; 4],
    bankenable: bool,
    addr_invert: u16,
    trace: Trace,
}

impl BankedMemory {
    pub fn new(addr_invert: u16, trace: Trace) -> Self {
        Self {
            backing: vec![0; BACKING_SIZE],
            bankreg: [0; 4],
            bankenable: false,
            addr_invert,
            trace,
        }
    }

    /// Seat the ROM image in the low half of the backing store.
    pub fn load_rom(&mut self, image: &[u8]) {
        let n = image.len().min(ROM_SIZE);
        self.backing[..n].copy_from_slice(&image[..n]);
    }

    pub fn read(&self, addr: u16) -> u8 {
        let xaddr = addr ^ self.addr_invert;
        if self.bankenable {
            let bank = (xaddr >> 14) & 3;
            let reg = self.bankreg[bank as usize];
            let val = self.backing[((reg as usize) << 14) + (xaddr & 0x3FFF) as usize];
            if self.trace.has(trace::MEM) {
                eprintln!("R {:04X}[{:02X}] = {:02X}", addr, reg, val);
            }
            return val;
        }
        // Banking off: the entire 64K repeats ROM page 0.
        let val = self.backing[(xaddr & 0x3FFF) as usize];
        if self.trace.has(trace::MEM) {
            eprintln!("R {:04X} = {:02X}", addr, val);
        }
        val
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        let xaddr = addr ^ self.addr_invert;
        if self.bankenable {
            let bank = (xaddr >> 14) & 3;
            let reg = self.bankreg[bank as usize];
            if self.trace.has(trace::MEM) {
                eprintln!("W {:04X}[{:02X}] = {:02X}", addr, reg, val);
            }
            if reg >= RAM_BANK_BASE {
                self.backing[((reg as usize) << 14) + (xaddr & 0x3FFF) as usize] = val;
            } else if self.trace.has(trace::MEM) {
                eprintln!("[Discarded: ROM]");
            }
        } else if self.trace.has(trace::MEM) {
            // Nothing is writable until the banker is switched on.
            eprintln!("W: {:04X} = {:02X} [Discarded: ROM]", addr, val);
        }
    }

    /// Guest write to one of the bank select ports (0x78..0x7B).
    pub fn write_bank_reg(&mut self, idx: u8, val: u8) {
        self.bankreg[(idx & 3) as usize] = val & 0x3F;
        if self.trace.has(trace::BANK) {
            eprintln!("Bank {} set to {}", idx & 3, val);
        }
    }

    /// Guest write to the bank enable port (0x7C..0x7F).
    pub fn set_bank_enable(&mut self, val: u8) {
        self.bankenable = val & 1 != 0;
        if self.trace.has(trace::BANK) {
            eprintln!("Banking {}abled.", if val & 1 != 0 { "en" } else { "dis" });
        }
    }

    pub fn bank_reg(&self, idx: u8) -> u8 {
        self.bankreg[(idx & 3) as usize]
    }

    pub fn bank_enabled(&self) -> bool {
        self.bankenable
    }

    /// Direct view of the backing store (ROM half first).
    pub fn backing(&self) -> &[u8] {
        &self.backing
    }
}
