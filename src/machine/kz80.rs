//! The KZ80 Z80 laptop machine.
//!
//! 8 KiB of EEPROM at the bottom of the map, RAM above, and an SIO/2
//! on ports 0x80..0x83.  The `rz80` CPU core owns the flat 64 KiB
//! memory and calls back into [`KzBus`] for port I/O, so the bus keeps
//! its state behind `RefCell`s (the core's `Bus` trait takes `&self`).
//!
//! The core has no interrupt-controller wiring, so mode-2 delivery is
//! synthesized by hand: push PC, drop IFF1/IFF2, jump through the
//! `(I << 8) | vector` table.  Exactly one source may be live at a
//! time; the next delivery waits for the `ED 4D` fetch, which the
//! machine spots by peeking the instruction stream before each step.

use std::cell::RefCell;
use std::thread;
use std::time::Duration;

use rz80::{Bus, CPU};

use crate::devices::sio::{Sio, CHAN_A, CHAN_B};
use crate::irq::OpcodeSniffer;
use crate::trace::{self, Trace};
use crate::tty::{self, Console};

pub const ROM_SIZE: usize = 8192;

/// T-states per execution slice.
pub const TSTATE_STEPS: u32 = 369;

/// Port I/O decode for the laptop board: the SIO/2 and nothing else.
pub struct KzBus {
    pub sio: RefCell<Sio>,
    pub con: RefCell<Box<dyn Console>>,
    trace: Trace,
}

impl Bus for KzBus {
    fn cpu_inp(&self, port: i32) -> i32 {
        let addr = (port & 0xFF) as u8;
        if self.trace.has(trace::IO) {
            eprintln!("IORQ/R {:04X}", port & 0xFFFF);
        }
        let v = if (0x80..=0x83).contains(&addr) {
            self.sio.borrow_mut().read(addr & 3)
        } else {
            if self.trace.has(trace::UNK) {
                eprintln!("Unknown read from port {:02X}", addr);
            }
            0xFF
        };
        v as i32
    }

    fn cpu_outp(&self, port: i32, val: i32) {
        let addr = (port & 0xFF) as u8;
        let val = val as u8;
        if self.trace.has(trace::IO) {
            eprintln!("IORQ/W {:04X} <- {:02X}", port & 0xFFFF, val);
        }
        if (0x80..=0x83).contains(&addr) {
            let mut con = self.con.borrow_mut();
            self.sio.borrow_mut().write(addr & 3, val, &mut **con);
        } else if self.trace.has(trace::UNK) {
            eprintln!("Unknown write to port {:02X} of {:02X}", addr, val);
        }
    }
}

/// Which source is live (delivered, awaiting RETI).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveIrq {
    SioA,
    SioB,
}

pub struct Kz80Machine {
    pub cpu: CPU,
    pub bus: KzBus,
    pub live: Option<LiveIrq>,
    sniffer: OpcodeSniffer,
    rom: Vec<u8>,
    trace: Trace,
}

impl Kz80Machine {
    pub fn new(rom: Vec<u8>, con: Box<dyn Console>, trace: Trace) -> Self {
        let mut cpu = CPU::new_64k();
        for (i, b) in rom.iter().enumerate() {
            cpu.mem.w8(i as i32, *b as i32);
        }
        cpu.reset();
        Self {
            cpu,
            bus: KzBus {
                sio: RefCell::new(Sio::new(true, trace.clone())),
                con: RefCell::new(con),
                trace: trace.clone(),
            },
            live: None,
            sniffer: OpcodeSniffer::new(),
            rom,
            trace,
        }
    }

    /// Re-assert the EEPROM image over the core's flat memory.  The
    /// CPU core has no write-enable mask, so a stray ROM write lives
    /// at most one pacing interval.
    pub fn reseat_rom(&mut self) {
        for (i, b) in self.rom.iter().enumerate() {
            self.cpu.mem.w8(i as i32, *b as i32);
        }
    }

    /// Deliver a pending SIO interrupt if the CPU will take it.
    ///
    /// Priority is channel A, then channel B; nothing is delivered
    /// while another source is live or while interrupts are disabled.
    pub fn poll_irq_event(&mut self) {
        if self.live.is_some() || !self.cpu.iff1 {
            return;
        }
        let picked = {
            let mut sio = self.bus.sio.borrow_mut();
            if let Some(v) = sio.check_pending(CHAN_A) {
                Some((LiveIrq::SioA, v))
            } else {
                sio.check_pending(CHAN_B).map(|v| (LiveIrq::SioB, v))
            }
        };
        let Some((src, vector)) = picked else {
            return;
        };
        if self.trace.has(trace::IRQ) {
            eprintln!(
                "New live interrupt pending is SIO ({:?}:{:02X}).",
                src, vector
            );
        }
        self.live = Some(src);
        self.mode2_entry(vector);
    }

    /// Synthesized mode-2 acceptance.
    fn mode2_entry(&mut self, vector: u8) {
        let pc = self.cpu.reg.pc();
        let sp = self.cpu.reg.sp().wrapping_sub(2);
        self.cpu.reg.set_sp(sp);
        self.cpu.mem.w8((sp as i32) & 0xFFFF, (pc & 0xFF) as i32);
        self.cpu
            .mem
            .w8((sp.wrapping_add(1) as i32) & 0xFFFF, ((pc >> 8) & 0xFF) as i32);
        self.cpu.iff1 = false;
        self.cpu.iff2 = false;
        self.cpu.halt = false;
        let table = (((self.cpu.reg.i as i32) << 8) | vector as i32) & 0xFFFF;
        let lo = self.cpu.mem.r8(table);
        let hi = self.cpu.mem.r8((table + 1) & 0xFFFF);
        self.cpu.reg.set_pc((((hi << 8) | lo) & 0xFFFF) as _);
    }

    /// The `ED 4D` acknowledge: all chips respond at once, then the
    /// next pending source is delivered.
    fn reti_event(&mut self) {
        if self.live.is_some() && self.trace.has(trace::IRQ) {
            eprintln!("RETI");
        }
        self.bus.sio.borrow_mut().reti();
        self.live = None;
        self.poll_irq_event();
    }

    /// Run roughly `budget` T-states.
    pub fn step_slice(&mut self, budget: u32) {
        let mut spent = 0u32;
        while spent < budget {
            if self.cpu.halt {
                // Nothing will change until a device tick raises an
                // interrupt; burn the rest of the slice.
                break;
            }
            // Watch the fetch stream for RETI before the opcode runs.
            let pc = self.cpu.reg.pc();
            let b0 = self.cpu.mem.r8((pc as i32) & 0xFFFF);
            let mut reti = self.sniffer.on_fetch(b0 as u8, true);
            if !reti && b0 as u8 == 0xED {
                let b1 = self.cpu.mem.r8(((pc as i32) + 1) & 0xFFFF);
                reti = self.sniffer.on_fetch(b1 as u8, true);
            }
            let t = self.cpu.step(&self.bus);
            spent += t as u32;
            if reti {
                // Acknowledge after the instruction has completed so
                // the re-delivered interrupt pushes the right PC.
                self.reti_event();
            } else {
                self.poll_irq_event();
            }
        }
    }

    /// Service the SIO against the host console.
    pub fn tick_devices(&mut self) {
        let mut con = self.bus.con.borrow_mut();
        self.bus.sio.borrow_mut().timer(&mut **con);
    }

    /// Main loop: 100 slices per pacing interval.
    pub fn run(&mut self, pacing: Duration) {
        while !tty::shutdown_requested() {
            for _ in 0..100 {
                self.step_slice(TSTATE_STEPS);
                self.tick_devices();
                self.poll_irq_event();
            }
            self.reseat_rom();
            thread::sleep(pacing);
        }
    }
}
