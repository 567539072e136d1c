//! The RC2014 6502 processor-card machine.
//!
//! A 6502 with an inverted-A15 option, Zeta-style banked memory, and
//! an I/O window at page 0xC0.  The bus implements
//! `mos6502::memory::Bus` so the `mos6502` CPU drives it directly.
//! That crate has no IRQ support, so interrupt entry is synthesized:
//! after each instruction, a nonzero source mask pushes PC and status
//! through the bus and jumps through the $FFFE vector.
//!
//! Interrupt acknowledgment is the curious part of this board: the
//! peripherals are Z80 chips that want to see an `ED 4D` fetch, which
//! a 6502 never issues.  The board optionally fakes the M1 line, and
//! the read path runs every fetched byte past the RETI sniffer when
//! that is enabled.

use mos6502::cpu::CPU;
use mos6502::instruction::Nmos6502;
use mos6502::memory::Bus;
use mos6502::registers::{StackPointer, Status};

use crate::devices::acia::Acia;
use crate::devices::ctc::Ctc;
use crate::devices::rtc::{Rtc, WallClock};
use crate::devices::sio::{Sio, CHAN_A, CHAN_B};
use crate::devices::uart16x50::Uart16x50;
use crate::devices::via::Via6522;
use crate::ide::IdeController;
use crate::irq::{IrqMask, OpcodeSniffer, IRQ_16550A, IRQ_CTC, IRQ_SIOA, IRQ_SIOB};
use crate::memory::BankedMemory;
use crate::nic::NicW5100;
use crate::trace::{self, Trace};
use crate::tty::Console;

/// The whole board minus the CPU: fabric, decoder, chips.
pub struct Rc6502Bus {
    pub mem: BankedMemory,
    pub sio: Option<Sio>,
    pub acia: Option<Acia>,
    pub acia_narrow: bool,
    pub uart: Option<Uart16x50>,
    pub ctc: Option<Ctc>,
    pub via: Via6522,
    pub rtc: Option<Rtc>,
    pub ide: Option<IdeController>,
    pub nic: Option<NicW5100>,
    pub intc: IrqMask,
    pub con: Box<dyn Console>,
    pub clock: Box<dyn WallClock>,
    sniffer: OpcodeSniffer,
    pub fake_m1: bool,
    iopage: u8,
    trace: Trace,
}

impl Rc6502Bus {
    pub fn new(
        mem: BankedMemory,
        con: Box<dyn Console>,
        clock: Box<dyn WallClock>,
        iopage: u8,
        fake_m1: bool,
        trace: Trace,
    ) -> Self {
        Self {
            mem,
            sio: None,
            acia: None,
            acia_narrow: false,
            uart: None,
            ctc: None,
            via: Via6522::new(trace.clone()),
            rtc: None,
            ide: None,
            nic: None,
            intc: IrqMask::new(),
            con,
            clock,
            sniffer: OpcodeSniffer::new(),
            fake_m1,
            iopage,
            trace,
        }
    }

    /// Side-effect-free read for debuggers and cycle counting.
    pub fn peek(&self, addr: u16) -> u8 {
        if (addr >> 8) as u8 == self.iopage {
            return 0xFF;
        }
        self.mem.read(addr)
    }

    // ── I/O window ────────────────────────────────────────────

    fn mmio_read(&mut self, addr: u8) -> u8 {
        if self.trace.has(trace::IO) {
            eprintln!("read {:02x}", addr);
        }
        if (0x80..=0x87).contains(&addr) && self.acia.is_some() && self.acia_narrow {
            let acia = self.acia.as_mut().unwrap();
            return acia.read(addr & 1, &mut self.intc);
        }
        if (0x80..=0xBF).contains(&addr) && self.acia.is_some() && !self.acia_narrow {
            let acia = self.acia.as_mut().unwrap();
            return acia.read(addr & 1, &mut self.intc);
        }
        if (0x80..=0x83).contains(&addr) {
            if let Some(sio) = self.sio.as_mut() {
                return sio.read(addr & 3);
            }
        }
        if (0x10..=0x17).contains(&addr) {
            if let Some(ide) = self.ide.as_mut() {
                return ide.read8(addr & 7);
            }
        }
        if (0x28..=0x2C).contains(&addr) {
            if let Some(nic) = self.nic.as_mut() {
                return nic.read(addr & 3);
            }
        }
        if (0x60..=0x6F).contains(&addr) {
            return self.via.read(addr & 0x0F, &mut self.intc);
        }
        if addr == 0xC0 {
            if let Some(rtc) = self.rtc.as_ref() {
                return rtc.read();
            }
        }
        if (0xC0..=0xCF).contains(&addr) && self.uart.is_some() {
            let uart = self.uart.as_mut().unwrap();
            return uart.read(addr & 0x0F, &mut *self.con, &mut self.intc);
        }
        if (0x88..=0x8B).contains(&addr) {
            if let Some(ctc) = self.ctc.as_ref() {
                return ctc.read((addr & 3) as usize);
            }
        }
        if self.trace.has(trace::UNK) {
            eprintln!("Unknown read from port {:04X}", addr);
        }
        0xFF
    }

    fn mmio_write(&mut self, addr: u8, val: u8) {
        if self.trace.has(trace::IO) {
            eprintln!("write {:02x} <- {:02x}", addr, val);
        }
        if (0x80..=0x87).contains(&addr) && self.acia.is_some() && self.acia_narrow {
            let acia = self.acia.as_mut().unwrap();
            acia.write(addr & 1, val, &mut *self.con, &mut self.intc);
        } else if (0x80..=0xBF).contains(&addr) && self.acia.is_some() && !self.acia_narrow {
            let acia = self.acia.as_mut().unwrap();
            acia.write(addr & 1, val, &mut *self.con, &mut self.intc);
        } else if (0x80..=0x83).contains(&addr) && self.sio.is_some() {
            let sio = self.sio.as_mut().unwrap();
            sio.write(addr & 3, val, &mut *self.con);
        } else if (0x10..=0x17).contains(&addr) && self.ide.is_some() {
            self.ide.as_mut().unwrap().write8(addr & 7, val);
        } else if (0x28..=0x2C).contains(&addr) && self.nic.is_some() {
            self.nic.as_mut().unwrap().write(addr & 3, val);
        } else if (0x60..=0x6F).contains(&addr) {
            self.via.write(addr & 0x0F, val, &mut self.intc);
        } else if (0x78..=0x7B).contains(&addr) {
            self.mem.write_bank_reg(addr & 3, val);
        } else if (0x7C..=0x7F).contains(&addr) {
            self.mem.set_bank_enable(val);
        } else if addr == 0xC0 && self.rtc.is_some() {
            let rtc = self.rtc.as_mut().unwrap();
            rtc.write(val, &mut *self.clock);
        } else if (0x88..=0x8B).contains(&addr) && self.ctc.is_some() {
            let ctc = self.ctc.as_mut().unwrap();
            ctc.write((addr & 3) as usize, val);
            // A control write may have withdrawn the last pending bit.
            if !ctc.any_pending() {
                self.intc.clear(IRQ_CTC);
            }
        } else if (0xC0..=0xCF).contains(&addr) && self.uart.is_some() {
            let uart = self.uart.as_mut().unwrap();
            uart.write(addr & 0x0F, val, &mut *self.con, &mut self.intc);
        } else if addr == 0x00 {
            println!("trace set to {}", val);
            self.trace.set(val as u32);
        } else if self.trace.has(trace::UNK) {
            eprintln!("Unknown write to port {:04X} of {:02X}", addr, val);
        }
    }

    // ── Interrupt plumbing ────────────────────────────────────

    /// Look for freshly pending sources and assert them on the mask.
    pub fn poll_irq_event(&mut self) {
        // The SIO has IE0/IE1 working internally but not globally.
        if let Some(sio) = self.sio.as_mut() {
            if sio.check_pending(CHAN_A).is_some() {
                self.intc.set(IRQ_SIOA);
            } else if sio.check_pending(CHAN_B).is_some() {
                self.intc.set(IRQ_SIOB);
            }
        }
        // The CTC has nothing wired to IE0/IE1 at all.
        if let Some(ctc) = self.ctc.as_ref() {
            if let Some(n) = ctc.pending_channel() {
                if self.trace.has(trace::IRQ) {
                    eprintln!(
                        "New live interrupt is from CTC {} vector {:x}.",
                        n,
                        ctc.vector_for(n)
                    );
                }
                self.intc.set(IRQ_CTC);
            }
        }
    }

    /// An `ED 4D` went by on the fetch stream: every Z80 peripheral
    /// acknowledges at once, then pending state is recomputed.
    pub fn reti_event(&mut self) {
        if let Some(sio) = self.sio.as_mut() {
            sio.reti();
            self.intc.clear(IRQ_SIOA);
            self.intc.clear(IRQ_SIOB);
            if sio.check_pending(CHAN_A).is_some() {
                self.intc.set(IRQ_SIOA);
            }
            if sio.check_pending(CHAN_B).is_some() {
                self.intc.set(IRQ_SIOB);
            }
        }
        if let Some(ctc) = self.ctc.as_mut() {
            for n in 0..4 {
                ctc.reti(n);
            }
        }
        // The ACIA and 16550A pay no attention to RETI; the UART
        // source drops here and is re-raised by its next event.
        self.intc.clear(IRQ_16550A);
        self.poll_irq_event();
    }

    /// Per-quantum device service.
    pub fn tick_timers(&mut self, tstates: u32) {
        if let Some(acia) = self.acia.as_mut() {
            acia.timer(&mut *self.con, &mut self.intc);
        }
        if let Some(sio) = self.sio.as_mut() {
            sio.timer(&mut *self.con);
        }
        if let Some(ctc) = self.ctc.as_mut() {
            ctc.tick(tstates);
        }
        if let Some(uart) = self.uart.as_mut() {
            uart.event(&mut *self.con, &mut self.intc);
        }
        self.via.tick(tstates, &mut self.intc);
    }
}

impl Bus for Rc6502Bus {
    fn get_byte(&mut self, addr: u16) -> u8 {
        if (addr >> 8) as u8 == self.iopage {
            return self.mmio_read(addr as u8);
        }
        let r = self.mem.read(addr);
        if self.sniffer.on_fetch(r, self.fake_m1) {
            self.reti_event();
        }
        r
    }

    fn set_byte(&mut self, addr: u16, val: u8) {
        if (addr >> 8) as u8 == self.iopage {
            self.mmio_write(addr as u8, val);
            return;
        }
        self.mem.write(addr, val);
    }
}

// ── CPU coupling ──────────────────────────────────────────────

/// Cycle counts per opcode (branch/page-cross penalties ignored;
/// close enough to pace a serial console).
static OPCODE_CYCLES: [u8; 256] = [
    //0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F
    7, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 4, 4, 6, 6, // 0x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 1x
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 4, 4, 6, 6, // 2x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 3x
    6, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 3, 4, 6, 6, // 4x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 5x
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 5, 4, 6, 6, // 6x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 7x
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4, // 8x
    2, 6, 2, 6, 4, 4, 4, 4, 2, 5, 2, 5, 5, 5, 5, 5, // 9x
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4, // Ax
    2, 5, 2, 5, 4, 4, 4, 4, 2, 4, 2, 4, 4, 4, 4, 4, // Bx
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6, // Cx
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // Dx
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6, // Ex
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // Fx
];

/// Synthesize the 6502 IRQ sequence: push PC and status (B clear),
/// set I, load the vector.  Returns the 7 cycles consumed, or 0 when
/// interrupts are masked.
pub fn deliver_irq(cpu: &mut CPU<Rc6502Bus, Nmos6502>) -> u32 {
    if cpu.registers.status.contains(Status::PS_DISABLE_INTERRUPTS) {
        return 0;
    }
    let pc = cpu.registers.program_counter;
    let mut sp = cpu.registers.stack_pointer.0;

    cpu.memory.set_byte(0x0100 | sp as u16, (pc >> 8) as u8);
    sp = sp.wrapping_sub(1);
    cpu.memory.set_byte(0x0100 | sp as u16, (pc & 0xFF) as u8);
    sp = sp.wrapping_sub(1);
    let status_byte = (cpu.registers.status.bits() | 0x20) & !0x10;
    cpu.memory.set_byte(0x0100 | sp as u16, status_byte);
    sp = sp.wrapping_sub(1);

    cpu.registers.stack_pointer = StackPointer(sp);
    cpu.registers.status.insert(Status::PS_DISABLE_INTERRUPTS);

    let lo = cpu.memory.get_byte(0xFFFE) as u16;
    let hi = cpu.memory.get_byte(0xFFFF) as u16;
    cpu.registers.program_counter = (hi << 8) | lo;
    7
}

pub struct Rc6502Machine {
    pub cpu: CPU<Rc6502Bus, Nmos6502>,
}

impl Rc6502Machine {
    /// Build the CPU around the bus and take the reset vector.
    pub fn new(bus: Rc6502Bus) -> Self {
        let mut cpu = CPU::new(bus, Nmos6502);
        let lo = cpu.memory.peek(0xFFFC) as u16;
        let hi = cpu.memory.peek(0xFFFD) as u16;
        cpu.registers.program_counter = (hi << 8) | lo;
        cpu.registers.stack_pointer = StackPointer(0xFD);
        cpu.registers.status.insert(Status::PS_DISABLE_INTERRUPTS);
        Self { cpu }
    }

    /// Run roughly `budget` T-states, delivering interrupts between
    /// instructions whenever a source is live.
    pub fn exec_tstates(&mut self, budget: u32) {
        let mut spent = 0u32;
        while spent < budget {
            let op = self.cpu.memory.peek(self.cpu.registers.program_counter);
            self.cpu.single_step();
            spent += OPCODE_CYCLES[op as usize] as u32;
            if self.cpu.memory.intc.any() {
                spent += deliver_irq(&mut self.cpu);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::rtc::RtcTime;
    use crate::devices::sio::Sio;
    use crate::devices::uart16x50::Uart16x50;
    use crate::irq::IRQ_VIA;
    use crate::tty::testing::ScriptedConsole;

    struct FixedClock;

    impl WallClock for FixedClock {
        fn now(&mut self) -> RtcTime {
            RtcTime::default()
        }
    }

    fn bus() -> Rc6502Bus {
        let trace = Trace::default();
        Rc6502Bus::new(
            BankedMemory::new(0, trace.clone()),
            Box::new(ScriptedConsole::default()),
            Box::new(FixedClock),
            0xC0,
            false,
            trace,
        )
    }

    #[test]
    fn banking_ports_select_ram_pages() {
        let mut b = bus();
        for (i, bank) in [32u8, 33, 34, 35].iter().enumerate() {
            b.set_byte(0xC078 + i as u16, *bank);
        }
        b.set_byte(0xC07C, 1);
        b.set_byte(0x0000, 0x99);
        assert_eq!(b.get_byte(0x0000), 0x99);
        assert_eq!(b.mem.backing()[32 << 14], 0x99);
    }

    #[test]
    fn io_window_is_position_checked_before_inversion() {
        let trace = Trace::default();
        let mut b = Rc6502Bus::new(
            BankedMemory::new(0x8000, trace.clone()),
            Box::new(ScriptedConsole::default()),
            Box::new(FixedClock),
            0xC0,
            false,
            trace,
        );
        // 0xC060..0xC06F is the VIA even with address inversion on.
        b.set_byte(0xC063, 0x77);
        assert_eq!(b.get_byte(0xC063), 0x77); // DDRA round-trip
    }

    #[test]
    fn via_interrupt_reaches_the_mask() {
        let mut b = bus();
        b.set_byte(0xC06E, 0xC0); // IER: enable T1
        b.set_byte(0xC064, 0x04);
        b.set_byte(0xC065, 0x00); // T1 = 4, started
        b.tick_timers(10);
        assert!(b.intc.is_set(IRQ_VIA));
    }

    #[test]
    fn unknown_ports_read_as_floating_bus() {
        let mut b = bus();
        assert_eq!(b.get_byte(0xC0F7), 0xFF);
    }

    #[test]
    fn fake_m1_sniff_triggers_reti_event() {
        let mut b = bus();
        b.fake_m1 = true;
        b.ctc = Some(Ctc::new(Trace::default()));
        {
            let ctc = b.ctc.as_mut().unwrap();
            ctc.chan[0].ctrl = crate::devices::ctc::CTC_IRQ | crate::devices::ctc::CTC_COUNTER;
            ctc.irqmask = 0x01;
        }
        b.intc.set(IRQ_CTC);
        // Arrange an ED 4D in RAM and fetch it.
        for (i, bank) in [32u8, 33, 34, 35].iter().enumerate() {
            b.set_byte(0xC078 + i as u16, *bank);
        }
        b.set_byte(0xC07C, 1);
        b.set_byte(0x2000, 0xED);
        b.set_byte(0x2001, 0x4D);
        b.get_byte(0x2000);
        b.get_byte(0x2001);
        assert!(!b.ctc.as_ref().unwrap().any_pending());
    }

    #[test]
    fn sio_echo_reaches_interrupt_mask() {
        let mut b = bus();
        let mut sio = Sio::new(true, Trace::default());
        sio.chan[CHAN_A].wr[3] = 0x01;
        sio.chan[CHAN_A].wr[1] = 0x10;
        b.sio = Some(sio);
        b.con = Box::new(ScriptedConsole::with_input(&[0x41]));
        b.tick_timers(200);
        b.poll_irq_event();
        assert!(b.intc.is_set(IRQ_SIOA));
        assert_eq!(b.get_byte(0xC081), 0x41); // SIO channel A data
    }

    #[test]
    fn cpu_transmits_through_the_uart() {
        // End to end: a little 6502 program stored in ROM writes a
        // byte to the 16550A data register.
        let mut b = bus();
        let con = crate::tty::testing::SharedConsole::default();
        let output = con.output.clone();
        b.con = Box::new(con);
        b.uart = Some(Uart16x50::new(Trace::default()));
        let mut rom = vec![0u8; 0x4000];
        // LDA #$48; STA $C0C0; JMP $0005
        let prog = [0xA9, 0x48, 0x8D, 0xC0, 0xC0, 0x4C, 0x05, 0x00];
        rom[..prog.len()].copy_from_slice(&prog);
        // Reset vector (replicated ROM page): $0000.
        rom[0x3FFC] = 0x00;
        rom[0x3FFD] = 0x00;
        b.mem.load_rom(&rom);

        let mut machine = Rc6502Machine::new(b);
        assert_eq!(machine.cpu.registers.program_counter, 0x0000);
        machine.exec_tstates(40);
        assert!(output.borrow().contains(&0x48));
    }
}
