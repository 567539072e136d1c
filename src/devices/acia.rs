//! Motorola 6850 ACIA.
//!
//! Two registers: control/status at even addresses, data at odd.
//! Status bits: 7 = IRQ pending, 5 = receive overrun, 1 = TX data
//! register empty, 0 = RX data register full.  Bits are set as
//! characters arrive and cleared by the following read, not by the
//! guest.

use crate::irq::{IrqMask, IRQ_ACIA};
use crate::trace::{self, Trace};
use crate::tty::Console;

pub struct Acia {
    pub status: u8,
    pub config: u8,
    rxchar: u8,
    /// Feed host input into the receiver.
    pub input: bool,
    in_int: bool,
    trace: Trace,
}

impl Acia {
    pub fn new(input: bool, trace: Trace) -> Self {
        Self {
            status: 0x02, // TX empty out of reset
            config: 0,
            rxchar: 0,
            input,
            in_int: false,
            trace,
        }
    }

    /// Refresh the interrupt source from config/status.  The source
    /// pulses: it is raised when an enabled cause appears and dropped
    /// again in the same pass, leaving the status bit for the guest
    /// to poll.
    fn irq_compute(&mut self, intc: &mut IrqMask) {
        if !self.in_int && self.config != 0 && self.status & 0x80 != 0 {
            if self.trace.has(trace::ACIA) {
                eprintln!("ACIA interrupt.");
            }
            self.in_int = true;
            intc.set(IRQ_ACIA);
        }
        if self.in_int {
            intc.clear(IRQ_ACIA);
            self.in_int = false;
        }
    }

    fn receive(&mut self, con: &mut dyn Console) {
        let old_status = self.status;
        self.status = old_status & 0x02;
        if old_status & 1 != 0 {
            // Unread character: flag the overrun.
            self.status |= 0x20;
        }
        self.rxchar = con.next_char();
        if self.trace.has(trace::ACIA) {
            eprintln!("ACIA rx.");
        }
        self.status |= 0x81; // IRQ + RX data full
    }

    fn transmit(&mut self) {
        if self.status & 2 == 0 {
            if self.trace.has(trace::ACIA) {
                eprintln!("ACIA tx is clear.");
            }
            self.status |= 0x82; // IRQ + TX data empty
        }
    }

    /// Per-quantum service.
    pub fn timer(&mut self, con: &mut dyn Console, intc: &mut IrqMask) {
        let s = con.poll();
        if s.rx && self.input {
            self.receive(con);
        }
        if s.tx {
            self.transmit();
        }
        if s.rx || s.tx {
            self.irq_compute(intc);
        }
    }

    pub fn read(&mut self, addr: u8, intc: &mut IrqMask) -> u8 {
        if self.trace.has(trace::ACIA) {
            eprintln!("acia_read {}", addr & 1);
        }
        match addr & 1 {
            0 => {
                self.status &= !0x80;
                self.irq_compute(intc);
                self.status
            }
            _ => {
                // Reading data clears IRQ and RX-full.
                self.status &= !0x81;
                self.irq_compute(intc);
                self.rxchar
            }
        }
    }

    pub fn write(&mut self, addr: u8, val: u8, con: &mut dyn Console, intc: &mut IrqMask) {
        if self.trace.has(trace::ACIA) {
            eprintln!("acia_write {} {}", addr & 1, val);
        }
        match addr & 1 {
            0 => {
                // Bit 7 enables interrupts, 5-6 TX control, 2-4 word
                // size, 0-1 the divider; 11 in the divider means reset.
                self.config = val;
                if self.config & 3 == 3 {
                    self.status = 0x02;
                }
                self.irq_compute(intc);
            }
            _ => {
                con.put_char(val);
                self.status &= !0x82;
            }
        }
    }
}
