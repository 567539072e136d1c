//! 16550A UART.
//!
//! The register file follows the 16x50 contract: offsets 0 and 1 swap
//! between data/IER and the divisor latch under DLAB (LCR bit 7), the
//! IIR is a priority encoder over the pending cause set, and the LSR
//! is computed live from host readiness with its low bits clearing on
//! read.  Only the causes the board can actually produce are wired:
//! receive-data-available, transmitter-empty, and modem-status.

use crate::irq::{IrqMask, IRQ_16550A};
use crate::trace::{self, Trace};
use crate::tty::Console;

/// Interrupt cause bits (matching the IER layout).
pub const RXDA: u8 = 1;
pub const TEMT: u8 = 2;
pub const MODEM: u8 = 8;

pub struct Uart16x50 {
    pub ier: u8,
    pub iir: u8,
    /// FIFO control shadow (write-only on the wire).
    #[allow(dead_code)]
    fcr: u8,
    pub lcr: u8,
    mcr: u8,
    pub lsr: u8,
    msr: u8,
    scratch: u8,
    /// Divisor latch low/high.
    ls: u8,
    ms: u8,
    dlab: bool,
    /// Pending cause set.
    irq: u8,
    /// Cause set at the time the line was last raised.
    irqline: u8,
    trace: Trace,
}

impl Uart16x50 {
    pub fn new(trace: Trace) -> Self {
        Self {
            ier: 0,
            iir: 0x01,
            fcr: 0,
            lcr: 0,
            mcr: 0,
            lsr: 0,
            msr: 0,
            scratch: 0,
            ls: 0,
            ms: 0,
            dlab: false,
            irq: 0,
            irqline: 0,
            trace,
        }
    }

    // ── Interrupt plumbing ────────────────────────────────────

    /// Re-encode the IIR from the pending cause set and waggle the
    /// controller line accordingly.
    fn recalc_iir(&mut self, intc: &mut IrqMask) {
        if self.irq & RXDA != 0 {
            self.iir = 0x04;
        } else if self.irq & TEMT != 0 {
            self.iir = 0x02;
        } else if self.irq & MODEM != 0 {
            self.iir = 0x00;
        } else {
            self.iir = 0x01; // no interrupt pending
            self.irqline = 0;
            intc.clear(IRQ_16550A);
            return;
        }
        if self.irqline != 0 {
            return;
        }
        self.irqline = self.irq;
        intc.set(IRQ_16550A);
    }

    /// Raise a cause.  Only effective when enabled in the IER.
    fn interrupt(&mut self, n: u8, intc: &mut IrqMask) {
        if self.irq & n != 0 {
            return;
        }
        if self.ier & n == 0 {
            return;
        }
        self.irq |= n;
        self.recalc_iir(intc);
    }

    fn clear_interrupt(&mut self, n: u8, intc: &mut IrqMask) {
        if self.irq & n == 0 {
            return;
        }
        self.irq &= !n;
        self.recalc_iir(intc);
    }

    /// Per-quantum service: refresh the LSR from host readiness and
    /// interrupt on its rising edges.
    pub fn event(&mut self, con: &mut dyn Console, intc: &mut IrqMask) {
        let r = con.poll();
        let old = self.lsr;
        if r.rx {
            self.lsr |= 0x01; // receive data ready
        }
        if r.tx {
            self.lsr |= 0x60; // THR empty + transmitter empty
        }
        let dhigh = (old ^ self.lsr) & self.lsr;
        if dhigh & 0x01 != 0 {
            self.interrupt(RXDA, intc);
        }
        if dhigh & 0x02 != 0 {
            self.interrupt(TEMT, intc);
        }
    }

    // ── Register file ─────────────────────────────────────────

    pub fn write(&mut self, addr: u8, val: u8, con: &mut dyn Console, intc: &mut IrqMask) {
        match addr & 0x0F {
            0 => {
                if self.dlab {
                    self.ls = val;
                    self.show_settings();
                } else {
                    con.put_char(val);
                    self.clear_interrupt(TEMT, intc);
                    self.interrupt(TEMT, intc);
                }
            }
            1 => {
                if self.dlab {
                    self.ms = val;
                    self.show_settings();
                } else {
                    self.ier = val;
                }
            }
            2 => self.fcr = val & 0x9F,
            3 => {
                self.lcr = val;
                self.dlab = self.lcr & 0x80 != 0;
                self.show_settings();
            }
            4 => {
                self.mcr = val & 0x3F;
                self.show_settings();
            }
            5 | 6 => {} // LSR/MSR are read-only
            _ => self.scratch = val,
        }
    }

    pub fn read(&mut self, addr: u8, con: &mut dyn Console, intc: &mut IrqMask) -> u8 {
        match addr & 0x0F {
            0 => {
                if !self.dlab {
                    self.clear_interrupt(RXDA, intc);
                    return con.next_char();
                }
                0xFF
            }
            1 => self.ier,
            2 => self.iir,
            3 => self.lcr,
            4 => self.mcr,
            5 => {
                // Live status; reading clears the low bits.
                let r = con.poll();
                self.lsr = 0;
                if r.rx {
                    self.lsr |= 0x01;
                }
                if r.tx {
                    self.lsr |= 0x60;
                }
                let val = self.lsr;
                self.lsr &= 0xF0;
                val
            }
            6 => {
                let r = self.msr;
                // Reading clears the delta bits.
                self.msr &= 0xF0;
                self.clear_interrupt(MODEM, intc);
                r
            }
            7 => self.scratch,
            _ => 0xFF,
        }
    }

    /// Decode the line settings for the trace stream.
    fn show_settings(&self) {
        if !self.trace.has(trace::UART) {
            return;
        }
        let mut baud = self.ls as u32 + ((self.ms as u32) << 8);
        if baud == 0 {
            baud = 1_843_200;
        }
        baud = 1_843_200 / baud;
        baud /= 16;
        let parity = match self.lcr & 0x38 {
            0x08 => 'O',
            0x18 => 'E',
            0x28 => 'M',
            0x38 => 'S',
            _ => 'N',
        };
        let mut line = format!(
            "[{}:{}{}{} ",
            baud,
            (self.lcr & 3) + 5,
            parity,
            if self.lcr & 4 != 0 { 2 } else { 1 }
        );
        if self.lcr & 0x40 != 0 {
            line.push_str("break ");
        }
        if self.lcr & 0x80 != 0 {
            line.push_str("dlab ");
        }
        if self.mcr & 1 != 0 {
            line.push_str("DTR ");
        }
        if self.mcr & 2 != 0 {
            line.push_str("RTS ");
        }
        if self.mcr & 4 != 0 {
            line.push_str("OUT1 ");
        }
        if self.mcr & 8 != 0 {
            line.push_str("OUT2 ");
        }
        if self.mcr & 16 != 0 {
            line.push_str("LOOP ");
        }
        eprintln!("{}ier {:02x}]", line, self.ier);
    }
}
