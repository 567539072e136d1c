//! Z80 CTC counter/timer channels.
//!
//! Four channels, each holding a down-counter scaled by 256, an 8-bit
//! reload constant, a control word, and (channel 0 only) the mode-2
//! vector base.  Channel 2's zero-count output is wired into channel
//! 3's trigger input, as on the real board.  Pending interrupts are a
//! chip-wide bit mask, level-held until the matching RETI.

use crate::trace::{self, Trace};

pub const CTC_IRQ: u8 = 0x80;
pub const CTC_COUNTER: u8 = 0x40;
pub const CTC_PRESCALER: u8 = 0x20;
pub const CTC_RISING: u8 = 0x10;
pub const CTC_PULSE: u8 = 0x08;
pub const CTC_TCONST: u8 = 0x04;
pub const CTC_RESET: u8 = 0x02;
pub const CTC_CONTROL: u8 = 0x01;

#[derive(Default)]
pub struct CtcChannel {
    /// Current count, scaled: the visible counter is the high byte.
    pub count: i32,
    pub reload: u16,
    pub vector: u8,
    pub ctrl: u8,
}

impl CtcChannel {
    /// TCONST and RESET both set: the channel is parked awaiting a
    /// time constant.
    fn stopped(&self) -> bool {
        self.ctrl & (CTC_TCONST | CTC_RESET) == (CTC_TCONST | CTC_RESET)
    }
}

pub struct Ctc {
    pub chan: [CtcChannel; 4],
    /// One pending bit per channel, held until RETI.
    pub irqmask: u8,
    trace: Trace,
}

impl Ctc {
    pub fn new(trace: Trace) -> Self {
        let mut ctc = Self {
            chan: Default::default(),
            irqmask: 0,
            trace,
        };
        ctc.reset();
        ctc
    }

    pub fn reset(&mut self) {
        for c in self.chan.iter_mut() {
            c.vector = 0;
            c.ctrl = CTC_RESET;
            c.count = 0;
            c.reload = 0;
        }
        self.irqmask = 0;
    }

    // ── Bus access ────────────────────────────────────────────

    pub fn write(&mut self, channel: usize, val: u8) {
        let channel = channel & 3;
        if self.chan[channel].ctrl & CTC_TCONST != 0 {
            if self.trace.has(trace::CTC) {
                eprintln!("CTC {} constant loaded with {:02X}", channel, val);
            }
            self.chan[channel].reload = val as u16;
            if self.chan[channel].ctrl & (CTC_TCONST | CTC_RESET) == (CTC_TCONST | CTC_RESET) {
                self.chan[channel].count = ((self.chan[channel].reload as i32 - 1) << 8) & 0xFFFF;
                if self.trace.has(trace::CTC) {
                    eprintln!("CTC {} constant reloaded with {:02X}", channel, val);
                }
            }
            self.chan[channel].ctrl &= !(CTC_TCONST | CTC_RESET);
        } else if val & CTC_CONTROL != 0 {
            // Edge/trigger niceties of the real chip are not modeled.
            if self.trace.has(trace::CTC) {
                eprintln!("CTC {} control loaded with {:02X}", channel, val);
            }
            self.chan[channel].ctrl = val;
            if self.chan[channel].ctrl & (CTC_TCONST | CTC_RESET) == CTC_RESET {
                self.chan[channel].count = ((self.chan[channel].reload as i32 - 1) << 8) & 0xFFFF;
            }
            // Dropping the IRQ enable withdraws a pending interrupt.
            if self.chan[channel].ctrl & CTC_IRQ == 0 && self.irqmask & (1 << channel) != 0 {
                self.irqmask &= !(1 << channel);
                if self.irqmask == 0 && self.trace.has(trace::IRQ) {
                    eprintln!("CTC {} irq reset.", channel);
                }
            }
        } else {
            if self.trace.has(trace::CTC) {
                eprintln!("CTC {} vector loaded with {:02X}", channel, val);
            }
            self.chan[channel].vector = val;
        }
    }

    pub fn read(&self, channel: usize) -> u8 {
        let val = (self.chan[channel & 3].count >> 8) as u8;
        if self.trace.has(trace::CTC) {
            eprintln!("CTC {} reads {:02x}", channel & 3, val);
        }
        val
    }

    // ── Counting ──────────────────────────────────────────────

    fn interrupt(&mut self, i: usize) {
        if self.chan[i].ctrl & CTC_IRQ != 0 && self.irqmask & (1 << i) == 0 {
            self.irqmask |= 1 << i;
            if self.trace.has(trace::CTC) {
                eprintln!("CTC {} wants to interrupt.", i);
            }
        }
    }

    /// Zero-count output: channel 2 feeds channel 3.
    fn pulse(&mut self, i: usize) {
        if i == 2 {
            self.receive_pulse(3);
        }
    }

    /// External trigger edge into channel `i`.
    pub fn receive_pulse(&mut self, i: usize) {
        if self.chan[i].ctrl & CTC_COUNTER != 0 {
            if self.chan[i].stopped() {
                return;
            }
            if self.chan[i].count >= 0x100 {
                self.chan[i].count -= 0x100; // no prescale on pulses
            }
            if self.chan[i].count & 0xFF00 == 0 {
                self.interrupt(i);
                self.pulse(i);
                self.chan[i].count = (self.chan[i].reload as i32) << 8;
            }
        } else if self.chan[i].ctrl & CTC_PULSE != 0 {
            self.chan[i].ctrl &= !CTC_PULSE;
        }
    }

    /// Advance every timer-mode channel by `clocks` T-states.
    pub fn tick(&mut self, clocks: u32) {
        for i in 0..4 {
            if self.chan[i].stopped() {
                continue;
            }
            if self.chan[i].ctrl & CTC_COUNTER != 0 {
                continue;
            }
            let mut decby = clocks as i32;
            // The scaled count bakes in the 256 prescaler; a 16x
            // prescale therefore counts 16 times faster.
            if self.chan[i].ctrl & CTC_PRESCALER == 0 {
                decby <<= 4;
            }
            let mut n = self.chan[i].count - decby;
            while n < 0 {
                self.interrupt(i);
                self.pulse(i);
                n += if self.chan[i].reload == 0 {
                    256 << 8
                } else {
                    (self.chan[i].reload as i32) << 8
                };
            }
            self.chan[i].count = n;
        }
    }

    // ── Interrupt delivery ────────────────────────────────────

    /// Lowest-numbered pending channel, if any.
    pub fn pending_channel(&self) -> Option<usize> {
        (0..4).find(|i| self.irqmask & (1 << i) != 0)
    }

    /// Mode-2 vector for channel `n`: channel 0's base with the low
    /// three bits replaced by the channel index doubled.
    pub fn vector_for(&self, n: usize) -> u8 {
        (self.chan[0].vector & 0xF8) + 2 * n as u8
    }

    pub fn reti(&mut self, n: usize) {
        if self.irqmask & (1 << n) != 0 {
            self.irqmask &= !(1 << n);
            if self.trace.has(trace::IRQ) {
                eprintln!("Acked interrupt from CTC {}.", n);
            }
        }
    }

    pub fn any_pending(&self) -> bool {
        self.irqmask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctc() -> Ctc {
        Ctc::new(Trace::default())
    }

    /// Program a channel: control word, then time constant.
    fn program(c: &mut Ctc, ch: usize, ctrl: u8, tconst: u8) {
        c.write(ch, ctrl | CTC_TCONST | CTC_RESET | CTC_CONTROL);
        c.write(ch, tconst);
    }

    #[test]
    fn derived_vectors_step_by_two() {
        let mut c = ctc();
        c.write(0, 0x86); // vector base (bit 0 clear marks a vector write)
        assert_eq!(c.vector_for(0), 0x86 & 0xF8);
        assert_eq!(c.vector_for(1), (0x86 & 0xF8) + 2);
        assert_eq!(c.vector_for(2), (0x86 & 0xF8) + 4);
        assert_eq!(c.vector_for(3), (0x86 & 0xF8) + 6);
    }

    #[test]
    fn time_constant_loads_scaled_count() {
        let mut c = ctc();
        program(&mut c, 0, CTC_IRQ | CTC_PRESCALER, 10);
        assert_eq!(c.chan[0].count, 9 << 8);
        assert_eq!(c.chan[0].ctrl & (CTC_TCONST | CTC_RESET), 0);
    }

    #[test]
    fn timer_mode_fires_and_reloads() {
        let mut c = ctc();
        // Prescale 256, constant 4: scaled count 3<<8, drains at one
        // count per T-state.
        program(&mut c, 1, CTC_IRQ | CTC_PRESCALER, 4);
        c.tick(0x2FF);
        assert!(!c.any_pending());
        // Underflow happens when the count goes below zero.
        c.tick(2);
        assert_eq!(c.pending_channel(), Some(1));
        // Reload is constant * 256.
        assert_eq!(c.chan[1].count, (4 << 8) - 1);
    }

    #[test]
    fn prescaler_16_counts_sixteen_times_faster() {
        let mut c = ctc();
        program(&mut c, 0, CTC_IRQ, 4);
        // 16x prescale: 3<<8 scaled counts drain in (3<<8)/16 = 48 T-states.
        c.tick(48);
        assert!(!c.any_pending());
        c.tick(1);
        assert_eq!(c.pending_channel(), Some(0));
    }

    #[test]
    fn reload_zero_counts_as_256() {
        let mut c = ctc();
        program(&mut c, 0, CTC_IRQ | CTC_PRESCALER, 0);
        // The (0-1) load wraps: first period drains from 0xFF00.
        c.tick(0xFF01);
        assert_eq!(c.pending_channel(), Some(0));
        c.reti(0);
        // Subsequent periods are a full 256 * 256.
        assert_eq!(c.chan[0].count, 0xFFFF);
        c.tick(0xFFFF);
        assert!(!c.any_pending());
        c.tick(1);
        assert_eq!(c.pending_channel(), Some(0));
    }

    #[test]
    fn counter_mode_underflows_on_scaled_drain() {
        let mut c = ctc();
        program(&mut c, 0, CTC_IRQ | CTC_COUNTER, 2);
        // Constant 2 loads 1<<8: the first pulse drains it to zero.
        c.receive_pulse(0);
        assert_eq!(c.pending_channel(), Some(0));
        assert_eq!(c.chan[0].count, 2 << 8);
        c.reti(0);
        // Two more pulses for the next underflow.
        c.receive_pulse(0);
        assert!(!c.any_pending());
        c.receive_pulse(0);
        assert_eq!(c.pending_channel(), Some(0));
    }

    #[test]
    fn counter_mode_interrupt_is_level_held() {
        let mut c = ctc();
        program(&mut c, 0, CTC_IRQ | CTC_COUNTER, 1);
        for _ in 0..256 {
            c.receive_pulse(0);
        }
        // The latch fires once and stays held until RETI.
        assert_eq!(c.pending_channel(), Some(0));
        c.reti(0);
        assert!(!c.any_pending());
    }

    #[test]
    fn channel_two_chains_into_channel_three() {
        let mut c = ctc();
        // Channel 2 counts pulses with constant 1, channel 3 with 2.
        program(&mut c, 2, CTC_COUNTER, 1); // no IRQ on 2
        program(&mut c, 3, CTC_IRQ | CTC_COUNTER, 2);
        c.receive_pulse(2);
        c.receive_pulse(2);
        assert_eq!(c.pending_channel(), Some(3));
        assert_eq!(c.irqmask, 1 << 3);
    }

    #[test]
    fn disabling_irq_withdraws_pending_interrupt() {
        let mut c = ctc();
        program(&mut c, 0, CTC_IRQ | CTC_COUNTER, 1);
        c.receive_pulse(0);
        assert!(c.any_pending());
        c.write(0, CTC_CONTROL); // control word without IRQ enable
        assert!(!c.any_pending());
    }

    #[test]
    fn stopped_channel_ignores_pulses_and_ticks() {
        let mut c = ctc();
        c.write(0, CTC_IRQ | CTC_COUNTER | CTC_TCONST | CTC_RESET | CTC_CONTROL);
        // No constant written yet: parked.
        c.receive_pulse(0);
        c.tick(0x10000);
        assert!(!c.any_pending());
    }

    #[test]
    fn read_returns_count_high_byte() {
        let mut c = ctc();
        program(&mut c, 0, CTC_IRQ | CTC_PRESCALER, 10);
        assert_eq!(c.read(0), 9);
        c.tick(0x100);
        assert_eq!(c.read(0), 8);
    }
}
