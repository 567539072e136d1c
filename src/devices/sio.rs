//! Zilog SIO/2 dual-channel serial controller.
//!
//! Each channel carries the WR0..WR7 write bank, the RR0..RR2 read
//! bank, and a three-deep receive FIFO.  An overrun replaces the last
//! FIFO slot and latches the overrun bit.  The pair shares one IRQ
//! output: channel A owns the asserted flag and mirrors "any interrupt
//! pending" into its RR0 bit 1 / RR1 bit 1, while channel B's WR2
//! holds the programmed mode-2 vector.

use crate::trace::{self, Trace};
use crate::tty::Console;

pub const INT_TX: u8 = 1;
pub const INT_RX: u8 = 2;
pub const INT_ERR: u8 = 4;

pub const CHAN_A: usize = 0;
pub const CHAN_B: usize = 1;

#[derive(Default)]
pub struct SioChannel {
    pub wr: [u8; 8],
    pub rr: [u8; 3],
    data: [u8; 3],
    dptr: u8,
    /// IRQ asserted for the pair (only meaningful on channel A).
    pub irq: bool,
    /// "Interrupt on next RX" latch (WR0 command 4).
    #[allow(dead_code)]
    rxint: bool,
    /// Transmit-pending latch (set by data writes, dropped by command 5).
    #[allow(dead_code)]
    txint: bool,
    pub intbits: u8,
    /// Interrupt bits pending as an IRQ cause.
    #[allow(dead_code)]
    pending: u8,
    pub vector: u8,
}

pub struct Sio {
    pub chan: [SioChannel; 2],
    /// Feed host input into channel A's receiver.
    pub input: bool,
    trace: Trace,
}

impl Sio {
    pub fn new(input: bool, trace: Trace) -> Self {
        let mut sio = Self {
            chan: Default::default(),
            input,
            trace,
        };
        sio.reset();
        sio
    }

    pub fn reset(&mut self) {
        self.channel_reset(CHAN_A);
        self.channel_reset(CHAN_B);
    }

    fn channel_reset(&mut self, ch: usize) {
        self.chan[ch].rr[0] = 0x2C;
        self.chan[ch].rr[1] = 0x01;
        self.chan[ch].rr[2] = 0;
        self.clear_int(ch, INT_RX | INT_TX | INT_ERR);
    }

    // ── Interrupt bookkeeping ─────────────────────────────────

    fn clear_int(&mut self, ch: usize, m: u8) {
        if self.trace.has(trace::IRQ) {
            eprintln!("Clear intbits {} {:x}", ch, m);
        }
        self.chan[ch].intbits &= !m;
        self.chan[ch].pending &= !m;
        if (self.chan[CHAN_A].intbits | self.chan[CHAN_B].intbits) == 0 {
            self.chan[CHAN_A].rr[1] &= !0x02;
            self.chan[ch].irq = false;
        }
    }

    fn raise_int(&mut self, ch: usize, m: u8) {
        let fresh = (self.chan[ch].intbits ^ m) & m;
        self.chan[ch].intbits |= m;
        if self.trace.has(trace::SIO) && fresh != 0 {
            eprintln!("SIO raise int {:x} new = {:x}", m, fresh);
        }
        if fresh != 0 && !self.chan[CHAN_A].irq {
            self.chan[ch].irq = true;
            self.chan[CHAN_A].rr[1] |= 0x02;
        }
    }

    pub fn any_intbits(&self) -> bool {
        (self.chan[CHAN_A].intbits | self.chan[CHAN_B].intbits) != 0
    }

    /// See whether the channel wants to interrupt; if so compute and
    /// latch its mode-2 vector and hand it back.
    ///
    /// The base vector is channel B's WR2.  When channel B's WR1 bit 2
    /// requests status-affects-vector, bits V1..V3 are replaced: bit 3
    /// marks channel A, and RX-available wins over error in bits 2/1.
    pub fn check_pending(&mut self, ch: usize) -> Option<u8> {
        if !self.chan[ch].irq {
            return None;
        }
        let mut vector = self.chan[CHAN_B].wr[2];
        if self.chan[CHAN_B].wr[1] & 0x04 != 0 {
            vector &= 0xF1;
            if ch == CHAN_A {
                vector |= 1 << 3;
            }
            if self.chan[ch].intbits & INT_RX != 0 {
                vector |= 4;
            } else if self.chan[ch].intbits & INT_ERR != 0 {
                vector |= 2;
            }
        }
        if self.trace.has(trace::SIO) {
            eprintln!("SIO2 interrupt {:02X}", vector);
        }
        self.chan[ch].vector = vector;
        Some(vector)
    }

    /// RETI acknowledge: drop the pair's asserted-IRQ state so the
    /// next pending source can be delivered.  Latched interrupt bits
    /// survive and are picked up by the following poll.
    pub fn reti(&mut self) {
        self.chan[CHAN_A].irq = false;
    }

    // ── Receive path ──────────────────────────────────────────

    /// Push a received byte into the channel's FIFO.
    pub fn queue(&mut self, ch: usize, c: u8) {
        if self.trace.has(trace::SIO) {
            eprintln!("SIO {} queue {}:", ch, c);
        }
        if self.chan[ch].wr[3] & 1 == 0 {
            if self.trace.has(trace::SIO) {
                eprintln!("RX disabled.");
            }
            return;
        }
        if self.chan[ch].dptr == 2 {
            // Overrun: the last FIFO slot is replaced.
            if self.trace.has(trace::SIO) {
                eprintln!("Overrun.");
            }
            self.chan[ch].data[2] = c;
            self.chan[ch].rr[1] |= 0x20;
            self.raise_int(ch, INT_ERR);
        } else {
            if self.trace.has(trace::SIO) {
                eprintln!(
                    "Queued {} (mode {})",
                    self.chan[ch].dptr,
                    self.chan[ch].wr[1] & 0x18
                );
            }
            let d = self.chan[ch].dptr as usize;
            self.chan[ch].data[d] = c;
            self.chan[ch].dptr += 1;
            self.chan[ch].rr[0] |= 1;
            match self.chan[ch].wr[1] & 0x18 {
                0x00 => {}
                0x08 => {
                    // Interrupt on first character only.
                    if self.chan[ch].dptr == 1 {
                        self.raise_int(ch, INT_RX);
                    }
                }
                _ => self.raise_int(ch, INT_RX),
            }
        }
    }

    // ── Register file ─────────────────────────────────────────

    /// Bus read.  Even addresses are control, odd are data; bit 1
    /// selects channel B.
    pub fn read(&mut self, addr: u8) -> u8 {
        let ch = if addr & 2 != 0 { CHAN_B } else { CHAN_A };
        if addr & 1 == 0 {
            let r = (self.chan[ch].wr[0] & 0x07) as usize;
            self.chan[ch].wr[0] &= !0x07;

            self.chan[ch].rr[0] &= !0x02;
            if ch == CHAN_A && self.any_intbits() {
                self.chan[ch].rr[0] |= 0x02;
            }
            if self.trace.has(trace::SIO) {
                eprintln!("sio{} read reg {}", if ch == CHAN_B { 'b' } else { 'a' }, r);
            }
            match r {
                0 | 1 => self.chan[ch].rr[r],
                2 if ch == CHAN_B => self.chan[ch].rr[2],
                2 | 3 => {
                    eprintln!("INVALID(0xFF)");
                    0xFF
                }
                _ => 0xFF,
            }
        } else {
            let c = self.chan[ch].data[0];
            self.chan[ch].data[0] = self.chan[ch].data[1];
            self.chan[ch].data[1] = self.chan[ch].data[2];
            if self.chan[ch].dptr > 0 {
                self.chan[ch].dptr -= 1;
            }
            if self.chan[ch].dptr == 0 {
                self.chan[ch].rr[0] &= 0xFE; // RX character available drops
            }
            self.clear_int(ch, INT_RX);
            self.chan[ch].rr[0] &= 0x3F;
            self.chan[ch].rr[1] &= 0x3F;
            if self.trace.has(trace::SIO) {
                eprintln!("sio{} read data {}", if ch == CHAN_B { 'b' } else { 'a' }, c);
            }
            if self.chan[ch].dptr > 0 && self.chan[ch].wr[1] & 0x10 != 0 {
                self.raise_int(ch, INT_RX);
            }
            c
        }
    }

    /// Bus write.
    pub fn write(&mut self, addr: u8, val: u8, con: &mut dyn Console) {
        let ch = if addr & 2 != 0 { CHAN_B } else { CHAN_A };
        if addr & 1 == 0 {
            if self.trace.has(trace::SIO) {
                eprintln!(
                    "sio{} write reg {} with {:02X}",
                    if ch == CHAN_B { 'b' } else { 'a' },
                    self.chan[ch].wr[0] & 7,
                    val
                );
            }
            match self.chan[ch].wr[0] & 0x07 {
                0 => {
                    self.chan[ch].wr[0] = val;
                    match (val >> 3) & 0x07 {
                        0 => {} // NOP
                        1 => {} // send abort: SDLC-specific, nothing in async
                        2 => {
                            // Reset external/status interrupts.
                            self.clear_int(ch, INT_ERR);
                            self.chan[ch].rr[1] &= 0xCF;
                        }
                        3 => {
                            if self.trace.has(trace::SIO) {
                                eprintln!("[channel reset]");
                            }
                            self.channel_reset(ch);
                        }
                        4 => self.chan[ch].rxint = true,
                        5 => {
                            self.chan[ch].txint = false;
                            self.clear_int(ch, INT_TX);
                        }
                        6 => self.chan[ch].rr[1] &= 0x8F,
                        _ => {
                            // Return from interrupt, channel A only.
                            if ch == CHAN_A {
                                self.chan[CHAN_A].irq = false;
                                self.chan[CHAN_A].rr[1] &= !0x02;
                                self.clear_int(CHAN_A, INT_RX | INT_TX | INT_ERR);
                                self.clear_int(CHAN_B, INT_RX | INT_TX | INT_ERR);
                            }
                        }
                    }
                }
                r => {
                    let r = r as usize;
                    if self.trace.has(trace::SIO) {
                        eprintln!(
                            "sio{}: wrote r{} to {:02X}",
                            if ch == CHAN_B { 'b' } else { 'a' },
                            r,
                            val
                        );
                    }
                    self.chan[ch].wr[r] = val;
                    if ch == CHAN_B && r == 2 {
                        self.chan[ch].rr[2] = val;
                    }
                    self.chan[ch].wr[0] &= !0x07;
                }
            }
        } else {
            self.chan[ch].rr[0] &= !(1 << 2); // transmit buffer no longer empty
            self.chan[ch].txint = true;
            self.clear_int(ch, INT_TX);
            if self.trace.has(trace::SIO) {
                eprintln!("sio{} write data {}", if ch == CHAN_B { 'b' } else { 'a' }, val);
            }
            con.put_char(val);
        }
    }

    // ── Timer tick ────────────────────────────────────────────

    /// Per-quantum service: channel A polls the host, both channels
    /// refresh their transmit-empty status.
    pub fn timer(&mut self, con: &mut dyn Console) {
        self.channel_timer(CHAN_A, con);
        self.channel_timer(CHAN_B, con);
    }

    fn channel_timer(&mut self, ch: usize, con: &mut dyn Console) {
        if ch == CHAN_A {
            let rdy = con.poll();
            if self.input && rdy.rx {
                let c = con.next_char();
                self.queue(ch, c);
            }
            if rdy.tx {
                self.tx_ready(ch);
            }
        } else {
            self.tx_ready(ch);
        }
    }

    fn tx_ready(&mut self, ch: usize) {
        if self.chan[ch].rr[0] & 0x04 == 0 {
            self.chan[ch].rr[0] |= 0x04;
            if self.chan[ch].wr[1] & 0x02 != 0 {
                self.raise_int(ch, INT_TX);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tty::testing::ScriptedConsole;

    fn sio() -> Sio {
        Sio::new(true, Trace::default())
    }

    /// Set WR3 bit 0 (receive enable) plus a WR1 interrupt mode.
    fn enable_rx(sio: &mut Sio, ch: usize, wr1: u8) {
        sio.chan[ch].wr[3] = 0x01;
        sio.chan[ch].wr[1] = wr1;
    }

    #[test]
    fn host_byte_lands_in_fifo_and_interrupts() {
        // A 0x41 on the host side shows up in channel A after one tick.
        let mut s = sio();
        let mut con = ScriptedConsole::with_input(&[0x41]);
        enable_rx(&mut s, CHAN_A, 0x10); // interrupt on every character
        s.timer(&mut con);
        assert_eq!(s.chan[CHAN_A].rr[0] & 0x01, 0x01);
        assert!(s.chan[CHAN_A].irq);
        assert_eq!(s.read(1), 0x41);
    }

    #[test]
    fn rx_available_tracks_fifo_depth() {
        let mut s = sio();
        enable_rx(&mut s, CHAN_A, 0);
        assert_eq!(s.chan[CHAN_A].rr[0] & 1, 0);
        s.queue(CHAN_A, 1);
        s.queue(CHAN_A, 2);
        assert_eq!(s.chan[CHAN_A].rr[0] & 1, 1);
        s.read(1);
        assert_eq!(s.chan[CHAN_A].rr[0] & 1, 1);
        s.read(1);
        assert_eq!(s.chan[CHAN_A].rr[0] & 1, 0);
    }

    #[test]
    fn overrun_replaces_last_slot_and_flags() {
        let mut s = sio();
        enable_rx(&mut s, CHAN_A, 0);
        for c in 1..=3 {
            s.queue(CHAN_A, c);
        }
        s.queue(CHAN_A, 99);
        assert_eq!(s.chan[CHAN_A].rr[1] & 0x20, 0x20);
        assert!(s.chan[CHAN_A].intbits & INT_ERR != 0);
        assert_eq!(s.read(1), 1);
        assert_eq!(s.read(1), 2);
        assert_eq!(s.read(1), 99);
    }

    #[test]
    fn receive_disabled_drops_bytes() {
        let mut s = sio();
        s.queue(CHAN_A, 0x55);
        assert_eq!(s.chan[CHAN_A].rr[0] & 1, 0);
        assert_eq!(s.chan[CHAN_A].dptr, 0);
    }

    #[test]
    fn first_char_mode_interrupts_once() {
        let mut s = sio();
        enable_rx(&mut s, CHAN_A, 0x08);
        s.queue(CHAN_A, 1);
        assert!(s.chan[CHAN_A].irq);
        let v = s.check_pending(CHAN_A);
        assert!(v.is_some());
        s.reti();
        s.clear_int(CHAN_A, INT_RX);
        s.queue(CHAN_A, 2); // second char, no fresh interrupt
        assert!(!s.chan[CHAN_A].irq);
    }

    #[test]
    fn drain_rearms_interrupt_in_all_chars_mode() {
        let mut s = sio();
        enable_rx(&mut s, CHAN_A, 0x10);
        s.queue(CHAN_A, 1);
        s.queue(CHAN_A, 2);
        s.read(1);
        // FIFO still holds a byte: RX must be latched again.
        assert!(s.chan[CHAN_A].intbits & INT_RX != 0);
        s.read(1);
        assert!(s.chan[CHAN_A].intbits & INT_RX == 0);
    }

    #[test]
    fn primary_rr0_mirrors_pair_interrupt_state() {
        let mut s = sio();
        enable_rx(&mut s, CHAN_B, 0x10);
        s.queue(CHAN_B, 7);
        // Point channel A at RR0 and read control.
        let r = s.read(0);
        assert_eq!(r & 0x02, 0x02);
        s.read(3); // drain channel B
        let r = s.read(0);
        assert_eq!(r & 0x02, 0x00);
    }

    #[test]
    fn vector_uses_status_bits_when_requested() {
        let mut s = sio();
        s.chan[CHAN_B].wr[2] = 0xE0;
        s.chan[CHAN_B].wr[1] = 0x04; // status affects vector
        enable_rx(&mut s, CHAN_A, 0x10);
        s.queue(CHAN_A, 1);
        // Channel A, RX cause: bit 3 (channel) + bit 2 (RX).
        assert_eq!(s.check_pending(CHAN_A), Some(0xE0 | 0x08 | 0x04));
    }

    #[test]
    fn vector_passes_unmodified_without_status_mode() {
        let mut s = sio();
        s.chan[CHAN_B].wr[2] = 0x86;
        enable_rx(&mut s, CHAN_A, 0x10);
        s.queue(CHAN_A, 1);
        assert_eq!(s.check_pending(CHAN_A), Some(0x86));
    }

    #[test]
    fn error_cause_encodes_when_no_rx_latched() {
        let mut s = sio();
        s.chan[CHAN_B].wr[2] = 0x40;
        s.chan[CHAN_B].wr[1] = 0x04;
        enable_rx(&mut s, CHAN_B, 0x00); // no RX interrupts
        for c in 0..4 {
            s.queue(CHAN_B, c); // fourth byte overruns
        }
        // Channel B, error cause: bit 1 only.
        assert_eq!(s.check_pending(CHAN_B), Some(0x42));
    }

    #[test]
    fn channel_reset_is_idempotent() {
        let mut s = sio();
        enable_rx(&mut s, CHAN_A, 0x10);
        s.queue(CHAN_A, 1);
        let mut con = ScriptedConsole::default();
        s.write(0, 0x18, &mut con); // channel reset command
        let snap = (
            s.chan[CHAN_A].rr,
            s.chan[CHAN_A].intbits,
            s.chan[CHAN_A].irq,
        );
        s.write(0, 0x18, &mut con);
        assert_eq!(
            snap,
            (
                s.chan[CHAN_A].rr,
                s.chan[CHAN_A].intbits,
                s.chan[CHAN_A].irq
            )
        );
        assert_eq!(s.chan[CHAN_A].rr[0], 0x2C);
        assert_eq!(s.chan[CHAN_A].rr[1], 0x01);
    }

    #[test]
    fn return_from_interrupt_command_clears_pair() {
        let mut s = sio();
        enable_rx(&mut s, CHAN_A, 0x10);
        enable_rx(&mut s, CHAN_B, 0x10);
        s.queue(CHAN_A, 1);
        s.queue(CHAN_B, 2);
        let mut con = ScriptedConsole::default();
        s.write(0, 0x38, &mut con); // WR0 command 7 on channel A
        assert!(!s.chan[CHAN_A].irq);
        assert!(!s.any_intbits());
        assert_eq!(s.chan[CHAN_A].rr[1] & 0x02, 0);
    }

    #[test]
    fn data_write_emits_to_console() {
        let mut s = sio();
        let mut con = ScriptedConsole::default();
        s.write(1, b'H', &mut con);
        s.write(3, b'i', &mut con);
        assert_eq!(con.output, b"Hi");
        assert_eq!(s.chan[CHAN_A].rr[0] & 0x04, 0);
    }

    #[test]
    fn tx_empty_refreshes_and_interrupts_on_tick() {
        let mut s = sio();
        s.chan[CHAN_A].wr[1] = 0x02; // TX interrupt enable
        let mut con = ScriptedConsole::default();
        s.write(1, b'x', &mut con);
        s.timer(&mut con);
        assert_eq!(s.chan[CHAN_A].rr[0] & 0x04, 0x04);
        assert!(s.chan[CHAN_A].intbits & INT_TX != 0);
    }

    #[test]
    fn register_pointer_clears_after_use() {
        let mut s = sio();
        let mut con = ScriptedConsole::default();
        s.write(0, 0x02, &mut con); // point at WR2
        s.write(2, 0x05, &mut con); // point channel B at WR5... separate channel
        s.write(0, 0x33, &mut con); // lands in channel A WR2
        assert_eq!(s.chan[CHAN_A].wr[2], 0x33);
        // Pointer reset: the next control write is a command/WR0 write.
        s.write(0, 0x00, &mut con);
        assert_eq!(s.chan[CHAN_A].wr[0] & 7, 0);
    }

    #[test]
    fn wr2_on_channel_b_mirrors_into_rr2() {
        let mut s = sio();
        let mut con = ScriptedConsole::default();
        s.write(2, 0x02, &mut con);
        s.write(2, 0x90, &mut con);
        assert_eq!(s.chan[CHAN_B].rr[2], 0x90);
        // Pointer at RR2 then control read returns it.
        s.write(2, 0x02, &mut con);
        assert_eq!(s.read(2), 0x90);
    }
}
