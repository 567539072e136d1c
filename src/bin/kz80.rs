//! kz80 — the KZ80 Z80 laptop emulator.
//!
//! An 8 KiB EEPROM monitor, 56 KiB of RAM in practice, and an SIO/2
//! on the console.  Interrupts are vectored mode-2 with the RETI
//! acknowledge spotted on the fetch stream.

use std::fs;
use std::process;
use std::time::Duration;

use rcbus::machine::kz80::{Kz80Machine, ROM_SIZE};
use rcbus::trace::Trace;
use rcbus::tty::{self, HostTty, RawMode};

fn usage() -> ! {
    eprintln!("kz80: [-r rompath] [-d tracemask]");
    process::exit(1);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = getopts::Options::new();
    opts.optopt("r", "", "ROM image", "PATH");
    opts.optopt("d", "", "trace mask", "MASK");
    let m = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(_) => usage(),
    };
    if !m.free.is_empty() {
        usage();
    }
    let rompath = m.opt_str("r").unwrap_or_else(|| "kz80.rom".into());
    let tracemask = match m.opt_str("d") {
        Some(s) => match s.parse() {
            Ok(v) => v,
            Err(_) => usage(),
        },
        None => 0,
    };

    let rom = match fs::read(&rompath) {
        Ok(rom) => rom,
        Err(e) => {
            eprintln!("{}: {}", rompath, e);
            process::exit(1);
        }
    };
    if rom.len() != ROM_SIZE {
        eprintln!("kz80: ROM image should be 8K.");
        process::exit(1);
    }

    tty::install_signal_handlers();
    let _raw = RawMode::enter(1, 0).ok();

    let mut machine = Kz80Machine::new(rom, Box::new(HostTty), Trace::new(tracemask));
    log::info!("kz80: booting {}", rompath);

    // Interrupt latency needs no better than the timer tick, so the
    // pacing nap can stay short.
    machine.run(Duration::from_micros(500));
}
