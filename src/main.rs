//! rc2014-6502 — the RC2014 6502 processor-card emulator.
//!
//! Boots a 512 KiB banked ROM image and runs it against the host
//! terminal.  Peripherals are populated from the command line; the
//! console device is one of the ACIA, the SIO/2, or the 16550A.

use std::fs;
use std::process;
use std::thread;
use std::time::Duration;

use rcbus::devices::acia::Acia;
use rcbus::devices::ctc::Ctc;
use rcbus::devices::rtc::{Rtc, SystemClock};
use rcbus::devices::sio::Sio;
use rcbus::devices::uart16x50::Uart16x50;
use rcbus::ide::IdeController;
use rcbus::machine::rc6502::{Rc6502Bus, Rc6502Machine};
use rcbus::memory::{BankedMemory, ROM_SIZE};
use rcbus::nic::NicW5100;
use rcbus::trace::Trace;
use rcbus::tty::{self, HostTty, RawMode};

/// T-states per execution slice (4 MHz board).
const TSTATE_STEPS: u32 = 200;

const IOPAGE: u8 = 0xC0;

fn usage() -> ! {
    eprintln!("rc2014: [-1] [-A] [-a] [-c] [-f] [-R] [-r rompath] [-s] [-w] [-d debug]");
    process::exit(1);
}

struct Options {
    rompath: String,
    idepath: Option<String>,
    acia: bool,
    acia_narrow: bool,
    sio: bool,
    uart_16550a: bool,
    have_ctc: bool,
    rtc: bool,
    wiznet: bool,
    fast: bool,
    tracemask: u32,
}

fn parse_options() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut opts = getopts::Options::new();
    opts.optflag("1", "", "populate the 16550A UART");
    opts.optflag("a", "", "populate the ACIA (wide decode)");
    opts.optflag("A", "", "populate the ACIA (narrow decode)");
    opts.optflag("s", "", "populate the SIO/2");
    opts.optflag("c", "", "populate the Z80 CTC");
    opts.optflag("R", "", "populate the DS1302 RTC");
    opts.optflag("w", "", "populate the Ethernet controller");
    opts.optflag("f", "", "fast: skip pacing sleeps");
    opts.optopt("i", "", "IDE disk image", "PATH");
    opts.optopt("r", "", "ROM image", "PATH");
    opts.optopt("d", "", "trace mask", "MASK");

    let m = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(_) => usage(),
    };
    if !m.free.is_empty() {
        usage();
    }

    let tracemask = match m.opt_str("d") {
        Some(s) => match s.parse() {
            Ok(v) => v,
            Err(_) => usage(),
        },
        None => 0,
    };

    let mut o = Options {
        rompath: m.opt_str("r").unwrap_or_else(|| "rc2014-6502.rom".into()),
        idepath: m.opt_str("i"),
        acia: false,
        acia_narrow: false,
        sio: false,
        uart_16550a: false,
        have_ctc: m.opt_present("c"),
        rtc: m.opt_present("R"),
        wiznet: m.opt_present("w"),
        fast: m.opt_present("f"),
        tracemask,
    };

    // The console selections are mutually exclusive: each flag
    // deselects the others.
    if m.opt_present("1") {
        o.uart_16550a = true;
    }
    if m.opt_present("a") {
        o.acia = true;
        o.acia_narrow = false;
        o.uart_16550a = false;
    }
    if m.opt_present("A") {
        o.acia = true;
        o.acia_narrow = true;
        o.uart_16550a = false;
    }
    if m.opt_present("s") {
        o.sio = true;
        o.acia = false;
        o.uart_16550a = false;
    }
    o
}

fn main() {
    env_logger::init();
    let mut o = parse_options();

    if !o.acia && !o.sio && !o.uart_16550a {
        eprintln!("rc2014: no UART selected, defaulting to 16550A");
        o.uart_16550a = true;
    }
    if o.rtc && o.uart_16550a {
        eprintln!("rc2014: RTC and 16550A clash at 0xC0.");
        process::exit(1);
    }

    let trace = Trace::new(o.tracemask);

    let rom = match fs::read(&o.rompath) {
        Ok(rom) => rom,
        Err(e) => {
            eprintln!("{}: {}", o.rompath, e);
            process::exit(1);
        }
    };
    if rom.len() != ROM_SIZE {
        eprintln!("rc2014: banked rom image should be 512K.");
        process::exit(1);
    }

    let mut mem = BankedMemory::new(0x0000, trace.clone());
    mem.load_rom(&rom);

    let mut bus = Rc6502Bus::new(
        mem,
        Box::new(HostTty),
        Box::new(SystemClock),
        IOPAGE,
        false,
        trace.clone(),
    );

    if let Some(idepath) = &o.idepath {
        match IdeController::allocate("cf") {
            Some(mut ide) => match fs::OpenOptions::new().read(true).write(true).open(idepath) {
                Ok(file) => {
                    if ide.attach(0, file).is_ok() {
                        ide.reset_begin();
                        bus.ide = Some(ide);
                    }
                }
                Err(e) => eprintln!("{}: {}", idepath, e),
            },
            None => eprintln!("rc2014: no IDE controller available"),
        }
    }

    if o.sio {
        bus.sio = Some(Sio::new(true, trace.clone()));
    }
    if o.acia {
        bus.acia = Some(Acia::new(true, trace.clone()));
        bus.acia_narrow = o.acia_narrow;
    }
    if o.have_ctc {
        bus.ctc = Some(Ctc::new(trace.clone()));
    }
    if o.uart_16550a {
        bus.uart = Some(Uart16x50::new(trace.clone()));
    }
    if o.rtc {
        bus.rtc = Some(Rtc::new(trace.clone()));
    }
    if o.wiznet {
        bus.nic = Some(NicW5100::alloc(trace.clone()));
    }

    tty::install_signal_handlers();
    let _raw = RawMode::enter(0, 1).ok();

    let mut machine = Rc6502Machine::new(bus);
    log::info!("rc2014-6502: booting {}", o.rompath);

    // 200 T-states per I/O check, 100 checks per pacing nap: the
    // balance between nice host behaviour and simulation smoothness.
    let pacing = Duration::from_millis(5);
    while !tty::shutdown_requested() {
        for _ in 0..100 {
            machine.exec_tstates(TSTATE_STEPS);
            machine.cpu.memory.tick_timers(TSTATE_STEPS);
        }
        if let Some(nic) = machine.cpu.memory.nic.as_mut() {
            nic.process();
        }
        if !o.fast {
            thread::sleep(pacing);
        }
        machine.cpu.memory.poll_irq_event();
    }
}
