//! Host terminal bridge.
//!
//! The guest's serial ports all talk to the controlling terminal:
//! stdin is the receive line, stdout the transmit line.  Readiness is
//! sampled with a zero-timeout `select(2)` once per device tick, and a
//! single byte is consumed per reported readiness.  Devices reach the
//! host through the [`Console`] trait so tests can substitute a
//! scripted console and capture output.

use std::io::{self, Write};
use std::mem;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Host I/O readiness, as reported by one poll.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ready {
    pub rx: bool,
    pub tx: bool,
}

/// Byte pipe between a serial device and the host.
pub trait Console {
    /// Non-blocking readiness check.
    fn poll(&mut self) -> Ready;
    /// Fetch one input byte.  Only called after `poll` reported `rx`.
    fn next_char(&mut self) -> u8;
    /// Emit one output byte.
    fn put_char(&mut self, byte: u8);
}

// ── Shutdown flag ─────────────────────────────────────────────

static DONE: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_done(_sig: libc::c_int) {
    DONE.store(true, Ordering::SeqCst);
}

/// Route SIGINT/SIGQUIT/SIGPIPE into the done flag.  The handlers do
/// nothing else; terminal restoration happens when the main loop
/// unwinds and the [`RawMode`] guard drops.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, mark_done as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, mark_done as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, mark_done as libc::sighandler_t);
    }
}

pub fn shutdown_requested() -> bool {
    DONE.load(Ordering::SeqCst)
}

// ── Raw mode ──────────────────────────────────────────────────

/// Puts the controlling terminal into raw mode and restores the saved
/// attributes on drop.  The interrupt/suspend/stop control characters
/// are disabled so they reach the guest as ordinary bytes.
pub struct RawMode {
    saved: libc::termios,
}

impl RawMode {
    pub fn enter(vmin: u8, vtime: u8) -> io::Result<RawMode> {
        unsafe {
            let mut term: libc::termios = mem::zeroed();
            if libc::tcgetattr(0, &mut term) != 0 {
                return Err(io::Error::last_os_error());
            }
            let saved = term;
            term.c_lflag &= !(libc::ICANON | libc::ECHO);
            term.c_cc[libc::VMIN] = vmin;
            term.c_cc[libc::VTIME] = vtime;
            term.c_cc[libc::VINTR] = 0;
            term.c_cc[libc::VSUSP] = 0;
            term.c_cc[libc::VSTOP] = 0;
            libc::tcsetattr(0, libc::TCSADRAIN, &term);
            Ok(RawMode { saved })
        }
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(0, libc::TCSADRAIN, &self.saved);
        }
    }
}

// ── The real console ──────────────────────────────────────────

/// The process's controlling terminal.
///
/// Output readiness is reported unconditionally: the transmit side of
/// a glass terminal is never the bottleneck at emulated baud rates.
#[derive(Default)]
pub struct HostTty;

impl Console for HostTty {
    fn poll(&mut self) -> Ready {
        unsafe {
            let mut rfds: libc::fd_set = mem::zeroed();
            libc::FD_ZERO(&mut rfds);
            libc::FD_SET(0, &mut rfds);
            let mut tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let n = libc::select(1, &mut rfds, ptr::null_mut(), ptr::null_mut(), &mut tv);
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    // Interrupted: report nothing ready, try again next tick.
                    return Ready { rx: false, tx: true };
                }
                eprintln!("select: {err}");
                process::exit(1);
            }
            Ready {
                rx: n > 0 && libc::FD_ISSET(0, &rfds),
                tx: true,
            }
        }
    }

    fn next_char(&mut self) -> u8 {
        let mut c = [0u8; 1];
        let n = unsafe { libc::read(0, c.as_mut_ptr() as *mut libc::c_void, 1) };
        if n != 1 {
            println!("(tty read without ready byte)");
            return 0xFF;
        }
        // Host newline arrives as the carriage return the firmware expects.
        if c[0] == 0x0A {
            0x0D
        } else {
            c[0]
        }
    }

    fn put_char(&mut self, byte: u8) {
        let mut out = io::stdout();
        let _ = out.write_all(&[byte]);
        let _ = out.flush();
    }
}

// ── Scripted console for tests ────────────────────────────────
