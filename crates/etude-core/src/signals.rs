// src/signals.rs
//! Signal plumbing through the reactor's self-pipe.
//!
//! Handlers only write the signal number as one byte to the pipe; the reactor
//! reads it back with the rest of its events. SIGALRM drives the idle-timer
//! tick; SIGTERM and SIGINT (via `ctrlc`) request a stop.

use crate::error::{EtudeError, EtudeResult};
use crate::syscalls::write_byte;
use libc::c_int;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Write end of the active server's pipe, or -1.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static CTRLC_INSTALLED: AtomicBool = AtomicBool::new(false);

pub const TICK_BYTE: u8 = libc::SIGALRM as u8;
pub const STOP_BYTE: u8 = libc::SIGTERM as u8;

/// A message read back from the self-pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Tick,
    Stop,
}

impl Control {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match c_int::from(byte) {
            libc::SIGALRM => Some(Control::Tick),
            libc::SIGTERM | libc::SIGINT => Some(Control::Stop),
            _ => None,
        }
    }
}

extern "C" fn forward_signal(sig: c_int) {
    // Only async-signal-safe calls in here. errno is preserved for the
    // interrupted code.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            write_byte(fd, sig as u8);
        }
        *errno = saved;
    }
}

pub fn ignore_sigpipe() -> EtudeResult<()> {
    unsafe {
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(EtudeError::Signal(io::Error::last_os_error().to_string()));
        }
    }
    Ok(())
}

/// Routes SIGALRM, SIGTERM and SIGINT into the pipe whose write end is `fd`.
pub fn install(fd: c_int) -> EtudeResult<()> {
    PIPE_WRITE_FD.store(fd, Ordering::SeqCst);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = forward_signal as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGALRM, &action, std::ptr::null_mut()) < 0 {
            return Err(EtudeError::Signal(io::Error::last_os_error().to_string()));
        }
    }

    // ctrlc allows one handler per process; it always targets the current pipe.
    if !CTRLC_INSTALLED.swap(true, Ordering::SeqCst) {
        ctrlc::set_handler(|| {
            let fd = PIPE_WRITE_FD.load(Ordering::SeqCst);
            if fd >= 0 {
                write_byte(fd, STOP_BYTE);
            }
        })
        .map_err(|e| {
            CTRLC_INSTALLED.store(false, Ordering::SeqCst);
            EtudeError::Signal(e.to_string())
        })?;
    }
    Ok(())
}

/// Schedules the next SIGALRM `secs` seconds from now.
pub fn arm_alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}

/// Stops forwarding and cancels any pending alarm.
pub fn uninstall() {
    arm_alarm(0);
    PIPE_WRITE_FD.store(-1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_bytes_decode() {
        assert_eq!(Control::from_byte(TICK_BYTE), Some(Control::Tick));
        assert_eq!(Control::from_byte(STOP_BYTE), Some(Control::Stop));
        assert_eq!(Control::from_byte(libc::SIGINT as u8), Some(Control::Stop));
        assert_eq!(Control::from_byte(0), None);
    }
}
