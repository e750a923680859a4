//! Process-level crash plumbing. This is the only module that touches raw signals
//! or exit handlers.
//!
//! The fuzz engine reports an internal abort and a memory fault differently, so
//! every abort is re-raised as a segmentation fault to get one consistent crash
//! report. Separately, an exit handler turns a process exit that happens in the
//! middle of a trial into an abort; otherwise a fatal engine error that exits
//! cleanly would hide the input that caused it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalTranslation {
    pub from: libc::c_int,
    pub to: libc::c_int,
}

pub const CRASH_TRANSLATIONS: &[SignalTranslation] = &[SignalTranslation {
    from: libc::SIGABRT,
    to: libc::SIGSEGV,
}];

pub fn translated(signal: libc::c_int) -> Option<libc::c_int> {
    CRASH_TRANSLATIONS
        .iter()
        .find(|t| t.from == signal)
        .map(|t| t.to)
}

#[cfg(unix)]
extern "C" fn translate_signal(
    signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if let Some(target) = translated(signum) {
        // SAFETY: raise is async-signal-safe.
        unsafe {
            libc::raise(target);
        }
    }
}

/// Installs a handler for every signal in [`CRASH_TRANSLATIONS`].
#[cfg(unix)]
pub fn install_crash_translation() -> io::Result<()> {
    for translation in CRASH_TRANSLATIONS {
        // SAFETY: a zeroed sigaction is a valid starting point; every field the
        // kernel reads is set below before the call.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = translate_signal
                as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
                as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(translation.from, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_crash_translation() -> io::Result<()> {
    Ok(())
}

static REGISTER_EXIT_HANDLER: Once = Once::new();
static WATCHED_TRIALS: Mutex<Vec<Weak<AtomicBool>>> = Mutex::new(Vec::new());

fn trial_mid_flight() -> bool {
    let watched = WATCHED_TRIALS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    watched
        .iter()
        .filter_map(Weak::upgrade)
        .any(|flag| flag.load(Ordering::SeqCst))
}

extern "C" fn abort_if_mid_trial() {
    if trial_mid_flight() {
        std::process::abort();
    }
}

/// Makes any process exit while `in_flight` is set end in an abort instead.
pub fn arm_exit_guard(in_flight: &Arc<AtomicBool>) {
    REGISTER_EXIT_HANDLER.call_once(|| {
        // SAFETY: the handler is a plain extern "C" fn with no captured state.
        unsafe {
            libc::atexit(abort_if_mid_trial);
        }
    });
    let mut watched = WATCHED_TRIALS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    watched.retain(|flag| flag.strong_count() > 0);
    let flag = Arc::downgrade(in_flight);
    if !watched.iter().any(|known| Weak::ptr_eq(known, &flag)) {
        watched.push(flag);
    }
}

#[cfg(test)]
fn watched_count(in_flight: &Arc<AtomicBool>) -> usize {
    let flag = Arc::downgrade(in_flight);
    WATCHED_TRIALS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .filter(|known| Weak::ptr_eq(known, &flag))
        .count()
}
