use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::unistd::Pid;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::trace;

/// Set by the observer's handler when the producer reports its workers are running.
static READY: AtomicBool = AtomicBool::new(false);
/// Set by the producer's handler when the observer asks it to stop.
static DONE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_ready(_signum: libc::c_int) {
    READY.store(true, Ordering::SeqCst);
}

extern "C" fn on_done(_signum: libc::c_int) {
    DONE.store(true, Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("cannot install {signal} handler")]
    Install { signal: Signal, source: Errno },
    #[error("cannot send {signal} to {target}")]
    Send {
        target: SignalTarget,
        signal: Signal,
        source: Errno,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalTarget {
    Process(Pid),
    Task { tgid: Pid, tid: Pid },
}

impl fmt::Display for SignalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalTarget::Process(pid) => write!(f, "process {pid}"),
            SignalTarget::Task { tgid, tid } => write!(f, "TID {tid} of process {tgid}"),
        }
    }
}

/// A set-once, never-cleared flag. Cheap to copy into any thread.
#[derive(Copy, Clone, Debug)]
pub struct Flag(&'static AtomicBool);

impl Flag {
    pub fn new(flag: &'static AtomicBool) -> Self {
        Self(flag)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn install(
    signal: Signal,
    handler: extern "C" fn(libc::c_int),
    flag: &'static AtomicBool,
) -> Result<Flag, SignalError> {
    // a fresh install marks the start of a new run
    flag.store(false, Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only performs an atomic store.
    unsafe { sigaction(signal, &action) }
        .map_err(|source| SignalError::Install { signal, source })?;

    trace!(%signal, "installed flag handler");
    Ok(Flag::new(flag))
}

/// Install the observer-side handler that records "producer is ready".
pub fn install_ready_handler(signal: Signal) -> Result<Flag, SignalError> {
    install(signal, on_ready, &READY)
}

/// Install the producer-side handler that records "stop now".
pub fn install_done_handler(signal: Signal) -> Result<Flag, SignalError> {
    install(signal, on_done, &DONE)
}

/// Delivery of suspend/resume/stop signals, either to a whole process or to one of its tasks.
pub trait Signaller {
    fn signal_process(&self, pid: Pid, signal: Signal) -> Result<(), SignalError>;
    fn signal_task(&self, tgid: Pid, tid: Pid, signal: Signal) -> Result<(), SignalError>;
}

/// Real delivery through `kill(2)` and `tgkill(2)`.
#[derive(Copy, Clone, Debug, Default)]
pub struct KernelSignaller;

impl Signaller for KernelSignaller {
    fn signal_process(&self, pid: Pid, signal: Signal) -> Result<(), SignalError> {
        trace!(%pid, %signal, "kill");
        kill(pid, signal).map_err(|source| SignalError::Send {
            target: SignalTarget::Process(pid),
            signal,
            source,
        })
    }

    fn signal_task(&self, tgid: Pid, tid: Pid, signal: Signal) -> Result<(), SignalError> {
        trace!(%tgid, %tid, %signal, "tgkill");
        tgkill(tgid, tid, signal).map_err(|source| SignalError::Send {
            target: SignalTarget::Task { tgid, tid },
            signal,
            source,
        })
    }
}

/// Deliver `signal` to exactly one task of the thread group `tgid`.
pub fn tgkill(tgid: Pid, tid: Pid, signal: Signal) -> Result<(), Errno> {
    // SAFETY: tgkill takes three plain integers and touches no memory of ours.
    let res = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            tgid.as_raw(),
            tid.as_raw(),
            signal as libc::c_int,
        )
    };
    Errno::result(res).map(drop)
}
