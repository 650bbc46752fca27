use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::counters::CounterArray;
use crate::options::HarnessConfig;
use crate::producer;
use crate::signals::Flag;

pub mod inspector;
pub mod tasks;

/// Poll interval while waiting for the producer's startup signal.
const READY_POLL: Duration = Duration::from_millis(1);
/// How long teardown waits for a stop-signalled producer before killing it.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProducerState {
    /// Forked, startup signal not received yet.
    Starting,
    /// All workers are running.
    Running,
    /// The producer process exited normally.
    Exited(i32),
    /// The producer process was killed by a signal.
    Terminated(Signal),
}

impl ProducerState {
    fn is_alive(&self) -> bool {
        matches!(self, ProducerState::Starting | ProducerState::Running)
    }
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerState::Starting => write!(f, "starting"),
            ProducerState::Running => write!(f, "running"),
            ProducerState::Exited(code) => write!(f, "exited with status {code}"),
            ProducerState::Terminated(sig) => write!(f, "terminated by {sig}"),
        }
    }
}

/// The observer's handle on the forked producer process.
///
/// Dropping a live handle tears the producer down: it is continued, sent the
/// stop signal, and reaped (killed if it does not exit in time).
#[derive(Debug)]
pub struct Producer {
    pid: Pid,
    state: ProducerState,
    stop_signal: Signal,
}

impl Producer {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    /// Block until `ready` is raised by the producer's startup signal.
    ///
    /// Fails if the producer dies first or `timeout` elapses.
    pub fn wait_ready(&mut self, ready: Flag, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !ready.is_set() {
            if let Some(state) = self.poll_exit()? {
                return Err(anyhow!(
                    "producer {} {state} before signalling startup",
                    self.pid
                ));
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "producer {} did not signal startup within {timeout:?}",
                    self.pid
                ));
            }
            std::thread::sleep(READY_POLL);
        }

        self.state = ProducerState::Running;
        debug!(pid = %self.pid, "producer reported startup");
        Ok(())
    }

    /// Ask the producer to finish: its workers stop and it prints final counters.
    pub fn stop(&self) -> Result<()> {
        info!(pid = %self.pid, signal = %self.stop_signal, "sending stop signal to producer");
        kill(self.pid, self.stop_signal)
            .with_context(|| format!("sending {} to producer {}", self.stop_signal, self.pid))
    }

    /// Wait for the producer to exit, retrying interrupted waits.
    pub fn reap(&mut self) -> Result<ProducerState> {
        while self.state.is_alive() {
            match waitpid(self.pid, None) {
                Ok(status) => self.record(status),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(anyhow!("waiting for producer {}: {e}", self.pid));
                }
            }
        }
        Ok(self.state)
    }

    fn poll_exit(&mut self) -> Result<Option<ProducerState>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => self.record(status),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(anyhow!("polling producer {}: {e}", self.pid)),
        }
        Ok((!self.state.is_alive()).then_some(self.state))
    }

    fn record(&mut self, status: WaitStatus) {
        trace!(pid = %self.pid, ?status, "producer wait status");
        match status {
            WaitStatus::Exited(_, code) => self.state = ProducerState::Exited(code),
            WaitStatus::Signaled(_, sig, _) => self.state = ProducerState::Terminated(sig),
            _ => {}
        }
    }

    fn teardown(&mut self) {
        warn!(pid = %self.pid, "tearing down producer");
        for signal in [Signal::SIGCONT, self.stop_signal] {
            if let Err(e) = kill(self.pid, signal) {
                debug!(pid = %self.pid, %signal, "teardown signal not delivered: {e}");
            }
        }

        let deadline = Instant::now() + TEARDOWN_GRACE;
        while Instant::now() < deadline {
            match self.poll_exit() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    warn!("{e:#}");
                    return;
                }
            }
        }

        warn!(pid = %self.pid, "producer ignored stop signal, killing it");
        if let Err(e) = kill(self.pid, Signal::SIGKILL) {
            debug!(pid = %self.pid, "SIGKILL not delivered: {e}");
        }
        if let Err(e) = self.reap() {
            warn!("{e:#}");
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.state.is_alive() {
            self.teardown();
        }
    }
}

/// Fork the producer. The child runs the producer to completion and exits; it
/// never returns from this function.
///
/// `counters` must be allocated before the fork so that both processes see it
/// at the same address.
pub fn spawn(counters: &CounterArray, config: &HarnessConfig) -> Result<Producer> {
    // SAFETY: the child only runs producer code and then exits, it never
    // returns into the caller.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { child } => {
            info!(pid = %child, workers = config.workers, "forked producer");
            Ok(Producer {
                pid: child,
                state: ProducerState::Starting,
                stop_signal: config.stop_signal,
            })
        }
        ForkResult::Child => {
            let code = match producer::run(counters, config) {
                Ok(report) => {
                    print!("{report}");
                    0
                }
                Err(e) => {
                    eprintln!("producer: {e:#}");
                    1
                }
            };
            std::process::exit(code)
        }
    }
}
