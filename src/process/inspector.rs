use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::fmt;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::counters::{RemoteLayout, VirtualAddress};

/// Upper bound on retries of a read that keeps failing with a transient errno.
pub const READ_RETRY_LIMIT: usize = 1 << 20;

/// A detach racing the attach-stop fails with ESRCH; give the stop this long to land.
const DETACH_ATTEMPTS: usize = 100;
const DETACH_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("cannot attach to TID {tid}")]
    Attach { tid: Pid, source: Errno },
    #[error("cannot read {address} in TID {tid}")]
    Read {
        tid: Pid,
        address: VirtualAddress,
        source: Errno,
    },
    #[error("read of {address} in TID {tid} did not settle after {attempts} attempts (last: {last})")]
    ReadUnsettled {
        tid: Pid,
        address: VirtualAddress,
        attempts: usize,
        last: Errno,
    },
    #[error("cannot detach from TID {tid}")]
    Detach { tid: Pid, source: Errno },
}

impl TraceError {
    /// Errnos a remote read may hit while the tracee is still moving into its
    /// trace-stop. Anything else is permanent.
    pub fn is_transient_errno(errno: Errno) -> bool {
        matches!(errno, Errno::EIO | Errno::EFAULT | Errno::ESRCH)
    }
}

/// The three tracing primitives the inspector needs.
pub trait Tracer {
    /// Take tracing control of one task. The task stops (asynchronously).
    fn attach(&self, tid: Pid) -> Result<(), Errno>;
    /// Read one machine word at `address` in the task's address space.
    fn peek(&self, tid: Pid, address: VirtualAddress) -> Result<usize, Errno>;
    /// Release tracing control, letting the task run again.
    fn detach(&self, tid: Pid) -> Result<(), Errno>;
}

/// `ptrace(2)` backed tracer.
#[derive(Copy, Clone, Debug, Default)]
pub struct PtraceTracer;

impl Tracer for PtraceTracer {
    fn attach(&self, tid: Pid) -> Result<(), Errno> {
        ptrace::attach(tid)
    }

    fn peek(&self, tid: Pid, address: VirtualAddress) -> Result<usize, Errno> {
        ptrace::read(tid, address.addr() as ptrace::AddressType).map(|word| word as usize)
    }

    fn detach(&self, tid: Pid) -> Result<(), Errno> {
        ptrace::detach(tid, None)
    }
}

impl<T: Tracer + ?Sized> Tracer for &T {
    fn attach(&self, tid: Pid) -> Result<(), Errno> {
        (**self).attach(tid)
    }

    fn peek(&self, tid: Pid, address: VirtualAddress) -> Result<usize, Errno> {
        (**self).peek(tid, address)
    }

    fn detach(&self, tid: Pid) -> Result<(), Errno> {
        (**self).detach(tid)
    }
}

/// A live trace attachment to one task.
///
/// Dropping it detaches, so every successful attach is released exactly once on
/// every path. Use [`Attachment::detach`] to observe the detach result.
pub struct Attachment<'t, T: Tracer> {
    tracer: &'t T,
    tid: Pid,
    retry_limit: usize,
    attached: bool,
}

impl<'t, T: Tracer> Attachment<'t, T> {
    pub fn new(tracer: &'t T, tid: Pid) -> Result<Self, TraceError> {
        tracer
            .attach(tid)
            .map_err(|source| TraceError::Attach { tid, source })?;
        debug!(%tid, "attached");

        Ok(Self {
            tracer,
            tid,
            retry_limit: READ_RETRY_LIMIT,
            attached: true,
        })
    }

    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit.max(1);
        self
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// Read one word, retrying while the failure is transient.
    pub fn read_word(&self, address: VirtualAddress) -> Result<usize, TraceError> {
        let mut last = Errno::UnknownErrno;
        for attempt in 0..self.retry_limit {
            match self.tracer.peek(self.tid, address) {
                Ok(word) => {
                    if attempt > 0 {
                        trace!(tid = %self.tid, %address, retries = attempt, "read settled");
                    }
                    return Ok(word);
                }
                Err(errno) if TraceError::is_transient_errno(errno) => {
                    last = errno;
                    std::hint::spin_loop();
                }
                Err(source) => {
                    return Err(TraceError::Read {
                        tid: self.tid,
                        address,
                        source,
                    });
                }
            }
        }

        Err(TraceError::ReadUnsettled {
            tid: self.tid,
            address,
            attempts: self.retry_limit,
            last,
        })
    }

    pub fn detach(mut self) -> Result<(), TraceError> {
        self.attached = false;
        self.release()
    }

    fn release(&self) -> Result<(), TraceError> {
        let mut result = self.tracer.detach(self.tid);
        let mut attempts = 1;
        while result == Err(Errno::ESRCH) && attempts < DETACH_ATTEMPTS {
            std::thread::sleep(DETACH_BACKOFF);
            result = self.tracer.detach(self.tid);
            attempts += 1;
        }

        match result {
            Ok(()) => {
                debug!(tid = %self.tid, "detached");
                Ok(())
            }
            Err(source) => Err(TraceError::Detach {
                tid: self.tid,
                source,
            }),
        }
    }
}

impl<T: Tracer> Drop for Attachment<'_, T> {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        if let Err(e) = self.release() {
            warn!("{e}");
        }
    }
}

#[derive(Copy, Clone, Debug, Display, Eq, PartialEq)]
pub enum Motion {
    Frozen,
    Advanced,
    /// The counter went backwards, which a live producer never does.
    Regressed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotReading {
    pub owner: Option<Pid>,
    pub count: usize,
}

/// All counter slots, as read remotely at one moment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    readings: Vec<SlotReading>,
}

impl Snapshot {
    pub fn new(readings: Vec<SlotReading>) -> Self {
        Self { readings }
    }

    pub fn readings(&self) -> &[SlotReading] {
        &self.readings
    }

    pub fn counts(&self) -> Vec<usize> {
        self.readings.iter().map(|r| r.count).collect()
    }

    /// Index of the slot written by `tid`, if that task owns one.
    pub fn slot_of(&self, tid: Pid) -> Option<usize> {
        self.readings.iter().position(|r| r.owner == Some(tid))
    }

    /// Per-slot movement from `self` to `later`.
    pub fn motions(&self, later: &Snapshot) -> Vec<Motion> {
        self.readings
            .iter()
            .zip(later.readings.iter())
            .map(|(a, b)| match b.count.cmp(&a.count) {
                std::cmp::Ordering::Equal => Motion::Frozen,
                std::cmp::Ordering::Greater => Motion::Advanced,
                std::cmp::Ordering::Less => Motion::Regressed,
            })
            .collect()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, r) in self.readings.iter().enumerate() {
            match r.owner {
                Some(tid) => writeln!(f, "\tcounter[{idx}] = {} (TID {tid})", r.count)?,
                None => writeln!(f, "\tcounter[{idx}] = {}", r.count)?,
            }
        }
        Ok(())
    }
}

/// Two snapshots taken through one attachment, a pacing delay apart.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Inspection {
    pub tid: Pid,
    pub first: Snapshot,
    pub second: Snapshot,
}

impl Inspection {
    pub fn motions(&self) -> Vec<Motion> {
        self.first.motions(&self.second)
    }

    /// Movement of the slot owned by `tid`, if the slot can be identified.
    pub fn motion_of(&self, tid: Pid) -> Option<Motion> {
        let idx = self.second.slot_of(tid)?;
        self.motions().get(idx).copied()
    }

    pub fn all_frozen(&self) -> bool {
        self.motions().iter().all(|m| *m == Motion::Frozen)
    }

    pub fn count(&self, motion: Motion) -> usize {
        self.motions().iter().filter(|m| **m == motion).count()
    }
}

impl fmt::Display for Inspection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Attached to TID {}.", self.tid)?;
        writeln!(f, "Peeking the counters in the child process:")?;
        write!(f, "{}", self.first)?;
        writeln!(f, "Waiting a short moment ... and another peek:")?;
        write!(f, "{}", self.second)?;
        let motions = self.motions();
        let summary: Vec<String> = motions
            .iter()
            .enumerate()
            .map(|(idx, m)| format!("counter[{idx}] {m}"))
            .collect();
        writeln!(f, "\t=> {}", summary.join(", "))
    }
}

/// Reads the producer's counter slots out of its address space.
pub struct Inspector<T: Tracer> {
    tracer: T,
    layout: RemoteLayout,
    pace: Duration,
    retry_limit: usize,
}

impl<T: Tracer> Inspector<T> {
    pub fn new(tracer: T, layout: RemoteLayout, pace: Duration) -> Self {
        Self {
            tracer,
            layout,
            pace,
            retry_limit: READ_RETRY_LIMIT,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn pace(&self) -> Duration {
        self.pace
    }

    pub fn attach(&self, tid: Pid) -> Result<Attachment<'_, T>, TraceError> {
        Ok(Attachment::new(&self.tracer, tid)?.with_retry_limit(self.retry_limit))
    }

    pub fn snapshot(&self, attachment: &Attachment<'_, T>) -> Result<Snapshot, TraceError> {
        let mut readings = Vec::with_capacity(self.layout.len());
        for idx in 0..self.layout.len() {
            let owner = attachment.read_word(self.layout.owner_address(idx))?;
            let count = attachment.read_word(self.layout.count_address(idx))?;
            readings.push(SlotReading {
                owner: (owner != 0).then(|| Pid::from_raw(owner as i32)),
                count,
            });
        }
        Ok(Snapshot::new(readings))
    }

    /// Attach to `tid`, take two snapshots `pace` apart, detach.
    ///
    /// The detach happens on every path; a failing detach after a good pair of
    /// snapshots is logged, not returned.
    pub fn inspect(&self, tid: Pid) -> Result<Inspection, TraceError> {
        let attachment = self.attach(tid)?;

        let first = self.snapshot(&attachment)?;
        std::thread::sleep(self.pace);
        let second = self.snapshot(&attachment)?;

        if let Err(e) = attachment.detach() {
            warn!("{e}");
        }

        for (idx, m) in first.motions(&second).iter().enumerate() {
            if *m == Motion::Regressed {
                warn!(%tid, slot = idx, "counter went backwards between snapshots");
            }
        }

        Ok(Inspection { tid, first, second })
    }
}
