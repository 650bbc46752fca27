use nix::unistd::gettid;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::counters::Slot;
use crate::signals::Flag;

/// The two lifecycle flags shared by every thread of the producer.
///
/// `run` is raised by the orchestrator once all workers exist; `done` by the
/// stop-signal handler. Neither is ever cleared.
#[derive(Copy, Clone, Debug)]
pub struct RunFlags<'a> {
    pub run: &'a AtomicBool,
    pub done: Flag,
}

impl RunFlags<'_> {
    pub fn running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    pub fn done(&self) -> bool {
        self.done.is_set()
    }
}

/// Body of one worker thread.
///
/// Registers itself as the slot's owner, spins until `run`, then bumps the
/// slot until `done`. Returns the final count.
pub fn run(slot: &Slot, flags: RunFlags<'_>) -> usize {
    slot.register(gettid());

    while !flags.running() && !flags.done() {
        std::hint::spin_loop();
    }

    while !flags.done() {
        slot.increment();
    }

    slot.count()
}
