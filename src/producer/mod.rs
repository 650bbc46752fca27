//! The traced side of the harness: a process whose threads do nothing but
//! bump their own counter as fast as they can.

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::kill;
use nix::unistd::{getppid, gettid};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, error};

use crate::counters::CounterArray;
use crate::options::HarnessConfig;
use crate::signals;

pub mod worker;

use worker::RunFlags;

/// Final counter values, printed by the producer on its way out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProducerReport {
    pub worker_counts: Vec<usize>,
    pub control_count: usize,
}

impl fmt::Display for ProducerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Final counters:")?;
        for (idx, count) in self.worker_counts.iter().enumerate() {
            writeln!(f, "\tThread {}: {count}", idx + 1)?;
        }
        writeln!(f, "\tMain thread: {}", self.control_count)
    }
}

/// Run the producer until the stop signal arrives.
///
/// Spawns one worker per worker slot of `counters`, waits until each has
/// registered its TID, raises `run`, and tells the parent with the ready
/// signal. The calling thread then bumps the control slot until stopped.
pub fn run(counters: &CounterArray, config: &HarnessConfig) -> Result<ProducerReport> {
    let done = signals::install_done_handler(config.stop_signal)
        .context("installing stop-signal handler")?;
    let run_flag = AtomicBool::new(false);
    let flags = RunFlags {
        run: &run_flag,
        done,
    };
    let workers = counters.workers();

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let slot = counters.worker_slot(idx);
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", idx + 1))
                .spawn_scoped(scope, move || worker::run(slot, flags));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // release the workers already spinning so the scope can join them
                    done.set();
                    return Err(anyhow!(
                        "cannot create thread {} of {workers}: {e}",
                        idx + 1
                    ));
                }
            }
        }

        counters.control_slot().register(gettid());
        while counters.slots().iter().any(|s| s.owner().is_none()) {
            thread::yield_now();
        }

        run_flag.store(true, Ordering::SeqCst);

        let parent = getppid();
        if let Err(e) = kill(parent, config.ready_signal) {
            done.set();
            return Err(anyhow!(
                "cannot send {} to parent {parent}: {e}",
                config.ready_signal
            ));
        }
        debug!(%parent, workers, "producer started");

        let control = counters.control_slot();
        while !done.is_set() {
            control.increment();
        }

        let mut worker_counts = Vec::with_capacity(workers);
        for (idx, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(count) => worker_counts.push(count),
                Err(_) => {
                    error!(worker = idx + 1, "worker thread panicked");
                    return Err(anyhow!("worker thread {} panicked", idx + 1));
                }
            }
        }

        Ok(ProducerReport {
            worker_counts,
            control_count: control.count(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_every_thread() {
        let report = ProducerReport {
            worker_counts: vec![10, 20, 30],
            control_count: 40,
        };
        assert_eq!(
            report.to_string(),
            "Final counters:\n\tThread 1: 10\n\tThread 2: 20\n\tThread 3: 30\n\tMain thread: 40\n"
        );
    }
}
