use anyhow::{Context, Result};
use nix::unistd::Pid;
use std::fmt;
use std::io::Write;
use tracing::{info, warn};

use crate::counters::CounterArray;
use crate::experiment::{Driver, ExperimentPlan, ExperimentReport};
use crate::options::HarnessConfig;
use crate::process::inspector::{Inspection, Inspector, PtraceTracer};
use crate::process::tasks::{TaskList, enumerate_tasks};
use crate::process::{self, ProducerState};
use crate::signals::{self, KernelSignaller};

/// Everything one harness run observed.
#[derive(Clone, Debug)]
pub struct HarnessReport {
    pub pid: Pid,
    pub tasks: TaskList,
    /// One inspection per task, attached to that task.
    pub baseline: Vec<Inspection>,
    pub experiment: ExperimentReport,
    pub producer_exit: ProducerState,
}

impl HarnessReport {
    pub fn succeeded(&self) -> bool {
        self.producer_exit == ProducerState::Exited(0)
    }
}

impl fmt::Display for HarnessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tids: Vec<String> = self.tasks.iter().map(|t| t.to_string()).collect();
        writeln!(
            f,
            "Child process {} had {} tasks: {}",
            self.pid,
            self.tasks.len(),
            tids.join(", ")
        )?;
        writeln!(
            f,
            "Experiment inspected TID {}, fine steps targeted TID {}:",
            self.experiment.plan.representative, self.experiment.plan.target
        )?;
        write!(f, "{}", self.experiment)?;
        writeln!(f, "Producer {}.", self.producer_exit)
    }
}

/// Run the whole harness: fork the producer, inspect it, experiment on it, stop it.
///
/// Inspection transcripts are written to `out` as they happen. On any failure
/// the producer is resumed, stopped and reaped before the error is returned.
pub fn run(config: &HarnessConfig, out: &mut impl Write) -> Result<HarnessReport> {
    let ready = signals::install_ready_handler(config.ready_signal)
        .context("installing ready-signal handler")?;

    let counters = CounterArray::new(config.workers);
    let mut producer = process::spawn(&counters, config).context("starting producer")?;
    let pid = producer.pid();

    producer
        .wait_ready(ready, config.startup_timeout)
        .context("waiting for producer startup")?;

    let tasks = enumerate_tasks(pid).with_context(|| format!("enumerating tasks of {pid}"))?;
    info!("Child process {pid} has {} tasks.", tasks.len());
    if tasks.len() < config.workers + 1 {
        warn!(
            expected = config.workers + 1,
            found = tasks.len(),
            "producer has fewer tasks than expected"
        );
    }

    let inspector = Inspector::new(PtraceTracer, counters.remote_layout(), config.pace);

    let mut baseline = Vec::with_capacity(tasks.len());
    for tid in tasks.iter() {
        let inspection = inspector
            .inspect(tid)
            .with_context(|| format!("baseline inspection of TID {tid}"))?;
        writeln!(out, "{inspection}")?;
        baseline.push(inspection);
    }

    let plan = ExperimentPlan::from_tasks(&tasks, config.representative)?;
    let driver = Driver::new(&inspector, KernelSignaller);
    let mut transcript_error = None;
    let experiment = driver.run(&plan, |outcome| {
        let res = writeln!(out, "Sent {}.\n{}", outcome.step, outcome.inspection);
        if let Err(e) = res {
            transcript_error.get_or_insert(e);
        }
    })?;
    if let Some(e) = transcript_error {
        return Err(e).context("writing inspection transcript");
    }

    producer.stop()?;
    let producer_exit = producer.reap()?;
    info!(%pid, "producer {producer_exit}");

    Ok(HarnessReport {
        pid,
        tasks,
        baseline,
        experiment,
        producer_exit,
    })
}
