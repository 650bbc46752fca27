//! Coarse (whole process) versus fine (single task) suspend/resume, each step
//! followed by an inspection pass.

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fmt;
use strum::Display;
use tracing::{error, info, warn};

use crate::process::inspector::{Inspection, Inspector, Motion, Tracer};
use crate::process::tasks::TaskList;
use crate::signals::{SignalError, Signaller};

#[derive(Copy, Clone, Debug, Display, Eq, PartialEq)]
pub enum Granularity {
    /// Signals go to the whole process.
    Coarse,
    /// Signals go to a single task.
    Fine,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    SuspendProcess,
    ResumeProcess,
    SuspendTask(Pid),
    ResumeTask(Pid),
}

impl Step {
    pub fn signal(&self) -> Signal {
        match self {
            Step::SuspendProcess | Step::SuspendTask(_) => Signal::SIGSTOP,
            Step::ResumeProcess | Step::ResumeTask(_) => Signal::SIGCONT,
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Step::SuspendProcess | Step::ResumeProcess => Granularity::Coarse,
            Step::SuspendTask(_) | Step::ResumeTask(_) => Granularity::Fine,
        }
    }

    pub fn is_suspend(&self) -> bool {
        self.signal() == Signal::SIGSTOP
    }

    fn deliver<S: Signaller>(&self, signaller: &S, pid: Pid) -> Result<(), SignalError> {
        match *self {
            Step::SuspendProcess | Step::ResumeProcess => {
                signaller.signal_process(pid, self.signal())
            }
            Step::SuspendTask(tid) | Step::ResumeTask(tid) => {
                signaller.signal_task(pid, tid, self.signal())
            }
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::SuspendProcess | Step::ResumeProcess => {
                write!(f, "{} to child process", self.signal())
            }
            Step::SuspendTask(tid) | Step::ResumeTask(tid) => {
                write!(f, "{} to TID {tid}", self.signal())
            }
        }
    }
}

/// Who gets signalled and who gets inspected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExperimentPlan {
    pub pid: Pid,
    /// The task every inspection attaches to.
    pub representative: Pid,
    /// The task the fine sequence suspends and resumes.
    pub target: Pid,
}

impl ExperimentPlan {
    /// The fine sequence targets the first task; by default the middle task is
    /// the representative. The two are kept apart whenever there is more than
    /// one task.
    pub fn from_tasks(tasks: &TaskList, representative: Option<usize>) -> Result<Self> {
        let target = tasks
            .get(0)
            .ok_or_else(|| anyhow!("process {} has no tasks to experiment on", tasks.pid()))?;

        let idx = representative.unwrap_or(tasks.len() / 2);
        let mut rep = tasks.get(idx).ok_or_else(|| {
            anyhow!(
                "representative index {idx} out of range, process {} has {} tasks",
                tasks.pid(),
                tasks.len()
            )
        })?;
        if rep == target && tasks.len() > 1 {
            rep = tasks.get(1).unwrap_or(rep);
        }

        Ok(Self {
            pid: tasks.pid(),
            representative: rep,
            target,
        })
    }

    /// Coarse sequence, then fine sequence.
    pub fn steps(&self) -> [Step; 4] {
        [
            Step::SuspendProcess,
            Step::ResumeProcess,
            Step::SuspendTask(self.target),
            Step::ResumeTask(self.target),
        ]
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepOutcome {
    pub step: Step,
    pub inspection: Inspection,
}

impl StepOutcome {
    /// Slots that are not written by the inspected (and therefore trace-stopped) task.
    fn free_motions(&self) -> impl Iterator<Item = Motion> + '_ {
        let pinned = self.inspection.second.slot_of(self.inspection.tid);
        self.inspection
            .motions()
            .into_iter()
            .enumerate()
            .filter(move |(idx, _)| Some(*idx) != pinned)
            .map(|(_, m)| m)
    }

    /// Every slot not held still by the inspection itself advanced.
    pub fn free_slots_advanced(&self) -> bool {
        self.free_motions().all(|m| m == Motion::Advanced)
    }

    /// Number of free slots that advanced.
    pub fn free_slots_advancing(&self) -> usize {
        self.free_motions().filter(|m| *m == Motion::Advanced).count()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExperimentReport {
    pub plan: ExperimentPlan,
    pub outcomes: Vec<StepOutcome>,
}

impl ExperimentReport {
    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.step == step)
    }
}

impl fmt::Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            let step = outcome.step;
            let verdict = match (step.is_suspend(), step) {
                (true, Step::SuspendTask(tid)) => match outcome.inspection.motion_of(tid) {
                    Some(m) => format!(
                        "target slot {m}, {} of the other free slots advancing",
                        outcome.free_slots_advancing()
                    ),
                    None => "target slot unknown".to_string(),
                },
                (true, _) if outcome.inspection.all_frozen() => "all slots frozen".to_string(),
                (true, _) => format!(
                    "{} slots still advancing",
                    outcome.inspection.count(Motion::Advanced)
                ),
                (false, _) if outcome.free_slots_advanced() => {
                    "all free slots advancing".to_string()
                }
                (false, _) => format!(
                    "only {} free slots advancing",
                    outcome.free_slots_advancing()
                ),
            };
            writeln!(f, "\t[{}] {step}: {verdict}", step.granularity())?;
        }
        Ok(())
    }
}

/// Walks an [`ExperimentPlan`]: deliver a step's signal, wait, inspect.
pub struct Driver<'a, T: Tracer, S: Signaller> {
    inspector: &'a Inspector<T>,
    signaller: S,
}

impl<'a, T: Tracer, S: Signaller> Driver<'a, T, S> {
    pub fn new(inspector: &'a Inspector<T>, signaller: S) -> Self {
        Self {
            inspector,
            signaller,
        }
    }

    /// Run all steps, handing each finished one to `on_step`.
    ///
    /// Any failure aborts the run after resuming the whole process, so the
    /// producer is never left suspended.
    pub fn run(
        &self,
        plan: &ExperimentPlan,
        mut on_step: impl FnMut(&StepOutcome),
    ) -> Result<ExperimentReport> {
        let mut outcomes = Vec::with_capacity(4);

        for step in plan.steps() {
            match self.run_step(plan, step) {
                Ok(outcome) => {
                    on_step(&outcome);
                    outcomes.push(outcome);
                }
                Err(e) => {
                    error!("experiment step \"{step}\" failed: {e:#}");
                    self.recover(plan);
                    return Err(e);
                }
            }
        }

        Ok(ExperimentReport {
            plan: *plan,
            outcomes,
        })
    }

    fn run_step(&self, plan: &ExperimentPlan, step: Step) -> Result<StepOutcome> {
        info!("Sending {step} ...");
        step.deliver(&self.signaller, plan.pid)
            .with_context(|| format!("sending {step}"))?;
        std::thread::sleep(self.inspector.pace());

        let inspection = self
            .inspector
            .inspect(plan.representative)
            .with_context(|| format!("inspecting TID {} after {step}", plan.representative))?;

        Ok(StepOutcome { step, inspection })
    }

    fn recover(&self, plan: &ExperimentPlan) {
        if let Err(e) = self.signaller.signal_process(plan.pid, Signal::SIGCONT) {
            warn!("could not resume producer after failure: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterArray;
    use crate::process::inspector::tests::FakeTracer;
    use crate::process::tasks::enumerate_tasks_in;
    use nix::errno::Errno;
    use std::cell::RefCell;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    enum Sent {
        Process(Signal),
        Task(Pid, Signal),
    }

    #[derive(Default)]
    struct RecordingSignaller {
        sent: RefCell<Vec<Sent>>,
    }

    impl Signaller for &RecordingSignaller {
        fn signal_process(&self, _pid: Pid, signal: Signal) -> Result<(), SignalError> {
            self.sent.borrow_mut().push(Sent::Process(signal));
            Ok(())
        }

        fn signal_task(&self, _tgid: Pid, tid: Pid, signal: Signal) -> Result<(), SignalError> {
            self.sent.borrow_mut().push(Sent::Task(tid, signal));
            Ok(())
        }
    }

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    fn task_list(pid: i32, tids: &[i32]) -> TaskList {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(pid.to_string()).join("task");
        std::fs::create_dir_all(&dir).unwrap();
        for t in tids {
            std::fs::create_dir(dir.join(t.to_string())).unwrap();
        }
        enumerate_tasks_in(root.path(), Pid::from_raw(pid)).unwrap()
    }

    #[test]
    fn plan_keeps_representative_apart_from_target() {
        let tasks = task_list(100, &[100, 101, 102, 103]);
        let plan = ExperimentPlan::from_tasks(&tasks, None).unwrap();
        assert_eq!(plan.target, pid(100));
        assert_eq!(plan.representative, pid(102));

        let plan = ExperimentPlan::from_tasks(&tasks, Some(0)).unwrap();
        assert_eq!(plan.representative, pid(101));

        let single = task_list(200, &[200]);
        let plan = ExperimentPlan::from_tasks(&single, None).unwrap();
        assert_eq!(plan.representative, pid(200));
        assert_eq!(plan.target, pid(200));

        assert!(ExperimentPlan::from_tasks(&tasks, Some(4)).is_err());
    }

    #[test]
    fn steps_run_coarse_then_fine() {
        let plan = ExperimentPlan {
            pid: pid(10),
            representative: pid(12),
            target: pid(10),
        };
        let steps = plan.steps();
        assert_eq!(steps[0], Step::SuspendProcess);
        assert_eq!(steps[1], Step::ResumeProcess);
        assert_eq!(steps[2], Step::SuspendTask(pid(10)));
        assert_eq!(steps[3], Step::ResumeTask(pid(10)));
        assert_eq!(steps[2].to_string(), "SIGSTOP to TID 10");
        assert_eq!(steps[1].to_string(), "SIGCONT to child process");
        assert_eq!(steps[3].granularity(), Granularity::Fine);
    }

    #[test]
    fn driver_signals_and_inspects_each_step() {
        let tracer = FakeTracer::counting();
        let counters = CounterArray::new(1);
        let inspector = Inspector::new(&tracer, counters.remote_layout(), Duration::ZERO);
        let signaller = RecordingSignaller::default();
        let plan = ExperimentPlan {
            pid: pid(10),
            representative: pid(12),
            target: pid(10),
        };

        let mut seen = Vec::new();
        let report = Driver::new(&inspector, &signaller)
            .run(&plan, |o| seen.push(o.step))
            .unwrap();

        assert_eq!(seen, plan.steps().to_vec());
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(
            *signaller.sent.borrow(),
            vec![
                Sent::Process(Signal::SIGSTOP),
                Sent::Process(Signal::SIGCONT),
                Sent::Task(pid(10), Signal::SIGSTOP),
                Sent::Task(pid(10), Signal::SIGCONT),
            ]
        );
        assert_eq!(*tracer.attaches.borrow(), vec![pid(12); 4]);
        assert_eq!(tracer.detaches.borrow().len(), 4);
        assert!(report.outcome(Step::ResumeTask(pid(10))).is_some());
    }

    #[test]
    fn attach_failure_resumes_producer() {
        let tracer = FakeTracer::counting();
        tracer.attach_error.set(Some(Errno::EPERM));
        let counters = CounterArray::new(1);
        let inspector = Inspector::new(&tracer, counters.remote_layout(), Duration::ZERO);
        let signaller = RecordingSignaller::default();
        let plan = ExperimentPlan {
            pid: pid(10),
            representative: pid(12),
            target: pid(10),
        };

        let err = Driver::new(&inspector, &signaller)
            .run(&plan, |_| {})
            .unwrap_err();

        assert!(format!("{err:#}").contains("cannot attach to TID 12"));
        assert_eq!(
            *signaller.sent.borrow(),
            vec![
                Sent::Process(Signal::SIGSTOP),
                Sent::Process(Signal::SIGCONT)
            ]
        );
        assert!(tracer.detaches.borrow().is_empty());
    }

    #[test]
    fn free_slots_ignore_the_inspected_task() {
        use crate::process::inspector::{SlotReading, Snapshot};

        let snap = |counts: [usize; 3]| {
            Snapshot::new(
                counts
                    .iter()
                    .zip([21, 22, 20])
                    .map(|(&count, owner)| SlotReading {
                        owner: Some(pid(owner)),
                        count,
                    })
                    .collect(),
            )
        };
        let outcome = StepOutcome {
            step: Step::ResumeProcess,
            inspection: Inspection {
                tid: pid(22),
                first: snap([1, 5, 9]),
                second: snap([2, 5, 10]),
            },
        };
        assert!(outcome.free_slots_advanced());
        assert_eq!(outcome.free_slots_advancing(), 2);
    }
}
