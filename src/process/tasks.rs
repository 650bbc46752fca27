use nix::unistd::Pid;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};

/// Lowest id accepted as a target process, and as a task id in a listing.
/// 0 and 1 are never a tracee we spawned.
pub const MIN_PID: i32 = 2;

/// The listing grows by whole chunks rather than one entry at a time.
const TASK_CHUNK: usize = 128;

const PROC_ROOT: &str = "/proc";

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("invalid process id {0}")]
    InvalidPid(i32),
    #[error("process {0} has no tasks")]
    NotFound(Pid),
    #[error("cannot read task list of process {pid}")]
    Io { pid: Pid, source: io::Error },
}

/// The tasks (threads) of one process at the moment it was listed.
///
/// Sorted ascending and free of duplicates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskList {
    pid: Pid,
    tids: Vec<Pid>,
}

impl TaskList {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn len(&self) -> usize {
        self.tids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tids.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Pid> {
        self.tids.get(idx).copied()
    }

    pub fn contains(&self, tid: Pid) -> bool {
        self.tids.binary_search(&tid).is_ok()
    }

    pub fn as_slice(&self) -> &[Pid] {
        &self.tids
    }

    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.tids.iter().copied()
    }
}

impl<'a> IntoIterator for &'a TaskList {
    type Item = &'a Pid;
    type IntoIter = std::slice::Iter<'a, Pid>;

    fn into_iter(self) -> Self::IntoIter {
        self.tids.iter()
    }
}

/// List every task of `pid` from `/proc/<pid>/task`.
///
/// The result is a snapshot: tasks may exit (or new ones appear) right after
/// it is taken, so callers must cope with a listed task being gone.
pub fn enumerate_tasks(pid: Pid) -> Result<TaskList, EnumerateError> {
    enumerate_tasks_in(Path::new(PROC_ROOT), pid)
}

/// Like [`enumerate_tasks`], reading from an alternative procfs mount point.
pub fn enumerate_tasks_in(proc_root: &Path, pid: Pid) -> Result<TaskList, EnumerateError> {
    if pid.as_raw() < MIN_PID {
        return Err(EnumerateError::InvalidPid(pid.as_raw()));
    }

    let task_dir = proc_root.join(pid.as_raw().to_string()).join("task");
    let entries = match task_dir.read_dir() {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EnumerateError::NotFound(pid));
        }
        Err(source) => return Err(EnumerateError::Io { pid, source }),
    };

    let mut tids: Vec<Pid> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| EnumerateError::Io { pid, source })?;
        let name = entry.file_name();
        let Some(tid) = parse_tid(&name.to_string_lossy()) else {
            trace!(?name, %pid, "skipping malformed task entry");
            continue;
        };

        if tids.len() == tids.capacity() {
            tids.reserve_exact(TASK_CHUNK);
        }
        tids.push(tid);
    }

    if tids.is_empty() {
        return Err(EnumerateError::NotFound(pid));
    }

    tids.sort_unstable();
    tids.dedup();
    tids.shrink_to_fit();

    debug!(%pid, count = tids.len(), "enumerated tasks");
    Ok(TaskList { pid, tids })
}

/// A task entry is a plain decimal number, nothing before or after it.
fn parse_tid(name: &str) -> Option<Pid> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let tid = name.parse::<i32>().ok()?;
    (tid >= MIN_PID).then(|| Pid::from_raw(tid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getpid, gettid};
    use std::fs;
    use tempfile::TempDir;

    fn fake_proc(pid: i32, entries: &[&str]) -> TempDir {
        let root = tempfile::tempdir().unwrap();
        let task_dir = root.path().join(pid.to_string()).join("task");
        fs::create_dir_all(&task_dir).unwrap();
        for e in entries {
            fs::create_dir(task_dir.join(e)).unwrap();
        }
        root
    }

    #[test]
    fn parses_only_plain_numbers() {
        assert_eq!(parse_tid("1234"), Some(Pid::from_raw(1234)));
        assert_eq!(parse_tid("12a"), None);
        assert_eq!(parse_tid("+12"), None);
        assert_eq!(parse_tid("-3"), None);
        assert_eq!(parse_tid(" 12"), None);
        assert_eq!(parse_tid("."), None);
        assert_eq!(parse_tid(""), None);
        assert_eq!(parse_tid("99999999999"), None);
        assert_eq!(parse_tid("1"), None);
    }

    #[test]
    fn skips_malformed_entries() {
        let root = fake_proc(300, &["300", "302", "301", "garbage", "7x", "0"]);
        let tasks = enumerate_tasks_in(root.path(), Pid::from_raw(300)).unwrap();

        assert_eq!(tasks.pid(), Pid::from_raw(300));
        assert_eq!(
            tasks.as_slice(),
            &[Pid::from_raw(300), Pid::from_raw(301), Pid::from_raw(302)]
        );
        assert!(tasks.contains(Pid::from_raw(301)));
        assert!(!tasks.contains(Pid::from_raw(303)));
        assert_eq!(tasks.iter().count(), tasks.len());
    }

    #[test]
    fn grows_past_one_chunk() {
        let names: Vec<String> = (1000..1000 + 3 * TASK_CHUNK as i32 + 5)
            .map(|t| t.to_string())
            .collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let root = fake_proc(1000, &refs);

        let tasks = enumerate_tasks_in(root.path(), Pid::from_raw(1000)).unwrap();
        assert_eq!(tasks.len(), names.len());
        assert_eq!(tasks.get(0), Some(Pid::from_raw(1000)));
    }

    #[test]
    fn rejects_sentinel_pids() {
        for raw in [-1, 0, 1] {
            let err = enumerate_tasks(Pid::from_raw(raw)).unwrap_err();
            assert!(matches!(err, EnumerateError::InvalidPid(p) if p == raw));
        }
    }

    #[test]
    fn empty_or_missing_listing_is_not_found() {
        let root = fake_proc(400, &["junk"]);
        let err = enumerate_tasks_in(root.path(), Pid::from_raw(400)).unwrap_err();
        assert!(matches!(err, EnumerateError::NotFound(p) if p.as_raw() == 400));

        let err = enumerate_tasks_in(root.path(), Pid::from_raw(401)).unwrap_err();
        assert!(matches!(err, EnumerateError::NotFound(_)));
    }

    #[test]
    fn unreadable_listing_is_io_error() {
        // a regular file where the task directory should be
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("500")).unwrap();
        fs::write(root.path().join("500/task"), b"").unwrap();

        let err = enumerate_tasks_in(root.path(), Pid::from_raw(500)).unwrap_err();
        assert!(matches!(err, EnumerateError::Io { .. }), "got {err:?}");

        // the io error appears once, as the cause
        let cause = match &err {
            EnumerateError::Io { source, .. } => source.to_string(),
            other => panic!("expected an io error, got {other:?}"),
        };
        assert_eq!(err.to_string(), "cannot read task list of process 500");
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(chain.matches(&cause).count(), 1, "{chain}");
    }

    #[test]
    fn lists_own_threads() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let helper = std::thread::spawn(move || {
            tx.send(gettid()).unwrap();
            let _ = stop_rx.recv();
        });
        let helper_tid = rx.recv().unwrap();

        let tasks = enumerate_tasks(getpid()).unwrap();
        assert!(tasks.len() >= 2);
        assert!(tasks.contains(gettid()));
        assert!(tasks.contains(helper_tid));
        assert!(tasks.contains(getpid()));

        drop(stop_tx);
        helper.join().unwrap();
    }
}
