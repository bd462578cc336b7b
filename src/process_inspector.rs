use std::collections::{BTreeSet, HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid as SysPid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

pub type Pid = u32;

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pids sharing one process name, as seen in a single table snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessHandle {
    pub name: String,
    pub pids: BTreeSet<Pid>,
}

impl ProcessHandle {
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KillReport {
    /// Pids that received the kill signal.
    pub signalled: BTreeSet<Pid>,
    /// Pids that were gone before the signal could be delivered.
    pub vanished: BTreeSet<Pid>,
    /// Pids still present once the wait timed out.
    pub still_alive: BTreeSet<Pid>,
}

impl KillReport {
    pub fn is_complete(&self) -> bool {
        self.still_alive.is_empty()
    }
}

/// Read-mostly view over the OS process table. Every query refreshes the
/// table, so results are never carried over from an earlier call.
pub struct ProcessInspector {
    system: System,
    kill_timeout: Duration,
}

impl Default for ProcessInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector {
    pub fn new() -> Self {
        Self::with_kill_timeout(DEFAULT_KILL_TIMEOUT)
    }

    pub fn with_kill_timeout(kill_timeout: Duration) -> Self {
        Self {
            system: System::new(),
            kill_timeout,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
    }

    fn live_processes(&self) -> impl Iterator<Item = (&SysPid, &sysinfo::Process)> {
        self.system
            .processes()
            .iter()
            .filter(|(_, proc_)| !matches!(proc_.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    pub fn list_pids(&mut self, name: &str) -> BTreeSet<Pid> {
        self.refresh();
        self.live_processes()
            .filter(|(_, proc_)| proc_.name().to_string_lossy() == name)
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    pub fn snapshot(&mut self, name: &str) -> ProcessHandle {
        ProcessHandle {
            name: name.to_string(),
            pids: self.list_pids(name),
        }
    }

    /// All descendants of `pid`. A pid that is not in the table has none.
    pub fn children(&mut self, pid: Pid) -> BTreeSet<Pid> {
        self.refresh();
        self.descendants_of(pid)
    }

    fn descendants_of(&self, pid: Pid) -> BTreeSet<Pid> {
        let mut by_parent: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child, proc_) in self.live_processes() {
            if let Some(parent) = proc_.parent() {
                by_parent.entry(parent.as_u32()).or_default().push(child.as_u32());
            }
        }

        let mut out = BTreeSet::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(current) = queue.pop_front() {
            let Some(kids) = by_parent.get(&current) else {
                continue;
            };
            for kid in kids {
                if *kid != pid && out.insert(*kid) {
                    queue.push_back(*kid);
                }
            }
        }
        out
    }

    pub fn is_alive(&mut self, pid: Pid) -> bool {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[SysPid::from_u32(pid)]), true);
        self.pid_live(pid)
    }

    fn pid_live(&self, pid: Pid) -> bool {
        self.system
            .process(SysPid::from_u32(pid))
            .is_some_and(|proc_| !matches!(proc_.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    /// Kills `pids` (and their descendants when asked) and waits for them to
    /// leave the process table. Survivors are reported, not raised.
    pub fn kill<I>(&mut self, pids: I, include_children: bool) -> KillReport
    where
        I: IntoIterator<Item = Pid>,
    {
        self.refresh();
        let mut targets = BTreeSet::new();
        for pid in pids {
            if include_children {
                targets.extend(self.descendants_of(pid));
            }
            targets.insert(pid);
        }
        targets.remove(&std::process::id());

        let mut report = KillReport::default();
        for pid in &targets {
            match send_kill(*pid) {
                Ok(true) => {
                    report.signalled.insert(*pid);
                }
                Ok(false) => {
                    report.vanished.insert(*pid);
                }
                Err(err) => {
                    warn!("process-kill-signal-failed pid={pid} err={err}");
                    report.signalled.insert(*pid);
                }
            }
        }

        let deadline = Instant::now() + self.kill_timeout;
        loop {
            self.refresh();
            let alive: BTreeSet<Pid> = report
                .signalled
                .iter()
                .copied()
                .filter(|pid| self.pid_live(*pid))
                .collect();
            if alive.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "process-kill-timeout still_alive={:?} timeout_secs={}",
                    alive,
                    self.kill_timeout.as_secs()
                );
                report.still_alive = alive;
                break;
            }
            thread::sleep(KILL_POLL_INTERVAL);
        }

        debug!(
            "process-kill signalled={:?} vanished={:?} still_alive={:?}",
            report.signalled, report.vanished, report.still_alive
        );
        report
    }

    pub fn kill_by_name(&mut self, name: &str, include_children: bool) -> KillReport {
        let pids = self.list_pids(name);
        self.kill(pids, include_children)
    }
}

/// `Ok(false)` when the process no longer exists.
#[cfg(unix)]
fn send_kill(pid: Pid) -> Result<bool, String> {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Err(format!("pid out of range: {pid}"));
    };
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err.to_string())
    }
}

#[cfg(not(unix))]
fn send_kill(pid: Pid) -> Result<bool, String> {
    let mut system = System::new();
    let sys_pid = SysPid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    match system.process(sys_pid) {
        Some(proc_) => Ok(proc_.kill()),
        None => Ok(false),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::{Child, Command, Stdio};
    use tempfile::TempDir;

    /// Scratch dir inside the package so scripts stay executable even when
    /// the system temp dir is mounted noexec.
    fn script_dir() -> TempDir {
        tempfile::Builder::new()
            .prefix(".proc-test-")
            .tempdir_in(env!("CARGO_MANIFEST_DIR"))
            .unwrap()
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn spawn(path: &Path) -> Child {
        let mut attempts = 0;
        loop {
            match Command::new(path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => return child,
                // ETXTBSY while another test thread still has a write handle.
                Err(err) if err.raw_os_error() == Some(libc::ETXTBSY) && attempts < 20 => {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => panic!("spawn {}: {err}", path.display()),
            }
        }
    }

    fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn lists_processes_by_exact_name() {
        let dir = script_dir();
        let script = write_script(dir.path(), "pc-list-a", "sleep 300");
        let mut child = spawn(&script);
        let mut inspector = ProcessInspector::with_kill_timeout(Duration::from_secs(10));

        assert!(wait_until(|| inspector.list_pids("pc-list-a").contains(&child.id())));
        assert!(inspector.list_pids("pc-list").is_empty());
        assert!(inspector.is_alive(child.id()));

        let report = inspector.kill([child.id()], true);
        assert!(report.is_complete());
        let _ = child.wait();
        assert!(inspector.list_pids("pc-list-a").is_empty());
    }

    #[test]
    fn kill_with_children_leaves_nothing_behind() {
        let dir = script_dir();
        let script = write_script(dir.path(), "pc-tree-b", "sleep 300 &\nsleep 300 &\nwait");
        let mut child = spawn(&script);
        let mut inspector = ProcessInspector::with_kill_timeout(Duration::from_secs(10));

        assert!(wait_until(|| inspector.children(child.id()).len() >= 2));
        let descendants = inspector.children(child.id());

        let report = inspector.kill([child.id()], true);
        assert!(report.is_complete());
        for pid in &descendants {
            assert!(report.signalled.contains(pid) || report.vanished.contains(pid));
        }
        let _ = child.wait();
        for pid in descendants {
            assert!(!inspector.is_alive(pid), "descendant {pid} survived");
        }
        assert!(inspector.list_pids("pc-tree-b").is_empty());
    }

    #[test]
    fn exited_process_counts_as_dead() {
        let dir = script_dir();
        let script = write_script(dir.path(), "pc-gone-c", "exit 0");
        let mut child = spawn(&script);
        let pid = child.id();
        child.wait().unwrap();

        let mut inspector = ProcessInspector::with_kill_timeout(Duration::from_secs(2));
        assert!(!inspector.is_alive(pid));
        assert!(inspector.children(pid).is_empty());

        let report = inspector.kill([pid], true);
        assert!(report.is_complete());
        assert!(report.vanished.contains(&pid));
    }
}
