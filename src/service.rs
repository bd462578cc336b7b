use crate::Outcome;
use crate::process_inspector::{Pid, ProcessInspector};
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceStatus {
    NotInstalled,
    Stopped,
    Starting,
    Running,
    Stopping,
    Paused,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInstalled => "not-installed",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_installed(self) -> bool {
        !matches!(self, Self::NotInstalled)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ServiceKind {
    /// Background process started with `--fork`, stopped by killing it.
    Detached,
    /// User unit managed through `systemctl --user`.
    Systemd,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Systemd => "systemd",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub bin_path: PathBuf,
    pub args: Vec<String>,
    pub kind: ServiceKind,
}

impl ServiceDescriptor {
    /// Process name as it shows up in the process table.
    pub fn process_name(&self) -> String {
        self.bin_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Lifecycle contract shared by every way of running the server binary.
/// Precondition violations come back as non-zero outcomes.
pub trait ServiceControl {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Replaces the command line used by the next `update`/`start`.
    fn set_args(&mut self, args: Vec<String>);

    fn create(&mut self) -> Outcome;
    fn update(&mut self) -> Outcome;
    fn delete(&mut self) -> Outcome;
    fn start(&mut self) -> Outcome;
    fn stop(&mut self) -> Outcome;
    fn status(&mut self) -> ServiceStatus;
    fn pids(&mut self) -> BTreeSet<Pid>;
}

pub fn build_service(descriptor: ServiceDescriptor) -> Box<dyn ServiceControl> {
    match descriptor.kind {
        ServiceKind::Detached => Box::new(DetachedProcess::new(descriptor)),
        ServiceKind::Systemd => Box::new(SystemdService::new(descriptor)),
    }
}

pub struct DetachedProcess {
    descriptor: ServiceDescriptor,
    inspector: ProcessInspector,
}

impl DetachedProcess {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self::with_inspector(descriptor, ProcessInspector::new())
    }

    pub fn with_inspector(descriptor: ServiceDescriptor, inspector: ProcessInspector) -> Self {
        Self {
            descriptor,
            inspector,
        }
    }
}

impl ServiceControl for DetachedProcess {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn set_args(&mut self, args: Vec<String>) {
        self.descriptor.args = args;
    }

    fn create(&mut self) -> Outcome {
        Outcome::ok("")
    }

    fn update(&mut self) -> Outcome {
        Outcome::ok("")
    }

    fn delete(&mut self) -> Outcome {
        Outcome::ok("")
    }

    fn start(&mut self) -> Outcome {
        let running = self.pids();
        if !running.is_empty() {
            return Outcome::fail(
                1,
                format!(
                    "Process '{}' is already running with pids {:?}",
                    self.descriptor.name, running
                ),
            );
        }

        let mut cmd = Command::new(&self.descriptor.bin_path);
        cmd.args(&self.descriptor.args);
        info!(
            "service-start kind=detached name={} argv={:?}",
            self.descriptor.name, self.descriptor.args
        );
        let result = match crate::run_command(cmd) {
            Ok(result) => result,
            Err(err) => {
                return Outcome::fail(
                    1,
                    format!("failed to launch {}: {err}", self.descriptor.bin_path.display()),
                );
            }
        };

        let outcome = Outcome::from_exec(&result);
        if outcome.success() {
            let pids = self.pids();
            if pids.is_empty() {
                warn!("service-start-no-pids name={}", self.descriptor.name);
            } else {
                debug!("service-start-pids name={} pids={:?}", self.descriptor.name, pids);
            }
        }
        outcome
    }

    fn stop(&mut self) -> Outcome {
        let name = self.descriptor.process_name();
        let pids = self.inspector.list_pids(&name);
        if pids.is_empty() {
            return Outcome::fail(1, format!("Process '{}' is not running", self.descriptor.name));
        }

        let report = self.inspector.kill(pids, true);
        if report.is_complete() {
            Outcome::ok(format!("Process '{}' stopped", self.descriptor.name))
        } else {
            Outcome::fail(
                1,
                format!(
                    "Process '{}' still has live pids {:?} after kill",
                    self.descriptor.name, report.still_alive
                ),
            )
        }
    }

    fn status(&mut self) -> ServiceStatus {
        if self.pids().is_empty() {
            ServiceStatus::Stopped
        } else {
            ServiceStatus::Running
        }
    }

    fn pids(&mut self) -> BTreeSet<Pid> {
        let name = self.descriptor.process_name();
        self.inspector.list_pids(&name)
    }
}

pub struct SystemdService {
    descriptor: ServiceDescriptor,
    unit_dir: PathBuf,
    systemctl: PathBuf,
    inspector: ProcessInspector,
}

impl SystemdService {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self::with_paths(descriptor, default_unit_dir(), PathBuf::from("systemctl"))
    }

    pub fn with_paths(descriptor: ServiceDescriptor, unit_dir: PathBuf, systemctl: PathBuf) -> Self {
        Self {
            descriptor,
            unit_dir,
            systemctl,
            inspector: ProcessInspector::new(),
        }
    }

    pub fn unit_name(&self) -> String {
        format!("{}.service", self.descriptor.name)
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(self.unit_name())
    }

    fn systemctl_user(&self, args: &[&str]) -> Outcome {
        let mut cmd = Command::new(&self.systemctl);
        cmd.arg("--user").args(args);
        match crate::run_command(cmd) {
            Ok(result) => Outcome::from_exec(&result),
            Err(err) => Outcome::fail(1, format!("systemctl spawn failed: {err}")),
        }
    }

    fn write_unit(&self) -> Outcome {
        if let Err(err) = fs::create_dir_all(&self.unit_dir) {
            return Outcome::fail(1, format!("create {}: {err}", self.unit_dir.display()));
        }
        let path = self.unit_path();
        if let Err(err) = fs::write(&path, render_unit(&self.descriptor)) {
            return Outcome::fail(1, format!("write {}: {err}", path.display()));
        }
        self.systemctl_user(&["daemon-reload"])
    }
}

impl ServiceControl for SystemdService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn set_args(&mut self, args: Vec<String>) {
        self.descriptor.args = args;
    }

    fn create(&mut self) -> Outcome {
        let status = self.status();
        if status.is_installed() {
            return Outcome::fail(
                1,
                format!(
                    "Service '{}' already installed, status: {}",
                    self.descriptor.name,
                    status.as_str()
                ),
            );
        }
        info!("service-create kind=systemd unit={}", self.unit_name());
        self.write_unit()
    }

    fn update(&mut self) -> Outcome {
        let status = self.status();
        if !status.is_installed() {
            return Outcome::fail(
                1,
                format!("Service update '{}' status: {}", self.descriptor.name, status.as_str()),
            );
        }
        self.write_unit()
    }

    fn delete(&mut self) -> Outcome {
        let status = self.status();
        if !status.is_installed() {
            return Outcome::fail(
                1,
                format!("Service delete '{}' status: {}", self.descriptor.name, status.as_str()),
            );
        }
        let unit = self.unit_name();
        if status == ServiceStatus::Running {
            let stopped = self.systemctl_user(&["stop", &unit]);
            if !stopped.success() {
                warn!("service-delete-stop-failed unit={unit} output={}", stopped.output);
            }
        }
        let path = self.unit_path();
        if let Err(err) = fs::remove_file(&path) {
            return Outcome::fail(1, format!("remove {}: {err}", path.display()));
        }
        self.systemctl_user(&["daemon-reload"])
    }

    fn start(&mut self) -> Outcome {
        let status = self.status();
        if !status.is_installed() || status == ServiceStatus::Running {
            return Outcome::fail(
                1,
                format!("Service start '{}' status: {}", self.descriptor.name, status.as_str()),
            );
        }
        let unit = self.unit_name();
        info!("service-start kind=systemd unit={unit}");
        let outcome = self.systemctl_user(&["start", &unit]);
        if outcome.success() {
            debug!("service-start-pids unit={unit} pids={:?}", self.pids());
        }
        outcome
    }

    fn stop(&mut self) -> Outcome {
        let status = self.status();
        if !status.is_installed() || status == ServiceStatus::Stopped {
            return Outcome::fail(
                1,
                format!("Service stop '{}' status: {}", self.descriptor.name, status.as_str()),
            );
        }
        let unit = self.unit_name();
        info!("service-stop kind=systemd unit={unit}");
        self.systemctl_user(&["stop", &unit])
    }

    fn status(&mut self) -> ServiceStatus {
        let unit = self.unit_name();
        let outcome = self.systemctl_user(&[
            "show",
            &unit,
            "--property=LoadState,ActiveState,FreezerState",
        ]);
        if !outcome.success() {
            debug!("service-status-failed unit={unit} output={}", outcome.output);
            return ServiceStatus::Unknown;
        }
        parse_systemd_status(&outcome.output)
    }

    fn pids(&mut self) -> BTreeSet<Pid> {
        let name = self.descriptor.process_name();
        self.inspector.list_pids(&name)
    }
}

fn default_unit_dir() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|dir| !dir.is_empty()) {
        return Path::new(&dir).join("systemd/user");
    }
    let home = env::var_os("HOME").unwrap_or_default();
    Path::new(&home).join(".config/systemd/user")
}

/// Maps `systemctl show` `Key=Value` output onto a status.
pub fn parse_systemd_status(output: &str) -> ServiceStatus {
    let props: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .collect();

    match props.get("LoadState").copied() {
        Some("not-found") => return ServiceStatus::NotInstalled,
        Some("loaded") => {}
        _ => return ServiceStatus::Unknown,
    }
    if matches!(props.get("FreezerState").copied(), Some("frozen" | "freezing")) {
        return ServiceStatus::Paused;
    }
    match props.get("ActiveState").copied() {
        Some("active") | Some("reloading") => ServiceStatus::Running,
        Some("activating") => ServiceStatus::Starting,
        Some("deactivating") => ServiceStatus::Stopping,
        Some("inactive") | Some("failed") => ServiceStatus::Stopped,
        _ => ServiceStatus::Unknown,
    }
}

pub fn render_unit(descriptor: &ServiceDescriptor) -> String {
    let mut exec = vec![systemd_quote(&descriptor.bin_path.to_string_lossy())];
    exec.extend(descriptor.args.iter().map(|arg| systemd_quote(arg)));
    format!(
        "[Unit]\nDescription=powercycle managed server {name}\n\n[Service]\nType=simple\nExecStart={exec}\nRestart=no\nTimeoutStopSec=120\n\n[Install]\nWantedBy=default.target\n",
        name = descriptor.name,
        exec = exec.join(" "),
    )
}

fn systemd_quote(raw: &str) -> String {
    let escaped = raw.replace('%', "%%").replace('$', "$$");
    if escaped.is_empty() || escaped.chars().any(|ch| ch.is_whitespace() || matches!(ch, '"' | '\'' | '\\')) {
        format!("\"{}\"", escaped.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        escaped
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn descriptor(kind: ServiceKind) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "mongod-powercycle-test".into(),
            bin_path: PathBuf::from("/opt/db/bin/mongod"),
            args: vec!["--dbpath".into(), "/data/my db".into(), "--port".into(), "27017".into()],
            kind,
        }
    }

    const FAKE_SYSTEMCTL: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "$@" >> "$dir/systemctl.log"
state="$dir/state"
case "$2" in
  show)
    if [ -f "$state" ]; then cat "$state"; else printf 'LoadState=not-found\nActiveState=inactive\nFreezerState=running\n'; fi ;;
  daemon-reload)
    if ls "$dir"/units/*.service >/dev/null 2>&1; then
      [ -f "$state" ] || printf 'LoadState=loaded\nActiveState=inactive\nFreezerState=running\n' > "$state"
    else
      rm -f "$state"
    fi ;;
  start)
    printf 'LoadState=loaded\nActiveState=active\nFreezerState=running\n' > "$state" ;;
  stop)
    printf 'LoadState=loaded\nActiveState=inactive\nFreezerState=running\n' > "$state" ;;
esac
exit 0
"#;

    fn fake_systemctl() -> (TempDir, SystemdService) {
        let dir = tempfile::Builder::new()
            .prefix(".systemctl-test-")
            .tempdir_in(env!("CARGO_MANIFEST_DIR"))
            .unwrap();
        let program = dir.path().join("systemctl");
        fs::write(&program, FAKE_SYSTEMCTL).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        let service = SystemdService::with_paths(
            descriptor(ServiceKind::Systemd),
            dir.path().join("units"),
            program,
        );
        (dir, service)
    }

    #[test]
    fn parses_manager_states() {
        assert_eq!(
            parse_systemd_status("LoadState=not-found\nActiveState=inactive\n"),
            ServiceStatus::NotInstalled
        );
        assert_eq!(
            parse_systemd_status("LoadState=loaded\nActiveState=active\nFreezerState=running\n"),
            ServiceStatus::Running
        );
        assert_eq!(
            parse_systemd_status("LoadState=loaded\nActiveState=active\nFreezerState=frozen\n"),
            ServiceStatus::Paused
        );
        assert_eq!(
            parse_systemd_status("LoadState=loaded\nActiveState=activating\n"),
            ServiceStatus::Starting
        );
        assert_eq!(
            parse_systemd_status("LoadState=loaded\nActiveState=deactivating\n"),
            ServiceStatus::Stopping
        );
        assert_eq!(
            parse_systemd_status("LoadState=loaded\nActiveState=failed\n"),
            ServiceStatus::Stopped
        );
        assert_eq!(parse_systemd_status(""), ServiceStatus::Unknown);
    }

    #[test]
    fn unit_file_quotes_arguments() {
        let unit = render_unit(&descriptor(ServiceKind::Systemd));
        assert!(unit.contains("ExecStart=/opt/db/bin/mongod --dbpath \"/data/my db\" --port 27017\n"));
        assert!(unit.contains("Restart=no"));
        assert_eq!(systemd_quote("100%"), "100%%");
        assert_eq!(systemd_quote("$HOME"), "$$HOME");
    }

    #[test]
    fn systemd_lifecycle_enforces_preconditions() {
        let (dir, mut service) = fake_systemctl();

        assert_eq!(service.status(), ServiceStatus::NotInstalled);
        assert_eq!(service.start().code, 1);
        assert_eq!(service.stop().code, 1);
        assert_eq!(service.update().code, 1);
        assert_eq!(service.delete().code, 1);

        assert!(service.create().success());
        assert!(service.unit_path().is_file());
        assert_eq!(service.status(), ServiceStatus::Stopped);
        let again = service.create();
        assert_eq!(again.code, 1);
        assert!(again.output.contains("already installed"));

        assert_eq!(service.stop().code, 1);
        assert!(service.start().success());
        assert_eq!(service.status(), ServiceStatus::Running);
        assert_eq!(service.start().code, 1);
        assert!(service.stop().success());
        assert_eq!(service.status(), ServiceStatus::Stopped);

        assert!(service.delete().success());
        assert!(!service.unit_path().exists());
        assert_eq!(service.status(), ServiceStatus::NotInstalled);

        let log = fs::read_to_string(dir.path().join("systemctl.log")).unwrap();
        assert!(log.lines().all(|line| line.starts_with("--user ")));
        assert!(log.contains("--user start mongod-powercycle-test.service"));
        assert!(log.contains("--user daemon-reload"));
    }

    #[test]
    fn detached_registration_is_a_no_op() {
        let mut service = DetachedProcess::new(ServiceDescriptor {
            bin_path: PathBuf::from("/nonexistent/pc-never-runs"),
            ..descriptor(ServiceKind::Detached)
        });
        assert!(service.create().success());
        assert!(service.update().success());
        assert!(service.delete().success());
        assert_eq!(service.status(), ServiceStatus::Stopped);

        let stopped = service.stop();
        assert_eq!(stopped.code, 1);
        assert!(stopped.output.contains("not running"));

        let started = service.start();
        assert_eq!(started.code, 1);
        assert!(started.output.contains("failed to launch"));
    }
}
