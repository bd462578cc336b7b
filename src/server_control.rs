use crate::Outcome;
use crate::process_inspector::Pid;
use crate::server_options::{ServerFlag, ServerOptions};
use crate::service::{ServiceControl, ServiceDescriptor, ServiceKind, ServiceStatus, build_service};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = "mongod.lock";
pub const SERVICE_NAME: &str = "mongod-powercycle";
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);
pub const SHUTDOWN_POLL: Duration = Duration::from_secs(3);

#[cfg(windows)]
const SERVER_BINARY: &str = "mongod.exe";
#[cfg(not(windows))]
const SERVER_BINARY: &str = "mongod";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerLayout {
    pub root_dir: PathBuf,
    pub bin_dir: Option<PathBuf>,
    pub db_path: PathBuf,
    pub log_path: PathBuf,
}

/// Owns the single service descriptor for one port of the target binary.
pub struct ServerControl {
    layout: ServerLayout,
    port: u16,
    options: ServerOptions,
    kind: ServiceKind,
    service: Option<Box<dyn ServiceControl>>,
}

impl ServerControl {
    pub fn new(
        layout: ServerLayout,
        port: u16,
        user_options: &ServerOptions,
        repl_set: Option<&str>,
        kind: ServiceKind,
    ) -> Self {
        let options = user_options.merged(&required_options(&layout, port, repl_set, kind));
        let mut control = Self {
            layout,
            port,
            options,
            kind,
            service: None,
        };
        control.attach_service();
        control
    }

    /// Uses a caller-supplied service instead of resolving one from the
    /// installed binary.
    pub fn with_service(layout: ServerLayout, port: u16, service: Box<dyn ServiceControl>) -> Self {
        let kind = service.descriptor().kind;
        Self {
            options: required_options(&layout, port, None, kind),
            layout,
            port,
            kind,
            service: Some(service),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn layout(&self) -> &ServerLayout {
        &self.layout
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn bin_dir(&self) -> Option<PathBuf> {
        find_bin_dir(&self.layout.root_dir)
    }

    fn attach_service(&mut self) {
        if self.service.is_some() {
            return;
        }
        let Some(bin_dir) = self.bin_dir() else {
            return;
        };
        self.service = Some(build_service(ServiceDescriptor {
            name: SERVICE_NAME.to_string(),
            bin_path: bin_dir.join(SERVER_BINARY),
            args: self.options.to_args(),
            kind: self.kind,
        }));
    }

    fn service_mut(&mut self) -> Result<&mut Box<dyn ServiceControl>, Outcome> {
        self.attach_service();
        let root = self.layout.root_dir.display().to_string();
        self.service
            .as_mut()
            .ok_or_else(|| Outcome::fail(1, format!("No bin dir can be found under {root}")))
    }

    /// Links or locates the binary dir, creates the data and log directories
    /// and registers the service.
    pub fn install(&mut self) -> Outcome {
        let root = self.layout.root_dir.clone();
        if root.is_dir() {
            warn!("install-root-exists root={}", root.display());
        } else if let Err(err) = fs::create_dir_all(&root) {
            return Outcome::fail(1, format!("create {}: {err}", root.display()));
        }

        if let Some(bin_dir) = self.layout.bin_dir.clone() {
            let link = root.join("bin");
            if bin_dir.is_dir() && fs::symlink_metadata(&link).is_err() {
                if let Err(err) = link_dir(&bin_dir, &link) {
                    return Outcome::fail(1, format!("link {} -> {}: {err}", link.display(), bin_dir.display()));
                }
                info!("install-link-bin link={} target={}", link.display(), bin_dir.display());
            }
        }

        for dir in [Some(self.layout.db_path.as_path()), self.layout.log_path.parent()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = fs::create_dir_all(dir) {
                return Outcome::fail(1, format!("create {}: {err}", dir.display()));
            }
        }

        let kind = self.kind;
        let service = match self.service_mut() {
            Ok(service) => service,
            Err(outcome) => return outcome,
        };
        let status = service.status();
        if status.is_installed() && kind == ServiceKind::Systemd {
            debug!("install-service-present status={}", status.as_str());
            return service.update();
        }
        service.create()
    }

    pub fn start(&mut self) -> Outcome {
        let args = self.options.to_args();
        let port = self.port;
        let service = match self.service_mut() {
            Ok(service) => service,
            Err(outcome) => return outcome,
        };
        service.set_args(args);
        let updated = service.update();
        if !updated.success() {
            return updated;
        }
        info!("server-start port={port}");
        service.start()
    }

    /// Stops the service. A killed server leaves its lock file behind, so
    /// callers that need a clean data directory shut down through the
    /// database first and then call [`wait_for_shutdown`].
    pub fn stop(&mut self) -> Outcome {
        let port = self.port;
        let service = match self.service_mut() {
            Ok(service) => service,
            Err(outcome) => return outcome,
        };
        info!("server-stop port={port}");
        service.stop()
    }

    pub fn pids(&mut self) -> BTreeSet<Pid> {
        match self.service_mut() {
            Ok(service) => service.pids(),
            Err(_) => BTreeSet::new(),
        }
    }

    pub fn status(&mut self) -> ServiceStatus {
        match self.service_mut() {
            Ok(service) => service.status(),
            Err(_) => ServiceStatus::NotInstalled,
        }
    }
}

fn required_options(layout: &ServerLayout, port: u16, repl_set: Option<&str>, kind: ServiceKind) -> ServerOptions {
    let mut required = ServerOptions::new();
    required.set(ServerFlag::DbPath, Some(layout.db_path.to_string_lossy()));
    required.set(ServerFlag::LogPath, Some(layout.log_path.to_string_lossy()));
    required.set(ServerFlag::LogAppend, None::<String>);
    required.set(ServerFlag::Port, Some(port.to_string()));
    required.set(ServerFlag::BindIp, Some("0.0.0.0"));
    if kind == ServiceKind::Detached {
        required.set(ServerFlag::Fork, None::<String>);
    }
    if let Some(name) = repl_set {
        required.set(ServerFlag::ReplSet, Some(name));
    }
    required
}

#[cfg(unix)]
fn link_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn link_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// First directory named `bin` found breadth-first under `root`.
pub fn find_bin_dir(root: &Path) -> Option<PathBuf> {
    let mut queue = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let candidate = dir.join("bin");
        if candidate.is_dir() {
            return Some(candidate);
        }
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut subdirs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        subdirs.sort();
        queue.extend(subdirs);
    }
    None
}

/// A present, non-empty lock file means the server still holds `db_path`.
pub fn lock_file_held(db_path: &Path) -> bool {
    fs::metadata(db_path.join(LOCK_FILE_NAME)).is_ok_and(|meta| meta.len() > 0)
}

pub fn wait_for_shutdown(db_path: &Path, timeout: Duration, poll: Duration) -> Outcome {
    let started = Instant::now();
    loop {
        if !lock_file_held(db_path) {
            debug!(
                "lock-file-released db_path={} waited_ms={}",
                db_path.display(),
                started.elapsed().as_millis()
            );
            return Outcome::ok("");
        }
        if started.elapsed() >= timeout {
            return Outcome::fail(
                1,
                format!(
                    "Lock file {} still held after {}s",
                    db_path.join(LOCK_FILE_NAME).display(),
                    timeout.as_secs()
                ),
            );
        }
        thread::sleep(poll);
    }
}
