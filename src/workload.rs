use crate::process_inspector::{Pid, ProcessInspector};
use crate::temp_registry::TempScope;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

pub const CLIENT_REPEAT: u32 = 100;
pub const CRUD_TEST: &str = "jstests/hooks/crud_client.js";
pub const FSM_TEST: &str = "jstests/libs/fsm_serial_client.js";
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error)]
#[error("{code}: {meta}")]
pub struct LaunchError {
    pub code: &'static str,
    pub meta: Value,
}

impl LaunchError {
    fn new(code: &'static str, meta: Value) -> Self {
        Self { code, meta }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientKind {
    Crud,
    Fsm,
}

impl ClientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crud => "crud",
            Self::Fsm => "fsm",
        }
    }

    pub fn test_file(self) -> &'static str {
        match self {
            Self::Crud => CRUD_TEST,
            Self::Fsm => FSM_TEST,
        }
    }
}

/// A running load client. Only liveness is tracked.
#[derive(Debug)]
pub struct ClientHandle {
    pub kind: ClientKind,
    pub index: usize,
    pub log_path: PathBuf,
    child: Child,
}

impl ClientHandle {
    pub fn new(kind: ClientKind, index: usize, log_path: PathBuf, child: Child) -> Self {
        Self {
            kind,
            index,
            log_path,
            child,
        }
    }

    pub fn pid(&self) -> Pid {
        self.child.id()
    }
}

pub trait LoadLauncher {
    fn kind(&self) -> &'static str;

    /// Starts one client against `mongodb://host:port` and returns without
    /// waiting for it.
    fn launch(
        &self,
        client: ClientKind,
        index: usize,
        host: &str,
        port: u16,
        scope: &mut TempScope,
    ) -> Result<ClientHandle, LaunchError>;
}

#[derive(Clone, Debug)]
pub struct ResmokeSettings {
    pub repo_root: PathBuf,
    pub python: String,
    pub mongo_path: PathBuf,
    pub suite: PathBuf,
    pub log_dir: PathBuf,
    pub script_dir: PathBuf,
    pub repeat: u32,
    pub db_name: String,
    pub collection_name: String,
    pub read_concern_level: Option<String>,
    /// JSON document.
    pub write_concern: Option<String>,
}

/// Runs each client as `resmoke.py` through a generated wrapper script.
pub struct ResmokeLauncher {
    settings: ResmokeSettings,
}

impl ResmokeLauncher {
    pub fn new(settings: ResmokeSettings) -> Self {
        Self { settings }
    }

    /// resmoke invocation for client `index`. CRUD clients each get their
    /// own collection and FSM clients their own database prefix.
    pub fn client_args(&self, client: ClientKind, index: usize, conn: &Url) -> Vec<String> {
        let s = &self.settings;
        let mut args = vec![
            s.python.clone(),
            "buildscripts/resmoke.py".to_string(),
            "run".to_string(),
            format!("--mongo={}", s.mongo_path.to_string_lossy()),
            format!("--suites={}", s.suite.to_string_lossy()),
            format!("--shellConnString={conn}"),
            "--continueOnFailure".to_string(),
            format!("--repeat={}", s.repeat),
        ];
        match client {
            ClientKind::Crud => {
                args.push(format!("--dbName={}", s.db_name));
                args.push(format!("--collectionName={}-{index}", s.collection_name));
            }
            ClientKind::Fsm => {
                args.push(format!("--dbNamePrefix=fsm-{index}"));
                args.push(format!("--fsmDbBlacklist={}", s.db_name));
            }
        }
        if let Some(level) = &s.read_concern_level {
            args.push(format!("--readConcernLevel={level}"));
        }
        if let Some(concern) = &s.write_concern {
            args.push(format!("--writeConcern={concern}"));
        }
        args.push(client.test_file().to_string());
        args
    }

    pub fn script(&self, client: ClientKind, index: usize, conn: &Url, log_path: &Path) -> String {
        format!(
            "#!/bin/bash\ncd {} && exec {} >> {} 2>&1\n",
            shell_words::quote(&self.settings.repo_root.to_string_lossy()),
            shell_words::join(self.client_args(client, index, conn)),
            shell_words::quote(&log_path.to_string_lossy()),
        )
    }
}

pub fn connection_string(host: &str, port: u16) -> Result<Url, LaunchError> {
    let raw = format!("mongodb://{host}:{port}");
    Url::parse(&raw).map_err(|e| {
        LaunchError::new(
            "connection-string-invalid",
            json!({ "error": e.to_string(), "url": raw }),
        )
    })
}

impl LoadLauncher for ResmokeLauncher {
    fn kind(&self) -> &'static str {
        "resmoke"
    }

    fn launch(
        &self,
        client: ClientKind,
        index: usize,
        host: &str,
        port: u16,
        scope: &mut TempScope,
    ) -> Result<ClientHandle, LaunchError> {
        let conn = connection_string(host, port)?;
        let log_path = self
            .settings
            .log_dir
            .join(format!("{}-client-{index}.log", client.as_str()));
        let contents = self.script(client, index, &conn, &log_path);
        let script = scope
            .create_script(&self.settings.script_dir, ".sh", &contents)
            .map_err(|e| {
                LaunchError::new(
                    "client-script-write-failed",
                    json!({ "error": e.to_string(), "dir": self.settings.script_dir }),
                )
            })?;

        let child = spawn_script(&script).map_err(|e| {
            LaunchError::new(
                "client-spawn-failed",
                json!({ "error": e.to_string(), "script": script, "client": client.as_str() }),
            )
        })?;
        info!(
            "client-launched kind={} index={index} pid={} conn={} log={}",
            client.as_str(),
            child.id(),
            conn,
            log_path.display()
        );
        Ok(ClientHandle::new(client, index, log_path, child))
    }
}

/// Freshly written scripts can briefly report ETXTBSY while another thread
/// forks.
fn spawn_script(script: &Path) -> std::io::Result<Child> {
    let mut attempts = 0;
    loop {
        let spawned = Command::new(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            #[cfg(unix)]
            Err(err) if err.raw_os_error() == Some(libc::ETXTBSY) && attempts < 10 => {
                attempts += 1;
                thread::sleep(Duration::from_millis(20));
            }
            other => return other,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminateReport {
    pub exited: usize,
    pub forced: usize,
}

/// Load clients of one iteration.
#[derive(Debug, Default)]
pub struct LoadSet {
    handles: Vec<ClientHandle>,
}

impl LoadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ClientHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.handles.iter().map(ClientHandle::pid).collect()
    }

    /// Kills every client with its children, waits up to `timeout` for each
    /// to exit, then force kills the stragglers.
    pub fn terminate(&mut self, inspector: &mut ProcessInspector, timeout: Duration) -> TerminateReport {
        let mut report = TerminateReport::default();
        for mut handle in self.handles.drain(..) {
            let pid = handle.pid();
            let kill = inspector.kill([pid], true);
            if !kill.is_complete() {
                warn!(
                    "client-kill-incomplete kind={} pid={pid} still_alive={:?}",
                    handle.kind.as_str(),
                    kill.still_alive
                );
            }

            if join_with_timeout(&mut handle.child, timeout) {
                report.exited += 1;
                continue;
            }
            warn!(
                "client-force-kill kind={} index={} pid={pid}",
                handle.kind.as_str(),
                handle.index
            );
            if let Err(err) = handle.child.kill() {
                warn!("client-force-kill-failed pid={pid} err={err}");
            }
            if let Err(err) = handle.child.wait() {
                warn!("client-reap-failed pid={pid} err={err}");
            }
            report.forced += 1;
        }
        report
    }
}

fn join_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Ok(None) => return false,
            Err(err) => {
                warn!("client-wait-failed pid={} err={err}", child.id());
                return false;
            }
        }
    }
}
