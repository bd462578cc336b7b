use crate::Outcome;
use crate::config::{Location, LoopSettings};
use crate::crash::{CrashContext, CrashInjector};
use crate::db_client::{CanaryDocument, DatabaseClient};
use crate::host_backend::Endpoint;
use crate::journal::RunJournal;
use crate::process_inspector::ProcessInspector;
use crate::remote_channel::RemoteChannel;
use crate::remote_ops::{Operation, RemoteContext, RemoteRequest};
use crate::temp_registry::TempScope;
use crate::workload::{ClientKind, LoadLauncher, LoadSet};
use rand::Rng;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    RecoveryStart,
    RecoveryValidate,
    RecoveryShutdown,
    StandardStart,
    LoadRunning,
    Crashing,
    Cooldown,
    Terminated,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RecoveryStart => "recovery-start",
            Self::RecoveryValidate => "recovery-validate",
            Self::RecoveryShutdown => "recovery-shutdown",
            Self::StandardStart => "standard-start",
            Self::LoadRunning => "load-running",
            Self::Crashing => "crashing",
            Self::Cooldown => "cooldown",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step that ended the run. `code` becomes the process exit code.
#[derive(Debug, Clone, Error)]
#[error("{phase} failed (exit {code}): {message}")]
pub struct LoopError {
    pub phase: Phase,
    pub code: i32,
    pub message: String,
}

impl LoopError {
    fn new(phase: Phase, code: i32, message: impl Into<String>) -> Self {
        Self {
            phase,
            code: if code == 0 { 1 } else { code },
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        "loop-step-failed"
    }
}

#[derive(Clone, Debug)]
pub struct LoopState {
    pub iteration: u64,
    pub started: Instant,
    pub elapsed: Duration,
    /// Written before the last crash, checked after the next recovery.
    pub canary: Option<CanaryDocument>,
    pub port: u16,
    pub endpoint: Endpoint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub elapsed: Duration,
}

/// Opens a controller-side client for `host:port`.
pub type DbConnector = Box<dyn Fn(&str, u16) -> Box<dyn DatabaseClient>>;

pub struct PowerCycle {
    settings: LoopSettings,
    channel: Box<dyn RemoteChannel>,
    injector: Box<dyn CrashInjector>,
    launcher: Option<Box<dyn LoadLauncher>>,
    connect_db: DbConnector,
    inspector: ProcessInspector,
    journal: Option<RunJournal>,
    state: LoopState,
    phase: Phase,
}

impl PowerCycle {
    pub fn new(
        settings: LoopSettings,
        channel: Box<dyn RemoteChannel>,
        injector: Box<dyn CrashInjector>,
        launcher: Option<Box<dyn LoadLauncher>>,
        connect_db: DbConnector,
    ) -> Self {
        let state = LoopState {
            iteration: 0,
            started: Instant::now(),
            elapsed: Duration::ZERO,
            canary: None,
            port: settings.recovery_port,
            endpoint: channel.endpoint().clone(),
        };
        Self {
            settings,
            channel,
            injector,
            launcher,
            connect_db,
            inspector: ProcessInspector::new(),
            journal: None,
            state,
            phase: Phase::Idle,
        }
    }

    pub fn with_journal(mut self, journal: Option<RunJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run(&mut self) -> Result<RunSummary, LoopError> {
        self.state.started = Instant::now();
        let method = self.injector.method().as_str();
        let target = self.state.endpoint.to_string();
        let loops = self.settings.budget.loops;
        self.journal_write(|journal| journal.begin(method, &target, loops));

        let result = self.run_loop();
        self.state.elapsed = self.state.started.elapsed();
        self.phase = Phase::Terminated;

        let (code, iterations) = match &result {
            Ok(summary) => (0, summary.iterations),
            Err(err) => (err.code, self.state.iteration),
        };
        self.journal_write(|journal| journal.finish(code, iterations));
        result
    }

    fn run_loop(&mut self) -> Result<RunSummary, LoopError> {
        self.enter(Phase::Idle);
        let bootstrap = self.channel.bootstrap();
        self.check(bootstrap)?;
        self.send(self.settings.recovery_port, vec![Operation::Install], false)?;

        loop {
            self.state.iteration += 1;
            info!(
                "loop-start iteration={} elapsed_secs={}",
                self.state.iteration,
                self.state.started.elapsed().as_secs()
            );

            self.recovery_start()?;
            self.recovery_validate()?;
            self.recovery_shutdown()?;
            self.standard_start()?;

            let mut scope = TempScope::new("iteration");
            let mut load = LoadSet::new();
            let crashed = self
                .launch_load(&mut load, &mut scope)
                .and_then(|()| self.crash());
            self.enter(Phase::Cooldown);
            let report = load.terminate(&mut self.inspector, self.settings.client_timeout);
            if report.exited + report.forced > 0 {
                info!("clients-terminated exited={} forced={}", report.exited, report.forced);
            }
            scope.release_all();
            crashed?;
            self.restore()?;

            self.state.elapsed = self.state.started.elapsed();
            info!(
                "loop-done iteration={} elapsed_secs={}",
                self.state.iteration,
                self.state.elapsed.as_secs()
            );
            if self.settings.budget.exhausted(self.state.iteration, self.state.elapsed) {
                return Ok(RunSummary {
                    iterations: self.state.iteration,
                    elapsed: self.state.elapsed,
                });
            }
        }
    }

    fn recovery_start(&mut self) -> Result<(), LoopError> {
        self.enter(Phase::RecoveryStart);
        let first = self.state.iteration == 1;
        let mut ops = Vec::new();
        if let Some(backups) = &self.settings.backups {
            ops.push(Operation::CopyData {
                dest: backups.before.clone(),
            });
        }
        ops.push(Operation::Start);
        if first {
            if let Some(version) = &self.settings.compat_version {
                ops.push(Operation::SetCompatVersion {
                    version: version.clone(),
                });
            }
        }
        if self.settings.validate == Some(Location::Remote) {
            ops.push(Operation::ValidateCollections);
        }
        if self.settings.canary.is_some() {
            if let Some(doc) = &self.state.canary {
                ops.push(Operation::ValidateCanary { doc: doc.clone() });
            }
        }
        if first && self.settings.seed_doc_num > 0 {
            ops.push(Operation::SeedDocuments {
                count: self.settings.seed_doc_num,
            });
        }
        self.send(self.settings.recovery_port, ops, false).map(|_| ())
    }

    fn recovery_validate(&mut self) -> Result<(), LoopError> {
        if self.settings.validate != Some(Location::Local) {
            return Ok(());
        }
        self.enter(Phase::RecoveryValidate);
        let db = (self.connect_db)(&self.state.endpoint.host, self.settings.recovery_port);
        let report = db
            .validate_collections()
            .map_err(|err| LoopError::new(self.phase, 1, format!("{} ({})", err, err.kind())))?;
        let busy = report.busy();
        if !busy.is_empty() {
            warn!("validate-busy endpoint={} collections={busy:?}", db.endpoint());
        }
        let invalid = report.invalid();
        if !invalid.is_empty() {
            let message = format!("Collection validation failed for {invalid:?}");
            self.journal_event(1, &message);
            return Err(LoopError::new(self.phase, 1, message));
        }
        self.journal_event(0, &format!("{} collections checked", report.collections.len()));
        Ok(())
    }

    fn recovery_shutdown(&mut self) -> Result<(), LoopError> {
        self.enter(Phase::RecoveryShutdown);
        self.send(self.settings.recovery_port, vec![Operation::Shutdown], false)
            .map(|_| ())
    }

    fn standard_start(&mut self) -> Result<(), LoopError> {
        self.enter(Phase::StandardStart);
        let mut ops = Vec::new();
        if let Some(backups) = &self.settings.backups {
            ops.push(Operation::CopyData {
                dest: backups.after.clone(),
            });
        }
        ops.push(Operation::Start);
        let replica_set = self.settings.remote.repl_set.is_some();
        self.send(self.settings.standard_port, ops, replica_set).map(|_| ())
    }

    fn launch_load(&mut self, load: &mut LoadSet, scope: &mut TempScope) -> Result<(), LoopError> {
        self.enter(Phase::LoadRunning);
        let Some(launcher) = &self.launcher else {
            return Ok(());
        };
        let host = self.state.endpoint.host.clone();
        let port = self.settings.standard_port;
        let plan = [
            (ClientKind::Crud, self.settings.crud_clients),
            (ClientKind::Fsm, self.settings.fsm_clients),
        ];
        for (kind, count) in plan {
            for index in 0..count {
                let handle = launcher
                    .launch(kind, index, &host, port, scope)
                    .map_err(|err| LoopError::new(Phase::LoadRunning, 1, err.to_string()))?;
                load.push(handle);
            }
            if count > 0 {
                info!("clients-started kind={} count={count} launcher={}", kind.as_str(), launcher.kind());
            }
        }
        Ok(())
    }

    fn crash(&mut self) -> Result<(), LoopError> {
        let wait = self.crash_wait();
        info!("crash-wait secs={}", wait.as_secs());
        thread::sleep(wait);

        self.enter(Phase::Crashing);
        self.state.port = self.settings.standard_port;
        let canary = self.settings.canary.map(|_| CanaryDocument::timestamped());
        if self.settings.canary == Some(Location::Local) {
            if let Some(doc) = &canary {
                let db = (self.connect_db)(&self.state.endpoint.host, self.settings.standard_port);
                db.insert_canary(
                    &self.settings.remote.db_name,
                    &self.settings.remote.collection_name,
                    doc,
                )
                .map_err(|err| LoopError::new(Phase::Crashing, 1, format!("insert canary: {err} ({})", err.kind())))?;
                info!("canary-inserted doc={doc} endpoint={}", db.endpoint());
            }
        }

        let ctx = CrashContext {
            remote: self.context(self.settings.standard_port, self.settings.remote.repl_set.is_some()),
            remote_canary: canary
                .clone()
                .filter(|_| self.settings.canary == Some(Location::Remote)),
        };
        let outcome = self
            .injector
            .crash(self.channel.as_mut(), &ctx)
            .map_err(|err| LoopError::new(Phase::Crashing, 1, format!("{err} ({})", err.kind())))?;
        self.journal_event(outcome.code, &outcome.output);
        if !outcome.success() && !self.injector.expects_disconnect() {
            return Err(LoopError::new(
                Phase::Crashing,
                outcome.code,
                format!("Crash did not succeed: {}", outcome.output.trim()),
            ));
        }
        info!(
            "crash-issued method={} exit={}",
            self.injector.method().as_str(),
            outcome.code
        );
        self.state.canary = canary;

        thread::sleep(self.settings.settle);
        Ok(())
    }

    fn restore(&mut self) -> Result<(), LoopError> {
        let restored = self
            .injector
            .restore()
            .map_err(|err| LoopError::new(Phase::Cooldown, 1, format!("{err} ({})", err.kind())))?;
        if let Some(host) = restored {
            self.channel
                .retarget(&host)
                .map_err(|err| LoopError::new(Phase::Cooldown, 1, format!("{err} ({})", err.kind())))?;
            self.state.endpoint = self.channel.endpoint().clone();
            info!("endpoint-refreshed target={}", self.state.endpoint);
            self.journal_event(0, &format!("endpoint {}", self.state.endpoint));
        }
        Ok(())
    }

    fn crash_wait(&self) -> Duration {
        let jitter = self.settings.crash_jitter.as_secs();
        let extra = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter)
        };
        self.settings.crash_wait + Duration::from_secs(extra)
    }

    fn context(&self, port: u16, use_replica_set: bool) -> RemoteContext {
        RemoteContext {
            use_replica_set,
            ..self.settings.remote.with_port(port)
        }
    }

    fn send(&mut self, port: u16, ops: Vec<Operation>, use_replica_set: bool) -> Result<Outcome, LoopError> {
        self.state.port = port;
        let request = RemoteRequest::new(self.context(port, use_replica_set), ops);
        let outcome = self.channel.send(&request);
        info!(
            "remote-step phase={} ops=\"{}\" port={port} exit={}",
            self.phase,
            request.describe(),
            outcome.code
        );
        self.check(outcome)
    }

    fn check(&mut self, outcome: Outcome) -> Result<Outcome, LoopError> {
        self.journal_event(outcome.code, &outcome.output);
        if outcome.success() {
            Ok(outcome)
        } else {
            Err(LoopError::new(self.phase, outcome.code, outcome.output.trim()))
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        debug!("loop-phase iteration={} phase={phase}", self.state.iteration);
    }

    fn journal_event(&self, code: i32, output: &str) {
        let (iteration, phase) = (self.state.iteration, self.phase.as_str());
        self.journal_write(|journal| journal.record(iteration, phase, code, output));
    }

    fn journal_write<F>(&self, write: F)
    where
        F: FnOnce(&RunJournal) -> Result<(), crate::journal::JournalError>,
    {
        if let Some(journal) = &self.journal {
            if let Err(err) = write(journal) {
                warn!("journal-write-failed kind={} err={err}", err.kind());
            }
        }
    }
}
