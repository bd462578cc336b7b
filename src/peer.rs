use crate::Outcome;
use crate::db_client::{DatabaseClient, MongoShellClient};
use crate::remote_ops::{Operation, RemoteArgs, RemoteContext};
use crate::server_control::{self, ServerControl, ServerLayout};
use crate::server_options::{OptionsError, ServerOptions};
use crate::temp_registry::TempScope;
use serde_json::{Value, json};
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const EXIT_BAD_REQUEST: i32 = 2;

#[derive(Clone, Debug)]
pub struct PeerTimings {
    pub ready_retries: u32,
    pub ready_sleep: Duration,
    pub primary_timeout: Duration,
    pub primary_poll: Duration,
    pub shutdown_timeout: Duration,
    pub shutdown_poll: Duration,
}

impl Default for PeerTimings {
    fn default() -> Self {
        Self {
            ready_retries: 5,
            ready_sleep: Duration::from_secs(5),
            primary_timeout: Duration::from_secs(60),
            primary_poll: Duration::from_secs(1),
            shutdown_timeout: server_control::SHUTDOWN_TIMEOUT,
            shutdown_poll: server_control::SHUTDOWN_POLL,
        }
    }
}

/// Entry point of `powercycle remote`.
pub fn run_remote(args: RemoteArgs) -> i32 {
    log_host_uptime();
    let request = match args.into_request() {
        Ok(request) => request,
        Err(err) => {
            error!("peer-bad-request kind={} err={}", err.kind(), err);
            return EXIT_BAD_REQUEST;
        }
    };
    let mut peer = match RemotePeer::new(request.context.clone()) {
        Ok(peer) => peer,
        Err(err) => {
            error!("peer-bad-server-options kind={} err={}", err.kind(), err);
            return EXIT_BAD_REQUEST;
        }
    };
    peer.execute(&request.operations)
}

/// Executes operations on the host that runs the database server.
pub struct RemotePeer {
    ctx: RemoteContext,
    server: ServerControl,
    db: Option<Box<dyn DatabaseClient>>,
    scope: TempScope,
    timings: PeerTimings,
}

impl RemotePeer {
    pub fn new(ctx: RemoteContext) -> Result<Self, OptionsError> {
        let options = ServerOptions::parse(&ctx.server_options)?;
        let repl_set = ctx.repl_set.as_deref().filter(|_| ctx.use_replica_set);
        let server = ServerControl::new(layout_of(&ctx), ctx.port, &options, repl_set, ctx.service_kind);
        Ok(Self::with_parts(ctx, server, None, PeerTimings::default()))
    }

    pub fn with_parts(
        ctx: RemoteContext,
        server: ServerControl,
        db: Option<Box<dyn DatabaseClient>>,
        timings: PeerTimings,
    ) -> Self {
        Self {
            ctx,
            server,
            db,
            scope: TempScope::new("peer"),
            timings,
        }
    }

    /// Shell client for the local server, created once the binary dir is known.
    fn db(&mut self) -> &dyn DatabaseClient {
        let port = self.ctx.port;
        let server = &self.server;
        &**self.db.get_or_insert_with(|| {
            let shell = server
                .bin_dir()
                .map(|dir| dir.join(shell_binary()))
                .unwrap_or_else(|| PathBuf::from(shell_binary()));
            Box::new(MongoShellClient::new(shell, "localhost", port)) as Box<dyn DatabaseClient>
        })
    }

    /// Runs `ops` in order, stopping at the first failure. Returns the
    /// process exit code.
    pub fn execute(&mut self, ops: &[Operation]) -> i32 {
        for op in ops {
            let name = op.name().as_str();
            info!("peer-op-start op={name} port={}", self.ctx.port);
            let outcome = self.run(op);
            if !outcome.output.trim().is_empty() {
                println!("{}", outcome.output.trim_end());
            }
            if !outcome.success() {
                error!("peer-op-failed op={name} exit={}", outcome.code);
                return outcome.code;
            }
            info!("peer-op-done op={name}");
        }
        0
    }

    fn run(&mut self, op: &Operation) -> Outcome {
        match op {
            Operation::Install => self.server.install(),
            Operation::Start => self.start(),
            Operation::Stop => self.server.stop(),
            Operation::Shutdown => self.shutdown(),
            Operation::Crash => crash_host(self.ctx.sudo, &mut self.scope),
            Operation::CopyData { dest } => copy_data("rsync", Path::new(&self.ctx.db_path), dest),
            Operation::SeedDocuments { count } => {
                let (db_name, coll) = (self.ctx.db_name.clone(), self.ctx.collection_name.clone());
                match self.db().seed_documents(&db_name, &coll, *count) {
                    Ok(total) => Outcome::ok(format!("{db_name}.{coll} holds {total} documents")),
                    Err(err) => db_failure("seed-documents", &err),
                }
            }
            Operation::ValidateCollections => match self.db().validate_collections() {
                Ok(report) => validation_outcome(&report),
                Err(err) => db_failure("validate-collections", &err),
            },
            Operation::InsertCanary { doc } => {
                let (db_name, coll) = (self.ctx.db_name.clone(), self.ctx.collection_name.clone());
                match self.db().insert_canary(&db_name, &coll, doc) {
                    Ok(()) => Outcome::ok(format!("canary {doc} inserted")),
                    Err(err) => db_failure("insert-canary", &err),
                }
            }
            Operation::ValidateCanary { doc } => {
                let (db_name, coll) = (self.ctx.db_name.clone(), self.ctx.collection_name.clone());
                match self.db().find_canary(&db_name, &coll, doc) {
                    Ok(true) => Outcome::ok(format!("canary {doc} found")),
                    Ok(false) => Outcome::fail(1, format!("Canary document {doc} not found in {db_name}.{coll}")),
                    Err(err) => db_failure("validate-canary", &err),
                }
            }
            Operation::SetCompatVersion { version } => match self.db().set_compat_version(version) {
                Ok(()) => Outcome::ok(format!("featureCompatibilityVersion set to {version}")),
                Err(err) => db_failure("set-compat-version", &err),
            },
        }
    }

    fn start(&mut self) -> Outcome {
        let started = self.server.start();
        if !started.success() {
            return started;
        }
        info!("server-status port={} status={}", self.ctx.port, self.server.status().as_str());

        let timings = self.timings.clone();
        let port = self.ctx.port;
        let db = self.db();
        let mut ready = false;
        for attempt in 1..=timings.ready_retries.max(1) {
            match db.ping() {
                Ok(()) => {
                    ready = true;
                    break;
                }
                Err(err) => {
                    warn!("server-not-ready port={port} attempt={attempt} kind={}", err.kind());
                    thread::sleep(timings.ready_sleep);
                }
            }
        }
        if !ready {
            return Outcome::fail(1, format!("Server on port {port} is not accepting connections"));
        }

        match db.server_info() {
            Ok(info) => {
                let version = info.get("version").and_then(|v| v.as_str()).unwrap_or("unknown");
                info!("server-version port={port} version={version}");
            }
            Err(err) => warn!("server-info-failed port={port} kind={}", err.kind()),
        }

        if self.ctx.use_replica_set {
            if let Some(name) = self.ctx.repl_set.clone() {
                let host = format!("localhost:{port}");
                let db = self.db();
                return reconfigure_replica_set(db, &name, &host, timings.primary_timeout, timings.primary_poll);
            }
        }
        started
    }

    fn shutdown(&mut self) -> Outcome {
        if let Err(err) = self.db().shutdown() {
            return db_failure("shutdown", &err);
        }
        server_control::wait_for_shutdown(
            Path::new(&self.ctx.db_path),
            self.timings.shutdown_timeout,
            self.timings.shutdown_poll,
        )
    }
}

fn layout_of(ctx: &RemoteContext) -> ServerLayout {
    ServerLayout {
        root_dir: PathBuf::from(&ctx.root_dir),
        bin_dir: ctx.bin_dir.as_ref().map(PathBuf::from),
        db_path: PathBuf::from(&ctx.db_path),
        log_path: PathBuf::from(&ctx.log_path),
    }
}

fn shell_binary() -> &'static str {
    if cfg!(windows) { "mongo.exe" } else { "mongo" }
}

fn db_failure(op: &str, err: &crate::db_client::DbClientError) -> Outcome {
    Outcome::fail(1, format!("{op} failed ({}): {err}", err.kind()))
}

fn validation_outcome(report: &crate::db_client::ValidationReport) -> Outcome {
    let busy = report.busy();
    if !busy.is_empty() {
        warn!("validate-busy collections={busy:?}");
    }
    let invalid = report.invalid();
    if invalid.is_empty() {
        Outcome::ok(format!("{} collections valid", report.collections.len() - busy.len()))
    } else {
        Outcome::fail(1, format!("Collection validation failed for {invalid:?}"))
    }
}

/// Initiates the set when it has no config yet; otherwise forces the single
/// member onto `host`. Then waits for the member to become primary.
pub fn reconfigure_replica_set(
    db: &dyn DatabaseClient,
    name: &str,
    host: &str,
    timeout: Duration,
    poll: Duration,
) -> Outcome {
    let config = match db.replset_config() {
        Ok(config) => config,
        Err(err) => return db_failure("replset-config", &err),
    };

    let result = match config {
        None => {
            info!("replset-initiate name={name} host={host}");
            db.replset_initiate(&json!({"_id": name, "members": [{"_id": 0, "host": host}]}))
        }
        Some(mut config) => {
            let current = config
                .pointer("/members/0/host")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if current == host {
                Ok(())
            } else {
                info!("replset-reconfig name={name} from={current} to={host}");
                if let Some(member) = config.pointer_mut("/members/0") {
                    member["host"] = json!(host);
                }
                if let Some(version) = config.get("version").and_then(Value::as_i64) {
                    config["version"] = json!(version + 1);
                }
                db.replset_reconfig(&config, true)
            }
        }
    };
    if let Err(err) = result {
        return db_failure("replset-reconfig", &err);
    }

    let deadline = Instant::now() + timeout;
    loop {
        if matches!(db.is_primary(), Ok(true)) {
            return Outcome::ok(format!("replica set {name} primary on {host}"));
        }
        if Instant::now() >= deadline {
            return Outcome::fail(
                1,
                format!("Replica set {name} has no primary after {}s", timeout.as_secs()),
            );
        }
        thread::sleep(poll);
    }
}

/// Platform reboot primitive as `(file suffix, script body)`.
pub fn crash_script(sudo: bool) -> (&'static str, String) {
    let sudo = if sudo { "sudo " } else { "" };
    if cfg!(windows) {
        (".cmd", "shutdown /r /f /t 0\r\n".to_string())
    } else if cfg!(target_os = "macos") {
        (".sh", format!("#!/bin/sh\n{sudo}reboot -q\n"))
    } else {
        (
            ".sh",
            format!(
                "#!/bin/sh\n{sudo}sh -c 'echo 1 > /proc/sys/kernel/sysrq'\n{sudo}sh -c 'echo b > /proc/sysrq-trigger'\n"
            ),
        )
    }
}

/// Forces an immediate reboot. Returning at all means the crash failed.
pub fn crash_host(sudo: bool, scope: &mut TempScope) -> Outcome {
    let (suffix, body) = crash_script(sudo);
    let script = match scope.create_script(&env::temp_dir(), suffix, &body) {
        Ok(path) => path,
        Err(err) => return Outcome::fail(1, format!("Crash script could not be written: {err}")),
    };
    warn!("host-crash-now script={}", script.display());

    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/c").arg(&script);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg(&script);
        cmd
    };
    let detail = match crate::run_command(cmd) {
        Ok(result) => format!("exit={} {}", result.code, result.combined()),
        Err(err) => err,
    };
    scope.release(&script);
    Outcome::fail(1, format!("Crash did not occur: {}", detail.trim()))
}

pub fn copy_data(rsync: &str, src: &Path, dest: &str) -> Outcome {
    let program = match which::which(rsync) {
        Ok(path) => path,
        Err(_) => {
            return Outcome::fail(
                1,
                format!("No rsync exists on the host, not copying {} to {dest}", src.display()),
            );
        }
    };
    let mut cmd = Command::new(program);
    cmd.arg("-va").arg("--delete").arg("--quiet").arg(src).arg(dest);
    info!("copy-data src={} dest={dest}", src.display());
    match crate::run_command(cmd) {
        Ok(result) => Outcome::from_exec(&result),
        Err(err) => Outcome::fail(1, format!("rsync failed to start: {err}")),
    }
}

fn log_host_uptime() {
    if cfg!(windows) {
        return;
    }
    match crate::run_command(Command::new("uptime")) {
        Ok(result) if result.success() => info!("host-uptime {}", result.stdout.trim()),
        Ok(result) => warn!("host-uptime-failed exit={}", result.code),
        Err(err) => warn!("host-uptime-failed err={err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_client::CanaryDocument;
    use crate::db_client::testing::FakeDb;
    use crate::service::ServiceKind;
    use tempfile::TempDir;

    fn context(root: &Path) -> RemoteContext {
        RemoteContext {
            root_dir: root.display().to_string(),
            db_path: root.join("data/db").display().to_string(),
            log_path: root.join("log/mongod.log").display().to_string(),
            bin_dir: None,
            port: 37017,
            repl_set: Some("powercycle".into()),
            use_replica_set: true,
            server_options: String::new(),
            service_kind: ServiceKind::Detached,
            sudo: false,
            db_name: "power".into(),
            collection_name: "cycle".into(),
        }
    }

    fn peer(root: &Path, db: &FakeDb) -> RemotePeer {
        let ctx = context(root);
        let server = ServerControl::new(layout_of(&ctx), ctx.port, &ServerOptions::new(), None, ServiceKind::Detached);
        let timings = PeerTimings {
            ready_retries: 2,
            ready_sleep: Duration::ZERO,
            primary_timeout: Duration::from_millis(50),
            primary_poll: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(50),
            shutdown_poll: Duration::from_millis(5),
        };
        RemotePeer::with_parts(ctx, server, Some(Box::new(db.clone())), timings)
    }

    #[test]
    fn chain_stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        let db = FakeDb::new();
        let mut peer = peer(dir.path(), &db);
        let doc = CanaryDocument::timestamped();

        let code = peer.execute(&[
            Operation::ValidateCanary { doc },
            Operation::SeedDocuments { count: 100 },
        ]);
        assert_eq!(code, 1);
        assert_eq!(db.calls(), vec!["find_canary"]);
    }

    #[test]
    fn canary_round_trip_and_seed() {
        let dir = TempDir::new().unwrap();
        let db = FakeDb::new();
        let mut peer = peer(dir.path(), &db);
        let doc = CanaryDocument::timestamped();

        let code = peer.execute(&[
            Operation::InsertCanary { doc: doc.clone() },
            Operation::ValidateCanary { doc },
            Operation::SeedDocuments { count: 25_000 },
            Operation::ValidateCollections,
        ]);
        assert_eq!(code, 0);
        assert_eq!(db.state.borrow().documents, 25_000);
    }

    #[test]
    fn invalid_collection_fails_validation_but_busy_does_not() {
        let dir = TempDir::new().unwrap();
        let db = FakeDb::new();
        db.state.borrow_mut().busy.push("local.oplog.rs".into());
        let mut peer = peer(dir.path(), &db);
        assert_eq!(peer.execute(&[Operation::ValidateCollections]), 0);

        db.state.borrow_mut().invalid.push("power.cycle2".into());
        assert_eq!(peer.execute(&[Operation::ValidateCollections]), 1);
    }

    #[test]
    fn shutdown_waits_for_lock_release() {
        let dir = TempDir::new().unwrap();
        let db = FakeDb::new();
        let mut peer = peer(dir.path(), &db);
        let db_path = dir.path().join("data/db");
        std::fs::create_dir_all(&db_path).unwrap();
        std::fs::write(db_path.join(server_control::LOCK_FILE_NAME), "77\n").unwrap();

        assert_eq!(peer.execute(&[Operation::Shutdown]), 1);
        std::fs::write(db_path.join(server_control::LOCK_FILE_NAME), "").unwrap();
        assert_eq!(peer.execute(&[Operation::Shutdown]), 0);
        assert_eq!(db.calls(), vec!["shutdown", "shutdown"]);
    }

    #[test]
    fn replica_set_is_initiated_when_missing() {
        let db = FakeDb::new();
        let outcome = reconfigure_replica_set(&db, "rs", "localhost:27017", Duration::from_millis(50), Duration::ZERO);
        assert!(outcome.success());
        let config = db.state.borrow().replset.clone().unwrap();
        assert_eq!(config["members"][0]["host"], "localhost:27017");
        assert!(db.state.borrow().reconfigs.is_empty());
    }

    #[test]
    fn replica_set_member_is_moved_with_forced_reconfig() {
        let db = FakeDb::new();
        {
            let mut state = db.state.borrow_mut();
            state.replset = Some(json!({"_id": "rs", "version": 3, "members": [{"_id": 0, "host": "localhost:37017"}]}));
            state.primary_after = 2;
        }
        let outcome = reconfigure_replica_set(&db, "rs", "localhost:27017", Duration::from_secs(1), Duration::ZERO);
        assert!(outcome.success());
        let reconfigs = db.state.borrow().reconfigs.clone();
        assert_eq!(reconfigs.len(), 1);
        assert!(reconfigs[0].1);
        assert_eq!(reconfigs[0].0["members"][0]["host"], "localhost:27017");
        assert_eq!(reconfigs[0].0["version"], 4);
    }

    #[test]
    fn replica_set_without_primary_times_out() {
        let db = FakeDb::new();
        db.state.borrow_mut().primary_after = u32::MAX;
        let outcome = reconfigure_replica_set(&db, "rs", "localhost:27017", Duration::from_millis(30), Duration::from_millis(5));
        assert_eq!(outcome.code, 1);
        assert!(outcome.output.contains("no primary"));
    }

    #[test]
    fn missing_rsync_is_reported() {
        let dir = TempDir::new().unwrap();
        let outcome = copy_data("pc-no-such-rsync", dir.path(), "/tmp/nowhere");
        assert_eq!(outcome.code, 1);
        assert!(outcome.output.starts_with("No rsync"));
    }

    #[cfg(unix)]
    #[test]
    fn failed_rsync_keeps_exit_code() {
        let dir = TempDir::new().unwrap();
        let outcome = copy_data("false", dir.path(), "/tmp/nowhere");
        assert_eq!(outcome.code, 1);
        assert!(!outcome.success());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_crash_uses_sysrq() {
        let (suffix, body) = crash_script(true);
        assert_eq!(suffix, ".sh");
        assert!(body.contains("sudo sh -c 'echo b > /proc/sysrq-trigger'"));
        let (_, plain) = crash_script(false);
        assert!(!plain.contains("sudo"));
    }
}
