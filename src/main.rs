mod config;
mod crash;
mod db_client;
mod host_backend;
mod journal;
mod peer;
mod power_cycle;
mod process_inspector;
mod remote_channel;
mod remote_ops;
mod server_control;
mod server_options;
mod service;
mod temp_registry;
mod workload;

use clap::{Parser, Subcommand, ValueEnum};
use config::{CrashPlan, RunArgs, TestConfig};
use crash::{AwsCli, CloudInstance, CrashInjector, LocalReboot, PowerToggle};
use db_client::{DatabaseClient, MongoShellClient};
use host_backend::{HostBackend, LocalHostBackend, SshHostBackend};
use power_cycle::{DbConnector, PowerCycle};
use remote_channel::PeerChannel;
use remote_ops::RemoteArgs;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use workload::{LoadLauncher, ResmokeLauncher};

const ENV_LOG_LEVEL: &str = "POWERCYCLE_LOG_LEVEL";
const ENV_LOG_FILE: &str = "POWERCYCLE_LOG_FILE";
const AWS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Result of one step, local or remote: an exit code plus captured output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub code: i32,
    pub output: String,
}

impl Outcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            code: 0,
            output: output.into(),
        }
    }

    /// A failure always carries a nonzero code.
    pub fn fail(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: if code == 0 { 1 } else { code },
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn from_exec(result: &CommandExecResult) -> Self {
        Self {
            code: result.code,
            output: result.combined(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandExecResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandExecResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Runs `command` to completion with stdin closed, capturing both streams.
pub fn run_command(mut command: Command) -> Result<CommandExecResult, String> {
    let program = command.get_program().to_string_lossy().into_owned();
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| format!("{program}: {e}"))?;
    Ok(CommandExecResult {
        code: exit_code(&output.status),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Exit code of a finished process; signals map to `128 + signal`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

pub fn current_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

fn release_tag() -> String {
    if let Some(tag) = option_env!("POWERCYCLE_BUILD_TAG") {
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let version = option_env!("POWERCYCLE_BUILD_VERSION")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(env!("CARGO_PKG_VERSION"));
    format!("v{version}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "powercycle", about = "Power-cycle crash recovery test for a database host", disable_version_flag = true)]
struct Cli {
    /// Print the release tag and exit.
    #[arg(long)]
    version: bool,
    #[arg(long, global = true, value_enum, env = ENV_LOG_LEVEL, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    /// Append log lines to this file instead of stderr.
    #[arg(long, global = true, env = ENV_LOG_FILE)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the power-cycle loop against a remote host.
    Run(Box<RunArgs>),
    /// Execute operations on this host (invoked over ssh by `run`).
    #[command(long_flag = "remote")]
    Remote(RemoteArgs),
    /// Print the release tag.
    Version,
}

fn init_tracing(level: LogLevel, log_file: Option<&PathBuf>) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open log file {}: {e}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if cli.version || matches!(cli.command, Some(Cmd::Version)) {
        println!("{}", release_tag());
        return;
    }
    if let Err(err) = init_tracing(cli.log_level, cli.log_file.as_ref()) {
        eprintln!("{err}");
        std::process::exit(config::EXIT_CONFIG);
    }

    let code = match cli.command {
        Some(Cmd::Run(args)) => run_test(*args),
        Some(Cmd::Remote(args)) => peer::run_remote(args),
        Some(Cmd::Version) => 0,
        None => {
            eprintln!("missing command; see `powercycle --help`");
            config::EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

fn run_test(args: RunArgs) -> i32 {
    let config = match TestConfig::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            error!("config-invalid kind={} err={err}", err.kind());
            eprintln!("{err}");
            return config::EXIT_CONFIG;
        }
    };

    let local_exe = match env::current_exe() {
        Ok(path) => path,
        Err(err) => {
            error!("current-exe-unavailable err={err}");
            return 1;
        }
    };
    let channel = match PeerChannel::connect(config.endpoint.clone(), config.ssh.clone(), local_exe) {
        Ok(channel) => channel,
        Err(err) => {
            error!("ssh-channel-invalid kind={} err={err}", err.kind());
            return config::EXIT_CONFIG;
        }
    };
    let injector = match build_injector(&config.crash) {
        Ok(injector) => injector,
        Err(err) => {
            error!("crash-control-invalid err={err}");
            return config::EXIT_CONFIG;
        }
    };
    let launcher = config
        .resmoke
        .clone()
        .map(|settings| Box::new(ResmokeLauncher::new(settings)) as Box<dyn LoadLauncher>);

    let shell = config.mongo_path.clone().unwrap_or_else(|| PathBuf::from("mongo"));
    let connect_db: DbConnector =
        Box::new(move |host: &str, port: u16| Box::new(MongoShellClient::new(shell.clone(), host, port)) as Box<dyn DatabaseClient>);
    let journal = journal::open_optional(config.journal_url.as_deref());

    info!(
        "powercycle-start tag={} target={} crash_method={}",
        release_tag(),
        config.endpoint,
        config.crash.method().as_str()
    );
    let mut cycle = PowerCycle::new(config.settings, Box::new(channel), injector, launcher, connect_db)
        .with_journal(journal);
    match cycle.run() {
        Ok(summary) => {
            info!(
                "powercycle-complete iterations={} elapsed_secs={}",
                summary.iterations,
                summary.elapsed.as_secs()
            );
            0
        }
        Err(err) => {
            error!("powercycle-failed phase={} code={} err={err}", err.phase, err.code);
            err.code
        }
    }
}

/// A power-toggle control host of plain `localhost` drives the line from this
/// machine without ssh.
fn build_injector(plan: &CrashPlan) -> Result<Box<dyn CrashInjector>, String> {
    Ok(match plan {
        CrashPlan::LocalReboot => Box::new(LocalReboot),
        CrashPlan::PowerToggle {
            control,
            ssh_options,
            line,
        } => {
            let backend: Box<dyn HostBackend> = if control.user.is_none() && control.host == "localhost" {
                Box::new(LocalHostBackend::new())
            } else {
                Box::new(SshHostBackend::new(control.to_string(), ssh_options, false)?)
            };
            Box::new(PowerToggle::new(backend, line.clone()))
        }
        CrashPlan::CloudInstance {
            instance_id,
            address_type,
            program,
        } => {
            let control = AwsCli::new(program.clone(), AWS_POLL_INTERVAL);
            Box::new(CloudInstance::new(Box::new(control), instance_id.clone(), *address_type))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_failure_is_never_zero() {
        assert_eq!(Outcome::fail(0, "x").code, 1);
        assert_eq!(Outcome::fail(255, "x").code, 255);
        assert!(Outcome::ok("").success());
    }

    #[test]
    fn combined_output_separates_streams() {
        let result = CommandExecResult {
            code: 3,
            stdout: "out".into(),
            stderr: "err\n".into(),
        };
        assert_eq!(result.combined(), "out\nerr\n");
        let outcome = Outcome::from_exec(&result);
        assert_eq!(outcome.code, 3);
        assert!(!outcome.success());
    }

    #[cfg(unix)]
    #[test]
    fn run_command_reports_signals_and_codes() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hi; echo oops >&2; exit 4");
        let result = run_command(cmd).unwrap();
        assert_eq!(result.code, 4);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.stderr, "oops\n");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("kill -9 $$");
        assert_eq!(run_command(cmd).unwrap().code, 137);

        assert!(run_command(Command::new("/nonexistent/powercycle-missing")).is_err());
    }

    #[test]
    fn cli_accepts_remote_long_flag_and_run_subcommand() {
        let cli = Cli::try_parse_from([
            "powercycle",
            "--remote",
            "--root-dir=/opt/pc",
            "--db-path=/opt/pc/db",
            "--log-path=/opt/pc/mongod.log",
            "--port=20001",
            "install",
            "start",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Cmd::Remote(_))));

        let cli = Cli::try_parse_from(["powercycle", "--log-level", "warning", "run", "--ssh-user-host", "h"]).unwrap();
        assert_eq!(cli.log_level, LogLevel::Warning);
        assert!(matches!(cli.command, Some(Cmd::Run(_))));
    }
}
