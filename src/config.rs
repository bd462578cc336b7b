use crate::crash::{AddressType, CrashMethod};
use crate::db_client::CompatVersion;
use crate::host_backend::Endpoint;
use crate::remote_channel::{DEFAULT_RETRY_SLEEP, DEFAULT_SEND_RETRIES, SshSettings};
use crate::remote_ops::RemoteContext;
use crate::server_options::{OptionsError, ServerFlag, ServerOptions};
use crate::service::ServiceKind;
use crate::workload::{CLIENT_REPEAT, DEFAULT_TERMINATE_TIMEOUT, ResmokeSettings};
use clap::{Args, ValueEnum};
use regex::Regex;
use serde_json::Value;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

pub const EXIT_CONFIG: i32 = 2;
pub const DEFAULT_STANDARD_PORT: u16 = 27017;
pub const DEFAULT_RECOVERY_PORT: u16 = 37017;
pub const DEFAULT_TEST_LOOPS: u64 = 10;
pub const DEFAULT_CLIENT_SUITE: &str = "buildscripts/resmokeconfig/suites/with_external_server.yml";
const SHELL_PROGRAM: &str = "mongo";
pub const CRASH_SETTLE: Duration = Duration::from_secs(10);

/// Where a validation or canary step runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Location {
    /// On the controller, connecting to the server over the network.
    Local,
    /// On the peer, chained into the remote invocation.
    Remote,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// `user@host` of the machine running the database server.
    #[arg(long, env = "POWERCYCLE_SSH_USER_HOST")]
    pub ssh_user_host: Option<String>,
    /// Extra ssh options, e.g. "-i ident.pem".
    #[arg(long, env = "POWERCYCLE_SSH_OPTIONS", allow_hyphen_values = true)]
    pub ssh_options: Option<String>,
    #[arg(long, env = "POWERCYCLE_SSH_RETRIES", default_value_t = DEFAULT_SEND_RETRIES)]
    pub ssh_retries: u32,
    #[arg(long, default_value_t = DEFAULT_RETRY_SLEEP.as_secs())]
    pub ssh_retry_sleep_secs: u64,
    /// Run privileged remote commands with sudo.
    #[arg(long, env = "POWERCYCLE_REMOTE_SUDO")]
    pub remote_sudo: bool,

    #[arg(long, env = "POWERCYCLE_TEST_LOOPS", default_value_t = DEFAULT_TEST_LOOPS)]
    pub test_loops: u64,
    /// Wall-clock budget in seconds. Overrides --test-loops.
    #[arg(long, env = "POWERCYCLE_TEST_TIME")]
    pub test_time: Option<u64>,

    /// Copy the data directory before and after each recovery.
    #[arg(long)]
    pub rsync: bool,
    #[arg(long)]
    pub backup_path_before: Option<String>,
    #[arg(long)]
    pub backup_path_after: Option<String>,
    #[arg(long, value_enum)]
    pub validate: Option<Location>,
    #[arg(long, value_enum)]
    pub canary: Option<Location>,
    #[arg(long, default_value_t = 0)]
    pub seed_doc_num: u64,
    #[arg(long, default_value = "power")]
    pub db_name: String,
    #[arg(long, default_value = "cycle")]
    pub collection_name: String,

    #[arg(long, value_enum, env = "POWERCYCLE_CRASH_METHOD", default_value_t = CrashMethod::LocalReboot)]
    pub crash_method: CrashMethod,
    /// `instance_id[:address_type]` for cloud-instance, the control line
    /// (e.g. `output1`) for power-toggle.
    #[arg(long, env = "POWERCYCLE_CRASH_OPTIONS")]
    pub crash_options: Option<String>,
    #[arg(long, default_value_t = 30)]
    pub crash_wait_time: u64,
    #[arg(long, default_value_t = 10)]
    pub crash_wait_jitter: u64,
    #[arg(long, hide = true, default_value_t = CRASH_SETTLE.as_secs())]
    pub crash_settle_secs: u64,
    /// `user@host` of the power-toggle control host.
    #[arg(long, env = "POWERCYCLE_SSH_CRASH_USER_HOST")]
    pub ssh_crash_user_host: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    pub ssh_crash_options: Option<String>,
    #[arg(long, default_value = "aws")]
    pub aws_program: String,

    #[arg(long, env = "POWERCYCLE_ROOT_DIR")]
    pub root_dir: Option<String>,
    #[arg(long)]
    pub bin_dir: Option<String>,
    #[arg(long)]
    pub db_path: Option<String>,
    #[arg(long)]
    pub log_path: Option<String>,
    /// Single-node replica set name. Standalone when unset.
    #[arg(long)]
    pub repl_set: Option<String>,
    #[arg(long, default_value_t = DEFAULT_STANDARD_PORT)]
    pub standard_port: u16,
    #[arg(long, default_value_t = DEFAULT_RECOVERY_PORT)]
    pub recovery_port: u16,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub server_options: String,
    /// featureCompatibilityVersion set on the first recovery start.
    #[arg(long)]
    pub fcv: Option<String>,
    #[arg(long, value_enum, env = "POWERCYCLE_SERVICE_KIND", default_value_t = ServiceKind::Detached)]
    pub service_kind: ServiceKind,

    /// Local `mongo` shell. Looked up on PATH when unset.
    #[arg(long, env = "POWERCYCLE_MONGO_PATH")]
    pub mongo_path: Option<PathBuf>,
    /// Database repository root used as the clients' work dir.
    #[arg(long, env = "POWERCYCLE_REPO_ROOT")]
    pub repo_root: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_CLIENT_SUITE)]
    pub client_suite: PathBuf,
    #[arg(long, default_value = "python")]
    pub python: String,
    #[arg(long, default_value_t = 1)]
    pub num_crud_clients: usize,
    #[arg(long, default_value_t = 0)]
    pub num_fsm_clients: usize,
    #[arg(long, default_value = ".")]
    pub client_log_dir: PathBuf,
    /// CRUD client read concern level, e.g. `majority`.
    #[arg(long)]
    pub read_concern_level: Option<String>,
    /// CRUD client write concern document, e.g. `{"w": "majority"}`.
    #[arg(long)]
    pub write_concern: Option<String>,

    /// sqlite url of the run journal.
    #[arg(long, env = "POWERCYCLE_DB_URL")]
    pub journal_db: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing --ssh-user-host")]
    MissingSshTarget,
    #[error("invalid ssh target: {0}")]
    InvalidSshTarget(String),
    #[error("--crash-method {0} requires --crash-options")]
    MissingCrashOptions(&'static str),
    #[error("invalid --crash-options: {0}")]
    InvalidCrashOptions(String),
    #[error("unknown address type '{0}', expected one of private_ip_address, public_ip_address, private_dns_name, public_dns_name")]
    UnknownAddressType(String),
    #[error("--crash-method power-toggle requires --ssh-crash-user-host")]
    MissingCrashHost,
    #[error("--canary cannot be used with --nojournal in --server-options")]
    CanaryWithoutJournal,
    #[error("--canary remote is only supported with --crash-method local-reboot")]
    RemoteCanaryNeedsLocalReboot,
    #[error("--standard-port and --recovery-port must differ (both {0})")]
    PortsNotDistinct(u16),
    #[error("mongo shell not found; set --mongo-path")]
    MissingMongoPath,
    #[error("mongo shell {} does not exist", .0.display())]
    MongoPathNotFound(PathBuf),
    #[error("repo root {} does not exist", .0.display())]
    RepoRootNotFound(PathBuf),
    #[error("client suite {} does not exist", .0.display())]
    SuiteNotFound(PathBuf),
    #[error("invalid --fcv: {0}")]
    InvalidCompatVersion(String),
    #[error("invalid --server-options: {0}")]
    InvalidServerOptions(#[from] OptionsError),
    #[error("invalid --{flag}: {reason}")]
    InvalidOptionString { flag: &'static str, reason: String },
    #[error("invalid --write-concern: {0}")]
    InvalidWriteConcern(String),
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingSshTarget => "missing-ssh-target",
            Self::InvalidSshTarget(_) => "invalid-ssh-target",
            Self::MissingCrashOptions(_) => "missing-crash-options",
            Self::InvalidCrashOptions(_) => "invalid-crash-options",
            Self::UnknownAddressType(_) => "unknown-address-type",
            Self::MissingCrashHost => "missing-crash-host",
            Self::CanaryWithoutJournal => "canary-without-journal",
            Self::RemoteCanaryNeedsLocalReboot => "remote-canary-needs-local-reboot",
            Self::PortsNotDistinct(_) => "ports-not-distinct",
            Self::MissingMongoPath => "missing-mongo-path",
            Self::MongoPathNotFound(_) => "mongo-path-not-found",
            Self::RepoRootNotFound(_) => "repo-root-not-found",
            Self::SuiteNotFound(_) => "suite-not-found",
            Self::InvalidCompatVersion(_) => "invalid-compat-version",
            Self::InvalidServerOptions(_) => "invalid-server-options",
            Self::InvalidOptionString { .. } => "invalid-option-string",
            Self::InvalidWriteConcern(_) => "invalid-write-concern",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CrashPlan {
    LocalReboot,
    PowerToggle {
        control: Endpoint,
        ssh_options: Vec<String>,
        line: String,
    },
    CloudInstance {
        instance_id: String,
        address_type: AddressType,
        program: String,
    },
}

impl CrashPlan {
    pub fn method(&self) -> CrashMethod {
        match self {
            Self::LocalReboot => CrashMethod::LocalReboot,
            Self::PowerToggle { .. } => CrashMethod::PowerToggle,
            Self::CloudInstance { .. } => CrashMethod::CloudInstance,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupPaths {
    pub before: String,
    pub after: String,
}

/// Stops the loop after a number of iterations or a wall-clock budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopBudget {
    pub loops: Option<u64>,
    pub test_time: Option<Duration>,
}

impl LoopBudget {
    pub fn exhausted(&self, iterations: u64, elapsed: Duration) -> bool {
        self.loops.is_some_and(|n| iterations >= n) || self.test_time.is_some_and(|t| elapsed >= t)
    }
}

/// Everything the power-cycle loop decides on.
#[derive(Clone, Debug)]
pub struct LoopSettings {
    /// Context of every remote call; the port is replaced per step.
    pub remote: RemoteContext,
    pub standard_port: u16,
    pub recovery_port: u16,
    pub backups: Option<BackupPaths>,
    pub validate: Option<Location>,
    pub canary: Option<Location>,
    pub seed_doc_num: u64,
    pub compat_version: Option<CompatVersion>,
    pub crud_clients: usize,
    pub fsm_clients: usize,
    pub crash_wait: Duration,
    pub crash_jitter: Duration,
    pub settle: Duration,
    pub client_timeout: Duration,
    pub budget: LoopBudget,
}

#[derive(Clone, Debug)]
pub struct TestConfig {
    pub endpoint: Endpoint,
    pub ssh: SshSettings,
    pub crash: CrashPlan,
    pub mongo_path: Option<PathBuf>,
    pub resmoke: Option<ResmokeSettings>,
    pub journal_url: Option<String>,
    pub settings: LoopSettings,
}

fn control_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap())
}

fn option_words(flag: &'static str, raw: Option<&str>) -> Result<Vec<String>, ConfigError> {
    match raw {
        Some(raw) => shell_words::split(raw).map_err(|err| ConfigError::InvalidOptionString {
            flag,
            reason: err.to_string(),
        }),
        None => Ok(Vec::new()),
    }
}

/// Splits `instance_id[:address_type]`.
pub fn parse_cloud_options(raw: &str) -> Result<(String, AddressType), ConfigError> {
    let (instance, address) = match raw.split_once(':') {
        Some((instance, address)) => (instance.trim(), Some(address.trim())),
        None => (raw.trim(), None),
    };
    if instance.is_empty() {
        return Err(ConfigError::InvalidCrashOptions(format!("no instance id in '{raw}'")));
    }
    let address_type = match address {
        None => AddressType::PublicIpAddress,
        Some(name) => AddressType::parse(name).ok_or_else(|| ConfigError::UnknownAddressType(name.to_string()))?,
    };
    Ok((instance.to_string(), address_type))
}

/// Looks the shell up in `paths`, a PATH-style list. Only executables match.
fn find_shell(paths: Option<OsString>) -> Result<PathBuf, ConfigError> {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(SHELL_PROGRAM, paths, cwd).map_err(|_| ConfigError::MissingMongoPath)
}

fn concern_levels(args: &RunArgs) -> Result<(Option<String>, Option<String>), ConfigError> {
    let write = match args.write_concern.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(_)) => Some(raw.to_string()),
            Ok(_) => return Err(ConfigError::InvalidWriteConcern(format!("'{raw}' is not a document"))),
            Err(err) => return Err(ConfigError::InvalidWriteConcern(err.to_string())),
        },
        None => None,
    };
    let read = match args.read_concern_level.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(level) => Some(level.to_string()),
        None if write.is_some() => Some("local".to_string()),
        None => None,
    };
    Ok((read, write))
}

impl TestConfig {
    pub fn from_args(args: RunArgs) -> Result<Self, ConfigError> {
        let crash = Self::crash_plan(&args)?;

        let options = ServerOptions::parse(&args.server_options)?;
        if args.canary.is_some() && options.contains(&ServerFlag::NoJournal) {
            return Err(ConfigError::CanaryWithoutJournal);
        }
        if args.canary == Some(Location::Remote) && crash.method() != CrashMethod::LocalReboot {
            return Err(ConfigError::RemoteCanaryNeedsLocalReboot);
        }
        if args.standard_port == args.recovery_port {
            return Err(ConfigError::PortsNotDistinct(args.standard_port));
        }
        let compat_version = args
            .fcv
            .as_deref()
            .map(CompatVersion::parse)
            .transpose()
            .map_err(ConfigError::InvalidCompatVersion)?;

        let raw_target = args
            .ssh_user_host
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSshTarget)?;
        let endpoint = Endpoint::parse(raw_target).map_err(ConfigError::InvalidSshTarget)?;
        let ssh = SshSettings {
            extra_options: option_words("ssh-options", args.ssh_options.as_deref())?,
            tty: args.remote_sudo,
            retries: args.ssh_retries,
            retry_sleep: Duration::from_secs(args.ssh_retry_sleep_secs),
        };

        let clients = args.num_crud_clients + args.num_fsm_clients;
        let needs_shell = clients > 0 || args.validate == Some(Location::Local) || args.canary == Some(Location::Local);
        let mongo_path = if needs_shell {
            let path = match &args.mongo_path {
                Some(path) => path.clone(),
                None => find_shell(env::var_os("PATH"))?,
            };
            if !path.is_file() {
                return Err(ConfigError::MongoPathNotFound(path));
            }
            Some(path)
        } else {
            None
        };

        let resmoke = match (&mongo_path, clients) {
            (Some(mongo_path), n) if n > 0 => Some(Self::resmoke_settings(&args, mongo_path)?),
            _ => None,
        };

        let root_dir = args
            .root_dir
            .clone()
            .unwrap_or_else(|| format!("powercycle-{}", crate::current_unix_secs()));
        let db_path = args.db_path.clone().unwrap_or_else(|| format!("{root_dir}/data/db"));
        let log_path = args
            .log_path
            .clone()
            .unwrap_or_else(|| format!("{root_dir}/log/mongod.log"));
        let backups = args.rsync.then(|| BackupPaths {
            before: args
                .backup_path_before
                .clone()
                .unwrap_or_else(|| format!("{root_dir}/data-beforerecovery")),
            after: args
                .backup_path_after
                .clone()
                .unwrap_or_else(|| format!("{root_dir}/data-afterrecovery")),
        });

        let remote = RemoteContext {
            root_dir,
            db_path,
            log_path,
            bin_dir: args.bin_dir.clone(),
            port: args.standard_port,
            repl_set: args.repl_set.clone(),
            use_replica_set: false,
            server_options: options.to_string(),
            service_kind: args.service_kind,
            sudo: args.remote_sudo,
            db_name: args.db_name.clone(),
            collection_name: args.collection_name.clone(),
        };

        let budget = match args.test_time {
            Some(secs) => LoopBudget {
                loops: None,
                test_time: Some(Duration::from_secs(secs)),
            },
            None => LoopBudget {
                loops: Some(args.test_loops.max(1)),
                test_time: None,
            },
        };

        Ok(Self {
            endpoint,
            ssh,
            crash,
            mongo_path,
            resmoke,
            journal_url: args.journal_db.clone(),
            settings: LoopSettings {
                remote,
                standard_port: args.standard_port,
                recovery_port: args.recovery_port,
                backups,
                validate: args.validate,
                canary: args.canary,
                seed_doc_num: args.seed_doc_num,
                compat_version,
                crud_clients: args.num_crud_clients,
                fsm_clients: args.num_fsm_clients,
                crash_wait: Duration::from_secs(args.crash_wait_time),
                crash_jitter: Duration::from_secs(args.crash_wait_jitter),
                settle: Duration::from_secs(args.crash_settle_secs),
                client_timeout: DEFAULT_TERMINATE_TIMEOUT,
                budget,
            },
        })
    }

    fn crash_plan(args: &RunArgs) -> Result<CrashPlan, ConfigError> {
        let crash_options = args
            .crash_options
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        match args.crash_method {
            CrashMethod::LocalReboot => Ok(CrashPlan::LocalReboot),
            CrashMethod::CloudInstance => {
                let raw = crash_options.ok_or(ConfigError::MissingCrashOptions("cloud-instance"))?;
                let (instance_id, address_type) = parse_cloud_options(raw)?;
                Ok(CrashPlan::CloudInstance {
                    instance_id,
                    address_type,
                    program: args.aws_program.clone(),
                })
            }
            CrashMethod::PowerToggle => {
                let line = crash_options.ok_or(ConfigError::MissingCrashOptions("power-toggle"))?;
                if !control_line_re().is_match(line) {
                    return Err(ConfigError::InvalidCrashOptions(format!("bad control line '{line}'")));
                }
                let raw_host = args
                    .ssh_crash_user_host
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(ConfigError::MissingCrashHost)?;
                let control = Endpoint::parse(raw_host).map_err(ConfigError::InvalidSshTarget)?;
                Ok(CrashPlan::PowerToggle {
                    control,
                    ssh_options: option_words("ssh-crash-options", args.ssh_crash_options.as_deref())?,
                    line: line.to_string(),
                })
            }
        }
    }

    fn resmoke_settings(args: &RunArgs, mongo_path: &Path) -> Result<ResmokeSettings, ConfigError> {
        let (read_concern_level, write_concern) = concern_levels(args)?;
        let repo_root = match &args.repo_root {
            Some(root) => root.clone(),
            None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        if !repo_root.is_dir() {
            return Err(ConfigError::RepoRootNotFound(repo_root));
        }
        let suite = if args.client_suite.is_absolute() {
            args.client_suite.clone()
        } else {
            repo_root.join(&args.client_suite)
        };
        if !suite.is_file() {
            return Err(ConfigError::SuiteNotFound(suite));
        }
        Ok(ResmokeSettings {
            script_dir: repo_root.join("tmp"),
            repo_root,
            python: args.python.clone(),
            mongo_path: mongo_path.to_path_buf(),
            suite,
            log_dir: args.client_log_dir.clone(),
            repeat: CLIENT_REPEAT,
            db_name: args.db_name.clone(),
            collection_name: args.collection_name.clone(),
            read_concern_level,
            write_concern,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    #[command(args_override_self = true)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["powercycle", "--ssh-user-host", "ec2-user@10.0.0.5", "--num-crud-clients", "0"];
        argv.extend_from_slice(extra);
        TestCli::try_parse_from(argv).unwrap().run
    }

    fn error_kind(extra: &[&str]) -> &'static str {
        TestConfig::from_args(parse(extra)).unwrap_err().kind()
    }

    #[test]
    fn defaults_derive_paths_from_root() {
        let config = TestConfig::from_args(parse(&["--root-dir", "/srv/pc", "--rsync"])).unwrap();
        let s = &config.settings;
        assert_eq!(s.remote.db_path, "/srv/pc/data/db");
        assert_eq!(s.remote.log_path, "/srv/pc/log/mongod.log");
        assert_eq!(
            s.backups,
            Some(BackupPaths {
                before: "/srv/pc/data-beforerecovery".into(),
                after: "/srv/pc/data-afterrecovery".into(),
            })
        );
        assert_eq!((s.standard_port, s.recovery_port), (27017, 37017));
        assert_eq!((s.remote.db_name.as_str(), s.remote.collection_name.as_str()), ("power", "cycle"));
        assert_eq!(s.budget.loops, Some(10));
        assert_eq!(config.crash, CrashPlan::LocalReboot);
        assert!(config.mongo_path.is_none());
        assert!(config.resmoke.is_none());
    }

    #[test]
    fn generated_root_dir_is_timestamped() {
        let config = TestConfig::from_args(parse(&[])).unwrap();
        assert!(config.settings.remote.root_dir.starts_with("powercycle-"));
        assert!(config.settings.remote.db_path.ends_with("/data/db"));
    }

    #[test]
    fn cloud_instance_requires_options() {
        assert_eq!(error_kind(&["--crash-method", "cloud-instance"]), "missing-crash-options");
        assert_eq!(
            error_kind(&["--crash-method", "cloud-instance", "--crash-options", "i-1:mac_address"]),
            "unknown-address-type"
        );

        let config =
            TestConfig::from_args(parse(&["--crash-method", "cloud-instance", "--crash-options", "i-0abc"])).unwrap();
        match config.crash {
            CrashPlan::CloudInstance {
                instance_id,
                address_type,
                ..
            } => {
                assert_eq!(instance_id, "i-0abc");
                assert_eq!(address_type, AddressType::PublicIpAddress);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn cloud_options_parse_address_type() {
        assert_eq!(
            parse_cloud_options("i-9:private_dns_name").unwrap(),
            ("i-9".to_string(), AddressType::PrivateDnsName)
        );
        assert_eq!(parse_cloud_options(":public_ip_address").unwrap_err().kind(), "invalid-crash-options");
    }

    #[test]
    fn power_toggle_needs_control_host_and_line() {
        assert_eq!(error_kind(&["--crash-method", "power-toggle"]), "missing-crash-options");
        assert_eq!(
            error_kind(&["--crash-method", "power-toggle", "--crash-options", "output1"]),
            "missing-crash-host"
        );
        assert_eq!(
            error_kind(&[
                "--crash-method",
                "power-toggle",
                "--crash-options",
                "out; reboot",
                "--ssh-crash-user-host",
                "admin@relay"
            ]),
            "invalid-crash-options"
        );
        let config = TestConfig::from_args(parse(&[
            "--crash-method",
            "power-toggle",
            "--crash-options",
            "output1",
            "--ssh-crash-user-host",
            "admin@relay",
            "--ssh-crash-options",
            "-i relay.pem",
        ]))
        .unwrap();
        assert_eq!(
            config.crash,
            CrashPlan::PowerToggle {
                control: Endpoint::parse("admin@relay").unwrap(),
                ssh_options: vec!["-i".into(), "relay.pem".into()],
                line: "output1".into(),
            }
        );
    }

    #[test]
    fn canary_rules() {
        assert_eq!(
            error_kind(&["--canary", "remote", "--server-options", "--nojournal"]),
            "canary-without-journal"
        );
        assert_eq!(
            error_kind(&["--canary", "remote", "--crash-method", "cloud-instance", "--crash-options", "i-1"]),
            "remote-canary-needs-local-reboot"
        );
        assert!(TestConfig::from_args(parse(&["--canary", "remote"])).is_ok());
    }

    #[test]
    fn ports_and_versions_are_checked() {
        assert_eq!(
            error_kind(&["--standard-port", "4000", "--recovery-port", "4000"]),
            "ports-not-distinct"
        );
        assert_eq!(error_kind(&["--fcv", "latest"]), "invalid-compat-version");
        let config = TestConfig::from_args(parse(&["--fcv", "4.0"])).unwrap();
        assert_eq!(config.settings.compat_version.unwrap().to_string(), "4.0");
        assert_eq!(error_kind(&["--server-options", "--bogus"]), "invalid-server-options");
    }

    #[test]
    fn missing_target_is_a_config_error() {
        let args = TestCli::try_parse_from(["powercycle", "--num-crud-clients", "0"]).unwrap().run;
        let err = TestConfig::from_args(args).unwrap_err();
        assert_eq!(err.kind(), "missing-ssh-target");
    }

    #[test]
    fn clients_require_shell_repo_and_suite() {
        let dir = tempfile::tempdir().unwrap();
        let mongo = dir.path().join("mongo");
        std::fs::write(&mongo, "").unwrap();
        let mongo_arg = mongo.display().to_string();
        let repo_arg = dir.path().display().to_string();

        assert_eq!(
            error_kind(&["--num-crud-clients", "1", "--mongo-path", "/nonexistent/mongo"]),
            "mongo-path-not-found"
        );
        assert_eq!(
            error_kind(&["--num-crud-clients", "1", "--mongo-path", &mongo_arg, "--repo-root", &repo_arg]),
            "suite-not-found"
        );

        let suite = dir.path().join(DEFAULT_CLIENT_SUITE);
        std::fs::create_dir_all(suite.parent().unwrap()).unwrap();
        std::fs::write(&suite, "test_kind: js_test\n").unwrap();
        let config = TestConfig::from_args(parse(&[
            "--num-crud-clients",
            "2",
            "--mongo-path",
            &mongo_arg,
            "--repo-root",
            &repo_arg,
        ]))
        .unwrap();
        let resmoke = config.resmoke.unwrap();
        assert_eq!(resmoke.suite, suite);
        assert_eq!(resmoke.repeat, 100);
        assert_eq!((resmoke.db_name.as_str(), resmoke.collection_name.as_str()), ("power", "cycle"));
        assert_eq!(resmoke.read_concern_level, None);
        assert_eq!(config.settings.crud_clients, 2);
    }

    #[cfg(unix)]
    #[test]
    fn shell_lookup_only_matches_executables() {
        use std::os::unix::fs::PermissionsExt;

        let plain = tempfile::tempdir().unwrap();
        std::fs::write(plain.path().join("mongo"), "").unwrap();
        let paths = env::join_paths([plain.path()]).unwrap();
        assert_eq!(find_shell(Some(paths)).unwrap_err().kind(), "missing-mongo-path");

        let bin = tempfile::tempdir().unwrap();
        let shell = bin.path().join("mongo");
        std::fs::write(&shell, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&shell, std::fs::Permissions::from_mode(0o755)).unwrap();
        let paths = env::join_paths([plain.path(), bin.path()]).unwrap();
        assert_eq!(find_shell(Some(paths)).unwrap(), shell);
        assert_eq!(find_shell(None).unwrap_err().kind(), "missing-mongo-path");
    }

    #[test]
    fn option_strings_split_like_a_shell() {
        assert_eq!(
            option_words("ssh-options", Some(r#"-i '/k ey' -o "ConnectTimeout 5" a\ b"#)).unwrap(),
            ["-i", "/k ey", "-o", "ConnectTimeout 5", "a b"]
        );
        assert_eq!(option_words("ssh-options", Some("--x #c")).unwrap(), ["--x"]);
        assert!(option_words("ssh-options", None).unwrap().is_empty());
        let err = option_words("ssh-options", Some("-i 'open")).unwrap_err();
        assert_eq!(err.kind(), "invalid-option-string");
    }

    #[test]
    fn write_concern_implies_local_reads() {
        let args = parse(&["--write-concern", r#"{"w": "majority"}"#]);
        assert_eq!(
            concern_levels(&args).unwrap(),
            (Some("local".to_string()), Some(r#"{"w": "majority"}"#.to_string()))
        );

        let args = parse(&["--read-concern-level", "majority"]);
        assert_eq!(concern_levels(&args).unwrap(), (Some("majority".to_string()), None));
        assert_eq!(concern_levels(&parse(&[])).unwrap(), (None, None));

        let args = parse(&["--write-concern", "majority"]);
        assert_eq!(concern_levels(&args).unwrap_err().kind(), "invalid-write-concern");
        let args = parse(&["--write-concern", "[1]"]);
        assert_eq!(concern_levels(&args).unwrap_err().kind(), "invalid-write-concern");
    }

    #[test]
    fn test_time_overrides_loops() {
        let config = TestConfig::from_args(parse(&["--test-loops", "3", "--test-time", "600"])).unwrap();
        let budget = config.settings.budget;
        assert_eq!(budget.loops, None);
        assert!(!budget.exhausted(1000, Duration::from_secs(599)));
        assert!(budget.exhausted(1, Duration::from_secs(600)));

        let loops = LoopBudget {
            loops: Some(3),
            test_time: None,
        };
        assert!(!loops.exhausted(2, Duration::from_secs(10_000)));
        assert!(loops.exhausted(3, Duration::ZERO));
    }
}
