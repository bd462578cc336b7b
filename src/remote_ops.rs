use crate::db_client::{CanaryDocument, CompatVersion};
use crate::service::ServiceKind;
use clap::{Args, ValueEnum};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, ValueEnum)]
pub enum OperationName {
    Install,
    Start,
    Stop,
    Shutdown,
    Crash,
    CopyData,
    SeedDocuments,
    ValidateCollections,
    InsertCanary,
    ValidateCanary,
    SetCompatVersion,
}

impl OperationName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
            Self::Crash => "crash",
            Self::CopyData => "copy-data",
            Self::SeedDocuments => "seed-documents",
            Self::ValidateCollections => "validate-collections",
            Self::InsertCanary => "insert-canary",
            Self::ValidateCanary => "validate-canary",
            Self::SetCompatVersion => "set-compat-version",
        }
    }
}

/// One action the remote peer can perform.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Install,
    Start,
    Stop,
    Shutdown,
    Crash,
    CopyData { dest: String },
    SeedDocuments { count: u64 },
    ValidateCollections,
    InsertCanary { doc: CanaryDocument },
    ValidateCanary { doc: CanaryDocument },
    SetCompatVersion { version: CompatVersion },
}

impl Operation {
    pub fn name(&self) -> OperationName {
        match self {
            Self::Install => OperationName::Install,
            Self::Start => OperationName::Start,
            Self::Stop => OperationName::Stop,
            Self::Shutdown => OperationName::Shutdown,
            Self::Crash => OperationName::Crash,
            Self::CopyData { .. } => OperationName::CopyData,
            Self::SeedDocuments { .. } => OperationName::SeedDocuments,
            Self::ValidateCollections => OperationName::ValidateCollections,
            Self::InsertCanary { .. } => OperationName::InsertCanary,
            Self::ValidateCanary { .. } => OperationName::ValidateCanary,
            Self::SetCompatVersion { .. } => OperationName::SetCompatVersion,
        }
    }
}

/// Parameters every remote invocation carries.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteContext {
    pub root_dir: String,
    pub db_path: String,
    pub log_path: String,
    pub bin_dir: Option<String>,
    pub port: u16,
    pub repl_set: Option<String>,
    pub use_replica_set: bool,
    pub server_options: String,
    pub service_kind: ServiceKind,
    pub sudo: bool,
    pub db_name: String,
    pub collection_name: String,
}

impl RemoteContext {
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteRequest {
    pub context: RemoteContext,
    pub operations: Vec<Operation>,
}

impl RemoteRequest {
    pub fn new(context: RemoteContext, operations: Vec<Operation>) -> Self {
        Self { context, operations }
    }

    pub fn describe(&self) -> String {
        self.operations
            .iter()
            .map(|op| op.name().as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Command-line arguments for the peer, starting with the `remote`
    /// subcommand. Each parameterised operation contributes its own flag.
    pub fn to_args(&self) -> Vec<String> {
        let ctx = &self.context;
        let mut args = vec![
            "remote".to_string(),
            format!("--root-dir={}", ctx.root_dir),
            format!("--db-path={}", ctx.db_path),
            format!("--log-path={}", ctx.log_path),
            format!("--port={}", ctx.port),
            format!("--server-options={}", ctx.server_options),
            format!("--service-kind={}", ctx.service_kind.as_str()),
            format!("--db-name={}", ctx.db_name),
            format!("--collection-name={}", ctx.collection_name),
        ];
        if let Some(bin_dir) = &ctx.bin_dir {
            args.push(format!("--bin-dir={bin_dir}"));
        }
        if let Some(repl_set) = &ctx.repl_set {
            args.push(format!("--repl-set={repl_set}"));
        }
        if ctx.use_replica_set {
            args.push("--use-replica-set".to_string());
        }
        if ctx.sudo {
            args.push("--sudo".to_string());
        }

        for op in &self.operations {
            match op {
                Operation::CopyData { dest } => args.push(format!("--rsync-dest={dest}")),
                Operation::SeedDocuments { count } => args.push(format!("--seed-doc-num={count}")),
                Operation::InsertCanary { doc } | Operation::ValidateCanary { doc } => {
                    let flag = format!("--canary-doc={doc}");
                    if !args.contains(&flag) {
                        args.push(flag);
                    }
                }
                Operation::SetCompatVersion { version } => {
                    args.push(format!("--compat-version={version}"))
                }
                Operation::Install
                | Operation::Start
                | Operation::Stop
                | Operation::Shutdown
                | Operation::Crash
                | Operation::ValidateCollections => {}
            }
        }

        args.push("--".to_string());
        args.extend(self.operations.iter().map(|op| op.name().as_str().to_string()));
        args
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteArgsError {
    #[error("operation '{op}' requires --{flag}")]
    MissingParameter { op: &'static str, flag: &'static str },
    #[error("invalid --canary-doc: {0}")]
    InvalidCanary(String),
    #[error("invalid --compat-version: {0}")]
    InvalidCompatVersion(String),
}

impl RemoteArgsError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingParameter { .. } => "missing-parameter",
            Self::InvalidCanary(_) => "invalid-canary",
            Self::InvalidCompatVersion(_) => "invalid-compat-version",
        }
    }
}

/// Arguments of `powercycle remote`, the peer-side entry point.
#[derive(Args, Debug, Clone)]
pub struct RemoteArgs {
    #[arg(long)]
    pub root_dir: String,
    #[arg(long)]
    pub db_path: String,
    #[arg(long)]
    pub log_path: String,
    #[arg(long)]
    pub bin_dir: Option<String>,
    #[arg(long)]
    pub port: u16,
    #[arg(long)]
    pub repl_set: Option<String>,
    #[arg(long)]
    pub use_replica_set: bool,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub server_options: String,
    #[arg(long, value_enum, default_value_t = ServiceKind::Detached)]
    pub service_kind: ServiceKind,
    #[arg(long)]
    pub sudo: bool,
    #[arg(long, default_value = "power")]
    pub db_name: String,
    #[arg(long, default_value = "cycle")]
    pub collection_name: String,
    #[arg(long)]
    pub rsync_dest: Option<String>,
    #[arg(long)]
    pub seed_doc_num: Option<u64>,
    #[arg(long)]
    pub canary_doc: Option<String>,
    #[arg(long)]
    pub compat_version: Option<String>,
    /// Operations to run, in order.
    #[arg(value_enum, required = true)]
    pub operations: Vec<OperationName>,
}

impl RemoteArgs {
    pub fn into_request(self) -> Result<RemoteRequest, RemoteArgsError> {
        let canary = match self.canary_doc.as_deref() {
            Some(raw) => Some(CanaryDocument::parse(raw).map_err(|err| RemoteArgsError::InvalidCanary(err.to_string()))?),
            None => None,
        };
        let compat = match self.compat_version.as_deref() {
            Some(raw) => Some(CompatVersion::parse(raw).map_err(RemoteArgsError::InvalidCompatVersion)?),
            None => None,
        };

        let mut operations = Vec::with_capacity(self.operations.len());
        for name in &self.operations {
            let op = match name {
                OperationName::Install => Operation::Install,
                OperationName::Start => Operation::Start,
                OperationName::Stop => Operation::Stop,
                OperationName::Shutdown => Operation::Shutdown,
                OperationName::Crash => Operation::Crash,
                OperationName::ValidateCollections => Operation::ValidateCollections,
                OperationName::CopyData => Operation::CopyData {
                    dest: self.rsync_dest.clone().ok_or(RemoteArgsError::MissingParameter {
                        op: "copy-data",
                        flag: "rsync-dest",
                    })?,
                },
                OperationName::SeedDocuments => Operation::SeedDocuments {
                    count: self.seed_doc_num.ok_or(RemoteArgsError::MissingParameter {
                        op: "seed-documents",
                        flag: "seed-doc-num",
                    })?,
                },
                OperationName::InsertCanary => Operation::InsertCanary {
                    doc: canary.clone().ok_or(RemoteArgsError::MissingParameter {
                        op: "insert-canary",
                        flag: "canary-doc",
                    })?,
                },
                OperationName::ValidateCanary => Operation::ValidateCanary {
                    doc: canary.clone().ok_or(RemoteArgsError::MissingParameter {
                        op: "validate-canary",
                        flag: "canary-doc",
                    })?,
                },
                OperationName::SetCompatVersion => Operation::SetCompatVersion {
                    version: compat.clone().ok_or(RemoteArgsError::MissingParameter {
                        op: "set-compat-version",
                        flag: "compat-version",
                    })?,
                },
            };
            operations.push(op);
        }

        let context = RemoteContext {
            root_dir: self.root_dir,
            db_path: self.db_path,
            log_path: self.log_path,
            bin_dir: self.bin_dir,
            port: self.port,
            repl_set: self.repl_set,
            use_replica_set: self.use_replica_set,
            server_options: self.server_options,
            service_kind: self.service_kind,
            sudo: self.sudo,
            db_name: self.db_name,
            collection_name: self.collection_name,
        };
        Ok(RemoteRequest::new(context, operations))
    }
}
