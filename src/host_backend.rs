use regex::Regex;
use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use thiserror::Error;

/// Exit status ssh reserves for its own failures.
pub const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostBackendKind {
    Local,
    Ssh,
}

impl HostBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
        }
    }
}

/// `[user@]host` of a remote machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub user: Option<String>,
    pub host: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, String> {
        validate_ssh_target(raw)?;
        let trimmed = raw.trim();
        match trimmed.rsplit_once('@') {
            Some((user, host)) if !user.is_empty() && !host.is_empty() => Ok(Self {
                user: Some(user.to_string()),
                host: host.to_string(),
            }),
            Some(_) => Err("ssh-target-malformed".to_string()),
            None => Ok(Self {
                user: None,
                host: trimmed.to_string(),
            }),
        }
    }

    pub fn with_host(&self, host: &str) -> Result<Self, String> {
        validate_ssh_target(host)?;
        Ok(Self {
            user: self.user.clone(),
            host: host.trim().to_string(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{user}@{}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum HostBackendError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("exec failed: {0}")]
    ExecFailed(String),
    #[error("io: {0}")]
    Io(String),
    #[error("copy exit={code} stderr={stderr}")]
    CopyFailed { code: i32, stderr: String },
}

impl HostBackendError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid-input",
            Self::ExecFailed(_) => "exec-failed",
            Self::Io(_) => "io",
            Self::CopyFailed { .. } => "copy-failed",
        }
    }
}

/// Where commands run: this machine or a host reached over ssh.
pub trait HostBackend {
    fn kind(&self) -> HostBackendKind;

    fn target_hint(&self) -> Option<String> {
        None
    }

    fn exec(&self, argv: &[String]) -> Result<crate::CommandExecResult, HostBackendError>;

    /// Copies `local` into `remote_dir` and returns the resulting path.
    fn copy_to(&self, local: &Path, remote_dir: &str) -> Result<String, HostBackendError>;
}

#[derive(Clone, Debug, Default)]
pub struct LocalHostBackend;

impl LocalHostBackend {
    pub fn new() -> Self {
        Self
    }
}

impl HostBackend for LocalHostBackend {
    fn kind(&self) -> HostBackendKind {
        HostBackendKind::Local
    }

    fn exec(&self, argv: &[String]) -> Result<crate::CommandExecResult, HostBackendError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HostBackendError::InvalidInput("argv-empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        crate::run_command(cmd).map_err(HostBackendError::ExecFailed)
    }

    fn copy_to(&self, local: &Path, remote_dir: &str) -> Result<String, HostBackendError> {
        let name = local
            .file_name()
            .ok_or_else(|| HostBackendError::InvalidInput("copy-source-no-file-name".to_string()))?;
        let dir = Path::new(remote_dir);
        fs::create_dir_all(dir).map_err(|e| HostBackendError::Io(e.to_string()))?;
        let dest = dir.join(name);
        if dest != local {
            fs::copy(local, &dest).map_err(|e| HostBackendError::Io(e.to_string()))?;
        }
        Ok(dest.to_string_lossy().into_owned())
    }
}

#[derive(Clone, Debug)]
pub struct SshHostBackend {
    target: String,
    default_opts: Vec<String>,
    tty: bool,
}

impl SshHostBackend {
    /// `extra_options` are appended after the defaults, e.g. `-i key.pem`.
    pub fn new(target: String, extra_options: &[String], tty: bool) -> Result<Self, String> {
        validate_ssh_target(&target)?;
        let mut default_opts = vec![
            "-oBatchMode=yes".to_string(),
            "-oStrictHostKeyChecking=no".to_string(),
            "-oServerAliveCountMax=10".to_string(),
            "-oServerAliveInterval=6".to_string(),
            "-oConnectTimeout=30".to_string(),
            "-oConnectionAttempts=25".to_string(),
        ];
        default_opts.extend(extra_options.iter().cloned());
        Ok(Self {
            target,
            default_opts,
            tty,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Everything after `ssh`. The remote argv is quoted into a single
    /// command string because the remote login shell re-splits it.
    pub fn ssh_argv(&self, remote_argv: &[String]) -> Result<Vec<String>, HostBackendError> {
        if remote_argv.is_empty() {
            return Err(HostBackendError::InvalidInput("remote-argv-empty".to_string()));
        }
        let mut argv = self.default_opts.clone();
        if self.tty {
            argv.push("-tt".to_string());
        }
        argv.push(self.target.clone());
        argv.push(shell_words::join(remote_argv));
        Ok(argv)
    }

    pub fn scp_argv(&self, local: &Path, remote_dir: &str) -> Vec<String> {
        let mut argv = self.default_opts.clone();
        argv.push(local.to_string_lossy().into_owned());
        argv.push(format!("{}:{}", self.target, remote_dir));
        argv
    }

    fn redact(&self, mut result: crate::CommandExecResult) -> crate::CommandExecResult {
        // Keep full targets (IPs/usernames) out of logs unless the target is
        // a plain ssh config alias.
        if ssh_target_hint(&self.target) == "<redacted>" {
            result.stdout = result.stdout.replace(&self.target, "<redacted>");
            result.stderr = result.stderr.replace(&self.target, "<redacted>");
        }
        result
    }
}

impl HostBackend for SshHostBackend {
    fn kind(&self) -> HostBackendKind {
        HostBackendKind::Ssh
    }

    fn target_hint(&self) -> Option<String> {
        Some(ssh_target_hint(&self.target))
    }

    fn exec(&self, argv: &[String]) -> Result<crate::CommandExecResult, HostBackendError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_argv(argv)?);
        let result = crate::run_command(cmd)
            .map_err(|e| HostBackendError::ExecFailed(redact_ssh_error(&self.target, &e)))?;
        Ok(self.redact(result))
    }

    fn copy_to(&self, local: &Path, remote_dir: &str) -> Result<String, HostBackendError> {
        let name = local
            .file_name()
            .ok_or_else(|| HostBackendError::InvalidInput("copy-source-no-file-name".to_string()))?
            .to_string_lossy()
            .into_owned();
        let mut cmd = Command::new("scp");
        cmd.args(self.scp_argv(local, remote_dir));
        let result = crate::run_command(cmd)
            .map_err(|e| HostBackendError::ExecFailed(redact_ssh_error(&self.target, &e)))?;
        let result = self.redact(result);
        if !result.success() {
            return Err(HostBackendError::CopyFailed {
                code: result.code,
                stderr: result.stderr,
            });
        }
        Ok(format!("{}/{name}", remote_dir.trim_end_matches('/')))
    }
}

/// True when ssh itself failed to establish the connection, as opposed to
/// the remote command failing.
pub fn is_connection_failure(code: i32, output: &str) -> bool {
    code == SSH_TRANSPORT_EXIT && mentions_transport_error(output)
}

/// scp reports a failed connection with its own exit code, so only the text
/// is checked.
pub fn mentions_transport_error(output: &str) -> bool {
    static CONNECT_ERR: OnceLock<Regex> = OnceLock::new();
    let regex = CONNECT_ERR.get_or_init(|| {
        Regex::new(
            r"(?i)(connection refused|connection timed out|operation timed out|no route to host|could not resolve hostname|connection reset|connection closed by remote host|kex_exchange_identification|network is unreachable)",
        )
        .unwrap()
    });
    regex.is_match(output)
}

pub fn validate_ssh_target(raw: &str) -> Result<(), String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("ssh-target-empty".to_string());
    }
    if trimmed.len() > 512 {
        return Err("ssh-target-too-long".to_string());
    }
    // `ssh <opts> <target>` would treat a leading '-' as another option.
    if trimmed.starts_with('-') {
        return Err("ssh-target-invalid-leading-dash".to_string());
    }
    if trimmed.chars().any(is_disallowed_shell_char) {
        return Err("ssh-target-unsafe-char".to_string());
    }
    Ok(())
}

fn is_disallowed_shell_char(ch: char) -> bool {
    ch.is_whitespace()
        || matches!(
            ch,
            ';' | '|' | '&' | '$' | '(' | ')' | '`' | '"' | '\'' | '<' | '>' | '\\'
        )
}

pub fn ssh_target_hint(target: &str) -> String {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    let looks_like_alias = trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'));
    if looks_like_alias {
        trimmed.to_string()
    } else {
        "<redacted>".to_string()
    }
}

fn redact_ssh_error(target: &str, err: &str) -> String {
    if ssh_target_hint(target) == "<redacted>" {
        err.replace(target, "<redacted>")
    } else {
        err.to_string()
    }
}
